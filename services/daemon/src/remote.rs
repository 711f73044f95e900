//! Fetching instance records from other cluster members.
//!
//! Every fetch runs in its own task and is raced against a timer. When the
//! timer wins the task is detached: it keeps running until the connection
//! attempt resolves on its own and its result is dropped. A hung node cannot
//! hold up a listing for longer than the timeout.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::instance::{InstanceFull, InstanceSummary, InstanceType};

/// Default time allowed for a single remote node to answer.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Node-scoped fetch failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("timeout getting instances from node {address}")]
    Timeout { address: String },

    #[error("failed to connect to node {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("failed to get instances from node {address}: {reason}")]
    Request { address: String, reason: String },

    #[error("fetch from node {address} aborted: {reason}")]
    Aborted { address: String, reason: String },
}

impl NodeError {
    /// Address of the node the error is about.
    pub fn address(&self) -> &str {
        match self {
            NodeError::Timeout { address }
            | NodeError::Connect { address, .. }
            | NodeError::Request { address, .. }
            | NodeError::Aborted { address, .. } => address,
        }
    }
}

/// Certificate and key shared by all cluster members.
#[derive(Clone, Default)]
pub struct ClusterCert {
    /// PEM-encoded certificate.
    pub certificate: String,

    /// PEM-encoded private key.
    pub key: String,
}

impl fmt::Debug for ClusterCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCert")
            .field("certificate_len", &self.certificate.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// A connection to one remote node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Scope subsequent requests to a project.
    fn use_project(self: Box<Self>, project: &str) -> Box<dyn NodeClient>;

    async fn list_instances(
        &self,
        instance_type: InstanceType,
    ) -> Result<Vec<InstanceSummary>, NodeError>;

    async fn list_instances_full(
        &self,
        instance_type: InstanceType,
    ) -> Result<Vec<InstanceFull>, NodeError>;
}

/// Opens connections to remote nodes.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        cert: &ClusterCert,
    ) -> Result<Box<dyn NodeClient>, NodeError>;
}

/// Fetches records from remote nodes with a hard timeout.
#[derive(Clone)]
pub struct RemoteFetcher {
    connector: Arc<dyn NodeConnector>,
    cert: Arc<ClusterCert>,
    timeout: Duration,
}

impl RemoteFetcher {
    pub fn new(connector: Arc<dyn NodeConnector>, cert: Arc<ClusterCert>, timeout: Duration) -> Self {
        Self {
            connector,
            cert,
            timeout,
        }
    }

    /// Fetch summaries of the project's instances hosted on `address`.
    pub async fn fetch_summaries(
        &self,
        project: &str,
        address: &str,
        instance_type: InstanceType,
    ) -> Result<Vec<InstanceSummary>, NodeError> {
        self.fetch(project, address, move |client| async move {
            client.list_instances(instance_type).await
        })
        .await
    }

    /// Fetch full records of the project's instances hosted on `address`.
    pub async fn fetch_full(
        &self,
        project: &str,
        address: &str,
        instance_type: InstanceType,
    ) -> Result<Vec<InstanceFull>, NodeError> {
        self.fetch(project, address, move |client| async move {
            client.list_instances_full(instance_type).await
        })
        .await
    }

    async fn fetch<R, F, Fut>(&self, project: &str, address: &str, list: F) -> Result<Vec<R>, NodeError>
    where
        R: Send + 'static,
        F: FnOnce(Box<dyn NodeClient>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<R>, NodeError>> + Send + 'static,
    {
        let connector = Arc::clone(&self.connector);
        let cert = Arc::clone(&self.cert);
        let project_name = project.to_string();
        let node = address.to_string();

        let task = tokio::spawn(async move {
            let client = connector.connect(&node, &cert).await?;
            let client = client.use_project(&project_name);
            list(client).await
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => {
                if let Ok(records) = &result {
                    debug!(node = %address, records = records.len(), "Fetched instances from node");
                }
                result
            }
            Ok(Err(join_err)) => Err(NodeError::Aborted {
                address: address.to_string(),
                reason: join_err.to_string(),
            }),
            Err(_) => {
                // Dropping the JoinHandle detaches the fetch task.
                warn!(
                    node = %address,
                    timeout_secs = self.timeout.as_secs(),
                    "Remote node did not answer in time"
                );
                Err(NodeError::Timeout {
                    address: address.to_string(),
                })
            }
        }
    }
}
