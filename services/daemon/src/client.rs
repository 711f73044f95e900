//! HTTP client for talking to other cluster members.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::instance::{InstanceFull, InstanceSummary, InstanceType};
use crate::listing::API_VERSION;
use crate::remote::{ClusterCert, NodeClient, NodeConnector, NodeError};

/// User agent marking a request as forwarded by another cluster member.
///
/// A node receiving such a request only reports its own instances.
pub const CLUSTER_NOTIFIER_USER_AGENT: &str = "lxd-cluster-notifier";

/// Opens reqwest connections to other nodes.
#[derive(Debug, Clone)]
pub struct HttpNodeConnector {
    scheme: &'static str,
}

impl Default for HttpNodeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpNodeConnector {
    /// Connector using TLS with the cluster certificate.
    pub fn new() -> Self {
        Self { scheme: "https" }
    }

    /// Connector using plain HTTP, for development clusters without a
    /// certificate.
    pub fn plain_http() -> Self {
        Self { scheme: "http" }
    }

    fn build_client(&self, address: &str, cert: &ClusterCert) -> Result<reqwest::Client, NodeError> {
        let connect_err = |reason: String| NodeError::Connect {
            address: address.to_string(),
            reason,
        };

        let mut builder = reqwest::Client::builder().user_agent(CLUSTER_NOTIFIER_USER_AGENT);

        if !cert.certificate.is_empty() {
            let mut pem = cert.certificate.clone().into_bytes();
            pem.push(b'\n');
            pem.extend_from_slice(cert.key.as_bytes());

            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| connect_err(format!("invalid cluster identity: {e}")))?;
            let root = reqwest::Certificate::from_pem(cert.certificate.as_bytes())
                .map_err(|e| connect_err(format!("invalid cluster certificate: {e}")))?;

            builder = builder.identity(identity).add_root_certificate(root);
        }

        builder.build().map_err(|e| connect_err(e.to_string()))
    }
}

#[async_trait]
impl NodeConnector for HttpNodeConnector {
    async fn connect(
        &self,
        address: &str,
        cert: &ClusterCert,
    ) -> Result<Box<dyn NodeClient>, NodeError> {
        let client = self.build_client(address, cert)?;
        Ok(Box::new(HttpNodeClient {
            client,
            address: address.to_string(),
            base_url: format!("{}://{address}/{API_VERSION}", self.scheme),
            project: None,
        }))
    }
}

#[derive(Deserialize)]
struct SyncEnvelope<T> {
    metadata: T,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: String,
}

struct HttpNodeClient {
    client: reqwest::Client,
    address: String,
    base_url: String,
    project: Option<String>,
}

impl HttpNodeClient {
    async fn get_instances<T: DeserializeOwned>(
        &self,
        recursion: u32,
        instance_type: InstanceType,
    ) -> Result<T, NodeError> {
        let url = format!("{}/instances", self.base_url);
        let mut query = vec![("recursion", recursion.to_string())];
        if let Some(project) = &self.project {
            query.push(("project", project.clone()));
        }
        if instance_type != InstanceType::Any {
            query.push(("instance-type", instance_type.to_string()));
        }

        debug!(node = %self.address, recursion, "Requesting instances from node");

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.detail)
                .unwrap_or(body);
            warn!(node = %self.address, status = %status, "Node rejected instance listing");
            return Err(self.request_error(format!("{status}: {detail}")));
        }

        let envelope: SyncEnvelope<T> = response
            .json()
            .await
            .map_err(|e| self.request_error(format!("invalid response: {e}")))?;
        Ok(envelope.metadata)
    }

    fn transport_error(&self, err: reqwest::Error) -> NodeError {
        if err.is_connect() {
            NodeError::Connect {
                address: self.address.clone(),
                reason: err.to_string(),
            }
        } else {
            self.request_error(err.to_string())
        }
    }

    fn request_error(&self, reason: String) -> NodeError {
        NodeError::Request {
            address: self.address.clone(),
            reason,
        }
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    fn use_project(self: Box<Self>, project: &str) -> Box<dyn NodeClient> {
        Box::new(HttpNodeClient {
            project: Some(project.to_string()),
            ..*self
        })
    }

    async fn list_instances(
        &self,
        instance_type: InstanceType,
    ) -> Result<Vec<InstanceSummary>, NodeError> {
        self.get_instances(1, instance_type).await
    }

    async fn list_instances_full(
        &self,
        instance_type: InstanceType,
    ) -> Result<Vec<InstanceFull>, NodeError> {
        self.get_instances(2, instance_type).await
    }
}
