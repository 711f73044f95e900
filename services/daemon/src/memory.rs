//! In-memory instance backend and remote nodes.
//!
//! Used by the daemon in development mode (seeded from a JSON file) and by
//! tests, which use the failure and latency knobs to exercise error paths.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::instance::{
    Instance, InstanceArgs, InstanceError, InstanceFull, InstanceRuntimeState, InstanceSource,
    InstanceSummary, InstanceType, LoadError, RenderError, StatusCode,
};
use crate::listing::DEFAULT_PROJECT;
use crate::remote::{ClusterCert, NodeClient, NodeConnector, NodeError};
use crate::store::{ClusterState, InstanceEntry, MemoryClusterStore, NodeEntry};

/// Tracks how many renders run at once.
#[derive(Debug, Default)]
pub struct RenderGauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl RenderGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Highest number of concurrent renders observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of renders started.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
struct InstanceState {
    status: StatusCode,
    architecture: u32,
    config: BTreeMap<String, String>,
    devices: BTreeMap<String, BTreeMap<String, String>>,
    ephemeral: bool,
    profiles: Vec<String>,
    /// Snapshot name (`<instance>/<snapshot>`) to the config it captured.
    snapshots: BTreeMap<String, BTreeMap<String, String>>,
}

/// An instance living in memory.
pub struct MemoryInstance {
    name: String,
    project: String,
    instance_type: InstanceType,
    location: String,
    state: RwLock<InstanceState>,
    render_failure: Option<String>,
    render_panic: bool,
    render_delay: Option<Duration>,
    gauge: Option<Arc<RenderGauge>>,
}

impl MemoryInstance {
    /// Create a running instance located on `location`.
    pub fn new(
        name: impl Into<String>,
        project: impl Into<String>,
        instance_type: InstanceType,
        location: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            project: project.into(),
            instance_type,
            location: location.into(),
            state: RwLock::new(InstanceState {
                status: StatusCode::Running,
                architecture: 0,
                config: BTreeMap::new(),
                devices: BTreeMap::new(),
                ephemeral: false,
                profiles: vec!["default".to_string()],
                snapshots: BTreeMap::new(),
            }),
            render_failure: None,
            render_panic: false,
            render_delay: None,
            gauge: None,
        }
    }

    pub fn with_status(self, status: StatusCode) -> Self {
        self.write_state().status = status;
        self
    }

    pub fn with_config(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.write_state().config.insert(key.into(), value.into());
        self
    }

    /// Capture the current config under a snapshot called `snapshot`.
    pub fn with_snapshot(self, snapshot: &str) -> Self {
        {
            let mut state = self.write_state();
            let captured = state.config.clone();
            state
                .snapshots
                .insert(format!("{}/{snapshot}", self.name), captured);
        }
        self
    }

    /// Make every render fail with `reason`.
    pub fn with_render_failure(mut self, reason: impl Into<String>) -> Self {
        self.render_failure = Some(reason.into());
        self
    }

    /// Make every render panic, as a crashing backend would.
    pub fn with_render_panic(mut self) -> Self {
        self.render_panic = true;
        self
    }

    /// Make every render take `delay`.
    pub fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = Some(delay);
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<RenderGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.read_state().status
    }

    pub fn config(&self) -> BTreeMap<String, String> {
        self.read_state().config.clone()
    }

    pub fn architecture(&self) -> u32 {
        self.read_state().architecture
    }

    pub fn profiles(&self) -> Vec<String> {
        self.read_state().profiles.clone()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, InstanceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, InstanceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn summary(&self) -> InstanceSummary {
        let state = self.read_state();
        InstanceSummary {
            name: self.name.clone(),
            status: state.status.to_string(),
            status_code: state.status,
            location: self.location.clone(),
            instance_type: self.instance_type,
            project: self.project.clone(),
            expanded_config: state.config.clone(),
        }
    }

    async fn begin_render(&self) -> Result<(), RenderError> {
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        if let Some(delay) = self.render_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        if self.render_panic {
            panic!("[MEMORY] render of {} crashed", self.name);
        }

        match &self.render_failure {
            Some(reason) => Err(RenderError::new(&self.name, reason.as_str())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Instance for MemoryInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn project(&self) -> &str {
        &self.project
    }

    fn instance_type(&self) -> InstanceType {
        self.instance_type
    }

    fn expanded_config(&self) -> BTreeMap<String, String> {
        self.read_state().config.clone()
    }

    fn snapshots(&self) -> Vec<String> {
        self.read_state().snapshots.keys().cloned().collect()
    }

    async fn render(&self) -> Result<(InstanceSummary, String), RenderError> {
        self.begin_render().await?;

        let summary = self.summary();
        let body = serde_json::to_vec(&summary)
            .map_err(|e| RenderError::new(&self.name, e.to_string()))?;
        let etag = hex::encode(Sha256::digest(&body));

        Ok((summary, etag))
    }

    async fn render_full(&self) -> Result<InstanceFull, RenderError> {
        self.begin_render().await?;

        let instance = self.summary();
        let running = instance.status_code == StatusCode::Running;
        let state = InstanceRuntimeState {
            status: instance.status.clone(),
            status_code: instance.status_code,
            pid: if running { 1 } else { 0 },
            processes: if running { 1 } else { 0 },
        };

        Ok(InstanceFull {
            instance,
            state: Some(state),
            snapshots: self.snapshots(),
        })
    }

    async fn update(&self, args: InstanceArgs) -> Result<(), InstanceError> {
        let mut state = self.write_state();
        state.architecture = args.architecture;
        state.config = args.config;
        state.devices = args.devices;
        state.ephemeral = args.ephemeral;
        state.profiles = args.profiles;

        debug!(instance = %self.name, "[MEMORY] Instance updated");
        Ok(())
    }

    async fn restore(&self, snapshot: &str) -> Result<(), InstanceError> {
        let mut state = self.write_state();
        let Some(config) = state.snapshots.get(snapshot).cloned() else {
            return Err(InstanceError::Restore {
                name: self.name.clone(),
                snapshot: snapshot.to_string(),
                reason: "snapshot does not exist".to_string(),
            });
        };
        state.config = config;

        debug!(instance = %self.name, snapshot = %snapshot, "[MEMORY] Instance restored");
        Ok(())
    }
}

/// Local instances held in memory.
#[derive(Default)]
pub struct MemoryInstanceSource {
    instances: RwLock<BTreeMap<(String, String), Arc<MemoryInstance>>>,
    failure: RwLock<Option<String>>,
}

impl MemoryInstanceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, instance: MemoryInstance) -> Arc<MemoryInstance> {
        let instance = Arc::new(instance);
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (instance.project.clone(), instance.name.clone()),
                Arc::clone(&instance),
            );
        instance
    }

    /// Make every load fail with `reason` until cleared with `None`.
    pub fn set_failure(&self, reason: Option<String>) {
        *self.failure.write().unwrap_or_else(PoisonError::into_inner) = reason;
    }

    fn check_failure(&self) -> Result<(), LoadError> {
        match self
            .failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(reason) => Err(LoadError::Backend(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InstanceSource for MemoryInstanceSource {
    async fn load_node_project_all(
        &self,
        project: &str,
        instance_type: InstanceType,
    ) -> Result<Vec<Arc<dyn Instance>>, LoadError> {
        self.check_failure()?;

        let instances = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        Ok(instances
            .values()
            .filter(|i| i.project == project && instance_type.matches(i.instance_type))
            .map(|i| Arc::clone(i) as Arc<dyn Instance>)
            .collect())
    }

    async fn load_by_project_and_name(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Arc<dyn Instance>, LoadError> {
        self.check_failure()?;

        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(project.to_string(), name.to_string()))
            .map(|i| Arc::clone(i) as Arc<dyn Instance>)
            .ok_or_else(|| LoadError::NotFound {
                project: project.to_string(),
                name: name.to_string(),
            })
    }
}

/// Behaviour of a simulated remote node.
#[derive(Debug, Clone)]
pub enum RemoteNode {
    /// Answer with these records.
    Serve(Vec<InstanceFull>),
    /// Accept the connection and never answer.
    Hang,
    /// Refuse the connection.
    Refuse(String),
    /// Accept the connection and fail the request.
    Fail(String),
}

/// Connector to simulated remote nodes, keyed by address.
#[derive(Default)]
pub struct MemoryNodeConnector {
    nodes: RwLock<HashMap<String, RemoteNode>>,
    connects: AtomicU32,
}

impl MemoryNodeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_node(&self, address: impl Into<String>, node: RemoteNode) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.into(), node);
    }

    /// Number of connection attempts so far.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeConnector for MemoryNodeConnector {
    async fn connect(
        &self,
        address: &str,
        _cert: &ClusterCert,
    ) -> Result<Box<dyn NodeClient>, NodeError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let node = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned();

        match node {
            None => Err(NodeError::Connect {
                address: address.to_string(),
                reason: "no route to host".to_string(),
            }),
            Some(RemoteNode::Refuse(reason)) => Err(NodeError::Connect {
                address: address.to_string(),
                reason,
            }),
            Some(behaviour) => Ok(Box::new(MemoryNodeClient {
                address: address.to_string(),
                project: None,
                behaviour,
            })),
        }
    }
}

struct MemoryNodeClient {
    address: String,
    project: Option<String>,
    behaviour: RemoteNode,
}

impl MemoryNodeClient {
    async fn records(&self, instance_type: InstanceType) -> Result<Vec<InstanceFull>, NodeError> {
        match &self.behaviour {
            RemoteNode::Serve(records) => Ok(records
                .iter()
                .filter(|r| {
                    self.project
                        .as_deref()
                        .is_none_or(|p| r.instance.project == p)
                        && instance_type.matches(r.instance.instance_type)
                })
                .cloned()
                .collect()),
            RemoteNode::Hang => std::future::pending().await,
            RemoteNode::Refuse(reason) | RemoteNode::Fail(reason) => Err(NodeError::Request {
                address: self.address.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

#[async_trait]
impl NodeClient for MemoryNodeClient {
    fn use_project(self: Box<Self>, project: &str) -> Box<dyn NodeClient> {
        Box::new(MemoryNodeClient {
            project: Some(project.to_string()),
            ..*self
        })
    }

    async fn list_instances(
        &self,
        instance_type: InstanceType,
    ) -> Result<Vec<InstanceSummary>, NodeError> {
        let records = self.records(instance_type).await?;
        Ok(records.into_iter().map(|r| r.instance).collect())
    }

    async fn list_instances_full(
        &self,
        instance_type: InstanceType,
    ) -> Result<Vec<InstanceFull>, NodeError> {
        self.records(instance_type).await
    }
}

/// Initial cluster contents for development mode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterSeed {
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
    #[serde(default)]
    pub instances: Vec<SeedInstance>,
}

/// An instance in the seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedInstance {
    pub name: String,
    #[serde(default = "default_project")]
    pub project: String,
    pub node: String,
    #[serde(rename = "type", default)]
    pub instance_type: InstanceType,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub snapshots: Vec<String>,
}

fn default_project() -> String {
    DEFAULT_PROJECT.to_string()
}

impl ClusterSeed {
    /// Read a seed from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read seed file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse seed file {}", path.display()))
    }

    /// Build the store and the local instance source as seen by `local_node`.
    ///
    /// Only instances placed on `local_node` are materialized locally; the
    /// rest exist in the store's placement table.
    pub fn build(self, local_node: &str) -> Result<(MemoryClusterStore, MemoryInstanceSource)> {
        let source = MemoryInstanceSource::new();
        let mut placements = Vec::with_capacity(self.instances.len());

        for seeded in self.instances {
            placements.push(InstanceEntry {
                name: seeded.name.clone(),
                project: seeded.project.clone(),
                node: seeded.node.clone(),
                instance_type: seeded.instance_type,
            });

            if seeded.node != local_node {
                continue;
            }

            let status = match seeded.status.as_deref() {
                Some(status) => status
                    .parse::<StatusCode>()
                    .map_err(anyhow::Error::msg)
                    .with_context(|| format!("instance {}", seeded.name))?,
                None => StatusCode::Running,
            };

            let mut instance = MemoryInstance::new(
                &seeded.name,
                &seeded.project,
                seeded.instance_type,
                local_node,
            )
            .with_status(status);
            for (key, value) in seeded.config {
                instance = instance.with_config(key, value);
            }
            for snapshot in &seeded.snapshots {
                instance = instance.with_snapshot(snapshot);
            }
            source.insert(instance);
        }

        info!(
            local_node = %local_node,
            nodes = self.nodes.len(),
            instances = placements.len(),
            "[MEMORY] Seeded cluster"
        );

        let store = MemoryClusterStore::new(
            local_node,
            ClusterState {
                nodes: self.nodes,
                instances: placements,
            },
        );
        Ok((store, source))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn test_render_summary_and_etag() {
        let instance = MemoryInstance::new("c1", "default", InstanceType::Container, "node1")
            .with_config("user.x", "1");

        let (summary, etag) = instance.render().await.unwrap();
        assert_eq!(summary.name, "c1");
        assert_eq!(summary.status_code, StatusCode::Running);
        assert_eq!(summary.expanded_config["user.x"], "1");
        assert_eq!(etag.len(), 64);

        let (_, again) = instance.render().await.unwrap();
        assert_eq!(etag, again);
    }

    #[tokio::test]
    async fn test_render_failure() {
        let instance = MemoryInstance::new("c1", "default", InstanceType::Container, "node1")
            .with_render_failure("storage offline");

        let err = instance.render_full().await.unwrap_err();
        assert_eq!(err.name, "c1");
        assert_eq!(err.reason, "storage offline");
    }

    #[tokio::test]
    async fn test_restore_snapshot() {
        let instance = MemoryInstance::new("c1", "default", InstanceType::Container, "node1")
            .with_config("user.x", "1")
            .with_snapshot("snap0")
            .with_config("user.x", "2");

        assert_eq!(instance.snapshots(), vec!["c1/snap0"]);
        instance.restore("c1/snap0").await.unwrap();
        assert_eq!(instance.config()["user.x"], "1");

        assert!(instance.restore("c1/missing").await.is_err());
    }

    #[tokio::test]
    async fn test_source_scopes_project() {
        let source = MemoryInstanceSource::new();
        source.insert(MemoryInstance::new("a", "default", InstanceType::Container, "n"));
        source.insert(MemoryInstance::new("b", "staging", InstanceType::Container, "n"));
        source.insert(MemoryInstance::new("v", "default", InstanceType::VirtualMachine, "n"));

        let all = source
            .load_node_project_all("default", InstanceType::Any)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let vms = source
            .load_node_project_all("default", InstanceType::VirtualMachine)
            .await
            .unwrap();
        assert_eq!(vms.len(), 1);

        let err = source.load_by_project_and_name("default", "b").await.err();
        assert!(matches!(err, Some(LoadError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_connector_behaviours() {
        let connector = MemoryNodeConnector::new();
        connector.set_node("10.0.0.2:8443", RemoteNode::Refuse("refused".to_string()));
        connector.set_node("10.0.0.3:8443", RemoteNode::Fail("boom".to_string()));

        let cert = ClusterCert::default();
        assert!(matches!(
            connector.connect("10.0.0.2:8443", &cert).await.err(),
            Some(NodeError::Connect { .. })
        ));
        assert!(matches!(
            connector.connect("10.0.0.9:8443", &cert).await.err(),
            Some(NodeError::Connect { .. })
        ));

        let client = connector.connect("10.0.0.3:8443", &cert).await.unwrap();
        assert!(matches!(
            client.list_instances(InstanceType::Any).await,
            Err(NodeError::Request { .. })
        ));
        assert_eq!(connector.connect_count(), 3);
    }

    #[test]
    fn test_seed_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "nodes": [
                    {{"name": "node1", "address": "10.0.0.1:8443"}},
                    {{"name": "node2", "address": "10.0.0.2:8443", "online": false}}
                ],
                "instances": [
                    {{"name": "c1", "node": "node1", "type": "container", "status": "Stopped",
                      "config": {{"user.x": "1"}}, "snapshots": ["snap0"]}},
                    {{"name": "c2", "node": "node2", "type": "container"}}
                ]
            }}"#
        )
        .unwrap();

        let seed = ClusterSeed::from_file(file.path()).unwrap();
        let (store, source) = seed.build("node1").unwrap();
        assert_eq!(store.local_node(), "node1");

        let local = source
            .instances
            .read()
            .unwrap()
            .get(&("default".to_string(), "c1".to_string()))
            .cloned()
            .unwrap();
        assert_eq!(local.status(), StatusCode::Stopped);
        assert_eq!(local.snapshots(), vec!["c1/snap0"]);
        assert!(source
            .instances
            .read()
            .unwrap()
            .get(&("default".to_string(), "c2".to_string()))
            .is_none());
    }

    #[test]
    fn test_seed_rejects_unknown_status() {
        let seed: ClusterSeed = serde_json::from_str(
            r#"{"instances": [{"name": "c1", "node": "node1", "status": "Sleeping"}]}"#,
        )
        .unwrap();
        assert!(seed.build("node1").is_err());
    }
}
