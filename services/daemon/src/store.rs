//! Cluster metadata store interface and in-memory implementation.
//!
//! The store answers two questions about a project, inside one transaction:
//! - which instances live behind which node address
//! - which node name owns each instance
//!
//! Node addresses follow two conventions: the local node is reported with an
//! empty address and nodes the cluster considers offline are reported as
//! [`OFFLINE_NODE_ADDRESS`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::instance::InstanceType;

/// Address reported for the node answering the request.
pub const LOCAL_NODE_ADDRESS: &str = "";

/// Address reported for nodes the cluster considers offline.
pub const OFFLINE_NODE_ADDRESS: &str = "0.0.0.0";

/// Errors from cluster store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Transient lock contention; the transaction may be retried.
    #[error("cluster database is locked")]
    Locked,

    #[error("cluster query failed: {0}")]
    Query(String),

    #[error("cluster database unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns true if the failure is expected to clear on its own.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Locked)
    }
}

/// Queries available inside a store transaction.
pub trait ClusterTx {
    /// Instance names grouped by the address of the node that owns them.
    fn instances_by_node_address(
        &self,
        project: &str,
        instance_type: InstanceType,
    ) -> Result<BTreeMap<String, Vec<String>>, StoreError>;

    /// Owning node name for every instance.
    fn instance_node_names(
        &self,
        project: &str,
        instance_type: InstanceType,
    ) -> Result<HashMap<String, String>, StoreError>;
}

/// Clustered metadata store.
pub trait ClusterStore: Send + Sync {
    /// Run `f` inside a single read transaction.
    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn ClusterTx) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub address: String,
    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

/// Placement of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub name: String,
    #[serde(default = "default_project")]
    pub project: String,
    /// Name of the owning node.
    pub node: String,
    #[serde(rename = "type", default)]
    pub instance_type: InstanceType,
}

fn default_project() -> String {
    "default".to_string()
}

/// Contents of the in-memory store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
    #[serde(default)]
    pub instances: Vec<InstanceEntry>,
}

/// In-memory cluster store used in development mode and tests.
///
/// Failures can be injected to exercise the retry path.
pub struct MemoryClusterStore {
    local_node: String,
    state: RwLock<ClusterState>,
    injected_locks: AtomicU32,
    injected_failure: Mutex<Option<StoreError>>,
    transactions: AtomicU32,
}

impl MemoryClusterStore {
    /// Create a store as seen from the node named `local_node`.
    pub fn new(local_node: impl Into<String>, state: ClusterState) -> Self {
        Self {
            local_node: local_node.into(),
            state: RwLock::new(state),
            injected_locks: AtomicU32::new(0),
            injected_failure: Mutex::new(None),
            transactions: AtomicU32::new(0),
        }
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Add or replace a node.
    pub fn upsert_node(&self, node: NodeEntry) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.nodes.retain(|n| n.name != node.name);
        state.nodes.push(node);
    }

    /// Add an instance placement.
    pub fn add_instance(&self, instance: InstanceEntry) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.instances.push(instance);
    }

    /// Mark a node online or offline.
    pub fn set_node_online(&self, name: &str, online: bool) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(node) = state.nodes.iter_mut().find(|n| n.name == name) {
            node.online = online;
        }
    }

    /// Fail the next `count` transactions with [`StoreError::Locked`].
    pub fn inject_locks(&self, count: u32) {
        self.injected_locks.store(count, Ordering::SeqCst);
    }

    /// Fail every transaction with `error` until cleared with `None`.
    pub fn inject_failure(&self, error: Option<StoreError>) {
        *self
            .injected_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Number of transactions started so far.
    pub fn transaction_count(&self) -> u32 {
        self.transactions.load(Ordering::SeqCst)
    }

    fn take_injected_lock(&self) -> bool {
        self.injected_locks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ClusterStore for MemoryClusterStore {
    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn ClusterTx) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let attempt = self.transactions.fetch_add(1, Ordering::SeqCst) + 1;

        if self.take_injected_lock() {
            debug!(attempt, "[MEMORY] Transaction hit injected lock");
            return Err(StoreError::Locked);
        }

        if let Some(err) = self
            .injected_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(err);
        }

        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let tx = MemoryTx {
            local_node: &self.local_node,
            state: &state,
        };
        f(&tx)
    }
}

struct MemoryTx<'a> {
    local_node: &'a str,
    state: &'a ClusterState,
}

impl MemoryTx<'_> {
    fn matching<'s>(
        &'s self,
        project: &'s str,
        instance_type: InstanceType,
    ) -> impl Iterator<Item = &'s InstanceEntry> + 's {
        self.state
            .instances
            .iter()
            .filter(move |i| i.project == project && instance_type.matches(i.instance_type))
    }

    fn address_of(&self, node_name: &str) -> &str {
        if node_name == self.local_node {
            return LOCAL_NODE_ADDRESS;
        }

        match self.state.nodes.iter().find(|n| n.name == node_name) {
            Some(node) if node.online => &node.address,
            _ => OFFLINE_NODE_ADDRESS,
        }
    }
}

impl ClusterTx for MemoryTx<'_> {
    fn instances_by_node_address(
        &self,
        project: &str,
        instance_type: InstanceType,
    ) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for instance in self.matching(project, instance_type) {
            grouped
                .entry(self.address_of(&instance.node).to_string())
                .or_default()
                .push(instance.name.clone());
        }
        Ok(grouped)
    }

    fn instance_node_names(
        &self,
        project: &str,
        instance_type: InstanceType,
    ) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .matching(project, instance_type)
            .map(|i| (i.name.clone(), i.node.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> ClusterState {
        ClusterState {
            nodes: vec![
                NodeEntry {
                    name: "node1".to_string(),
                    address: "10.0.0.1:8443".to_string(),
                    online: true,
                },
                NodeEntry {
                    name: "node2".to_string(),
                    address: "10.0.0.2:8443".to_string(),
                    online: true,
                },
                NodeEntry {
                    name: "node3".to_string(),
                    address: "10.0.0.3:8443".to_string(),
                    online: false,
                },
            ],
            instances: vec![
                entry("c1", "node1", InstanceType::Container),
                entry("c2", "node2", InstanceType::Container),
                entry("v1", "node2", InstanceType::VirtualMachine),
                entry("c3", "node3", InstanceType::Container),
                InstanceEntry {
                    name: "other".to_string(),
                    project: "staging".to_string(),
                    node: "node1".to_string(),
                    instance_type: InstanceType::Container,
                },
            ],
        }
    }

    fn entry(name: &str, node: &str, instance_type: InstanceType) -> InstanceEntry {
        InstanceEntry {
            name: name.to_string(),
            project: "default".to_string(),
            node: node.to_string(),
            instance_type,
        }
    }

    fn read_groups(
        store: &MemoryClusterStore,
        instance_type: InstanceType,
    ) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
        let mut groups = BTreeMap::new();
        store.transaction(&mut |tx| {
            groups = tx.instances_by_node_address("default", instance_type)?;
            Ok(())
        })?;
        Ok(groups)
    }

    #[test]
    fn test_groups_by_address() {
        let store = MemoryClusterStore::new("node1", test_state());
        let groups = read_groups(&store, InstanceType::Any).unwrap();

        assert_eq!(groups[LOCAL_NODE_ADDRESS], vec!["c1"]);
        assert_eq!(groups["10.0.0.2:8443"], vec!["c2", "v1"]);
        assert_eq!(groups[OFFLINE_NODE_ADDRESS], vec!["c3"]);
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn test_filters_by_type() {
        let store = MemoryClusterStore::new("node1", test_state());
        let groups = read_groups(&store, InstanceType::VirtualMachine).unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups["10.0.0.2:8443"], vec!["v1"]);
    }

    #[test]
    fn test_node_names() {
        let store = MemoryClusterStore::new("node1", test_state());
        let mut owners = HashMap::new();
        store
            .transaction(&mut |tx| {
                owners = tx.instance_node_names("default", InstanceType::Any)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(owners["c2"], "node2");
        assert_eq!(owners["c3"], "node3");
        assert!(!owners.contains_key("other"));
    }

    #[test]
    fn test_injected_locks() {
        let store = MemoryClusterStore::new("node1", test_state());
        store.inject_locks(2);

        assert_eq!(
            read_groups(&store, InstanceType::Any).unwrap_err(),
            StoreError::Locked
        );
        assert_eq!(
            read_groups(&store, InstanceType::Any).unwrap_err(),
            StoreError::Locked
        );
        assert!(read_groups(&store, InstanceType::Any).is_ok());
        assert_eq!(store.transaction_count(), 3);
    }

    #[test]
    fn test_injected_failure() {
        let store = MemoryClusterStore::new("node1", test_state());
        store.inject_failure(Some(StoreError::Query("boom".to_string())));

        let err = read_groups(&store, InstanceType::Any).unwrap_err();
        assert!(!err.is_retriable());

        store.inject_failure(None);
        assert!(read_groups(&store, InstanceType::Any).is_ok());
    }

    #[test]
    fn test_set_node_offline() {
        let store = MemoryClusterStore::new("node1", test_state());
        store.set_node_online("node2", false);

        let groups = read_groups(&store, InstanceType::Any).unwrap();
        assert_eq!(groups[OFFLINE_NODE_ADDRESS], vec!["c2", "v1", "c3"]);
    }
}
