//! Project topology: which node owns which instance.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::instance::InstanceType;
use crate::store::{ClusterStore, StoreError, LOCAL_NODE_ADDRESS, OFFLINE_NODE_ADDRESS};

/// Instance placement for one project, read in a single transaction.
///
/// Fetched fresh for every request and discarded afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    /// Instance names grouped by owning node address.
    pub by_node_address: BTreeMap<String, Vec<String>>,

    /// Owning node name per instance.
    pub owner_of: HashMap<String, String>,
}

impl TopologySnapshot {
    /// Total number of instances across all node groups.
    pub fn instance_count(&self) -> usize {
        self.by_node_address.values().map(Vec::len).sum()
    }

    /// Owning node name, or empty if the store did not report one.
    pub fn owner(&self, name: &str) -> &str {
        self.owner_of.get(name).map(String::as_str).unwrap_or("")
    }
}

/// Where a node group has to be fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind<'a> {
    Local,
    Offline,
    Remote(&'a str),
}

impl<'a> NodeKind<'a> {
    pub fn of(address: &'a str) -> Self {
        match address {
            LOCAL_NODE_ADDRESS => NodeKind::Local,
            OFFLINE_NODE_ADDRESS => NodeKind::Offline,
            remote => NodeKind::Remote(remote),
        }
    }
}

/// Read the topology of a project. Retrying is up to the caller.
pub fn resolve(
    store: &dyn ClusterStore,
    project: &str,
    instance_type: InstanceType,
) -> Result<TopologySnapshot, StoreError> {
    let mut snapshot = TopologySnapshot::default();

    store.transaction(&mut |tx| {
        snapshot.by_node_address = tx.instances_by_node_address(project, instance_type)?;
        snapshot.owner_of = tx.instance_node_names(project, instance_type)?;
        Ok(())
    })?;

    debug!(
        project = %project,
        instance_type = %instance_type,
        node_groups = snapshot.by_node_address.len(),
        instances = snapshot.instance_count(),
        "Resolved topology"
    );

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClusterState, InstanceEntry, MemoryClusterStore, NodeEntry};

    fn store() -> MemoryClusterStore {
        MemoryClusterStore::new(
            "node1",
            ClusterState {
                nodes: vec![NodeEntry {
                    name: "node2".to_string(),
                    address: "10.0.0.2:8443".to_string(),
                    online: true,
                }],
                instances: vec![
                    InstanceEntry {
                        name: "a".to_string(),
                        project: "default".to_string(),
                        node: "node1".to_string(),
                        instance_type: InstanceType::Container,
                    },
                    InstanceEntry {
                        name: "b".to_string(),
                        project: "default".to_string(),
                        node: "node2".to_string(),
                        instance_type: InstanceType::Container,
                    },
                ],
            },
        )
    }

    #[test]
    fn test_resolve() {
        let topology = resolve(&store(), "default", InstanceType::Any).unwrap();

        assert_eq!(topology.instance_count(), 2);
        assert_eq!(topology.by_node_address[""], vec!["a"]);
        assert_eq!(topology.by_node_address["10.0.0.2:8443"], vec!["b"]);
        assert_eq!(topology.owner("b"), "node2");
        assert_eq!(topology.owner("missing"), "");
    }

    #[test]
    fn test_resolve_does_not_retry() {
        let store = store();
        store.inject_locks(1);

        let err = resolve(&store, "default", InstanceType::Any).unwrap_err();
        assert_eq!(err, StoreError::Locked);
        assert_eq!(store.transaction_count(), 1);
    }

    #[test]
    fn test_node_kind() {
        assert_eq!(NodeKind::of(""), NodeKind::Local);
        assert_eq!(NodeKind::of("0.0.0.0"), NodeKind::Offline);
        assert_eq!(NodeKind::of("10.0.0.2:8443"), NodeKind::Remote("10.0.0.2:8443"));
    }
}
