//! In-place instance updates and snapshot restores.
//!
//! Both run as background operations; the request only validates that the
//! instance exists locally.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::instance::{Instance, InstanceArgs, InstanceError, InstanceSource, LoadError};
use crate::operation::{Operation, OperationRunner, OperationTask, TaskError};

/// Separator between an instance name and a snapshot name.
pub const SNAPSHOT_DELIMITER: char = '/';

/// Body of an instance update request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InstancePut {
    pub architecture: String,
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    pub ephemeral: bool,
    pub profiles: Vec<String>,
    /// Snapshot to restore; an update is performed when empty.
    pub restore: String,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("instance {project}/{name} not found")]
    NotFound { project: String, name: String },

    #[error("snapshot {snapshot} does not exist")]
    SnapshotNotFound { snapshot: String },

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error(transparent)]
    Load(LoadError),
}

impl From<LoadError> for UpdateError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::NotFound { project, name } => UpdateError::NotFound { project, name },
            other => UpdateError::Load(other),
        }
    }
}

/// Numeric id of an architecture name; unknown names map to 0.
pub fn architecture_id(name: &str) -> u32 {
    match name {
        "x86_64" => 1,
        "i686" => 2,
        "armv7l" => 3,
        "aarch64" => 4,
        "ppc64le" => 7,
        "s390x" => 8,
        _ => 0,
    }
}

/// Qualify a bare snapshot name with its instance.
pub fn snapshot_full_name(instance: &str, snapshot: &str) -> String {
    if snapshot.contains(SNAPSHOT_DELIMITER) {
        snapshot.to_string()
    } else {
        format!("{instance}{SNAPSHOT_DELIMITER}{snapshot}")
    }
}

/// Start an update or a restore of a local instance.
pub async fn update_instance(
    source: &dyn InstanceSource,
    runner: &dyn OperationRunner,
    project: &str,
    name: &str,
    put: InstancePut,
) -> Result<Operation, UpdateError> {
    let instance = source.load_by_project_and_name(project, name).await?;
    let resources = BTreeMap::from([("instances".to_string(), vec![name.to_string()])]);

    if put.restore.is_empty() {
        let args = InstanceArgs {
            architecture: architecture_id(&put.architecture),
            config: put.config,
            devices: put.devices,
            ephemeral: put.ephemeral,
            profiles: put.profiles,
        };

        let task: OperationTask = Box::pin(async move {
            instance.update(args).await?;
            Ok::<(), TaskError>(())
        });
        return Ok(runner.submit("Updating instance", resources, task));
    }

    let snapshot = snapshot_full_name(name, &put.restore);
    info!(instance = %name, snapshot = %snapshot, "Restoring snapshot");

    let task: OperationTask = Box::pin(async move {
        restore_snapshot(instance, &snapshot).await?;
        Ok::<(), TaskError>(())
    });
    Ok(runner.submit("Restoring snapshot", resources, task))
}

async fn restore_snapshot(instance: Arc<dyn Instance>, snapshot: &str) -> Result<(), UpdateError> {
    if !instance.snapshots().iter().any(|s| s == snapshot) {
        return Err(UpdateError::SnapshotNotFound {
            snapshot: snapshot.to_string(),
        });
    }

    instance.restore(snapshot).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::instance::InstanceType;
    use crate::memory::{MemoryInstance, MemoryInstanceSource};
    use crate::operation::{OperationStatus, TokioOperationRunner};

    #[rstest]
    #[case("x86_64", 1)]
    #[case("i686", 2)]
    #[case("armv7l", 3)]
    #[case("aarch64", 4)]
    #[case("ppc64le", 7)]
    #[case("s390x", 8)]
    #[case("", 0)]
    #[case("riscv64", 0)]
    fn test_architecture_id(#[case] name: &str, #[case] expected: u32) {
        assert_eq!(architecture_id(name), expected);
    }

    #[test]
    fn test_snapshot_full_name() {
        assert_eq!(snapshot_full_name("c1", "snap0"), "c1/snap0");
        assert_eq!(snapshot_full_name("c1", "c1/snap0"), "c1/snap0");
    }

    fn source() -> (MemoryInstanceSource, Arc<MemoryInstance>) {
        let source = MemoryInstanceSource::new();
        let instance = source.insert(
            MemoryInstance::new("c1", "default", InstanceType::Container, "node1")
                .with_config("user.x", "1")
                .with_snapshot("snap0")
                .with_config("user.x", "2"),
        );
        (source, instance)
    }

    #[tokio::test]
    async fn test_update_applies_args() {
        let (source, instance) = source();
        let runner = TokioOperationRunner::new();
        let put = InstancePut {
            architecture: "aarch64".to_string(),
            config: BTreeMap::from([("limits.cpu".to_string(), "2".to_string())]),
            profiles: vec!["default".to_string(), "gpu".to_string()],
            ..Default::default()
        };

        let op = update_instance(&source, &runner, "default", "c1", put)
            .await
            .unwrap();
        assert_eq!(op.resources["instances"], vec!["c1"]);

        let done = runner.wait(op.id).await.unwrap();
        assert_eq!(done.status, OperationStatus::Success);
        assert_eq!(instance.architecture(), 4);
        assert_eq!(instance.config()["limits.cpu"], "2");
        assert_eq!(instance.profiles(), vec!["default", "gpu"]);
    }

    #[tokio::test]
    async fn test_restore_bare_snapshot_name() {
        let (source, instance) = source();
        let runner = TokioOperationRunner::new();
        let put = InstancePut {
            restore: "snap0".to_string(),
            ..Default::default()
        };

        let op = update_instance(&source, &runner, "default", "c1", put)
            .await
            .unwrap();
        let done = runner.wait(op.id).await.unwrap();

        assert_eq!(done.status, OperationStatus::Success);
        assert_eq!(instance.config()["user.x"], "1");
    }

    #[tokio::test]
    async fn test_restore_missing_snapshot_fails_operation() {
        let (source, _instance) = source();
        let runner = TokioOperationRunner::new();
        let put = InstancePut {
            restore: "snap9".to_string(),
            ..Default::default()
        };

        let op = update_instance(&source, &runner, "default", "c1", put)
            .await
            .unwrap();
        let done = runner.wait(op.id).await.unwrap();

        assert_eq!(done.status, OperationStatus::Failure);
        assert_eq!(done.err, "snapshot c1/snap9 does not exist");
    }

    #[tokio::test]
    async fn test_missing_instance() {
        let (source, _instance) = source();
        let runner = TokioOperationRunner::new();

        let err = update_instance(&source, &runner, "default", "nope", InstancePut::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::NotFound { .. }));
    }

    #[test]
    fn test_put_body_defaults() {
        let put: InstancePut = serde_json::from_str(r#"{"restore": "snap0"}"#).unwrap();
        assert_eq!(put.restore, "snap0");
        assert!(put.config.is_empty());
        assert!(!put.ephemeral);
    }
}
