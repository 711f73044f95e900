//! Background operations.
//!
//! Mutating requests return immediately with an [`Operation`] descriptor while
//! the work runs on an [`OperationRunner`].

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a finished operation stays queryable.
pub const DEFAULT_OPERATION_RETENTION: Duration = Duration::from_secs(300);

/// Error produced by a failed task.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Work carried out by an operation.
pub type OperationTask = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationStatus {
    Running,
    Success,
    Failure,
}

impl OperationStatus {
    pub fn code(&self) -> u16 {
        match self {
            OperationStatus::Running => 103,
            OperationStatus::Success => 200,
            OperationStatus::Failure => 400,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, OperationStatus::Running)
    }
}

/// Descriptor of a background operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    pub id: Uuid,
    pub class: OperationClass,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: OperationStatus,
    pub status_code: u16,
    /// Affected resources by kind.
    pub resources: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err: String,
}

impl Operation {
    fn new(description: &str, resources: BTreeMap<String, Vec<String>>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            class: OperationClass::Task,
            description: description.to_string(),
            created_at: now,
            updated_at: now,
            status: OperationStatus::Running,
            status_code: OperationStatus::Running.code(),
            resources,
            err: String::new(),
        }
    }

    fn finish(&mut self, result: Result<(), TaskError>) {
        self.status = match &result {
            Ok(()) => OperationStatus::Success,
            Err(_) => OperationStatus::Failure,
        };
        self.status_code = self.status.code();
        self.err = result.err().map(|e| e.to_string()).unwrap_or_default();
        self.updated_at = Utc::now();
    }

    /// Path of the operation resource.
    pub fn url(&self) -> String {
        format!("/{}/operations/{}", crate::listing::API_VERSION, self.id)
    }
}

/// Runs operation tasks in the background.
#[async_trait]
pub trait OperationRunner: Send + Sync {
    /// Start `task` and return its descriptor in the running state.
    fn submit(
        &self,
        description: &str,
        resources: BTreeMap<String, Vec<String>>,
        task: OperationTask,
    ) -> Operation;

    /// Current descriptor of an operation.
    fn get(&self, id: Uuid) -> Option<Operation>;

    /// Wait for an operation to finish and return its final descriptor.
    async fn wait(&self, id: Uuid) -> Option<Operation>;
}

struct Entry {
    operation: Operation,
    done: watch::Receiver<bool>,
}

/// Runs each operation in its own tokio task.
///
/// Finished operations are forgotten once the retention period has passed.
#[derive(Clone)]
pub struct TokioOperationRunner {
    operations: Arc<RwLock<HashMap<Uuid, Entry>>>,
    retention: Duration,
}

impl Default for TokioOperationRunner {
    fn default() -> Self {
        Self::with_retention(DEFAULT_OPERATION_RETENTION)
    }
}

impl TokioOperationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            operations: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }
}

#[async_trait]
impl OperationRunner for TokioOperationRunner {
    fn submit(
        &self,
        description: &str,
        resources: BTreeMap<String, Vec<String>>,
        task: OperationTask,
    ) -> Operation {
        let operation = Operation::new(description, resources);
        let id = operation.id;
        let (done_tx, done_rx) = watch::channel(false);

        self.operations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Entry {
                    operation: operation.clone(),
                    done: done_rx,
                },
            );

        let operations = Arc::clone(&self.operations);
        let retention = self.retention;
        tokio::spawn(async move {
            let result = match tokio::spawn(task).await {
                Ok(result) => result,
                Err(e) => Err(TaskError::from(format!("operation task aborted: {e}"))),
            };
            match &result {
                Ok(()) => info!(operation_id = %id, "Operation succeeded"),
                Err(e) => warn!(operation_id = %id, error = %e, "Operation failed"),
            }

            if let Some(entry) = operations
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .get_mut(&id)
            {
                entry.operation.finish(result);
            }
            let _ = done_tx.send(true);

            tokio::time::sleep(retention).await;
            operations
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            debug!(operation_id = %id, "Operation expired");
        });

        operation
    }

    fn get(&self, id: Uuid) -> Option<Operation> {
        self.operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|entry| entry.operation.clone())
    }

    async fn wait(&self, id: Uuid) -> Option<Operation> {
        let mut done = self
            .operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|entry| entry.done.clone())?;

        // A dropped sender means the task is gone; report what was recorded.
        let _ = done.wait_for(|finished| *finished).await;
        self.get(id)
    }
}
