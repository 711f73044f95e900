//! Application state shared across request handlers.

use std::sync::Arc;

use crate::instance::InstanceSource;
use crate::listing::InstanceLister;
use crate::operation::OperationRunner;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    node_name: String,
    lister: InstanceLister,
    instances: Arc<dyn InstanceSource>,
    operations: Arc<dyn OperationRunner>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(
        node_name: impl Into<String>,
        lister: InstanceLister,
        instances: Arc<dyn InstanceSource>,
        operations: Arc<dyn OperationRunner>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                node_name: node_name.into(),
                lister,
                instances,
                operations,
            }),
        }
    }

    /// Name of the node this daemon runs on.
    pub fn node_name(&self) -> &str {
        &self.inner.node_name
    }

    pub fn lister(&self) -> &InstanceLister {
        &self.inner.lister
    }

    pub fn instances(&self) -> &dyn InstanceSource {
        self.inner.instances.as_ref()
    }

    pub fn operations(&self) -> &dyn OperationRunner {
        self.inner.operations.as_ref()
    }
}
