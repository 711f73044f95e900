//! Shared result accumulation for listing requests.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use fleet_filter::FilterTarget;

use crate::instance::{Instance, InstanceFull, InstanceSummary, InstanceType, RenderError};
use crate::remote::{NodeError, RemoteFetcher};

/// Append-only collection shared by every producer of a request.
///
/// The lock is only held for the duration of an append.
#[derive(Debug, Default)]
pub struct ResultAccumulator<T> {
    items: Mutex<Vec<T>>,
}

impl<T> ResultAccumulator<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(items);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move everything collected so far out of the accumulator.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A record shape that can be rendered locally or fetched from a node.
#[async_trait]
pub trait InstanceRecord: FilterTarget + Send + Sync + Sized + 'static {
    /// Placeholder for an instance whose state could not be obtained.
    fn error_record(name: &str, location: &str) -> Self;

    async fn render(instance: &dyn Instance) -> Result<Self, RenderError>;

    async fn fetch(
        fetcher: &RemoteFetcher,
        project: &str,
        address: &str,
        instance_type: InstanceType,
    ) -> Result<Vec<Self>, NodeError>;
}

#[async_trait]
impl InstanceRecord for InstanceSummary {
    fn error_record(name: &str, location: &str) -> Self {
        InstanceSummary::error(name, location)
    }

    async fn render(instance: &dyn Instance) -> Result<Self, RenderError> {
        let (summary, _etag) = instance.render().await?;
        Ok(summary)
    }

    async fn fetch(
        fetcher: &RemoteFetcher,
        project: &str,
        address: &str,
        instance_type: InstanceType,
    ) -> Result<Vec<Self>, NodeError> {
        fetcher.fetch_summaries(project, address, instance_type).await
    }
}

#[async_trait]
impl InstanceRecord for InstanceFull {
    fn error_record(name: &str, location: &str) -> Self {
        InstanceFull::error(name, location)
    }

    async fn render(instance: &dyn Instance) -> Result<Self, RenderError> {
        instance.render_full().await
    }

    async fn fetch(
        fetcher: &RemoteFetcher,
        project: &str,
        address: &str,
        instance_type: InstanceType,
    ) -> Result<Vec<Self>, NodeError> {
        fetcher.fetch_full(project, address, instance_type).await
    }
}

/// Sort records ascending by instance name.
pub fn sort_by_name<T: FilterTarget>(records: &mut [T]) {
    records.sort_by(|a, b| a.name().cmp(b.name()));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_take_drains() {
        let acc = ResultAccumulator::new();
        acc.push(1);
        acc.extend([2, 3]);
        assert_eq!(acc.len(), 3);

        assert_eq!(acc.take(), vec![1, 2, 3]);
        assert!(acc.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_pushes() {
        let acc = Arc::new(ResultAccumulator::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let acc = Arc::clone(&acc);
            handles.push(tokio::spawn(async move {
                for j in 0..100 {
                    acc.push(i * 100 + j);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut items = acc.take();
        items.sort_unstable();
        assert_eq!(items, (0..800).collect::<Vec<_>>());
    }

    #[test]
    fn test_sort_by_name() {
        let mut records = vec![
            InstanceSummary::error("web2", "n1"),
            InstanceSummary::error("db", "n2"),
            InstanceSummary::error("web10", "n1"),
        ];
        sort_by_name(&mut records);

        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["db", "web10", "web2"]);
    }

    #[test]
    fn test_error_records() {
        let full = <InstanceFull as InstanceRecord>::error_record("c1", "node2");
        assert_eq!(full.name(), "c1");
        assert_eq!(full.instance.location, "node2");
        assert!(full.snapshots.is_empty());
    }
}
