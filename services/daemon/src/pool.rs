//! Bounded worker pool for rendering local instances.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

/// Default upper bound on concurrent local renders.
pub const DEFAULT_RENDER_WORKERS: usize = 4;

/// Fixed-size pool draining a single shared queue.
///
/// The queue is filled once and closed before the workers start pulling, so
/// a worker exits as soon as it finds the queue empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPool {
    max_workers: usize,
}

impl Default for RenderPool {
    fn default() -> Self {
        Self::new(DEFAULT_RENDER_WORKERS)
    }
}

impl RenderPool {
    /// Create a pool running at most `max_workers` jobs at once.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of workers spawned for a batch of `items` jobs.
    pub fn workers_for(&self, items: usize) -> usize {
        self.max_workers.min(items)
    }

    /// Run `work` once per item and wait for all of them.
    ///
    /// `work` is expected to record its own outcome. Each job runs in its own
    /// task, so a panicking job only loses that job: `on_panic` is called
    /// with its item and the worker moves on to the next one.
    pub async fn run<T, F, Fut, P>(&self, items: Vec<T>, work: F, on_panic: P)
    where
        T: Clone + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        P: Fn(T, JoinError) + Send + Sync + 'static,
    {
        let workers = self.workers_for(items.len());
        if workers == 0 {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for item in items {
            if tx.send(item).is_err() {
                break;
            }
        }
        drop(tx);

        let queue = Arc::new(Mutex::new(rx));
        let work = Arc::new(work);
        let on_panic = Arc::new(on_panic);
        let mut set = JoinSet::new();

        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let work = Arc::clone(&work);
            let on_panic = Arc::clone(&on_panic);
            set.spawn(async move {
                let mut done = 0usize;
                loop {
                    let next = queue.lock().await.recv().await;
                    let Some(item) = next else {
                        break;
                    };
                    if let Err(e) = tokio::spawn(work(item.clone())).await {
                        warn!(worker, error = %e, "Render job terminated abnormally");
                        on_panic(item, e);
                    }
                    done += 1;
                }
                debug!(worker, jobs = done, "Render worker drained queue");
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Render worker terminated abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_workers_for() {
        let pool = RenderPool::default();
        assert_eq!(pool.workers_for(0), 0);
        assert_eq!(pool.workers_for(2), 2);
        assert_eq!(pool.workers_for(4), 4);
        assert_eq!(pool.workers_for(10), 4);
    }

    #[test]
    fn test_zero_bound_is_clamped() {
        assert_eq!(RenderPool::new(0).max_workers(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_runs_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        RenderPool::default()
            .run(
                Vec::<u32>::new(),
                move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                },
                |_, _| {},
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let (in_flight_w, peak_w, done_w) =
            (Arc::clone(&in_flight), Arc::clone(&peak), Arc::clone(&done));

        RenderPool::default()
            .run(
                (0..10).collect(),
                move |_: u32| {
                    let in_flight = Arc::clone(&in_flight_w);
                    let peak = Arc::clone(&peak_w);
                    let done = Arc::clone(&done_w);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                    }
                },
                |_, _| {},
            )
            .await;

        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(peak.load(Ordering::SeqCst), 4);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_jobs_do_not_stop_pool() {
        let done = Arc::new(AtomicUsize::new(0));
        let panicked = Arc::new(std::sync::Mutex::new(Vec::new()));
        let counter = Arc::clone(&done);
        let failed = Arc::clone(&panicked);

        // More panicking jobs than workers.
        RenderPool::new(2)
            .run(
                (0..6).collect(),
                move |i: u32| {
                    let counter = Arc::clone(&counter);
                    async move {
                        if i < 3 {
                            panic!("render blew up");
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                },
                move |i, e| {
                    assert!(e.is_panic());
                    failed.lock().unwrap().push(i);
                },
            )
            .await;

        assert_eq!(done.load(Ordering::SeqCst), 3);
        let mut panicked = panicked.lock().unwrap().clone();
        panicked.sort_unstable();
        assert_eq!(panicked, vec![0, 1, 2]);
    }
}
