//! Bounded retry primitives.
//!
//! The cluster store reports transient lock contention that is expected to
//! clear within milliseconds. Callers wrap a whole operation in a
//! [`RetryPolicy`] so it is re-run a bounded number of times with a fixed
//! pause in between.
//!
//! # Invariants
//!
//! - The operation is invoked at most `max_attempts` times
//! - Consecutive attempts are separated by at least `backoff`
//! - A failure the caller does not classify as retriable is returned after
//!   the attempt that produced it, without sleeping

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Default maximum number of attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

/// Default pause between attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retriable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// An attempt failed with an error that must not be retried.
    #[error(transparent)]
    Permanent(E),
}

/// Fixed-backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (at least one attempt is always made).
    pub max_attempts: u32,

    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is used up.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, R>(&self, mut op: F, is_retriable: R) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_retriable(&err) {
                return Err(RetryError::Permanent(err));
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, "Retry budget exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            debug!(
                attempt,
                max_attempts,
                backoff_ms = self.backoff.as_millis() as u64,
                "Transient failure, retrying"
            );
            tokio::time::sleep(self.backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum TestError {
        Busy,
        Broken,
    }

    fn is_busy(err: &TestError) -> bool {
        *err == TestError::Busy
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 100);
        assert_eq!(policy.backoff, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_first_attempt() {
        let calls = Cell::new(0);
        let result: Result<u32, RetryError<TestError>> = RetryPolicy::default()
            .run(
                |attempt| {
                    calls.set(calls.get() + 1);
                    async move { Ok(attempt) }
                },
                is_busy,
            )
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success_with_backoff() {
        let start = Instant::now();
        let result = RetryPolicy::new(10, Duration::from_millis(100))
            .run(
                |attempt| async move {
                    if attempt < 4 {
                        Err(TestError::Busy)
                    } else {
                        Ok(attempt)
                    }
                },
                is_busy,
            )
            .await;

        assert_eq!(result.unwrap(), 4);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = Cell::new(0);
        let start = Instant::now();
        let result: Result<(), _> = RetryPolicy::default()
            .run(
                |_| {
                    calls.set(calls.get() + 1);
                    async { Err(TestError::Broken) }
                },
                is_busy,
            )
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Permanent(TestError::Broken))
        ));
        assert_eq!(calls.get(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::new(5, Duration::from_millis(100))
            .run(
                |_| {
                    calls.set(calls.get() + 1);
                    async { Err(TestError::Busy) }
                },
                is_busy,
            )
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 5);
                assert_eq!(last, TestError::Busy);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.get(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_runs_once() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::new(0, Duration::from_millis(100))
            .run(
                |_| {
                    calls.set(calls.get() + 1);
                    async { Err(TestError::Busy) }
                },
                is_busy,
            )
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 1, .. })
        ));
        assert_eq!(calls.get(), 1);
    }
}
