use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{ProgressionError, StoreError};

/// Caller-side policy for running a progression operation: each try gets its
/// own timeout, and retryable failures are re-run from a fresh read.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 2,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, ProgressionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProgressionError>>,
    {
        let mut tries = 0u32;
        loop {
            tries += 1;
            let outcome = match tokio::time::timeout(self.timeout, f()).await {
                Ok(res) => res,
                // the timed-out future is dropped here, which abandons its unit of work
                Err(_) => Err(StoreError::Timeout(self.timeout).into()),
            };
            match outcome {
                Err(e) if e.is_retryable() && tries <= self.retries => {
                    warn!(op, tries, error = %e, "retrying after retryable failure");
                    tokio::time::sleep(self.delay(tries)).await;
                }
                other => return other,
            }
        }
    }

    /// Linear backoff before try `tries + 1`.
    fn delay(&self, tries: u32) -> Duration {
        self.backoff.saturating_mul(tries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(200),
            retries,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let calls = &AtomicU32::new(0);
        let res = quick(2)
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProgressionError::from(StoreError::Unavailable("blip".into())))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reported_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let res: Result<(), _> = quick(3)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProgressionError::MaxAttemptsExceeded {
                    assessment_id: uuid::Uuid::nil(),
                    cap: 1,
                })
            })
            .await;
        assert!(matches!(res, Err(ProgressionError::MaxAttemptsExceeded { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeouts_surface_as_store_timeout() {
        let res: Result<(), _> = quick(0)
            .run("test", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            res,
            Err(ProgressionError::Store(StoreError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_gives_up_after_configured_retries() {
        let calls = &AtomicU32::new(0);
        let res: Result<(), _> = quick(1)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProgressionError::from(StoreError::Unavailable("down".into())))
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_grows_linearly_and_saturates() {
        let policy = quick(3);
        assert_eq!(policy.delay(3), Duration::from_millis(3));

        let huge = RetryPolicy {
            backoff: Duration::MAX,
            ..quick(3)
        };
        assert_eq!(huge.delay(2), Duration::MAX);
    }
}
