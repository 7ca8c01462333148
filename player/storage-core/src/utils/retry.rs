use std::fmt::Display;
use std::time::Duration;

/// Backoff policy for operations against the remote store.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter_max: Some(Duration::from_millis(50)),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, used where the caller already owns the retry loop.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter_max: None,
        }
    }

    fn delay_for(&self, backoff: Duration) -> Duration {
        match self.jitter_max {
            Some(jitter_max) if !jitter_max.is_zero() => {
                let jitter_ms = jitter_max.as_millis() as u64;
                backoff + Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1))
            }
            _ => backoff,
        }
    }
}

/// Runs `f` until it succeeds or `policy.max_attempts` is exhausted, sleeping
/// with exponential backoff between attempts. Returns the last error.
pub async fn retry_with_policy<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0usize;
    let mut backoff = policy.base_backoff;

    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= policy.max_attempts.max(1) => {
                tracing::warn!(operation, attempt, error = %e, "giving up after retries");
                return Err(e);
            }
            Err(e) => {
                tracing::debug!(operation, attempt, error = %e, "retrying");
                tokio::time::sleep(policy.delay_for(backoff)).await;
                backoff = std::cmp::min(backoff * 2, policy.max_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            jitter_max: None,
        }
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let counter = AtomicUsize::new(0);

        let res: Result<usize, &'static str> =
            retry_with_policy(&fast_policy(3), "push", || async {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("offline")
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(res, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_returns_last_error() {
        let counter = AtomicUsize::new(0);

        let res: Result<(), &'static str> = retry_with_policy(&fast_policy(2), "push", || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("always offline")
        })
        .await;

        assert_eq!(res, Err("always offline"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn single_attempt_policy_does_not_retry() {
        let counter = AtomicUsize::new(0);

        let res: Result<(), &'static str> = retry_with_policy(&RetryPolicy::once(), "push", || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("offline")
        })
        .await;

        assert!(res.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
