//! # Exponential Backoff
//!
//! Provides a doubling backoff for retrying transient cluster API failures.
//! Each delay is twice the previous one, starting at `base` and capped at `cap`.
//! [`retry_transient`] adds up to 25% random jitter to each delay.
//!
//! ## Usage
//!
//! ```rust
//! use kube_fixtures::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
//! assert_eq!(backoff.next_backoff(), Duration::from_millis(100));
//! assert_eq!(backoff.next_backoff(), Duration::from_millis(200));
//! assert_eq!(backoff.next_backoff(), Duration::from_millis(400));
//! ```

use crate::cluster::ApiError;
use crate::config::RetryPolicy;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Starting value (for reset)
    base: Duration,
    /// Value returned by the next call
    current: Duration,
    /// Maximum value
    cap: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `base` and never exceeding `cap`
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            current: base.min(cap),
            cap,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.cap);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.base.min(self.cap);
    }
}

/// Add up to 25% random jitter to `delay`
#[must_use]
pub fn jittered(delay: Duration) -> Duration {
    let spread = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=spread))
}

/// Run `op` until it succeeds, fails terminally, or `policy.max_attempts` is reached
///
/// Only [`ApiError::is_transient`] failures are retried. The last error is
/// returned on exhaustion so callers can report it.
pub async fn retry_transient<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = jittered(backoff.next_backoff());
                debug!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(
                        "{} failed after {} attempts: {}",
                        operation, policy.max_attempts, e
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base: Duration::from_millis(10),
            cap: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(1000));

        assert_eq!(backoff.next_backoff(), Duration::from_millis(100));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(200));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(400));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(800));
        // Next would be 1600ms, capped at 1000ms
        assert_eq!(backoff.next_backoff(), Duration::from_millis(1000));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(50), Duration::from_millis(1000));
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_millis(50));
    }

    #[test]
    fn test_base_above_cap_starts_at_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        for _ in 0..100 {
            let delay = jittered(Duration::from_millis(400));
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
        assert_eq!(jittered(Duration::from_millis(2)), Duration::from_millis(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_transient(policy(3), "create", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ApiError::transient("connection reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), ApiError> = retry_transient(policy(4), "create", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::transient("rate limited"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_retry_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), ApiError> = retry_transient(policy(5), "create", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::terminal("forbidden"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
