//! Shared retry-with-backoff logic for copies, probes, segment downloads,
//! uploads, and callback delivery.

use crate::error::JobError;
use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Fixed delay between attempts (segment downloads, uploads).
    Constant(Duration),
    /// `base * 2^attempt` capped at `max` (copies, probes).
    Exponential { base: Duration, max: Duration },
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    pub backoff: Backoff,
    /// When true, adds random jitter of [0, delay/2) to prevent synchronized
    /// retries across workers.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Constant backoff without jitter.
    pub fn constant(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Constant(delay),
            jitter: false,
        }
    }

    /// Exponential backoff with jitter.
    pub fn exponential(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential { base, max },
            jitter: true,
        }
    }

    /// Compute the delay for a given attempt number (0-indexed).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Constant(delay) => delay,
            Backoff::Exponential { base, max } => {
                // Checked shift so misconfigured attempt counts saturate
                // instead of overflowing.
                let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                base.checked_mul(multiplier).unwrap_or(max).min(max)
            }
        };

        if !self.jitter {
            return delay;
        }
        let jitter_range_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..jitter_range_ms))
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed transiently; try again after the backoff.
    Retry(JobError),
    /// Operation failed permanently; stop immediately.
    Fail(JobError),
}

/// Execute an async operation with retry-and-backoff.
///
/// The `operation` closure receives the current attempt number (0-indexed)
/// and returns a [`RetryAction`].
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> Result<T, JobError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient(reason: &str) -> JobError {
        JobError::Copy {
            reason: reason.to_string(),
        }
    }

    #[test]
    fn constant_backoff_is_flat() {
        let policy = RetryPolicy::constant(10, Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(5));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 6,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_secs(1),
            },
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn fail_short_circuits() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            &RetryPolicy::constant(5, Duration::from_millis(1)),
            "test",
            |_| {
                attempts.fetch_add(1, Ordering::Relaxed);
                async { RetryAction::Fail(transient("gone")) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn retries_until_exhausted() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            &RetryPolicy::constant(2, Duration::from_millis(1)),
            "test",
            |_| {
                attempts.fetch_add(1, Ordering::Relaxed);
                async { RetryAction::Retry(transient("flaky")) }
            },
        )
        .await;
        assert!(result.is_err());
        // Initial attempt + 2 retries.
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn recovers_on_later_attempt() {
        let result = retry_with_backoff(
            &RetryPolicy::constant(3, Duration::from_millis(1)),
            "test",
            |attempt| async move {
                if attempt < 2 {
                    RetryAction::Retry(transient("flaky"))
                } else {
                    RetryAction::Success(attempt)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
