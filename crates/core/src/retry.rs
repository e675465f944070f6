// crates/core/src/retry.rs

//! Bounded exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EvaluationError, FmError, SandboxError};

/// Backoff schedule: `delay_n = min(initial * multiplier^n, max)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            max_delay_ms: 60_000,
            max_retries: 5,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for FmError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

impl Retryable for SandboxError {
    fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::Unavailable(_))
    }
}

impl Retryable for EvaluationError {
    fn is_retryable(&self) -> bool {
        matches!(self, EvaluationError::SandboxUnavailable(_))
    }
}

/// Run `op` until it succeeds, fails non-retryably, or retries run out.
pub async fn retry_transient<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                warn!(
                    op = label,
                    attempt = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 4,
            max_retries,
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_schedule_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for(3), Duration::from_secs(40));
        assert_eq!(policy.delay_for(4), Duration::from_secs(60));
        assert_eq!(policy.delay_for(9), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, FmError> = retry_transient(&fast_policy(5), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FmError::Transient("rate limited".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FmError> = retry_transient(&fast_policy(5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FmError::Fatal("401".into())) }
        })
        .await;

        assert_eq!(result, Err(FmError::Fatal("401".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), SandboxError> = retry_transient(&fast_policy(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SandboxError::Unavailable("down".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
