//! Retry policies with exponential backoff

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub initial_interval: Duration,
    /// Upper bound for any single delay
    pub max_interval: Duration,
    /// Multiplier applied after every failed attempt
    pub backoff_coefficient: f64,
    /// Total attempts including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    /// Policy for commands and credential requests
    pub fn standard() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(120),
            backoff_coefficient: 2.0,
            max_attempts: 3,
        }
    }

    pub fn compression() -> Self {
        Self {
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(300),
            backoff_coefficient: 2.0,
            max_attempts: 2,
        }
    }

    pub fn upload() -> Self {
        Self {
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(600),
            backoff_coefficient: 2.0,
            max_attempts: 3,
        }
    }

    pub fn verification() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(120),
            backoff_coefficient: 2.0,
            max_attempts: 5,
        }
    }

    pub fn deletion() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            max_attempts: 2,
        }
    }

    /// Same attempt count without any delay.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            max_attempts,
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = secs.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Run `op` until `should_retry` rejects its result or attempts run out.
///
/// Returns the last result and the number of attempts made. Cancellation
/// during a backoff sleep stops retrying and returns the last result.
pub async fn retry_with<T, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
    should_retry: P,
) -> (T, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = op(attempt).await;
        if attempt >= max_attempts || !should_retry(&result) || cancel.is_cancelled() {
            return (result, attempt);
        }

        let delay = policy.backoff(attempt);
        warn!(
            operation = %operation,
            attempt = attempt,
            max_attempts = max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                debug!(operation = %operation, "Cancelled during backoff");
                return (result, attempt);
            }
        }
        attempt += 1;
    }
}
