//! Retry logic with exponential backoff for transient provider errors.
//!
//! Every provider call made by the executor goes through [`with_retry`],
//! which also bounds each attempt with a timeout. A timed-out attempt is
//! treated like any other transient failure.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ProviderError;

/// Retry policy for a single operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempts, base delay and factor.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Creates a policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculates the delay after a failed attempt (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }
}

/// Result of a retried operation together with the number of attempts made.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result.
    pub result: Result<T, ProviderError>,
    /// Attempts made, at least 1.
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails permanently, or exhausts the policy.
///
/// Each attempt is bounded by `timeout`. The closure receives the 1-based
/// attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    label: &str,
    mut operation: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(timeout, operation(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::transient(format!(
                "operation timed out after {}s",
                timeout.as_secs_f64()
            ))),
        };

        match result {
            Ok(value) => {
                debug!("{label} succeeded on attempt {attempt}");
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    "{label}: attempt {attempt}/{max_attempts} failed: {e}. Retrying in {}ms",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                };
            }
        }
    }
}
