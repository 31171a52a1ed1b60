//! Failure handling policy for bus calls
//!
//! The relay keeps running when the bus misbehaves. `LogOnly` makes one
//! attempt and logs the failure; `Retry` backs off between attempts.

use std::future::Future;
use std::time::Duration;

use super::BusError;

/// How a failed bus call is handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Single attempt, failure is logged and returned
    LogOnly,
    /// Up to `max_attempts` attempts with quadratic backoff
    Retry {
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    },
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::LogOnly
    }
}

impl FailurePolicy {
    /// Build a policy from attempt count and delays; one attempt or fewer means log-only
    pub fn from_attempts(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        if max_attempts <= 1 {
            FailurePolicy::LogOnly
        } else {
            FailurePolicy::Retry {
                max_attempts,
                base_delay,
                max_delay,
            }
        }
    }

    /// Total number of attempts this policy makes
    pub fn max_attempts(&self) -> u32 {
        match self {
            FailurePolicy::LogOnly => 1,
            FailurePolicy::Retry { max_attempts, .. } => *max_attempts,
        }
    }

    /// Delay before the retry that follows `attempt` failed attempts
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            FailurePolicy::LogOnly => Duration::ZERO,
            FailurePolicy::Retry {
                base_delay,
                max_delay,
                ..
            } => {
                // base, 4x base, 9x base...
                let factor = attempt.saturating_mul(attempt);
                base_delay.saturating_mul(factor).min(*max_delay)
            }
        }
    }

    /// Run `op` under this policy.
    ///
    /// Every failed attempt is logged with `operation` as context. The last
    /// error is returned once attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, BusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BusError>>,
    {
        let attempts = self.max_attempts().max(1);
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                tokio::time::sleep(self.delay_for(attempt)).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(
                        operation = %operation,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Bus operation failed"
                    );
                    if attempt >= attempts {
                        return Err(e);
                    }
                }
            }
        }
    }
}
