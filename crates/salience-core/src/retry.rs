//! Retry policy for external capability calls: per-attempt timeout, bounded
//! attempts, exponential backoff.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capability::CapabilityResult;
use crate::domain::CapabilityError;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries).
    pub max_attempts: u32,
    /// Wall-clock limit for a single attempt (milliseconds).
    pub timeout_ms: u64,
    /// Delay before the second attempt; doubles per further attempt.
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_ms: 30_000,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the call once.
    pub fn no_retry(timeout_ms: u64) -> Self {
        Self {
            max_attempts: 1,
            timeout_ms,
            backoff_base_ms: 0,
        }
    }

    /// Backoff before attempt `attempt + 1`, given that `attempt` just failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }

    /// Run `call` under this policy.
    ///
    /// Timeouts and transient errors are retried until attempts run out; the
    /// last error is returned. Non-transient errors return immediately.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> CapabilityResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CapabilityResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let timeout = Duration::from_millis(self.timeout_ms);
        let mut last_err = CapabilityError::Other(format!("{operation}: no attempt made"));

        for attempt in 1..=max_attempts {
            let err = match tokio::time::timeout(timeout, call()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "capability call succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_elapsed) => CapabilityError::Timeout {
                    elapsed_ms: self.timeout_ms,
                },
            };

            warn!(
                operation,
                attempt,
                max_attempts,
                error = %err,
                "capability call failed"
            );

            if !err.is_transient() {
                return Err(err);
            }
            last_err = err;

            if attempt < max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(last_err)
    }
}
