//! Bounded retry with exponential backoff
//!
//! Shared by the publish path, the handler retry loop and reconnects.
//!
//! ## Usage
//!
//! ```rust
//! use integration_events::retry::RetryPolicy;
//!
//! let policy = RetryPolicy::default(); // 5 retries, 200ms base, 10s max
//! assert_eq!(policy.max_attempts(), 6);
//! ```

use crate::error::{EventError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry behaviour for one class of operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first (0 = no retries)
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential growth)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// A policy with no retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Policy with the given retry count and default delays
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Total attempts, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Calculate the delay for a given attempt number (0-indexed)
    ///
    /// Uses exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
    /// Adds jitter of ±25% to avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(10));
        let capped = exp_delay.min(self.max_delay_ms);

        let jitter_range = capped / 4;
        let delay = if jitter_range > 0 {
            let jitter_offset = (attempt as u64 * 7 + 3) % (jitter_range * 2 + 1);
            capped - jitter_range + jitter_offset
        } else {
            capped
        };

        Duration::from_millis(delay)
    }
}

/// Outcome of a single attempt, used by the retry loop
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    /// Attempt succeeded
    Success(T),
    /// Attempt failed and may succeed if tried again
    Retryable(EventError),
    /// Attempt failed permanently (bail immediately)
    Fatal(EventError),
}

impl<T> From<Result<T>> for AttemptOutcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Success(value),
            Err(e) if e.is_transient() => AttemptOutcome::Retryable(e),
            Err(e) => AttemptOutcome::Fatal(e),
        }
    }
}

/// Execute an async operation with retry logic.
///
/// The `operation` closure is called on each attempt with the 0-indexed
/// attempt number. Retryable failures wait with exponential backoff; fatal
/// failures return immediately. Exhaustion returns
/// [`EventError::RetriesExhausted`] wrapping the last error.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
{
    let mut last_error = None;

    for attempt in 0..policy.max_attempts() {
        match op(attempt).await {
            AttemptOutcome::Success(value) => {
                if attempt > 0 {
                    tracing::info!(operation, retries = attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            AttemptOutcome::Fatal(err) => return Err(err),
            AttemptOutcome::Retryable(err) => {
                if attempt < policy.max_retries {
                    let delay = policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(err);
            }
        }
    }

    let last_error = last_error.unwrap_or_else(|| EventError::Config(format!(
        "retry policy for '{}' allows no attempts",
        operation
    )));
    tracing::warn!(
        operation,
        attempts = policy.max_attempts(),
        error = %last_error,
        "Retries exhausted"
    );
    Err(EventError::RetriesExhausted {
        operation: operation.to_string(),
        attempts: policy.max_attempts(),
        last_error: Box::new(last_error),
    })
}
