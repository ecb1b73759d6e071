//! Event bus configuration
//!
//! Plain serde structs with defaults, optionally overlaid from environment
//! variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `SUBSCRIPTION_CLIENT_NAME` | `queue_name` |
//! | `EVENT_BUS_RETRY_COUNT` | `max_retries` of every retry policy |

use crate::error::{EventError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ENV_SUBSCRIPTION_CLIENT_NAME: &str = "SUBSCRIPTION_CLIENT_NAME";
pub const ENV_RETRY_COUNT: &str = "EVENT_BUS_RETRY_COUNT";

/// Consume and publish policy for an [`EventBus`](crate::EventBus)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventBusConfig {
    /// Per-service queue name (one queue per subscribing service)
    pub queue_name: String,

    /// Maximum deliveries processed concurrently by the consume loop
    pub prefetch: usize,

    /// Deadline for a single handler invocation, in milliseconds
    pub handler_timeout_ms: u64,

    /// Deadline for dispatching one message to all of its handlers,
    /// retries included, in milliseconds
    ///
    /// On expiry the message is requeued. Keep it below the broker's ack
    /// wait so the broker doesn't redeliver while handlers still run.
    pub message_timeout_ms: u64,

    /// Deliveries after which a message that keeps hitting the message
    /// deadline is dead-lettered instead of requeued
    pub max_deliveries: u64,

    /// Deadline for a single publish attempt, in milliseconds
    pub publish_timeout_ms: u64,

    /// Deadline for a broker-side bind/unbind, in milliseconds
    pub subscribe_timeout_ms: u64,

    /// How long shutdown waits for in-flight handlers, in milliseconds
    pub shutdown_timeout_ms: u64,

    /// Retries for transient publish failures
    pub publish_retry: RetryPolicy,

    /// Per-handler retries before a message is dead-lettered
    pub handler_retry: RetryPolicy,

    /// Backoff for re-opening the consumer after a transport fault
    pub connect_retry: RetryPolicy,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_name: "default-service".to_string(),
            prefetch: 16,
            handler_timeout_ms: 30_000,
            message_timeout_ms: 50_000,
            max_deliveries: 5,
            publish_timeout_ms: 5_000,
            subscribe_timeout_ms: 10_000,
            shutdown_timeout_ms: 30_000,
            publish_retry: RetryPolicy::default(),
            handler_retry: RetryPolicy {
                max_retries: 3,
                base_delay_ms: 500,
                max_delay_ms: 5_000,
            },
            connect_retry: RetryPolicy {
                max_retries: 5,
                base_delay_ms: 1_000,
                max_delay_ms: 30_000,
            },
        }
    }
}

impl EventBusConfig {
    /// Default config for the named service queue
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    /// Defaults overlaid with process environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from an environment-like lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(name) = lookup(ENV_SUBSCRIPTION_CLIENT_NAME) {
            self.queue_name = name;
        }

        if let Some(count) = lookup(ENV_RETRY_COUNT) {
            let count: u32 = count.trim().parse().map_err(|_| {
                EventError::Config(format!(
                    "{} must be an integer, got '{}'",
                    ENV_RETRY_COUNT, count
                ))
            })?;
            self.publish_retry.max_retries = count;
            self.handler_retry.max_retries = count;
            self.connect_retry.max_retries = count;
        }

        self.validate()
    }

    /// Reject values the bus can't run with
    pub fn validate(&self) -> Result<()> {
        if self.queue_name.trim().is_empty() {
            return Err(EventError::Config("queue name must not be empty".to_string()));
        }
        if self.queue_name.contains(['.', '*', '>', ' ']) {
            return Err(EventError::Config(format!(
                "queue name '{}' must not contain '.', '*', '>' or spaces",
                self.queue_name
            )));
        }
        if self.prefetch == 0 {
            return Err(EventError::Config("prefetch must be at least 1".to_string()));
        }
        if self.message_timeout_ms == 0 {
            return Err(EventError::Config("message timeout must be positive".to_string()));
        }
        if self.max_deliveries == 0 {
            return Err(EventError::Config("max deliveries must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Per-attempt handler deadline
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Whole-message processing deadline
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    /// Per-attempt publish deadline
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Bind/unbind deadline
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    /// Drain deadline for in-flight handlers at shutdown
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
