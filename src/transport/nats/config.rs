//! NATS JetStream transport configuration

use crate::error::{EventError, Result};
use serde::{Deserialize, Serialize};

pub const ENV_CONNECTION: &str = "EVENT_BUS_CONNECTION";
pub const ENV_USERNAME: &str = "EVENT_BUS_USERNAME";
pub const ENV_PASSWORD: &str = "EVENT_BUS_PASSWORD";
pub const ENV_SUBSCRIPTION_CLIENT_NAME: &str = crate::config::ENV_SUBSCRIPTION_CLIENT_NAME;

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Where a newly created service queue starts reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StartPolicy {
    /// Only messages published after the queue was created
    #[default]
    New,
    /// Everything still retained by the stream
    All,
}

/// Connection, stream and queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// Server URL (e.g., `nats://127.0.0.1:4222`)
    pub url: String,

    /// Auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Username for user/password auth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password for user/password auth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// JetStream stream holding all integration events
    pub stream_name: String,

    /// Subject prefix; an event is published to `<prefix>.<EventName>`
    pub subject_prefix: String,

    /// Subject prefix for dead letters: `<dlq_prefix>.<queue>.<EventName>`
    pub dlq_subject_prefix: String,

    /// Durable consumer name: the per-service queue
    pub queue_name: String,

    pub storage: StorageType,

    /// Max messages retained by the stream (-1 = unlimited)
    pub max_events: i64,

    /// Max message age in seconds (0 = unlimited)
    pub max_age_secs: u64,

    /// Max stream size in bytes (-1 = unlimited)
    pub max_bytes: i64,

    /// Window in which a repeated `Nats-Msg-Id` is dropped as a duplicate
    pub duplicate_window_secs: u64,

    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,

    /// How long the server waits for an ack before redelivering
    pub ack_wait_secs: u64,

    /// Max unacknowledged deliveries outstanding for the queue
    pub max_ack_pending: i64,

    pub start_policy: StartPolicy,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            user: None,
            password: None,
            stream_name: "INTEGRATION_EVENTS".to_string(),
            subject_prefix: "integration".to_string(),
            dlq_subject_prefix: "integration_dlq".to_string(),
            queue_name: "default-service".to_string(),
            storage: StorageType::File,
            max_events: 1_000_000,
            max_age_secs: 7 * 24 * 3600,
            max_bytes: -1,
            duplicate_window_secs: 120,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            ack_wait_secs: 60,
            max_ack_pending: 1_000,
            start_policy: StartPolicy::New,
        }
    }
}

impl NatsConfig {
    /// Defaults overlaid with process environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay broker address, credentials and queue name
    ///
    /// `EVENT_BUS_CONNECTION` accepts a full URL or a bare `host[:port]`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(connection) = lookup(ENV_CONNECTION) {
            self.url = normalize_url(&connection)?;
        }
        if let Some(user) = lookup(ENV_USERNAME) {
            self.user = Some(user);
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.password = Some(password);
        }
        if let Some(name) = lookup(ENV_SUBSCRIPTION_CLIENT_NAME) {
            self.queue_name = name;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.subject_prefix.is_empty() || self.subject_prefix.contains(['*', '>', ' ']) {
            return Err(EventError::Config(format!(
                "invalid subject prefix '{}'",
                self.subject_prefix
            )));
        }
        if self.dlq_subject_prefix == self.subject_prefix {
            return Err(EventError::Config(
                "dead-letter prefix must differ from the subject prefix".to_string(),
            ));
        }
        if self.queue_name.is_empty() || self.queue_name.contains(['.', '*', '>', ' ']) {
            return Err(EventError::Config(format!(
                "invalid queue name '{}'",
                self.queue_name
            )));
        }
        if self.user.is_some() != self.password.is_some() {
            return Err(EventError::Config(
                "user and password must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Subject an event is published to
    pub fn event_subject(&self, event_name: &str) -> String {
        format!("{}.{}", self.subject_prefix, event_name)
    }

    /// Event name carried by a subject, if it belongs to this stream
    pub fn event_name_from_subject<'a>(&self, subject: &'a str) -> Option<&'a str> {
        subject
            .strip_prefix(self.subject_prefix.as_str())?
            .strip_prefix('.')
            .filter(|name| !name.is_empty())
    }

    /// Subject a dead letter is copied to
    pub fn dlq_subject(&self, event_name: &str) -> String {
        format!("{}.{}.{}", self.dlq_subject_prefix, self.queue_name, event_name)
    }

    /// Filter used while the queue has no bindings; nothing publishes here
    pub fn idle_subject(&self) -> String {
        format!("{}._idle.{}", self.dlq_subject_prefix, self.queue_name)
    }

    /// Subjects captured by the stream
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![
            format!("{}.>", self.subject_prefix),
            format!("{}.>", self.dlq_subject_prefix),
        ]
    }
}

fn normalize_url(connection: &str) -> Result<String> {
    let connection = connection.trim();
    if connection.is_empty() {
        return Err(EventError::Config(format!("{} is empty", ENV_CONNECTION)));
    }
    if connection.contains("://") {
        Ok(connection.to_string())
    } else if connection.contains(':') {
        Ok(format!("nats://{}", connection))
    } else {
        Ok(format!("nats://{}:4222", connection))
    }
}
