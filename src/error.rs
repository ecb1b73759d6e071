//! Error types for integration-events

use thiserror::Error;

/// Errors that can occur in the event bus
#[derive(Debug, Error)]
pub enum EventError {
    /// Broker connection failure (connect refused, connection dropped)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Channel/session-level fault on an established connection
    #[error("Channel error: {0}")]
    Channel(String),

    /// Publish failure
    #[error("Failed to publish event '{event_name}': {reason}")]
    Publish {
        event_name: String,
        reason: String,
    },

    /// Broker-side binding (subscribe/unsubscribe) failure
    #[error("Failed to bind event '{event_name}': {reason}")]
    Binding {
        event_name: String,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload decoded to a different type than the handler expects
    #[error("Event '{event_name}' decoded to an unexpected type, handler expects {expected}")]
    TypeMismatch {
        event_name: String,
        expected: &'static str,
    },

    /// The same handler type was registered twice for one event
    #[error("Handler {handler} already registered for event '{event_name}'")]
    DuplicateHandler {
        handler: String,
        event_name: String,
    },

    /// Lookup of an event name that has no subscriptions
    #[error("No subscriptions registered for event '{0}'")]
    UnknownEvent(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Consumer/queue creation or management error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A retried operation ran out of attempts
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last_error: Box<EventError>,
    },

    /// Dead-letter routing failure
    #[error("Dead letter error: {0}")]
    DeadLetter(String),

    /// The bus or connection has been shut down
    #[error("Shut down: {0}")]
    Shutdown(String),
}

impl EventError {
    /// Whether retrying the failed operation can plausibly succeed
    ///
    /// Transport faults are transient. Programming errors (registration),
    /// malformed payloads, bad configuration and shutdown are not.
    pub fn is_transient(&self) -> bool {
        match self {
            EventError::Connection(_)
            | EventError::Channel(_)
            | EventError::Publish { .. }
            | EventError::Binding { .. }
            | EventError::Consumer(_)
            | EventError::Ack(_)
            | EventError::Timeout(_) => true,
            EventError::RetriesExhausted { last_error, .. } => last_error.is_transient(),
            EventError::Serialization(_)
            | EventError::TypeMismatch { .. }
            | EventError::DuplicateHandler { .. }
            | EventError::UnknownEvent(_)
            | EventError::Config(_)
            | EventError::DeadLetter(_)
            | EventError::Shutdown(_) => false,
        }
    }
}

/// Result type alias for event operations
pub type Result<T> = std::result::Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EventError::Connection("refused".into()).is_transient());
        assert!(EventError::Timeout("publish".into()).is_transient());
        assert!(EventError::Publish {
            event_name: "UserRegistered".into(),
            reason: "channel closed".into(),
        }
        .is_transient());

        assert!(!EventError::UnknownEvent("X".into()).is_transient());
        assert!(!EventError::Shutdown("bus".into()).is_transient());
        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!EventError::from(bad_json).is_transient());
    }

    #[test]
    fn test_exhausted_inherits_classification() {
        let err = EventError::RetriesExhausted {
            operation: "publish".into(),
            attempts: 4,
            last_error: Box::new(EventError::Connection("down".into())),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("after 4 attempts"));
    }
}
