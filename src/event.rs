//! Integration event envelope and wire types
//!
//! All wire types use camelCase JSON serialization. A concrete event is a
//! plain struct that flattens [`EventMeta`] next to its payload fields and
//! names itself through [`IntegrationEvent::NAME`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and creation time shared by every integration event
///
/// Assigned once when the publisher constructs the event and carried
/// verbatim across the wire, so every hop (and every retry) sees the
/// publisher's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    /// Globally unique event identifier
    pub id: Uuid,

    /// UTC creation time
    pub created_at: DateTime<Utc>,
}

impl EventMeta {
    /// Fresh identity for a newly constructed event
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// A domain fact published from one service to others
///
/// `NAME` is the wire contract: it is the routing key, the broker topic
/// and the registry key, and must stay stable across processes.
///
/// ```rust
/// use integration_events::{EventMeta, IntegrationEvent};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// struct UserRegistered {
///     #[serde(flatten)]
///     meta: EventMeta,
///     user_id: String,
///     email: String,
/// }
///
/// impl IntegrationEvent for UserRegistered {
///     const NAME: &'static str = "UserRegisteredIntegrationEvent";
///     fn meta(&self) -> &EventMeta {
///         &self.meta
///     }
/// }
/// ```
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Canonical event name
    const NAME: &'static str;

    /// Identity assigned at construction
    fn meta(&self) -> &EventMeta;

    /// Unique event id, also the publish dedup key
    fn event_id(&self) -> Uuid {
        self.meta().id
    }

    /// When the event was created
    fn created_at(&self) -> DateTime<Utc> {
        self.meta().created_at
    }
}

/// Late-bound event handed to dynamic handlers
///
/// Carries the raw payload and the event name; the handler does its own
/// parsing.
#[derive(Debug, Clone)]
pub struct DynamicEvent {
    /// Event name taken from the routing key
    pub event_name: String,

    /// Raw serialized payload
    pub payload: Bytes,

    /// Envelope identity, when the payload carries one
    pub meta: Option<EventMeta>,
}

impl DynamicEvent {
    /// Wrap a raw payload, picking up `id`/`createdAt` if present
    pub fn new(event_name: impl Into<String>, payload: Bytes) -> Self {
        let meta = serde_json::from_slice::<EventMeta>(&payload).ok();
        Self {
            event_name: event_name.into(),
            payload,
            meta,
        }
    }

    /// Parse the payload as untyped JSON
    pub fn json(&self) -> crate::Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Parse the payload into a caller-chosen type
    pub fn deserialize<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// A serialized event ready to hand to a transport
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Routing key (the event name)
    pub event_name: String,

    /// Envelope id, used for logging and broker-side deduplication
    pub event_id: Uuid,

    /// JSON body containing `id`, `createdAt` and the payload fields
    pub payload: Bytes,

    /// Broker-level durability flag, always set by the bus
    pub persistent: bool,
}

impl OutboundMessage {
    /// Serialize an event into its wire form
    pub fn from_event<E: IntegrationEvent>(event: &E) -> crate::Result<Self> {
        let payload = serde_json::to_vec(event)?;
        Ok(Self {
            event_name: E::NAME.to_string(),
            event_id: event.event_id(),
            payload: Bytes::from(payload),
            persistent: true,
        })
    }
}

/// A message received from the service queue
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Event name extracted from the routing key
    pub event_name: String,

    /// Raw serialized payload
    pub payload: Bytes,

    /// Transport-assigned sequence number
    pub sequence: u64,

    /// Number of delivery attempts, starting at 1
    pub num_delivered: u64,

    /// Queue this message was consumed from
    pub queue: String,
}

impl ReceivedMessage {
    /// Envelope id parsed from the payload, for log correlation
    pub fn event_id(&self) -> Option<Uuid> {
        serde_json::from_slice::<EventMeta>(&self.payload)
            .ok()
            .map(|m| m.id)
    }
}

/// Options for publishing events
///
/// Unsupported options are ignored by transports that don't support them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOptions {
    /// Deduplication message ID (NATS: `Nats-Msg-Id` header)
    ///
    /// Defaults to the event id when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,

    /// Per-attempt publish timeout in milliseconds (overrides the bus default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct UserRegistered {
        #[serde(flatten)]
        meta: EventMeta,
        user_id: String,
        user_name: String,
        email: String,
    }

    impl IntegrationEvent for UserRegistered {
        const NAME: &'static str = "UserRegisteredIntegrationEvent";

        fn meta(&self) -> &EventMeta {
            &self.meta
        }
    }

    fn sample() -> UserRegistered {
        UserRegistered {
            meta: EventMeta::new(),
            user_id: "u1".to_string(),
            user_name: "alice".to_string(),
            email: "a@b.com".to_string(),
        }
    }

    #[test]
    fn test_meta_assigned_once() {
        let a = EventMeta::new();
        let b = EventMeta::new();
        assert_ne!(a.id, b.id);
        assert!(b.created_at >= a.created_at);
    }

    #[test]
    fn test_event_serialization_roundtrip() {
        let event = sample();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"userId\":\"u1\""));

        let parsed: UserRegistered = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_id(), event.event_id());
        assert_eq!(parsed.created_at(), event.created_at());
        assert_eq!(parsed.user_id, "u1");
        assert_eq!(parsed.user_name, "alice");
        assert_eq!(parsed.email, "a@b.com");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{
            "id": "6f1c1a52-3c1b-4d6a-9d1e-0d7b2b7c9a11",
            "createdAt": "2024-01-01T00:00:00Z",
            "userId": "u1",
            "userName": "alice",
            "email": "a@b.com",
            "addedInV2": {"nested": true}
        }"#;

        let parsed: UserRegistered = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed.event_id().to_string(),
            "6f1c1a52-3c1b-4d6a-9d1e-0d7b2b7c9a11"
        );
        assert_eq!(parsed.email, "a@b.com");
    }

    #[test]
    fn test_outbound_message_from_event() {
        let event = sample();
        let msg = OutboundMessage::from_event(&event).unwrap();
        assert_eq!(msg.event_name, "UserRegisteredIntegrationEvent");
        assert_eq!(msg.event_id, event.event_id());
        assert!(msg.persistent);

        let received = ReceivedMessage {
            event_name: msg.event_name.clone(),
            payload: msg.payload.clone(),
            sequence: 1,
            num_delivered: 1,
            queue: "identity".to_string(),
        };
        assert_eq!(received.event_id(), Some(event.event_id()));
    }

    #[test]
    fn test_dynamic_event_parsing() {
        let event = sample();
        let payload = Bytes::from(serde_json::to_vec(&event).unwrap());
        let dynamic = DynamicEvent::new(UserRegistered::NAME, payload);

        assert_eq!(dynamic.meta.map(|m| m.id), Some(event.event_id()));
        assert_eq!(dynamic.json().unwrap()["email"], "a@b.com");

        let typed: UserRegistered = dynamic.deserialize().unwrap();
        assert_eq!(typed.user_id, "u1");
    }

    #[test]
    fn test_dynamic_event_without_meta() {
        let dynamic = DynamicEvent::new("Ping", Bytes::from_static(b"{\"n\":1}"));
        assert!(dynamic.meta.is_none());
        assert_eq!(dynamic.json().unwrap()["n"], 1);
    }

    #[test]
    fn test_publish_options_skip_none_fields() {
        let opts = PublishOptions::default();
        let json = serde_json::to_string(&opts).unwrap();
        assert!(!json.contains("msgId"));
        assert!(!json.contains("timeoutMs"));

        let opts = PublishOptions {
            msg_id: Some("dedup-1".to_string()),
            timeout_ms: Some(250),
        };
        let json = serde_json::to_string(&opts).unwrap();
        assert!(json.contains("\"msgId\":\"dedup-1\""));
        assert!(json.contains("\"timeoutMs\":250"));
    }
}
