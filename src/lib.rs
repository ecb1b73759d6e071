//! # integration-events
//!
//! Asynchronous integration events between independently deployed services.
//!
//! ## Overview
//!
//! A service publishes domain facts ("a user registered") as integration
//! events; every other service that subscribed to that event name receives
//! its own copy through a durable per-service queue. Delivery is
//! at-least-once: handlers are retried with backoff, and messages that keep
//! failing are routed to a dead-letter destination instead of being lost.
//!
//! ## Quick Start
//!
//! ```rust
//! use integration_events::{
//!     EventBus, EventMeta, HandlerResult, IntegrationEvent, IntegrationEventHandler,
//! };
//! use integration_events::transport::memory::MemoryBroker;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct UserRegistered {
//!     #[serde(flatten)]
//!     meta: EventMeta,
//!     user_id: String,
//! }
//!
//! impl IntegrationEvent for UserRegistered {
//!     const NAME: &'static str = "UserRegisteredIntegrationEvent";
//!     fn meta(&self) -> &EventMeta {
//!         &self.meta
//!     }
//! }
//!
//! struct SendWelcomeMail;
//!
//! #[async_trait::async_trait]
//! impl IntegrationEventHandler<UserRegistered> for SendWelcomeMail {
//!     async fn handle(&self, event: &UserRegistered) -> HandlerResult {
//!         println!("welcome, {}", event.user_id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> integration_events::Result<()> {
//! let broker = MemoryBroker::new();
//! let bus = EventBus::new(broker.transport("notifications"));
//!
//! bus.subscribe::<UserRegistered, _, _>(|| SendWelcomeMail).await?;
//! bus.start()?;
//!
//! bus.publish(&UserRegistered {
//!     meta: EventMeta::new(),
//!     user_id: "u-42".to_string(),
//! })
//! .await?;
//!
//! bus.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transports
//!
//! - **memory**: In-process broker for testing and single-process use
//! - **nats**: NATS JetStream, one durable pull consumer per service
//!
//! ## Architecture
//!
//! - **EventBus**: publish, subscribe and the consume loop
//! - **SubscriptionRegistry**: event name → handler descriptors
//! - **EventTransport** trait: broker abstraction all backends implement
//! - **PersistentConnection**: lazily (re)established broker channel
//! - **RetryPolicy** / **DlqHandler**: bounded retry, then dead-letter

pub mod bus;
pub mod config;
pub mod connection;
pub mod dlq;
pub mod error;
pub mod event;
pub mod handler;
pub mod registry;
pub mod retry;
pub mod transport;

// Re-export core types
pub use bus::{EventBus, EventBusBuilder, ProcessOutcome};
pub use config::EventBusConfig;
pub use connection::{ConnectionState, Connector, PersistentConnection};
pub use dlq::{DeadLetter, DlqHandler, MemoryDlqHandler};
pub use error::{EventError, Result};
pub use event::{
    DynamicEvent, EventMeta, IntegrationEvent, OutboundMessage, PublishOptions, ReceivedMessage,
};
pub use handler::{
    DynamicEventHandler, EventPayload, HandlerId, HandlerInvoker, HandlerResult,
    IntegrationEventHandler,
};
pub use registry::{EventType, SubscriptionInfo, SubscriptionRegistry};
pub use retry::RetryPolicy;
pub use transport::{Delivery, EventTransport, PendingDelivery};

// Re-export transports for convenience
pub use transport::memory::{MemoryBroker, MemoryTransport};
pub use transport::nats::{NatsConfig, NatsDlqHandler, NatsTransport, StorageType};
