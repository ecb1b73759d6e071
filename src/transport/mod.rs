//! Transport trait: the broker abstraction under the event bus
//!
//! A transport publishes serialized events addressed by event name, keeps
//! one queue per service bound to the event names that service handles,
//! and streams that queue's deliveries with manual acknowledgement.

use crate::error::Result;
use crate::event::{OutboundMessage, PublishOptions, ReceivedMessage};
use async_trait::async_trait;
use futures::future::BoxFuture;

pub mod memory;
pub mod nats;

/// Core trait for broker backends
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Publish a message, returning the transport-assigned sequence number
    async fn publish(&self, message: &OutboundMessage, opts: &PublishOptions) -> Result<u64>;

    /// Route messages for `event_name` into this service's queue
    async fn bind(&self, event_name: &str) -> Result<()>;

    /// Stop routing `event_name` into this service's queue
    async fn unbind(&self, event_name: &str) -> Result<()>;

    /// Replace the queue's bindings with exactly `event_names`
    ///
    /// Used after a reconnect to restore bindings from the registry.
    async fn rebind(&self, event_names: &[String]) -> Result<()>;

    /// Open the delivery stream for this service's queue
    async fn consume(&self) -> Result<Box<dyn Delivery>>;

    /// Name of the per-service queue
    fn queue_name(&self) -> &str;

    /// Transport name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Health check: true if the broker is reachable
    async fn health(&self) -> Result<bool>;

    /// Close the broker connection
    async fn close(&self) -> Result<()>;
}

/// Stream of deliveries from a service queue
#[async_trait]
pub trait Delivery: Send {
    /// Receive the next delivery; `None` means the stream ended
    async fn next(&mut self) -> Result<Option<PendingDelivery>>;
}

type Settle = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A delivery awaiting settlement
///
/// Exactly one of [`ack`](Self::ack), [`nak`](Self::nak) or
/// [`term`](Self::term) should be called.
pub struct PendingDelivery {
    /// The received message
    pub message: ReceivedMessage,

    ack_fn: Settle,
    nak_fn: Settle,
    term_fn: Settle,
}

impl PendingDelivery {
    /// Create a pending delivery with settlement callbacks
    pub fn new(
        message: ReceivedMessage,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nak_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        term_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            message,
            ack_fn: Box::new(ack_fn),
            nak_fn: Box::new(nak_fn),
            term_fn: Box::new(term_fn),
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Negative-acknowledge (request redelivery)
    pub async fn nak(self) -> Result<()> {
        (self.nak_fn)().await
    }

    /// Remove from the live queue without redelivery (dead-lettered)
    pub async fn term(self) -> Result<()> {
        (self.term_fn)().await
    }
}

impl std::fmt::Debug for PendingDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingDelivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
