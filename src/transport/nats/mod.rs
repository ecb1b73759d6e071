//! NATS JetStream transport
//!
//! Every integration event lives in one JetStream stream under
//! `<prefix>.<EventName>`. Each service owns one durable pull consumer (its
//! queue) whose filter subjects are the event names it is bound to.
//! Deliveries use explicit acks, so unacknowledged messages are redelivered
//! after `ack_wait` or a reconnect (at-least-once).

mod client;
mod config;
mod subscriber;

pub use client::{NatsChannel, NatsConnector};
pub use config::{NatsConfig, StartPolicy, StorageType};
pub use subscriber::NatsDelivery;

use crate::connection::PersistentConnection;
use crate::dlq::{DeadLetter, DlqHandler, MemoryDlqHandler};
use crate::error::{EventError, Result};
use crate::event::{OutboundMessage, PublishOptions};
use crate::retry::RetryPolicy;
use crate::transport::{Delivery, EventTransport};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// NATS JetStream transport for one service
pub struct NatsTransport {
    connection: PersistentConnection<NatsConnector>,
    config: Arc<NatsConfig>,
    bindings: Mutex<BTreeSet<String>>,
}

impl NatsTransport {
    /// Connect to NATS and ensure the stream exists
    pub async fn connect(config: NatsConfig, connect_retry: RetryPolicy) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let connection =
            PersistentConnection::connect(NatsConnector::new(config.clone()), connect_retry)
                .await?;

        Ok(Self {
            connection,
            config,
            bindings: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    pub fn connection(&self) -> &PersistentConnection<NatsConnector> {
        &self.connection
    }

    /// Run an operation on the live channel, invalidating it on transport faults
    async fn with_channel<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(NatsChannel) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let (channel, generation) = self.connection.lease().await?;
        let result = op(channel).await;
        if let Err(ref e) = result {
            if e.is_transient() {
                self.connection.invalidate(generation).await;
            }
        }
        result
    }

    async fn apply_bindings(&self, bindings: &BTreeSet<String>) -> Result<()> {
        let config = self.config.clone();
        self.with_channel(|channel| async move {
            client::apply_queue_bindings(&channel, &config, bindings).await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl EventTransport for NatsTransport {
    async fn publish(&self, message: &OutboundMessage, opts: &PublishOptions) -> Result<u64> {
        let subject = self.config.event_subject(&message.event_name);
        let msg_id = opts
            .msg_id
            .clone()
            .unwrap_or_else(|| message.event_id.to_string());

        self.with_channel(|channel| async move {
            let mut headers = async_nats::HeaderMap::new();
            headers.insert("Nats-Msg-Id", msg_id.as_str());

            let publish_error = |reason: String| EventError::Publish {
                event_name: message.event_name.clone(),
                reason,
            };

            let ack = channel
                .jetstream
                .publish_with_headers(subject.clone(), headers, message.payload.clone())
                .await
                .map_err(|e| publish_error(e.to_string()))?
                .await
                .map_err(|e| publish_error(format!("ack failed: {}", e)))?;

            tracing::debug!(
                event_id = %message.event_id,
                subject = %subject,
                sequence = ack.sequence,
                duplicate = ack.duplicate,
                "Event published"
            );

            Ok(ack.sequence)
        })
        .await
    }

    async fn bind(&self, event_name: &str) -> Result<()> {
        let mut bindings = self.bindings.lock().await;
        if bindings.contains(event_name) {
            return Ok(());
        }

        let mut next = bindings.clone();
        next.insert(event_name.to_string());
        self.apply_bindings(&next).await.map_err(|e| EventError::Binding {
            event_name: event_name.to_string(),
            reason: e.to_string(),
        })?;
        *bindings = next;

        tracing::info!(queue = %self.config.queue_name, event_name, "Queue bound");
        Ok(())
    }

    async fn unbind(&self, event_name: &str) -> Result<()> {
        let mut bindings = self.bindings.lock().await;
        if !bindings.contains(event_name) {
            return Ok(());
        }

        let mut next = bindings.clone();
        next.remove(event_name);
        self.apply_bindings(&next).await.map_err(|e| EventError::Binding {
            event_name: event_name.to_string(),
            reason: e.to_string(),
        })?;
        *bindings = next;

        tracing::info!(queue = %self.config.queue_name, event_name, "Queue unbound");
        Ok(())
    }

    async fn rebind(&self, event_names: &[String]) -> Result<()> {
        let mut bindings = self.bindings.lock().await;
        let next: BTreeSet<String> = event_names.iter().cloned().collect();
        self.apply_bindings(&next).await?;
        *bindings = next;
        Ok(())
    }

    async fn consume(&self) -> Result<Box<dyn Delivery>> {
        let bindings = self.bindings.lock().await.clone();
        let config = self.config.clone();

        let messages = self
            .with_channel(|channel| async move {
                let consumer = client::apply_queue_bindings(&channel, &config, &bindings).await?;
                consumer.messages().await.map_err(|e| {
                    EventError::Consumer(format!(
                        "Failed to open queue '{}': {}",
                        config.queue_name, e
                    ))
                })
            })
            .await?;

        tracing::info!(queue = %self.config.queue_name, "Consuming from queue");
        Ok(Box::new(NatsDelivery::new(messages, self.config.clone())))
    }

    fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    fn name(&self) -> &str {
        "nats"
    }

    async fn health(&self) -> Result<bool> {
        match self.connection.channel().await {
            Ok(channel) => Ok(matches!(
                channel.client.connection_state(),
                async_nats::connection::State::Connected
            )),
            Err(_) => Ok(false),
        }
    }

    async fn close(&self) -> Result<()> {
        if let Ok(channel) = self.connection.channel().await {
            if let Err(e) = channel.client.flush().await {
                tracing::warn!(error = %e, "Failed to flush NATS connection on close");
            }
        }
        self.connection.close().await;
        Ok(())
    }
}

/// Dead-letter handler that copies failed messages to a DLQ subject
///
/// The copy goes to `<dlq_prefix>.<queue>.<EventName>` with the reason and
/// delivery count as headers; a bounded local log backs `count`/`list`.
pub struct NatsDlqHandler {
    transport: Arc<NatsTransport>,
    recent: MemoryDlqHandler,
}

impl NatsDlqHandler {
    pub fn new(transport: Arc<NatsTransport>) -> Self {
        Self {
            transport,
            recent: MemoryDlqHandler::new(1_000),
        }
    }
}

#[async_trait]
impl DlqHandler for NatsDlqHandler {
    async fn handle(&self, dead_letter: DeadLetter) -> Result<()> {
        let subject = self.transport.config.dlq_subject(&dead_letter.message.event_name);

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Dlq-Reason", dead_letter.reason.as_str());
        headers.insert(
            "Dlq-Num-Delivered",
            dead_letter.message.num_delivered.to_string().as_str(),
        );
        headers.insert(
            "Dlq-Stream-Sequence",
            dead_letter.message.sequence.to_string().as_str(),
        );

        let payload = dead_letter.message.payload.clone();
        self.transport
            .with_channel(|channel| async move {
                channel
                    .jetstream
                    .publish_with_headers(subject.clone(), headers, payload)
                    .await
                    .map_err(|e| EventError::DeadLetter(format!("{}: {}", subject, e)))?
                    .await
                    .map_err(|e| {
                        EventError::DeadLetter(format!("{}: ack failed: {}", subject, e))
                    })?;
                Ok(())
            })
            .await?;

        self.recent.handle(dead_letter).await
    }

    async fn count(&self) -> Result<usize> {
        self.recent.count().await
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.recent.list(limit).await
    }
}
