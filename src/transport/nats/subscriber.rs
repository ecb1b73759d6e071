//! JetStream delivery stream for the service queue

use super::config::NatsConfig;
use crate::error::{EventError, Result};
use crate::event::ReceivedMessage;
use crate::transport::{Delivery, PendingDelivery};
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;

/// Pull-consumer message stream with manual acknowledgement
pub struct NatsDelivery {
    messages: jetstream::consumer::pull::Stream,
    config: Arc<NatsConfig>,
}

impl NatsDelivery {
    pub(crate) fn new(
        messages: jetstream::consumer::pull::Stream,
        config: Arc<NatsConfig>,
    ) -> Self {
        Self { messages, config }
    }
}

#[async_trait]
impl Delivery for NatsDelivery {
    async fn next(&mut self) -> Result<Option<PendingDelivery>> {
        loop {
            let message = match self.messages.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    return Err(EventError::Consumer(format!(
                        "Failed to receive from queue '{}': {}",
                        self.config.queue_name, e
                    )))
                }
                None => return Ok(None),
            };

            let (sequence, num_delivered) = match message.info() {
                Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
                Err(_) => (0, 1),
            };

            let subject = message.subject.to_string();
            let (message, acker) = message.split();
            let acker = Arc::new(acker);

            let Some(event_name) = self.config.event_name_from_subject(&subject) else {
                // Not an integration event subject; nothing here can handle it.
                tracing::warn!(subject = %subject, "Dropping message with foreign subject");
                if let Err(e) = acker.ack_with(AckKind::Term).await {
                    tracing::warn!(subject = %subject, error = %e, "Failed to terminate message");
                }
                continue;
            };

            let received = ReceivedMessage {
                event_name: event_name.to_string(),
                payload: message.payload,
                sequence,
                num_delivered,
                queue: self.config.queue_name.clone(),
            };

            let (ack_acker, nak_acker, term_acker) = (acker.clone(), acker.clone(), acker);

            return Ok(Some(PendingDelivery::new(
                received,
                move || {
                    async move {
                        ack_acker
                            .ack()
                            .await
                            .map_err(|e| EventError::Ack(e.to_string()))
                    }
                    .boxed()
                },
                move || {
                    async move {
                        nak_acker
                            .ack_with(AckKind::Nak(None))
                            .await
                            .map_err(|e| EventError::Ack(format!("nak failed: {}", e)))
                    }
                    .boxed()
                },
                move || {
                    async move {
                        term_acker
                            .ack_with(AckKind::Term)
                            .await
                            .map_err(|e| EventError::Ack(format!("term failed: {}", e)))
                    }
                    .boxed()
                },
            )));
        }
    }
}
