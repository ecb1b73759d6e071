//! Dead Letter Queue: destination for messages that exhausted retry
//!
//! The bus removes a dead-lettered message from the live queue only after
//! the `DlqHandler` accepted it; if the handler fails, the message is
//! nak'ed for redelivery instead, so nothing is silently lost.

use crate::error::Result;
use crate::event::ReceivedMessage;
use crate::handler::HandlerId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A failed message with context about why it ended up in the DLQ
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The original received message
    pub message: ReceivedMessage,

    /// Reason the message was dead-lettered
    pub reason: String,

    /// Handlers that still failed after the retry budget
    pub failed_handlers: Vec<HandlerId>,

    /// When the message was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Create a new dead letter
    pub fn new(message: ReceivedMessage, reason: impl Into<String>) -> Self {
        Self {
            message,
            reason: reason.into(),
            failed_handlers: Vec::new(),
            dead_lettered_at: Utc::now(),
        }
    }

    /// Record which handlers exhausted their retries
    pub fn with_failed_handlers(mut self, handlers: Vec<HandlerId>) -> Self {
        self.failed_handlers = handlers;
        self
    }
}

/// Trait for dead letter queue handlers
///
/// Implementations decide what to do with messages that failed
/// permanently: log, store, forward, or alert.
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Accept a dead-lettered message
    async fn handle(&self, dead_letter: DeadLetter) -> Result<()>;

    /// Number of messages currently held
    async fn count(&self) -> Result<usize>;

    /// Most recent dead letters, newest first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// In-memory DLQ handler for development and testing
///
/// Keeps at most `max_events` dead letters, dropping the oldest.
pub struct MemoryDlqHandler {
    events: Arc<RwLock<VecDeque<DeadLetter>>>,
    max_events: usize,
}

impl MemoryDlqHandler {
    /// Create a new in-memory DLQ handler (0 = unbounded)
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(VecDeque::new())),
            max_events,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, dead_letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            event_name = %dead_letter.message.event_name,
            event_id = ?dead_letter.message.event_id(),
            queue = %dead_letter.message.queue,
            num_delivered = dead_letter.message.num_delivered,
            reason = %dead_letter.reason,
            "Message dead-lettered"
        );

        let mut events = self.events.write().await;
        events.push_back(dead_letter);

        if self.max_events > 0 {
            while events.len() > self.max_events {
                events.pop_front();
            }
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.events.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_message(sequence: u64) -> ReceivedMessage {
        ReceivedMessage {
            event_name: "UserRegistered".to_string(),
            payload: Bytes::from_static(b"{}"),
            sequence,
            num_delivered: 1,
            queue: "identity".to_string(),
        }
    }

    struct SomeHandler;

    #[test]
    fn test_dead_letter_creation() {
        let dl = DeadLetter::new(test_message(7), "handler failed")
            .with_failed_handlers(vec![HandlerId::of::<SomeHandler>()]);
        assert_eq!(dl.reason, "handler failed");
        assert_eq!(dl.message.sequence, 7);
        assert_eq!(dl.failed_handlers.len(), 1);
        assert!(dl.dead_lettered_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_memory_dlq_handle_and_count() {
        let dlq = MemoryDlqHandler::default();
        assert_eq!(dlq.count().await.unwrap(), 0);

        dlq.handle(DeadLetter::new(test_message(1), "failed"))
            .await
            .unwrap();
        assert_eq!(dlq.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_dlq_list_newest_first() {
        let dlq = MemoryDlqHandler::default();
        for i in 0..5 {
            dlq.handle(DeadLetter::new(test_message(i), format!("reason {}", i)))
                .await
                .unwrap();
        }

        let list = dlq.list(3).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].reason, "reason 4");
        assert_eq!(list[2].reason, "reason 2");
    }

    #[tokio::test]
    async fn test_memory_dlq_max_capacity() {
        let dlq = MemoryDlqHandler::new(3);
        for i in 0..5 {
            dlq.handle(DeadLetter::new(test_message(i), format!("reason {}", i)))
                .await
                .unwrap();
        }

        assert_eq!(dlq.count().await.unwrap(), 3);
        let list = dlq.list(10).await.unwrap();
        assert_eq!(list[0].reason, "reason 4");
        assert_eq!(list[2].reason, "reason 2");
    }
}
