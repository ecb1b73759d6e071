//! In-process broker for testing and single-process use
//!
//! A [`MemoryBroker`] stands in for a real broker shared by several
//! services: each service gets its own queue through
//! [`MemoryBroker::transport`], and a publish fans a copy out to every queue
//! bound to the event name. Nak'ed deliveries are requeued with their
//! delivery count incremented. Availability can be toggled to simulate
//! connection loss.

use crate::connection::{ConnectionState, Connector, PersistentConnection};
use crate::error::{EventError, Result};
use crate::event::{OutboundMessage, PublishOptions, ReceivedMessage};
use crate::retry::RetryPolicy;
use crate::transport::{Delivery, EventTransport, PendingDelivery};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone)]
struct QueuedMessage {
    event_name: String,
    payload: Bytes,
    sequence: u64,
    num_delivered: u64,
}

struct MemoryQueue {
    name: String,
    bindings: Mutex<BTreeSet<String>>,
    tx: mpsc::UnboundedSender<QueuedMessage>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedMessage>>>,
    /// Messages enqueued or delivered but not yet settled
    unsettled: AtomicUsize,
}

impl MemoryQueue {
    fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            bindings: Mutex::new(BTreeSet::new()),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            unsettled: AtomicUsize::new(0),
        }
    }

    fn is_bound(&self, event_name: &str) -> bool {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(event_name)
    }

    fn enqueue(&self, message: QueuedMessage) {
        self.unsettled.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(message).is_err() {
            self.unsettled.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    terminated: AtomicU64,
}

struct BrokerInner {
    available: watch::Sender<bool>,
    fail_publishes: AtomicU32,
    sequence: AtomicU64,
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    stats: Stats,
}

/// Shared in-memory broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (available, _) = watch::channel(true);
        Self {
            inner: Arc::new(BrokerInner {
                available,
                fail_publishes: AtomicU32::new(0),
                sequence: AtomicU64::new(0),
                queues: Mutex::new(HashMap::new()),
                stats: Stats::default(),
            }),
        }
    }

    /// Transport for a service queue, created on first use
    ///
    /// Connects fail fast; pass a policy through
    /// [`MemoryTransport::with_connect_retry`] to retry them.
    pub fn transport(&self, queue_name: &str) -> MemoryTransport {
        MemoryTransport::with_connect_retry(self.clone(), queue_name, RetryPolicy::disabled())
    }

    /// Simulate the broker going down (false) or coming back (true)
    pub fn set_available(&self, available: bool) {
        self.inner.available.send_replace(available);
        tracing::debug!(available, "Memory broker availability changed");
    }

    pub fn is_available(&self) -> bool {
        *self.inner.available.borrow()
    }

    /// Make the next `n` publishes fail with a channel error
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Successful publishes so far
    pub fn published(&self) -> u64 {
        self.inner.stats.published.load(Ordering::SeqCst)
    }

    /// Messages settled with ack
    pub fn acked(&self) -> u64 {
        self.inner.stats.acked.load(Ordering::SeqCst)
    }

    /// Messages handed back for redelivery
    pub fn nacked(&self) -> u64 {
        self.inner.stats.nacked.load(Ordering::SeqCst)
    }

    /// Deliveries removed without redelivery
    pub fn terminated(&self) -> u64 {
        self.inner.stats.terminated.load(Ordering::SeqCst)
    }

    /// Unsettled messages in a queue (queued or in flight)
    pub fn pending(&self, queue_name: &str) -> usize {
        self.queue_if_exists(queue_name)
            .map(|q| q.unsettled.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Event names currently bound to a queue
    pub fn bindings(&self, queue_name: &str) -> Vec<String> {
        self.queue_if_exists(queue_name)
            .map(|q| {
                q.bindings
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn queue(&self, queue_name: &str) -> Arc<MemoryQueue> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(queue_name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(queue_name)))
            .clone()
    }

    fn queue_if_exists(&self, queue_name: &str) -> Option<Arc<MemoryQueue>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_name)
            .cloned()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(EventError::Connection("memory broker unavailable".to_string()))
        }
    }

    fn route(&self, message: &OutboundMessage) -> Result<u64> {
        self.ensure_available()?;

        let injected = self
            .inner
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EventError::Channel(format!(
                "injected publish failure for '{}'",
                message.event_name
            )));
        }

        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let queues: Vec<Arc<MemoryQueue>> = self
            .inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|q| q.is_bound(&message.event_name))
            .cloned()
            .collect();

        for queue in &queues {
            queue.enqueue(QueuedMessage {
                event_name: message.event_name.clone(),
                payload: message.payload.clone(),
                sequence,
                num_delivered: 0,
            });
        }

        self.inner.stats.published.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(
            event_name = %message.event_name,
            sequence,
            copies = queues.len(),
            "Memory broker routed message"
        );
        Ok(sequence)
    }
}

/// Connector whose "connection" succeeds while the broker is available
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Handle = MemoryBroker;

    async fn connect(&self) -> Result<MemoryBroker> {
        self.broker.ensure_available()?;
        Ok(self.broker.clone())
    }

    fn is_open(&self, handle: &MemoryBroker) -> bool {
        handle.is_available()
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}

/// One service's view of a [`MemoryBroker`]
pub struct MemoryTransport {
    queue: Arc<MemoryQueue>,
    connection: PersistentConnection<MemoryConnector>,
}

impl MemoryTransport {
    pub fn with_connect_retry(broker: MemoryBroker, queue_name: &str, retry: RetryPolicy) -> Self {
        let queue = broker.queue(queue_name);
        Self {
            queue,
            connection: PersistentConnection::new(MemoryConnector { broker }, retry),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &PersistentConnection<MemoryConnector> {
        &self.connection
    }

    async fn channel(&self) -> Result<MemoryBroker> {
        self.connection.channel().await
    }

    fn bindings(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.queue
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventTransport for MemoryTransport {
    async fn publish(&self, message: &OutboundMessage, _opts: &PublishOptions) -> Result<u64> {
        let (broker, generation) = self.connection.lease().await?;
        match broker.route(message) {
            Ok(sequence) => Ok(sequence),
            Err(e) => {
                self.connection.invalidate(generation).await;
                Err(match e {
                    EventError::Connection(reason) | EventError::Channel(reason) => {
                        EventError::Publish {
                            event_name: message.event_name.clone(),
                            reason,
                        }
                    }
                    other => other,
                })
            }
        }
    }

    async fn bind(&self, event_name: &str) -> Result<()> {
        self.channel().await?;
        if self.bindings().insert(event_name.to_string()) {
            tracing::debug!(queue = %self.queue.name, event_name, "Queue bound");
        }
        Ok(())
    }

    async fn unbind(&self, event_name: &str) -> Result<()> {
        self.channel().await?;
        if self.bindings().remove(event_name) {
            tracing::debug!(queue = %self.queue.name, event_name, "Queue unbound");
        }
        Ok(())
    }

    async fn rebind(&self, event_names: &[String]) -> Result<()> {
        self.channel().await?;
        let mut bindings = self.bindings();
        bindings.clear();
        bindings.extend(event_names.iter().cloned());
        Ok(())
    }

    async fn consume(&self) -> Result<Box<dyn Delivery>> {
        let broker = self.channel().await?;
        Ok(Box::new(MemoryDelivery {
            available: broker.inner.available.subscribe(),
            broker,
            queue: self.queue.clone(),
        }))
    }

    fn queue_name(&self) -> &str {
        &self.queue.name
    }

    fn name(&self) -> &str {
        "memory"
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.channel().await.is_ok())
    }

    async fn close(&self) -> Result<()> {
        self.connection.close().await;
        Ok(())
    }
}

struct MemoryDelivery {
    broker: MemoryBroker,
    queue: Arc<MemoryQueue>,
    available: watch::Receiver<bool>,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    async fn next(&mut self) -> Result<Option<PendingDelivery>> {
        let rx = self.queue.rx.clone();
        let mut rx = rx.lock().await;

        loop {
            if !*self.available.borrow_and_update() {
                return Err(EventError::Channel("memory broker unavailable".to_string()));
            }

            let received = tokio::select! {
                received = rx.recv() => Some(received),
                changed = self.available.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                    None
                }
            };

            match received {
                Some(Some(mut queued)) => {
                    queued.num_delivered += 1;
                    return Ok(Some(self.pending(queued)));
                }
                Some(None) => return Ok(None),
                None => continue,
            }
        }
    }
}

impl MemoryDelivery {
    fn pending(&self, queued: QueuedMessage) -> PendingDelivery {
        let message = ReceivedMessage {
            event_name: queued.event_name.clone(),
            payload: queued.payload.clone(),
            sequence: queued.sequence,
            num_delivered: queued.num_delivered,
            queue: self.queue.name.clone(),
        };

        let (ack_broker, ack_queue) = (self.broker.clone(), self.queue.clone());
        let (nak_broker, nak_queue) = (self.broker.clone(), self.queue.clone());
        let (term_broker, term_queue) = (self.broker.clone(), self.queue.clone());

        PendingDelivery::new(
            message,
            move || {
                async move {
                    ack_queue.unsettled.fetch_sub(1, Ordering::SeqCst);
                    ack_broker.inner.stats.acked.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            },
            move || {
                async move {
                    nak_broker.inner.stats.nacked.fetch_add(1, Ordering::SeqCst);
                    // Still unsettled: the requeued copy carries the count.
                    if nak_queue.tx.send(queued).is_err() {
                        nak_queue.unsettled.fetch_sub(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
                .boxed()
            },
            move || {
                async move {
                    term_queue.unsettled.fetch_sub(1, Ordering::SeqCst);
                    term_broker.inner.stats.terminated.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMeta;
    use std::time::Duration;

    fn outbound(event_name: &str) -> OutboundMessage {
        let meta = EventMeta::new();
        OutboundMessage {
            event_name: event_name.to_string(),
            event_id: meta.id,
            payload: Bytes::from(serde_json::to_vec(&meta).unwrap()),
            persistent: true,
        }
    }

    async fn next(delivery: &mut Box<dyn Delivery>) -> PendingDelivery {
        tokio::time::timeout(Duration::from_secs(1), delivery.next())
            .await
            .expect("delivery timed out")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_routes_only_to_bound_queues() {
        let broker = MemoryBroker::new();
        let identity = broker.transport("identity");
        let chat = broker.transport("chat");
        identity.bind("UserRegistered").await.unwrap();

        let opts = PublishOptions::default();
        chat.publish(&outbound("UserRegistered"), &opts).await.unwrap();
        chat.publish(&outbound("SpaceCreated"), &opts).await.unwrap();

        assert_eq!(broker.published(), 2);
        assert_eq!(broker.pending("identity"), 1);
        assert_eq!(broker.pending("chat"), 0);

        let mut delivery = identity.consume().await.unwrap();
        let pending = next(&mut delivery).await;
        assert_eq!(pending.message.event_name, "UserRegistered");
        assert_eq!(pending.message.num_delivered, 1);
        assert_eq!(pending.message.queue, "identity");
        pending.ack().await.unwrap();

        assert_eq!(broker.pending("identity"), 0);
        assert_eq!(broker.acked(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_to_every_bound_queue() {
        let broker = MemoryBroker::new();
        let a = broker.transport("service-a");
        let b = broker.transport("service-b");
        a.bind("UserRegistered").await.unwrap();
        b.bind("UserRegistered").await.unwrap();

        a.publish(&outbound("UserRegistered"), &PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(broker.pending("service-a"), 1);
        assert_eq!(broker.pending("service-b"), 1);
    }

    #[tokio::test]
    async fn test_nak_redelivers_with_incremented_count() {
        let broker = MemoryBroker::new();
        let transport = broker.transport("identity");
        transport.bind("UserRegistered").await.unwrap();
        transport
            .publish(&outbound("UserRegistered"), &PublishOptions::default())
            .await
            .unwrap();

        let mut delivery = transport.consume().await.unwrap();
        next(&mut delivery).await.nak().await.unwrap();

        let again = next(&mut delivery).await;
        assert_eq!(again.message.num_delivered, 2);
        assert_eq!(broker.pending("identity"), 1);
        again.term().await.unwrap();

        assert_eq!(broker.pending("identity"), 0);
        assert_eq!(broker.nacked(), 1);
        assert_eq!(broker.terminated(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_broker_fails_publish_and_stream() {
        let broker = MemoryBroker::new();
        let transport = broker.transport("identity");
        transport.bind("UserRegistered").await.unwrap();
        let mut delivery = transport.consume().await.unwrap();

        broker.set_available(false);
        let err = transport
            .publish(&outbound("UserRegistered"), &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);

        let err = delivery.next().await.unwrap_err();
        assert!(matches!(err, EventError::Channel(_)));

        broker.set_available(true);
        transport
            .publish(&outbound("UserRegistered"), &PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(transport.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_injected_publish_failures() {
        let broker = MemoryBroker::new();
        let transport = broker.transport("identity");
        broker.fail_next_publishes(2);

        let opts = PublishOptions::default();
        assert!(transport.publish(&outbound("X"), &opts).await.is_err());
        assert!(transport.publish(&outbound("X"), &opts).await.is_err());
        assert!(transport.publish(&outbound("X"), &opts).await.is_ok());
        assert_eq!(broker.published(), 1);
    }

    #[tokio::test]
    async fn test_rebind_and_unbind() {
        let broker = MemoryBroker::new();
        let transport = broker.transport("identity");
        transport.bind("A").await.unwrap();
        transport.bind("B").await.unwrap();
        transport.unbind("A").await.unwrap();
        assert_eq!(broker.bindings("identity"), vec!["B"]);

        transport
            .rebind(&["C".to_string(), "D".to_string()])
            .await
            .unwrap();
        assert_eq!(broker.bindings("identity"), vec!["C", "D"]);
    }

    #[tokio::test]
    async fn test_closed_transport_refuses_publish() {
        let broker = MemoryBroker::new();
        let transport = broker.transport("identity");
        transport.close().await.unwrap();

        let err = transport
            .publish(&outbound("X"), &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Shutdown(_)));
        assert!(!transport.health().await.unwrap());
    }
}
