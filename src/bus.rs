//! Event bus: publish, subscribe and the consume loop
//!
//! `EventBus` ties a [`SubscriptionRegistry`] to an [`EventTransport`]:
//!
//! - **publish** serializes an event and sends it under its event name,
//!   retrying transient transport failures with backoff.
//! - **subscribe** registers a handler factory and binds the service queue
//!   to the event name when it gains its first handler; **unsubscribe**
//!   unbinds once the registry reports the name emptied.
//! - **start** runs one consume loop per process. Each delivery is
//!   dispatched on its own task (bounded by `prefetch`) to every handler
//!   registered for its event name, then acked, or dead-lettered once a
//!   handler exhausts its retry budget.

use crate::config::EventBusConfig;
use crate::dlq::{DeadLetter, DlqHandler, MemoryDlqHandler};
use crate::error::{EventError, Result};
use crate::event::{
    DynamicEvent, IntegrationEvent, OutboundMessage, PublishOptions, ReceivedMessage,
};
use crate::handler::{
    is_permanent, DynamicEventHandler, EventPayload, HandlerId, IntegrationEventHandler,
};
use crate::registry::{EventType, SubscriptionInfo, SubscriptionRegistry};
use crate::retry::{with_retry, AttemptOutcome};
use crate::transport::{Delivery, EventTransport, PendingDelivery};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Every handler succeeded; the message was acked
    Acked,
    /// No local subscription; the message was acked and dropped
    Dropped,
    /// Retry budget exhausted or payload unusable; routed to the DLQ
    DeadLettered,
    /// Handed back to the broker for redelivery
    Requeued,
}

enum HandlerOutcome {
    Succeeded,
    Failed(String),
    Interrupted,
}

enum Dispatch {
    Completed {
        failed: Vec<HandlerId>,
        reasons: Vec<String>,
    },
    Interrupted,
}

/// A message decoded once per concrete type its handlers expect
struct Payloads {
    typed: Vec<(EventType, EventPayload)>,
    dynamic: Option<EventPayload>,
}

impl Payloads {
    fn decode(
        message: &ReceivedMessage,
        handlers: &[SubscriptionInfo],
    ) -> std::result::Result<Self, String> {
        let mut typed: Vec<(EventType, EventPayload)> = Vec::new();
        let mut dynamic = None;

        for subscription in handlers {
            match subscription.event_type() {
                Some(event_type) => {
                    if typed.iter().any(|(known, _)| *known == event_type) {
                        continue;
                    }
                    let event = event_type.decode(&message.payload).map_err(|e| {
                        format!("undecodable payload for {}: {}", event_type.type_name(), e)
                    })?;
                    typed.push((event_type, EventPayload::Typed(event)));
                }
                None if dynamic.is_none() => {
                    dynamic = Some(EventPayload::Dynamic(DynamicEvent::new(
                        message.event_name.clone(),
                        message.payload.clone(),
                    )));
                }
                None => {}
            }
        }

        Ok(Self { typed, dynamic })
    }

    fn for_subscription(&self, subscription: &SubscriptionInfo) -> Option<&EventPayload> {
        match subscription.event_type() {
            Some(event_type) => self
                .typed
                .iter()
                .find(|(known, _)| *known == event_type)
                .map(|(_, payload)| payload),
            None => self.dynamic.as_ref(),
        }
    }
}

struct BusInner {
    transport: Arc<dyn EventTransport>,
    registry: Arc<SubscriptionRegistry>,
    dlq: Arc<dyn DlqHandler>,
    config: EventBusConfig,
    /// Event names the registry reported emptied, awaiting unbind
    removed: Mutex<mpsc::UnboundedReceiver<String>>,
    /// Serializes register+bind and remove+unbind sequences
    binding: Mutex<()>,
    shutdown: CancellationToken,
    in_flight: TaskTracker,
    consumer: StdMutex<Option<JoinHandle<()>>>,
}

/// Integration event bus for one service process
///
/// Cheap to clone; clones share the registry, transport and consume loop.
/// Call [`shutdown`](Self::shutdown) to drain and close.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Builder for [`EventBus`]
pub struct EventBusBuilder {
    transport: Arc<dyn EventTransport>,
    config: EventBusConfig,
    registry: Option<Arc<SubscriptionRegistry>>,
    dlq: Option<Arc<dyn DlqHandler>>,
}

impl EventBusBuilder {
    /// Replace the default configuration
    pub fn config(mut self, config: EventBusConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing registry instead of a fresh one
    pub fn registry(mut self, registry: Arc<SubscriptionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Dead-letter destination (defaults to [`MemoryDlqHandler`])
    pub fn dlq(mut self, dlq: Arc<dyn DlqHandler>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Validate the configuration and create the bus
    pub fn build(self) -> Result<EventBus> {
        self.config.validate()?;
        Ok(EventBus::from_parts(
            self.transport,
            self.config,
            self.registry.unwrap_or_default(),
            self.dlq
                .unwrap_or_else(|| Arc::new(MemoryDlqHandler::default())),
        ))
    }
}

impl EventBus {
    /// Create an event bus with default configuration
    pub fn new(transport: impl EventTransport + 'static) -> Self {
        let config = EventBusConfig::for_queue(transport.queue_name());
        Self::from_parts(
            Arc::new(transport),
            config,
            Arc::default(),
            Arc::new(MemoryDlqHandler::default()),
        )
    }

    fn from_parts(
        transport: Arc<dyn EventTransport>,
        config: EventBusConfig,
        registry: Arc<SubscriptionRegistry>,
        dlq: Arc<dyn DlqHandler>,
    ) -> Self {
        let (removed_tx, removed_rx) = mpsc::unbounded_channel();
        registry.on_event_removed(move |event_name| {
            let _ = removed_tx.send(event_name.to_string());
        });

        tracing::info!(
            transport = transport.name(),
            queue = transport.queue_name(),
            prefetch = config.prefetch,
            "Event bus created"
        );

        Self {
            inner: Arc::new(BusInner {
                transport,
                registry,
                dlq,
                config,
                removed: Mutex::new(removed_rx),
                binding: Mutex::new(()),
                shutdown: CancellationToken::new(),
                in_flight: TaskTracker::new(),
                consumer: StdMutex::new(None),
            }),
        }
    }

    /// Start building a bus with custom configuration, registry or DLQ
    pub fn builder(transport: Arc<dyn EventTransport>) -> EventBusBuilder {
        EventBusBuilder {
            config: EventBusConfig::for_queue(transport.queue_name()),
            transport,
            registry: None,
            dlq: None,
        }
    }

    /// Subscription registry shared by this bus
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    /// Broker transport this bus publishes and consumes through
    pub fn transport(&self) -> &Arc<dyn EventTransport> {
        &self.inner.transport
    }

    /// Active configuration
    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    /// Dead-letter destination
    pub fn dlq(&self) -> &Arc<dyn DlqHandler> {
        &self.inner.dlq
    }

    /// Whether the consume loop is running
    pub fn is_running(&self) -> bool {
        self.inner
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Health check: true if the transport can reach the broker
    pub async fn health(&self) -> Result<bool> {
        self.inner.transport.health().await
    }

    // ─── Publish ─────────────────────────────────────────────────────

    /// Publish an event, returning the broker sequence number
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<u64> {
        self.publish_with_options(event, &PublishOptions::default())
            .await
    }

    /// Publish an event with explicit options
    pub async fn publish_with_options<E: IntegrationEvent>(
        &self,
        event: &E,
        opts: &PublishOptions,
    ) -> Result<u64> {
        let message = OutboundMessage::from_event(event)?;
        self.publish_message(&message, opts).await
    }

    /// Publish an already serialized message
    ///
    /// Transient transport failures are retried per `publish_retry`; each
    /// attempt is bounded by the publish timeout. The message id is pinned
    /// to the event id so brokers that deduplicate drop retried copies.
    pub async fn publish_message(
        &self,
        message: &OutboundMessage,
        opts: &PublishOptions,
    ) -> Result<u64> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EventError::Shutdown("event bus is shut down".to_string()));
        }

        let timeout = opts
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.inner.config.publish_timeout());
        let mut opts = opts.clone();
        opts.msg_id
            .get_or_insert_with(|| message.event_id.to_string());
        let opts = &opts;
        let transport = &self.inner.transport;

        tracing::debug!(
            event_name = %message.event_name,
            event_id = %message.event_id,
            "Publishing integration event"
        );

        with_retry(&self.inner.config.publish_retry, "publish", |attempt| async move {
            match tokio::time::timeout(timeout, transport.publish(message, opts)).await {
                Ok(result) => AttemptOutcome::from(result),
                Err(_) => AttemptOutcome::Retryable(EventError::Timeout(format!(
                    "publish of '{}' attempt {} exceeded {:?}",
                    message.event_name,
                    attempt + 1,
                    timeout
                ))),
            }
        })
        .await
        .inspect_err(|e| {
            tracing::error!(
                event_name = %message.event_name,
                event_id = %message.event_id,
                error = %e,
                "Failed to publish integration event"
            );
        })
    }

    // ─── Subscribe ───────────────────────────────────────────────────

    /// Subscribe a typed handler to `E`
    ///
    /// `factory` builds a fresh handler for every delivery attempt. Fails
    /// with [`EventError::DuplicateHandler`] if `H` already handles `E`.
    pub async fn subscribe<E, H, F>(&self, factory: F) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let registry = &self.inner.registry;
        self.register_and_bind(
            E::NAME,
            || registry.add_subscription::<E, H, F>(factory),
            || {
                registry.remove_subscription::<E, H>();
            },
        )
        .await?;

        tracing::info!(
            event_name = E::NAME,
            handler = %HandlerId::of::<H>(),
            "Subscribed to integration event"
        );
        Ok(())
    }

    /// Subscribe a dynamic handler to an event name
    pub async fn subscribe_dynamic<H, F>(&self, event_name: &str, factory: F) -> Result<()>
    where
        H: DynamicEventHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let registry = &self.inner.registry;
        self.register_and_bind(
            event_name,
            || registry.add_dynamic_subscription::<H, F>(event_name, factory),
            || {
                registry.remove_dynamic_subscription::<H>(event_name);
            },
        )
        .await?;

        tracing::info!(
            event_name,
            handler = %HandlerId::of::<H>(),
            "Subscribed dynamic handler"
        );
        Ok(())
    }

    /// Remove a typed handler; unbinds `E` once no local handler remains
    pub async fn unsubscribe<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let _guard = self.inner.binding.lock().await;
        self.inner.registry.remove_subscription::<E, H>();
        self.flush_unbinds().await
    }

    /// Remove a dynamic handler; unbinds the name once no local handler remains
    pub async fn unsubscribe_dynamic<H>(&self, event_name: &str) -> Result<()>
    where
        H: DynamicEventHandler,
    {
        let _guard = self.inner.binding.lock().await;
        self.inner
            .registry
            .remove_dynamic_subscription::<H>(event_name);
        self.flush_unbinds().await
    }

    async fn register_and_bind(
        &self,
        event_name: &str,
        register: impl FnOnce() -> Result<()>,
        rollback: impl FnOnce(),
    ) -> Result<()> {
        let _guard = self.inner.binding.lock().await;

        let first = !self.inner.registry.has_subscriptions_for_event(event_name);
        register()?;

        if first {
            let bound = self
                .with_subscribe_timeout(event_name, self.inner.transport.bind(event_name))
                .await;
            if let Err(e) = bound {
                rollback();
                // The rollback emptied the name again; discard that notification.
                self.drain_removed().await;
                tracing::error!(
                    event_name,
                    error = %e,
                    "Failed to bind queue, subscription rolled back"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unbind every name the registry reported emptied
    async fn flush_unbinds(&self) -> Result<()> {
        let mut first_error = None;

        for event_name in self.drain_removed().await {
            if self.inner.registry.has_subscriptions_for_event(&event_name) {
                continue;
            }
            let unbound = self
                .with_subscribe_timeout(&event_name, self.inner.transport.unbind(&event_name))
                .await;
            match unbound {
                Ok(()) => {
                    tracing::info!(event_name = %event_name, "Unsubscribed from integration event")
                }
                Err(e) => {
                    tracing::warn!(event_name = %event_name, error = %e, "Failed to unbind queue");
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn drain_removed(&self) -> Vec<String> {
        let mut removed = self.inner.removed.lock().await;
        let mut names = Vec::new();
        while let Ok(name) = removed.try_recv() {
            names.push(name);
        }
        names
    }

    async fn with_subscribe_timeout(
        &self,
        event_name: &str,
        op: impl Future<Output = Result<()>>,
    ) -> Result<()> {
        let timeout = self.inner.config.subscribe_timeout();
        tokio::time::timeout(timeout, op).await.map_err(|_| {
            EventError::Timeout(format!("binding '{}' exceeded {:?}", event_name, timeout))
        })?
    }

    // ─── Consume ─────────────────────────────────────────────────────

    /// Start the consume loop
    ///
    /// Must be called from within a Tokio runtime. Fails if the loop is
    /// already running or the bus was shut down.
    pub fn start(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EventError::Shutdown("event bus is shut down".to_string()));
        }

        let mut consumer = self
            .inner
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if consumer.is_some() {
            return Err(EventError::Config("consume loop already started".to_string()));
        }

        let inner = self.inner.clone();
        *consumer = Some(tokio::spawn(async move { inner.consume_loop().await }));

        tracing::info!(queue = self.inner.transport.queue_name(), "Consume loop started");
        Ok(())
    }

    /// Stop receiving, drain in-flight handlers, close the transport
    ///
    /// In-flight handlers run until they finish or the shutdown timeout
    /// elapses; deliveries waiting on a retry backoff are requeued.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        self.inner.shutdown.cancel();

        let consumer = self
            .inner
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = consumer {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Consume loop terminated abnormally");
            }
        }

        self.inner.in_flight.close();
        let timeout = self.inner.config.shutdown_timeout();
        if tokio::time::timeout(timeout, self.inner.in_flight.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = self.inner.in_flight.len(),
                "Shutdown timed out waiting for in-flight handlers"
            );
        }

        self.inner.transport.close().await?;
        tracing::info!(queue = self.inner.transport.queue_name(), "Event bus shut down");
        Ok(())
    }

    /// Dispatch one delivery to its handlers and settle it
    ///
    /// This is the per-message body of the consume loop; it never fails,
    /// every error becomes an ack, nak or dead-letter decision.
    pub async fn process_delivery(&self, pending: PendingDelivery) -> ProcessOutcome {
        self.inner.process_delivery(pending).await
    }
}

impl BusInner {
    async fn consume_loop(self: Arc<Self>) {
        let permits = Arc::new(Semaphore::new(self.config.prefetch));
        let mut failures: u32 = 0;

        'open: loop {
            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => break 'open,
                opened = self.open_delivery() => opened,
            };

            let mut delivery = match opened {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::warn!(
                        queue = self.transport.queue_name(),
                        attempt = failures + 1,
                        error = %e,
                        "Failed to open queue"
                    );
                    if !self.backoff(&mut failures).await {
                        break 'open;
                    }
                    continue 'open;
                }
            };

            loop {
                let permit = tokio::select! {
                    _ = self.shutdown.cancelled() => break 'open,
                    permit = permits.clone().acquire_owned() => permit,
                };
                let Ok(permit) = permit else {
                    break 'open;
                };

                let next = tokio::select! {
                    _ = self.shutdown.cancelled() => break 'open,
                    next = delivery.next() => next,
                };

                match next {
                    Ok(Some(pending)) => {
                        failures = 0;
                        let inner = self.clone();
                        self.in_flight.spawn(async move {
                            inner.process_delivery(pending).await;
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        tracing::warn!(
                            queue = self.transport.queue_name(),
                            "Delivery stream ended, reopening"
                        );
                        if !self.backoff(&mut failures).await {
                            break 'open;
                        }
                        continue 'open;
                    }
                    Err(e) => {
                        tracing::warn!(
                            queue = self.transport.queue_name(),
                            error = %e,
                            "Delivery stream failed, reopening"
                        );
                        if !self.backoff(&mut failures).await {
                            break 'open;
                        }
                        continue 'open;
                    }
                }
            }
        }

        tracing::info!(queue = self.transport.queue_name(), "Consume loop stopped");
    }

    /// Restore bindings from the registry, then open the queue
    async fn open_delivery(&self) -> Result<Box<dyn Delivery>> {
        {
            let _guard = self.binding.lock().await;
            let event_names = self.registry.event_names();
            self.transport.rebind(&event_names).await?;
            tracing::debug!(bindings = ?event_names, "Queue bindings restored from registry");
        }
        self.transport.consume().await
    }

    /// Sleep before reopening; false if shutdown interrupted the wait
    async fn backoff(&self, failures: &mut u32) -> bool {
        let policy = &self.config.connect_retry;
        let delay = policy.delay_for_attempt(*failures);
        *failures = failures.saturating_add(1);

        if *failures > policy.max_retries && (*failures - policy.max_retries) == 1 {
            tracing::error!(
                queue = self.transport.queue_name(),
                attempts = *failures,
                "Reconnect retries exhausted; continuing at maximum backoff"
            );
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn process_delivery(&self, pending: PendingDelivery) -> ProcessOutcome {
        let event_name = pending.message.event_name.clone();

        if !self.registry.has_subscriptions_for_event(&event_name) {
            tracing::debug!(event_name = %event_name, "No local subscription, dropping message");
            settle("ack", &event_name, pending.ack()).await;
            return ProcessOutcome::Dropped;
        }

        let handlers = match self.registry.get_handlers_for_event(&event_name) {
            Ok(handlers) => handlers,
            Err(_) => {
                // Unsubscribed between the two lookups.
                settle("ack", &event_name, pending.ack()).await;
                return ProcessOutcome::Dropped;
            }
        };

        let payloads = match Payloads::decode(&pending.message, &handlers) {
            Ok(payloads) => payloads,
            Err(reason) => return self.dead_letter(pending, reason, Vec::new()).await,
        };

        let deadline = self.config.message_timeout();
        let dispatched =
            tokio::time::timeout(deadline, self.dispatch(&handlers, &payloads, &event_name)).await;

        match dispatched {
            Ok(Dispatch::Completed { failed, .. }) if failed.is_empty() => {
                settle("ack", &event_name, pending.ack()).await;
                tracing::debug!(
                    event_name = %event_name,
                    handlers = handlers.len(),
                    "Integration event handled"
                );
                ProcessOutcome::Acked
            }
            Ok(Dispatch::Completed { failed, reasons }) => {
                self.dead_letter(pending, reasons.join("; "), failed).await
            }
            Ok(Dispatch::Interrupted) => {
                tracing::info!(
                    event_name = %event_name,
                    "Shutdown during retry, requeueing message"
                );
                settle("nak", &event_name, pending.nak()).await;
                ProcessOutcome::Requeued
            }
            Err(_) if pending.message.num_delivered >= self.config.max_deliveries => {
                let reason = format!(
                    "message deadline of {:?} exceeded on {} deliveries",
                    deadline, pending.message.num_delivered
                );
                self.dead_letter(pending, reason, Vec::new()).await
            }
            Err(_) => {
                tracing::warn!(
                    event_name = %event_name,
                    deadline = ?deadline,
                    delivery = pending.message.num_delivered,
                    "Message deadline exceeded, requeueing"
                );
                settle("nak", &event_name, pending.nak()).await;
                ProcessOutcome::Requeued
            }
        }
    }

    /// Run every handler in registration order, collecting the ones that failed
    async fn dispatch(
        &self,
        handlers: &[SubscriptionInfo],
        payloads: &Payloads,
        event_name: &str,
    ) -> Dispatch {
        let mut failed = Vec::new();
        let mut reasons = Vec::new();

        for subscription in handlers {
            let Some(payload) = payloads.for_subscription(subscription) else {
                continue;
            };

            match self.invoke_with_retry(subscription, payload, event_name).await {
                HandlerOutcome::Succeeded => {}
                HandlerOutcome::Failed(reason) => {
                    reasons.push(format!("{}: {}", subscription.handler(), reason));
                    failed.push(subscription.handler());
                }
                HandlerOutcome::Interrupted => return Dispatch::Interrupted,
            }
        }

        Dispatch::Completed { failed, reasons }
    }

    /// Run one handler until it succeeds, fails permanently, or runs out of retries
    ///
    /// Only this handler is re-invoked; handlers that already succeeded for
    /// the message are not run again. A panic counts as a failed attempt.
    async fn invoke_with_retry(
        &self,
        subscription: &SubscriptionInfo,
        payload: &EventPayload,
        event_name: &str,
    ) -> HandlerOutcome {
        let policy = &self.config.handler_retry;
        let timeout = self.config.handler_timeout();
        let mut last_error = String::new();

        for attempt in 0..policy.max_attempts() {
            let invocation =
                AssertUnwindSafe(subscription.invoker().invoke(payload)).catch_unwind();
            let result = match tokio::time::timeout(timeout, invocation).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(anyhow::anyhow!(
                    "handler panicked: {}",
                    panic_message(&*panic)
                )),
                Err(_) => Err(anyhow::anyhow!("handler timed out after {:?}", timeout)),
            };

            match result {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::info!(
                            event_name,
                            handler = %subscription.handler(),
                            retries = attempt,
                            "Handler succeeded after retry"
                        );
                    }
                    return HandlerOutcome::Succeeded;
                }
                Err(e) if is_permanent(&e) => {
                    tracing::error!(
                        event_name,
                        handler = %subscription.handler(),
                        error = %format!("{:#}", e),
                        "Handler rejected payload"
                    );
                    return HandlerOutcome::Failed(format!("{:#}", e));
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    tracing::warn!(
                        event_name,
                        handler = %subscription.handler(),
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts(),
                        error = %last_error,
                        "Handler failed"
                    );

                    if attempt + 1 < policy.max_attempts() {
                        let delay = policy.delay_for_attempt(attempt);
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return HandlerOutcome::Interrupted,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        HandlerOutcome::Failed(last_error)
    }

    async fn dead_letter(
        &self,
        pending: PendingDelivery,
        reason: String,
        failed: Vec<HandlerId>,
    ) -> ProcessOutcome {
        let event_name = pending.message.event_name.clone();
        let dead_letter =
            DeadLetter::new(pending.message.clone(), reason).with_failed_handlers(failed);

        match self.dlq.handle(dead_letter).await {
            Ok(()) => {
                settle("term", &event_name, pending.term()).await;
                ProcessOutcome::DeadLettered
            }
            Err(e) => {
                tracing::error!(
                    event_name = %event_name,
                    error = %e,
                    "Dead-letter routing failed, requeueing message"
                );
                settle("nak", &event_name, pending.nak()).await;
                ProcessOutcome::Requeued
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Await an ack/nak/term; failures only mean the broker will redeliver
async fn settle(kind: &str, event_name: &str, op: impl Future<Output = Result<()>>) {
    if let Err(e) = op.await {
        tracing::warn!(event_name, settle = kind, error = %e, "Failed to settle delivery");
    }
}
