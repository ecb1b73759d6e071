//! Integration event handlers and per-message handler resolution
//!
//! Business services implement [`IntegrationEventHandler`] for one concrete
//! event type, or [`DynamicEventHandler`] for late-bound payloads. Handlers
//! are registered through a factory that the bus calls once per delivery
//! attempt, so no handler instance outlives a single invocation.

use crate::error::EventError;
use crate::event::{DynamicEvent, IntegrationEvent};
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Outcome of a handler invocation
///
/// Any error counts as a failure and is subject to the bus retry policy.
pub type HandlerResult = anyhow::Result<()>;

/// Handler bound to one concrete event type
///
/// Delivery is at-least-once: the same event can arrive more than once, so
/// implementations must be idempotent or check for prior application.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    async fn handle(&self, event: &E) -> HandlerResult;
}

/// Handler that receives the raw payload of any event name it is bound to
#[async_trait]
pub trait DynamicEventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &DynamicEvent) -> HandlerResult;
}

/// Identity of a handler implementation
#[derive(Clone, Copy)]
pub struct HandlerId {
    type_id: TypeId,
    type_name: &'static str,
}

impl HandlerId {
    /// Identity of handler type `H`
    pub fn of<H: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            type_name: std::any::type_name::<H>(),
        }
    }

    /// Fully qualified type name, for logs
    pub fn name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for HandlerId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for HandlerId {}

impl std::hash::Hash for HandlerId {
    fn hash<S: std::hash::Hasher>(&self, state: &mut S) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

/// Payload handed to an invoker
///
/// Typed payloads are decoded once per message and shared by every typed
/// handler of that event name.
#[derive(Clone)]
pub enum EventPayload {
    Typed(Arc<dyn Any + Send + Sync>),
    Dynamic(DynamicEvent),
}

impl fmt::Debug for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPayload::Typed(_) => f.write_str("EventPayload::Typed(..)"),
            EventPayload::Dynamic(event) => f
                .debug_tuple("EventPayload::Dynamic")
                .field(&event.event_name)
                .finish(),
        }
    }
}

/// Type-erased entry point the consume loop calls for one descriptor
#[async_trait]
pub trait HandlerInvoker: Send + Sync {
    /// Resolve a fresh handler instance and run it against the payload
    async fn invoke(&self, payload: &EventPayload) -> HandlerResult;
}

pub(crate) struct TypedInvoker<E, H, F> {
    factory: F,
    _marker: PhantomData<fn() -> (E, H)>,
}

impl<E, H, F> TypedInvoker<E, H, F> {
    pub(crate) fn new(factory: F) -> Self {
        Self {
            factory,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<E, H, F> HandlerInvoker for TypedInvoker<E, H, F>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
    F: Fn() -> H + Send + Sync + 'static,
{
    async fn invoke(&self, payload: &EventPayload) -> HandlerResult {
        let event = match payload {
            EventPayload::Typed(any) => any.downcast_ref::<E>(),
            EventPayload::Dynamic(_) => None,
        }
        .ok_or_else(|| EventError::TypeMismatch {
            event_name: E::NAME.to_string(),
            expected: std::any::type_name::<E>(),
        })?;

        let handler = (self.factory)();
        handler.handle(event).await
    }
}

pub(crate) struct DynamicInvoker<H, F> {
    factory: F,
    _marker: PhantomData<fn() -> H>,
}

impl<H, F> DynamicInvoker<H, F> {
    pub(crate) fn new(factory: F) -> Self {
        Self {
            factory,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<H, F> HandlerInvoker for DynamicInvoker<H, F>
where
    H: DynamicEventHandler,
    F: Fn() -> H + Send + Sync + 'static,
{
    async fn invoke(&self, payload: &EventPayload) -> HandlerResult {
        let EventPayload::Dynamic(event) = payload else {
            return Err(EventError::TypeMismatch {
                event_name: "<typed>".to_string(),
                expected: "DynamicEvent",
            }
            .into());
        };

        let handler = (self.factory)();
        handler.handle(event).await
    }
}

/// Whether a handler error is a payload/type problem that retrying can't fix
pub(crate) fn is_permanent(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<EventError>(),
        Some(EventError::TypeMismatch { .. }) | Some(EventError::Serialization(_))
    )
}
