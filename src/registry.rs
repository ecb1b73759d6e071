//! In-memory subscription registry
//!
//! Tracks, per event name, which handlers are interested and which concrete
//! type typed handlers expect. Pure bookkeeping: no I/O. One registry is
//! shared by the consume loop and any runtime subscribe/unsubscribe calls.

use crate::error::{EventError, Result};
use crate::event::IntegrationEvent;
use crate::handler::{
    DynamicEventHandler, DynamicInvoker, HandlerId, HandlerInvoker, IntegrationEventHandler,
    TypedInvoker,
};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// One registered handler for an event name
#[derive(Clone)]
pub struct SubscriptionInfo {
    handler: HandlerId,
    event_type: Option<EventType>,
    invoker: Arc<dyn HandlerInvoker>,
}

impl SubscriptionInfo {
    /// Identity of the handler implementation
    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    /// Whether the handler receives the raw, late-bound payload
    pub fn is_dynamic(&self) -> bool {
        self.event_type.is_none()
    }

    /// Concrete type a typed handler expects; `None` for dynamic handlers
    pub fn event_type(&self) -> Option<EventType> {
        self.event_type
    }

    pub(crate) fn invoker(&self) -> &Arc<dyn HandlerInvoker> {
        &self.invoker
    }
}

impl fmt::Debug for SubscriptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionInfo")
            .field("handler", &self.handler)
            .field("event_type", &self.event_type)
            .finish()
    }
}

type Decoder = fn(&[u8]) -> Result<Arc<dyn Any + Send + Sync>>;

/// Concrete type used to deserialize a typed event
#[derive(Clone, Copy)]
pub struct EventType {
    type_id: TypeId,
    type_name: &'static str,
    decode: Decoder,
}

impl EventType {
    /// Descriptor for the concrete event type `E`
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            decode: decode_as::<E>,
        }
    }

    /// `TypeId` of the concrete event type
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified type name, for logs
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether this descriptor is for `E`
    pub fn is<E: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<E>()
    }

    /// Deserialize a payload into this type
    pub fn decode(&self, payload: &[u8]) -> Result<Arc<dyn Any + Send + Sync>> {
        (self.decode)(payload)
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for EventType {}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

fn decode_as<E: IntegrationEvent>(payload: &[u8]) -> Result<Arc<dyn Any + Send + Sync>> {
    let event: E = serde_json::from_slice(payload)?;
    Ok(Arc::new(event))
}

/// Callback fired when the last handler for an event name is removed
pub type RemovalListener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<String, Vec<SubscriptionInfo>>,
    event_types: HashMap<String, EventType>,
}

/// Event name → handler descriptors, safe for concurrent use
///
/// Insertion order per event name is the dispatch order. Every operation
/// takes the lock once, so readers never observe a half-applied change.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
    listeners: RwLock<Vec<RemovalListener>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `E`
    ///
    /// Records (or overwrites) `E` as the concrete type for `E::NAME`.
    /// Fails with [`EventError::DuplicateHandler`] if `H` is already
    /// registered for that name.
    pub fn add_subscription<E, H, F>(&self, factory: F) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let info = SubscriptionInfo {
            handler: HandlerId::of::<H>(),
            event_type: Some(EventType::of::<E>()),
            invoker: Arc::new(TypedInvoker::<E, H, F>::new(factory)),
        };
        self.do_add(E::NAME, info)
    }

    /// Register a dynamic handler for an arbitrary event name
    ///
    /// No concrete type is recorded; the handler parses the payload itself.
    pub fn add_dynamic_subscription<H, F>(&self, event_name: &str, factory: F) -> Result<()>
    where
        H: DynamicEventHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let info = SubscriptionInfo {
            handler: HandlerId::of::<H>(),
            event_type: None,
            invoker: Arc::new(DynamicInvoker::<H, F>::new(factory)),
        };
        self.do_add(event_name, info)
    }

    fn do_add(&self, event_name: &str, info: SubscriptionInfo) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let handlers = state.handlers.get(event_name);
        if handlers.is_some_and(|list| list.iter().any(|s| s.handler == info.handler)) {
            return Err(EventError::DuplicateHandler {
                handler: info.handler.to_string(),
                event_name: event_name.to_string(),
            });
        }

        tracing::debug!(
            event_name,
            handler = %info.handler,
            dynamic = info.is_dynamic(),
            "Subscription added"
        );

        if let Some(event_type) = info.event_type {
            state.event_types.insert(event_name.to_string(), event_type);
        }
        state
            .handlers
            .entry(event_name.to_string())
            .or_default()
            .push(info);
        Ok(())
    }

    /// Remove a typed handler; no-op if it isn't registered
    ///
    /// Returns true when this removal emptied the event name.
    pub fn remove_subscription<E, H>(&self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.do_remove(E::NAME, HandlerId::of::<H>(), false)
    }

    /// Remove a dynamic handler; no-op if it isn't registered
    pub fn remove_dynamic_subscription<H>(&self, event_name: &str) -> bool
    where
        H: DynamicEventHandler,
    {
        self.do_remove(event_name, HandlerId::of::<H>(), true)
    }

    fn do_remove(&self, event_name: &str, handler: HandlerId, is_dynamic: bool) -> bool {
        let emptied = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

            let Some(list) = state.handlers.get_mut(event_name) else {
                return false;
            };
            let Some(pos) = list
                .iter()
                .position(|s| s.handler == handler && s.is_dynamic() == is_dynamic)
            else {
                return false;
            };
            list.remove(pos);

            tracing::debug!(event_name, handler = %handler, "Subscription removed");

            // The name's type follows the most recent typed descriptor still present.
            let remaining_type = list.iter().rev().find_map(|s| s.event_type);
            let emptied = list.is_empty();
            if emptied {
                state.handlers.remove(event_name);
            }
            match remaining_type {
                Some(event_type) => {
                    state.event_types.insert(event_name.to_string(), event_type);
                }
                None => {
                    state.event_types.remove(event_name);
                }
            }
            emptied
        };

        if emptied {
            self.raise_on_event_removed(event_name);
        }
        emptied
    }

    fn raise_on_event_removed(&self, event_name: &str) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(event_name);
        }
    }

    /// Register a callback for "last handler removed" notifications
    pub fn on_event_removed(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Whether at least one handler is registered for the event name
    pub fn has_subscriptions_for_event(&self, event_name: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .contains_key(event_name)
    }

    /// Typed shorthand for [`has_subscriptions_for_event`](Self::has_subscriptions_for_event)
    pub fn has_subscriptions_for<E: IntegrationEvent>(&self) -> bool {
        self.has_subscriptions_for_event(E::NAME)
    }

    /// Snapshot of the handlers for an event name, in dispatch order
    pub fn get_handlers_for_event(&self, event_name: &str) -> Result<Vec<SubscriptionInfo>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .get(event_name)
            .cloned()
            .ok_or_else(|| EventError::UnknownEvent(event_name.to_string()))
    }

    /// Concrete type of the most recent typed subscription still registered
    pub fn get_event_type_by_name(&self, event_name: &str) -> Option<EventType> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .event_types
            .get(event_name)
            .copied()
    }

    /// All event names with at least one handler, sorted
    pub fn event_names(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = state.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether no handler is registered at all
    pub fn is_empty(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .is_empty()
    }

    /// Drop all subscriptions and types; listeners are kept and not notified
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.handlers.clear();
        state.event_types.clear();
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_map().entries(state.handlers.iter()).finish()
    }
}
