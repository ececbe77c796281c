//! The event-bus interface: type-erased core operations plus the typed
//! convenience layer.

use crate::component::{Component, ComponentHandle};
use crate::connection::Connection;
use crate::event::{DeliveryMode, EventMeta, EventObject, EventRef};
use crate::ids::EventId;
use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};

/// Type-erased weak handle with weak-identity semantics.
///
/// Two keys are equal iff they observe the same allocation. The wrapped
/// `Weak` pins the allocation's control block, so the recorded address
/// cannot be recycled while the key is alive, even after the referent
/// itself has been dropped.
#[derive(Clone)]
pub struct WeakKey {
    weak: Weak<dyn Any + Send + Sync>,
    addr: usize,
}

impl WeakKey {
    /// Builds a key observing `strong`.
    pub fn new<T: Send + Sync + 'static>(strong: &Arc<T>) -> Self {
        let any: Arc<dyn Any + Send + Sync> = strong.clone();
        Self::from_any(&any)
    }

    /// Builds a key observing a component handle.
    pub fn of_component(handle: &ComponentHandle) -> Self {
        Self::from_any(&handle.clone().as_any_arc())
    }

    /// Builds a key from an already type-erased handle.
    pub fn from_any(any: &Arc<dyn Any + Send + Sync>) -> Self {
        WeakKey {
            addr: Arc::as_ptr(any) as *const () as usize,
            weak: Arc::downgrade(any),
        }
    }

    /// Whether the observed allocation has been dropped.
    pub fn is_expired(&self) -> bool {
        self.weak.strong_count() == 0
    }

    /// Address identifying the observed allocation.
    pub fn addr(&self) -> usize {
        self.addr
    }
}

impl PartialEq for WeakKey {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for WeakKey {}

impl std::hash::Hash for WeakKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl Debug for WeakKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WeakKey({:#x})", self.addr)
    }
}

/// Type-erased subscriber callback.
///
/// Shared so queued deliveries can carry their own clone.
pub type EventCallback = Arc<dyn Fn(&dyn EventObject) + Send + Sync>;

/// The inter-component event bus.
///
/// These are the type-erased core operations; the typed surface lives on
/// `dyn EventBus` itself (see below) and wraps event construction,
/// subscriber weakening and downcasting around them.
pub trait EventBus: Component {
    /// Adds a subscription in the global topic of `event_id`.
    fn subscribe_global_raw(
        &self,
        event_id: EventId,
        subscriber: WeakKey,
        callback: EventCallback,
        mode: DeliveryMode,
    ) -> Connection;

    /// Adds a subscription in the per-sender topic of `(sender, event_id)`.
    fn subscribe_to_sender_raw(
        &self,
        event_id: EventId,
        subscriber: WeakKey,
        sender: WeakKey,
        callback: EventCallback,
        mode: DeliveryMode,
    ) -> Connection;

    /// Delivers an event to the global topic.
    fn fire_global_raw(&self, event: EventRef);

    /// Delivers an event to the per-sender topic of `sender`.
    fn fire_to_sender_raw(&self, sender: &WeakKey, event: EventRef);

    /// Whether the global topic of `event_id` has any subscription.
    fn is_global_subscribed(&self, event_id: EventId) -> bool;

    /// Whether the per-sender topic of `(sender, event_id)` has any
    /// subscription.
    fn is_sender_subscribed(&self, sender: &WeakKey, event_id: EventId) -> bool;

    /// Removes every subscription of `subscriber`, global and per-sender.
    ///
    /// Cost is proportional to the subscriber's own subscription count.
    fn unsubscribe_raw(&self, subscriber: &WeakKey);

    /// Removes the subscriptions of `subscriber` for one event, globally
    /// (`sender` is `None`) or towards one sender.
    fn unsubscribe_event_raw(
        &self,
        subscriber: &WeakKey,
        event_id: EventId,
        sender: Option<&WeakKey>,
    );

    /// Physically removes the subscription owning `token`.
    ///
    /// Called by [`Connection::disconnect`] after the token has been
    /// flipped; a token no longer present is a no-op.
    fn remove_subscription(
        &self,
        event_id: EventId,
        sender: Option<&WeakKey>,
        token: &Arc<AtomicBool>,
    );

    /// Blocks until the asynchronous queue is empty and the worker idle.
    fn drain_async_events(&self);
}

impl dyn EventBus {
    /// Subscribes `subscriber` to the global topic of `E`.
    ///
    /// The bus holds the subscriber weakly; dropping it ends delivery
    /// without any unsubscribe call. The returned [`Connection`] must be
    /// kept (or wrapped scoped) to disconnect explicitly.
    pub fn subscribe_global<E, S, F>(
        &self,
        subscriber: &Arc<S>,
        mode: DeliveryMode,
        callback: F,
    ) -> Connection
    where
        E: EventMeta,
        S: Send + Sync + 'static,
        F: Fn(&S, &E) + Send + Sync + 'static,
    {
        self.subscribe_global_raw(
            E::EVENT_ID,
            WeakKey::new(subscriber),
            wrap_callback(subscriber, callback),
            mode,
        )
    }

    /// Subscribes `subscriber` to events of type `E` fired towards
    /// `sender`.
    pub fn subscribe_to_sender<E, S, F>(
        &self,
        sender: &ComponentHandle,
        subscriber: &Arc<S>,
        mode: DeliveryMode,
        callback: F,
    ) -> Connection
    where
        E: EventMeta,
        S: Send + Sync + 'static,
        F: Fn(&S, &E) + Send + Sync + 'static,
    {
        self.subscribe_to_sender_raw(
            E::EVENT_ID,
            WeakKey::new(subscriber),
            WeakKey::of_component(sender),
            wrap_callback(subscriber, callback),
            mode,
        )
    }

    /// Fires `event` on the global topic.
    ///
    /// When nothing is subscribed the event value is dropped without any
    /// shared allocation.
    pub fn fire_global<E: EventMeta>(&self, event: E) {
        if !self.is_global_subscribed(E::EVENT_ID) {
            return;
        }
        self.fire_global_raw(Arc::new(event));
    }

    /// Fires `event` on the per-sender topic of `sender`.
    pub fn fire_to_sender<E: EventMeta>(&self, sender: &ComponentHandle, event: E) {
        let key = WeakKey::of_component(sender);
        if !self.is_sender_subscribed(&key, E::EVENT_ID) {
            return;
        }
        self.fire_to_sender_raw(&key, Arc::new(event));
    }

    /// Removes every subscription of `subscriber`.
    pub fn unsubscribe<S: Send + Sync + 'static>(&self, subscriber: &Arc<S>) {
        self.unsubscribe_raw(&WeakKey::new(subscriber));
    }

    /// Removes the subscriptions of `subscriber` for `E`, globally or
    /// towards `sender`.
    pub fn unsubscribe_event<E, S>(&self, subscriber: &Arc<S>, sender: Option<&ComponentHandle>)
    where
        E: EventMeta,
        S: Send + Sync + 'static,
    {
        let sender_key = sender.map(WeakKey::of_component);
        self.unsubscribe_event_raw(
            &WeakKey::new(subscriber),
            E::EVENT_ID,
            sender_key.as_ref(),
        );
    }
}

fn wrap_callback<E, S, F>(subscriber: &Arc<S>, callback: F) -> EventCallback
where
    E: EventMeta,
    S: Send + Sync + 'static,
    F: Fn(&S, &E) + Send + Sync + 'static,
{
    let weak = Arc::downgrade(subscriber);
    Arc::new(move |event: &dyn EventObject| {
        let Some(subscriber) = weak.upgrade() else {
            return;
        };
        if let Some(typed) = event.downcast_ref::<E>() {
            callback(&subscriber, typed);
        }
    })
}

crate::declare_interface!(EventBus, "veld-core-EventBus-IID-A0000002", 1, 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_key_identity() {
        let first = Arc::new(41_u32);
        let second = Arc::new(41_u32);

        let key_a = WeakKey::new(&first);
        let key_b = WeakKey::new(&first);
        let key_c = WeakKey::new(&second);

        assert_eq!(key_a, key_b);
        assert_ne!(key_a, key_c);
        assert!(!key_a.is_expired());

        drop(first);
        assert!(key_a.is_expired());
        // Identity survives expiry; the control block is still pinned.
        assert_eq!(key_a, key_b);
    }
}
