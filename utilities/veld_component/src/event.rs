//! Event objects, their compile-time metadata and the delivery modes.

use crate::ids::EventId;
use std::any::Any;
use std::sync::Arc;

/// How a subscription receives its events.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The callback runs on the thread calling `fire`, before `fire`
    /// returns.
    Direct,
    /// The callback is queued and runs on the bus worker thread.
    Queued,
}

/// Base trait of every event value.
///
/// Implemented through [`declare_event!`](crate::declare_event). Events
/// are delivered as shared immutable handles so all subscribers of one
/// fire observe the same instance.
pub trait EventObject: Send + Sync + 'static {
    /// Identifier of the event type.
    fn event_id(&self) -> EventId;

    /// Name of the event type.
    fn event_name(&self) -> &'static str;

    /// The event as `Any`, for typed downcasts at the subscriber.
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

/// Shared handle to a fired event.
pub type EventRef = Arc<dyn EventObject>;

/// Compile-time metadata of an event type.
pub trait EventMeta: EventObject + Sized {
    /// Event identifier, hashed from the event UUID.
    const EVENT_ID: EventId;
    /// Event name.
    const NAME: &'static str;
}

impl dyn EventObject {
    /// Downcasts the event to its concrete type.
    pub fn downcast_ref<E: EventMeta>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }
}

/// Attaches identity metadata to an event struct and implements
/// [`EventObject`] for it.
///
/// ```
/// #[derive(Debug, Clone)]
/// pub struct TemperatureChanged {
///     pub celsius: i32,
/// }
/// veld_component::declare_event!(TemperatureChanged, "veld-doc-temperature-EVENT-41C09A55");
/// ```
#[macro_export]
macro_rules! declare_event {
    ($event:ty, $uuid:literal) => {
        impl $crate::EventMeta for $event {
            const EVENT_ID: $crate::EventId = $crate::event_id($uuid);
            const NAME: &'static str = stringify!($event);
        }

        impl $crate::EventObject for $event {
            fn event_id(&self) -> $crate::EventId {
                <Self as $crate::EventMeta>::EVENT_ID
            }

            fn event_name(&self) -> &'static str {
                <Self as $crate::EventMeta>::NAME
            }

            fn as_any(&self) -> &(dyn ::std::any::Any + Send + Sync) {
                self
            }
        }
    };
}
