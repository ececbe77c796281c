//! Subscription handles returned by the event bus.

use crate::bus::{EventBus, WeakKey};
use crate::ids::EventId;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

struct ConnectionInner {
    bus: Weak<dyn EventBus>,
    subscriber: WeakKey,
    event_id: EventId,
    sender: Option<WeakKey>,
    token: Arc<AtomicBool>,
}

/// Handle to one live subscription.
///
/// Shares its active token with the subscription stored in the bus:
/// [`disconnect`](Connection::disconnect) flips the token atomically, so
/// delivery stops even when the physical list entry lingers until the next
/// collection pass. Disconnecting is idempotent and remains safe after the
/// bus or the subscriber are gone.
pub struct Connection {
    inner: Option<ConnectionInner>,
}

impl Connection {
    /// Builds a live connection. Called by bus implementations from their
    /// subscribe paths; the token must be the one stored in the matching
    /// subscription.
    pub fn new(
        bus: Weak<dyn EventBus>,
        subscriber: WeakKey,
        event_id: EventId,
        sender: Option<WeakKey>,
        token: Arc<AtomicBool>,
    ) -> Self {
        Connection {
            inner: Some(ConnectionInner {
                bus,
                subscriber,
                event_id,
                sender,
                token,
            }),
        }
    }

    /// A connection that was never attached to a subscription.
    pub fn disconnected() -> Self {
        Connection { inner: None }
    }

    /// Stops delivery through this subscription.
    ///
    /// The atomic flip alone guarantees no further delivery; removal of
    /// the stored entry is best-effort and falls back to the bus's lazy
    /// collection when the bus or subscriber have already died. Calling
    /// this twice is a no-op.
    pub fn disconnect(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if !inner.token.swap(false, Ordering::AcqRel) {
            return;
        }
        if inner.subscriber.is_expired() {
            return;
        }
        if let Some(bus) = inner.bus.upgrade() {
            bus.remove_subscription(inner.event_id, inner.sender.as_ref(), &inner.token);
        }
    }

    /// Whether the subscription can still deliver.
    pub fn is_connected(&self) -> bool {
        match &self.inner {
            Some(inner) => {
                inner.token.load(Ordering::Acquire)
                    && inner.bus.strong_count() > 0
                    && !inner.subscriber.is_expired()
            }
            None => false,
        }
    }

    /// Wraps the connection so it disconnects when dropped.
    pub fn into_scoped(self) -> ScopedConnection {
        ScopedConnection { connection: self }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::disconnected()
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => write!(
                f,
                "Connection(event: {:#018x}, connected: {})",
                inner.event_id,
                self.is_connected()
            ),
            None => f.write_str("Connection(disconnected)"),
        }
    }
}

/// RAII wrapper disconnecting a [`Connection`] on drop.
#[derive(Debug, Default)]
pub struct ScopedConnection {
    connection: Connection,
}

impl ScopedConnection {
    /// Disconnects early, before the wrapper is dropped.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Whether the wrapped subscription can still deliver.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }
}

impl From<Connection> for ScopedConnection {
    fn from(connection: Connection) -> Self {
        ScopedConnection { connection }
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}
