//! Component model of the veld plugin runtime.
//!
//! This crate is the surface every plugin and host compiles against:
//! 64-bit identity hashing, interface descriptors and version metadata,
//! the [`Component`] base trait with its reference-counted handles and
//! typed [`plugin_cast`], the [`EventBus`] and [`PluginQuery`] interfaces,
//! subscription [`Connection`]s, and the registration surface a plugin
//! entry point uses. The runtime implementing all of it lives in the
//! `veld_runtime` crate.
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

mod bus;
mod component;
mod connection;
mod error;
mod event;
mod events;
mod ids;
mod interface;
mod query;
mod registry;

pub use bus::{EventBus, EventCallback, WeakKey};
pub use component::{
    plugin_cast, query_interface_raw, Component, ComponentClass, ComponentHandle, InterfaceBox,
};
pub use connection::{Connection, ScopedConnection};
pub use error::{panic_message, PluginError};
pub use event::{DeliveryMode, EventMeta, EventObject, EventRef};
pub use events::{ComponentRegisterEvent, PluginLoadFailureEvent, PluginLoadSuccessEvent};
pub use ids::{class_id, event_id, hash_id, interface_id, ClassId, EventId, InterfaceId, INVALID_ID};
pub use interface::{InterfaceDescriptor, InterfaceMeta};
pub use query::{ComponentDetails, PluginQuery};
pub use registry::{
    clsid, ComponentRegistration, FactoryFn, PluginInitFn, PluginRegistry, Registrar,
    DEFAULT_PLUGIN_ENTRY,
};

use static_assertions::assert_impl_all;

assert_impl_all!(Connection: Send, Sync);
assert_impl_all!(ScopedConnection: Send, Sync);
assert_impl_all!(WeakKey: Send, Sync);
assert_impl_all!(ComponentRegistration: Send, Sync);
