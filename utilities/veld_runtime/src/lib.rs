//! Runtime of the veld plugin framework.
//!
//! Hosts create one [`PluginManager`] per process, load plugin libraries
//! into it and talk to the components they register through the traits of
//! the `veld_component` crate. The manager owns the registry, the
//! singleton caches, the OS library handles and the event bus with its
//! worker thread; [`locator`] offers free-function access for call sites
//! without a manager handle.
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

mod event_bus;
pub mod locator;
mod manager;
mod platform;
mod registry;

pub use event_bus::{
    ExceptionHandler, PanicOrigin, PanicReport, TraceHook, TracePoint, DEFAULT_QUEUE_CAPACITY,
};
pub use manager::{PluginManager, BUILTIN_PLUGIN_PATH, STATIC_PLUGIN_PREFIX};
pub use platform::shared_library_extension;
