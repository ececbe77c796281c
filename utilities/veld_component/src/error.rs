//! The error type shared across the runtime surface.

use crate::ids::{ClassId, InterfaceId};
use std::any::Any;
use std::fmt::{Display, Formatter};

/// Errors produced by registration, lookup, instantiation and interface
/// queries.
///
/// Singleton construction failures are cached and handed back to every
/// later caller, which is why the type is [`Clone`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// No component is registered under the alias, or no default
    /// implementation exists for the requested interface.
    AliasNotFound(String),
    /// The class id is not registered.
    ClsidNotFound(ClassId),
    /// The class id names a transient component; use the transient path.
    NotAService(ClassId),
    /// The class id names a singleton service; use the service path.
    NotAComponent(ClassId),
    /// The factory produced no instance, or it (or `initialize`) panicked.
    FactoryFailed(String),
    /// The component does not implement the requested interface.
    InterfaceNotImpl(InterfaceId),
    /// The interface exists but its major version differs from the
    /// caller's. Major is the breaking-change axis; a mismatch is never
    /// bridged.
    VersionMajorMismatch {
        /// Major version the caller asked for.
        requested: u32,
        /// Major version the implementation provides.
        provided: u32,
    },
    /// The interface exists and majors match, but the implementation's
    /// minor version is older than the caller requires.
    VersionMinorTooLow {
        /// Minor version the caller asked for.
        requested: u32,
        /// Minor version the implementation provides.
        provided: u32,
    },
    /// The class id is already registered.
    DuplicateClsid(ClassId),
    /// The non-empty alias is already taken by another class.
    DuplicateAlias(String),
    /// Another class is already registered as the default implementation
    /// for the interface.
    DefaultConflict {
        /// Interface whose default slot is contested.
        iid: InterfaceId,
        /// Class currently holding the default slot.
        existing: ClassId,
    },
    /// Opening, resolving or initializing a plugin library failed.
    LoadFailed {
        /// Path of the library.
        path: String,
        /// Platform or entry-point error text.
        message: String,
    },
    /// The manager is not active, or a registry invariant was violated.
    Internal(String),
}

impl Display for PluginError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginError::AliasNotFound(alias) => {
                write!(f, "alias not found: {}", alias)
            }
            PluginError::ClsidNotFound(clsid) => {
                write!(f, "class id not found: {:#018x}", clsid)
            }
            PluginError::NotAService(clsid) => {
                write!(
                    f,
                    "class id {:#018x} is a transient component, not a service",
                    clsid
                )
            }
            PluginError::NotAComponent(clsid) => {
                write!(
                    f,
                    "class id {:#018x} is a singleton service, not a transient component",
                    clsid
                )
            }
            PluginError::FactoryFailed(message) => {
                write!(f, "component factory failed: {}", message)
            }
            PluginError::InterfaceNotImpl(iid) => {
                write!(f, "interface {:#018x} is not implemented", iid)
            }
            PluginError::VersionMajorMismatch {
                requested,
                provided,
            } => {
                write!(
                    f,
                    "interface major version mismatch: requested {}, provided {}",
                    requested, provided
                )
            }
            PluginError::VersionMinorTooLow {
                requested,
                provided,
            } => {
                write!(
                    f,
                    "interface minor version too low: requested {}, provided {}",
                    requested, provided
                )
            }
            PluginError::DuplicateClsid(clsid) => {
                write!(f, "class id already registered: {:#018x}", clsid)
            }
            PluginError::DuplicateAlias(alias) => {
                write!(f, "alias already registered: {}", alias)
            }
            PluginError::DefaultConflict { iid, existing } => {
                write!(
                    f,
                    "default implementation conflict for interface {:#018x}, held by {:#018x}",
                    iid, existing
                )
            }
            PluginError::LoadFailed { path, message } => {
                write!(f, "failed to load plugin '{}': {}", path, message)
            }
            PluginError::Internal(message) => {
                write!(f, "internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for PluginError {}

/// Extracts a readable message from a caught panic payload.
///
/// Used wherever the runtime isolates plugin code with
/// `std::panic::catch_unwind`.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}
