//! Free-function access to the active manager.
//!
//! Thin forwarders for call sites that have no manager handle at hand,
//! plugins most of all. The `try_` forms swallow the error and are safe
//! anywhere, including shutdown hooks and destructors.

use crate::manager::PluginManager;
use std::sync::Arc;
use veld_component::{
    ClassId, Connection, DeliveryMode, EventBus, EventMeta, InterfaceMeta, PluginError,
};

fn active() -> Result<Arc<PluginManager>, PluginError> {
    PluginManager::active()
        .ok_or_else(|| PluginError::Internal(String::from("no active plugin manager")))
}

/// Fetches the service `clsid` as interface `T` from the active manager.
pub fn get_service<T>(clsid: ClassId) -> Result<Arc<T>, PluginError>
where
    T: InterfaceMeta + ?Sized,
{
    active()?.get_service::<T>(clsid)
}

/// Fetches the service aliased `alias` as interface `T`.
pub fn get_service_by_alias<T>(alias: &str) -> Result<Arc<T>, PluginError>
where
    T: InterfaceMeta + ?Sized,
{
    active()?.get_service_by_alias::<T>(alias)
}

/// Fetches the default service for interface `T`.
pub fn get_default_service<T>() -> Result<Arc<T>, PluginError>
where
    T: InterfaceMeta + ?Sized,
{
    active()?.get_default_service::<T>()
}

/// Creates a transient instance of `clsid` as interface `T`.
pub fn create_instance<T>(clsid: ClassId) -> Result<Arc<T>, PluginError>
where
    T: InterfaceMeta + ?Sized,
{
    active()?.create_instance::<T>(clsid)
}

/// Creates a transient instance of the class aliased `alias`.
pub fn create_instance_by_alias<T>(alias: &str) -> Result<Arc<T>, PluginError>
where
    T: InterfaceMeta + ?Sized,
{
    active()?.create_instance_by_alias::<T>(alias)
}

/// Creates a transient instance of the default implementation of `T`.
pub fn create_default_instance<T>() -> Result<Arc<T>, PluginError>
where
    T: InterfaceMeta + ?Sized,
{
    active()?.create_default_instance::<T>()
}

/// Non-raising form of [`get_service`].
pub fn try_get_service<T>(clsid: ClassId) -> Option<Arc<T>>
where
    T: InterfaceMeta + ?Sized,
{
    get_service::<T>(clsid).ok()
}

/// Non-raising form of [`get_service_by_alias`].
pub fn try_get_service_by_alias<T>(alias: &str) -> Option<Arc<T>>
where
    T: InterfaceMeta + ?Sized,
{
    get_service_by_alias::<T>(alias).ok()
}

/// Non-raising form of [`get_default_service`].
pub fn try_get_default_service<T>() -> Option<Arc<T>>
where
    T: InterfaceMeta + ?Sized,
{
    get_default_service::<T>().ok()
}

/// Fires `event` on the active manager's global bus.
///
/// Silently does nothing when no manager is active.
pub fn fire_global_event<E: EventMeta>(event: E) {
    if let Some(manager) = PluginManager::active() {
        (manager.as_ref() as &dyn EventBus).fire_global(event);
    }
}

/// Subscribes `subscriber` to the global topic of `E` on the active
/// manager.
pub fn subscribe_global_event<E, S, F>(
    subscriber: &Arc<S>,
    mode: DeliveryMode,
    callback: F,
) -> Result<Connection, PluginError>
where
    E: EventMeta,
    S: Send + Sync + 'static,
    F: Fn(&S, &E) + Send + Sync + 'static,
{
    let manager = active()?;
    Ok((manager.as_ref() as &dyn EventBus).subscribe_global::<E, S, F>(subscriber, mode, callback))
}

/// Removes every subscription of `subscriber` on the active manager.
///
/// Silently does nothing when no manager is active.
pub fn unsubscribe<S: Send + Sync + 'static>(subscriber: &Arc<S>) {
    if let Some(manager) = PluginManager::active() {
        (manager.as_ref() as &dyn EventBus).unsubscribe(subscriber);
    }
}
