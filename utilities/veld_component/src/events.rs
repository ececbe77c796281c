//! Events the runtime itself publishes on the global bus.

use crate::ids::ClassId;

/// Published after every successful component registration.
#[derive(Clone, Debug)]
pub struct ComponentRegisterEvent {
    /// Class id of the new registration.
    pub clsid: ClassId,
    /// Alias of the registration, empty when none.
    pub alias: String,
    /// Plugin path the registration came from.
    pub plugin_path: String,
    /// Whether the class was registered as a singleton service.
    pub is_singleton: bool,
}

crate::declare_event!(
    ComponentRegisterEvent,
    "veld-event-component-register-E0000003"
);

/// Published after a plugin library was loaded and committed.
#[derive(Clone, Debug)]
pub struct PluginLoadSuccessEvent {
    /// Path of the loaded plugin.
    pub plugin_path: String,
}

crate::declare_event!(
    PluginLoadSuccessEvent,
    "veld-event-plugin-load-success-E0000001"
);

/// Published after a plugin failed to open, resolve or initialize.
#[derive(Clone, Debug)]
pub struct PluginLoadFailureEvent {
    /// Path of the plugin that failed.
    pub plugin_path: String,
    /// Why the load failed.
    pub error_message: String,
}

crate::declare_event!(
    PluginLoadFailureEvent,
    "veld-event-plugin-load-failure-E0000002"
);
