//! Introspection over the registered component population.

use crate::component::Component;
use crate::ids::{ClassId, InterfaceId};
use crate::interface::InterfaceDescriptor;
use serde::Serialize;

/// Snapshot of one registration, as reported by [`PluginQuery`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComponentDetails {
    /// Class identifier.
    pub clsid: ClassId,
    /// Registered alias, empty when none was given.
    pub alias: String,
    /// Whether the class is a singleton service.
    pub is_singleton: bool,
    /// Path of the plugin that registered the class.
    pub source_plugin_path: String,
    /// Whether the class is a default implementation.
    pub is_default: bool,
    /// Interfaces the class implements.
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// Read-only queries over the registry, exposed as an interface so other
/// plugins can introspect the runtime they are loaded into.
pub trait PluginQuery: Component {
    /// Details of every registered component.
    fn all_components(&self) -> Vec<ComponentDetails>;

    /// Details of one component, if registered.
    fn component_details(&self, clsid: ClassId) -> Option<ComponentDetails>;

    /// Details of the component registered under `alias`.
    fn component_details_by_alias(&self, alias: &str) -> Option<ComponentDetails>;

    /// Details of every component implementing `iid`.
    fn components_implementing(&self, iid: InterfaceId) -> Vec<ComponentDetails>;

    /// Paths of the currently loaded plugins, in load order.
    fn loaded_plugin_files(&self) -> Vec<String>;

    /// Details of every component registered by the plugin at
    /// `plugin_path`.
    fn components_of_plugin(&self, plugin_path: &str) -> Vec<ComponentDetails>;
}

crate::declare_interface!(PluginQuery, "veld-core-PluginQuery-IID-A0000003", 1, 0);
