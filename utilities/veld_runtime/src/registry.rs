//! Registry tables and the registration/rollback bookkeeping.
//!
//! All tables live in one [`RegistryState`] guarded by a single
//! reader-writer lock in the manager; the methods here run under that
//! lock and contain no locking themselves.

use crate::platform::LibraryHandle;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use veld_component::{
    ClassId, Component, ComponentDetails, ComponentHandle, ComponentRegistration, FactoryFn,
    InterfaceDescriptor, InterfaceId, InterfaceMeta, PluginError,
};

/// Immutable record of one registration.
pub(crate) struct ComponentInfo {
    pub(crate) clsid: ClassId,
    pub(crate) factory: FactoryFn,
    pub(crate) is_singleton: bool,
    pub(crate) alias: String,
    pub(crate) source_plugin_path: String,
    pub(crate) interfaces: Vec<InterfaceDescriptor>,
    pub(crate) is_default: bool,
}

impl ComponentInfo {
    pub(crate) fn details(&self) -> ComponentDetails {
        ComponentDetails {
            clsid: self.clsid,
            alias: self.alias.clone(),
            is_singleton: self.is_singleton,
            source_plugin_path: self.source_plugin_path.clone(),
            is_default: self.is_default,
            interfaces: self.interfaces.clone(),
        }
    }
}

/// Once-initialized cache of one singleton service.
///
/// The cell captures the first construction outcome, success or failure,
/// and replays it to every later caller.
pub(crate) struct SingletonSlot {
    pub(crate) factory: FactoryFn,
    pub(crate) cell: OnceCell<Result<ComponentHandle, PluginError>>,
}

/// Every table of the registry plus the loader transaction state.
pub(crate) struct RegistryState {
    pub(crate) components: HashMap<ClassId, ComponentInfo>,
    pub(crate) singletons: HashMap<ClassId, std::sync::Arc<SingletonSlot>>,
    pub(crate) alias_map: HashMap<String, ClassId>,
    pub(crate) default_map: HashMap<InterfaceId, ClassId>,
    pub(crate) interface_index: HashMap<InterfaceId, Vec<ClassId>>,
    pub(crate) plugin_path_index: HashMap<String, Vec<ClassId>>,
    /// Loaded plugins in load order. Statically linked plugin packs have
    /// no library handle.
    pub(crate) loaded_libs: Vec<(String, Option<LibraryHandle>)>,
    /// Path of the plugin whose entry point is currently running.
    pub(crate) current_loading_path: String,
    /// Class ids registered by the running entry point, for rollback.
    pub(crate) current_rollback: Option<Vec<ClassId>>,
}

impl RegistryState {
    pub(crate) fn new() -> Self {
        RegistryState {
            components: HashMap::new(),
            singletons: HashMap::new(),
            alias_map: HashMap::new(),
            default_map: HashMap::new(),
            interface_index: HashMap::new(),
            plugin_path_index: HashMap::new(),
            loaded_libs: Vec::new(),
            current_loading_path: String::new(),
            current_rollback: None,
        }
    }

    /// Inserts a registration into every index.
    ///
    /// Validation happens up front; a rejected registration leaves no
    /// trace in any table.
    pub(crate) fn register(
        &mut self,
        registration: ComponentRegistration,
    ) -> Result<(), PluginError> {
        let ComponentRegistration {
            clsid,
            factory,
            is_singleton,
            alias,
            interfaces,
            is_default,
        } = registration;

        if self.components.contains_key(&clsid) {
            return Err(PluginError::DuplicateClsid(clsid));
        }
        if !alias.is_empty() && self.alias_map.contains_key(&alias) {
            return Err(PluginError::DuplicateAlias(alias));
        }
        if is_default {
            for descriptor in &interfaces {
                if descriptor.iid == <dyn Component as InterfaceMeta>::IID {
                    continue;
                }
                if let Some(&existing) = self.default_map.get(&descriptor.iid) {
                    return Err(PluginError::DefaultConflict {
                        iid: descriptor.iid,
                        existing,
                    });
                }
            }
        }

        if is_default {
            for descriptor in &interfaces {
                if descriptor.iid != <dyn Component as InterfaceMeta>::IID {
                    self.default_map.insert(descriptor.iid, clsid);
                }
            }
        }
        for descriptor in &interfaces {
            self.interface_index
                .entry(descriptor.iid)
                .or_default()
                .push(clsid);
        }
        self.plugin_path_index
            .entry(self.current_loading_path.clone())
            .or_default()
            .push(clsid);
        if is_singleton {
            self.singletons.insert(
                clsid,
                std::sync::Arc::new(SingletonSlot {
                    factory: factory.clone(),
                    cell: OnceCell::new(),
                }),
            );
        }
        if !alias.is_empty() {
            self.alias_map.insert(alias.clone(), clsid);
        }
        if let Some(rollback) = &mut self.current_rollback {
            rollback.push(clsid);
        }
        self.components.insert(
            clsid,
            ComponentInfo {
                clsid,
                factory,
                is_singleton,
                alias,
                source_plugin_path: self.current_loading_path.clone(),
                interfaces,
                is_default,
            },
        );
        Ok(())
    }

    /// Removes the listed class ids from every index.
    pub(crate) fn rollback(&mut self, clsids: &[ClassId]) {
        for clsid in clsids {
            let Some(info) = self.components.remove(clsid) else {
                continue;
            };
            if !info.alias.is_empty() {
                self.alias_map.remove(&info.alias);
            }
            if info.is_default {
                for descriptor in &info.interfaces {
                    if self.default_map.get(&descriptor.iid) == Some(clsid) {
                        self.default_map.remove(&descriptor.iid);
                    }
                }
            }
            for descriptor in &info.interfaces {
                if let Some(implementors) = self.interface_index.get_mut(&descriptor.iid) {
                    implementors.retain(|candidate| candidate != clsid);
                    if implementors.is_empty() {
                        self.interface_index.remove(&descriptor.iid);
                    }
                }
            }
            if let Some(registered) = self.plugin_path_index.get_mut(&info.source_plugin_path) {
                registered.retain(|candidate| candidate != clsid);
                if registered.is_empty() {
                    self.plugin_path_index.remove(&info.source_plugin_path);
                }
            }
            self.singletons.remove(clsid);
        }
    }

    pub(crate) fn is_loaded(&self, path: &str) -> bool {
        self.loaded_libs.iter().any(|(loaded, _)| loaded == path)
    }

    pub(crate) fn details_of(&self, clsid: ClassId) -> Option<ComponentDetails> {
        self.components.get(&clsid).map(ComponentInfo::details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use veld_component::interface_id;

    fn descriptor(name: &'static str, iid_uuid: &str) -> InterfaceDescriptor {
        InterfaceDescriptor {
            iid: interface_id(iid_uuid),
            name,
            major: 1,
            minor: 0,
        }
    }

    fn registration(clsid: ClassId, alias: &str, is_default: bool) -> ComponentRegistration {
        ComponentRegistration {
            clsid,
            factory: Arc::new(|| None),
            is_singleton: false,
            alias: alias.to_string(),
            interfaces: vec![descriptor("Probe", "veld-test-probe-IID-11AA22BB")],
            is_default,
        }
    }

    #[test]
    fn register_then_rollback_leaves_no_trace() {
        let mut state = RegistryState::new();
        state.current_loading_path = String::from("test-plugin");

        state.register(registration(1, "one", true)).unwrap();
        state.register(registration(2, "two", false)).unwrap();
        state.rollback(&[1, 2]);

        assert!(state.components.is_empty());
        assert!(state.alias_map.is_empty());
        assert!(state.default_map.is_empty());
        assert!(state.interface_index.is_empty());
        assert!(state.plugin_path_index.is_empty());
        assert!(state.singletons.is_empty());
    }

    #[test]
    fn duplicate_clsid_is_rejected() {
        let mut state = RegistryState::new();
        state.register(registration(7, "", false)).unwrap();
        assert_eq!(
            state.register(registration(7, "", false)).unwrap_err(),
            PluginError::DuplicateClsid(7)
        );
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let mut state = RegistryState::new();
        state.register(registration(1, "shared", false)).unwrap();
        assert_eq!(
            state.register(registration(2, "shared", false)).unwrap_err(),
            PluginError::DuplicateAlias(String::from("shared"))
        );
    }

    #[test]
    fn second_default_is_rejected_without_side_effects() {
        let mut state = RegistryState::new();
        state.register(registration(1, "", true)).unwrap();
        let error = state.register(registration(2, "", true)).unwrap_err();
        assert!(matches!(error, PluginError::DefaultConflict { .. }));
        // The losing registration must not appear anywhere.
        assert!(!state.components.contains_key(&2));
        assert_eq!(state.interface_index.values().flatten().count(), 1);
    }
}
