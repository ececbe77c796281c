//! The plugin manager: registry ownership, instance creation, the
//! transactional loader and the three-phase unload.

use crate::event_bus::{
    BusState, ExceptionHandler, PanicOrigin, TraceHook, TracePoint, DEFAULT_QUEUE_CAPACITY,
};
use crate::platform;
use crate::registry::{ComponentInfo, RegistryState};
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use veld_component::{
    clsid, panic_message, plugin_cast, ClassId, ComponentClass, ComponentDetails,
    ComponentHandle, ComponentRegisterEvent, ComponentRegistration, EventBus, EventId, FactoryFn,
    InterfaceId, InterfaceMeta, PluginError, PluginInitFn, PluginLoadFailureEvent,
    PluginLoadSuccessEvent, PluginQuery, PluginRegistry, Registrar, DEFAULT_PLUGIN_ENTRY,
};

/// Pseudo-path under which the runtime's own services are registered.
pub const BUILTIN_PLUGIN_PATH: &str = "builtin:veld.core";

/// Prefix of the pseudo-paths assigned to statically linked plugin packs.
pub const STATIC_PLUGIN_PREFIX: &str = "static:";

lazy_static! {
    static ref ACTIVE_INSTANCE: Mutex<Option<Arc<PluginManager>>> = Mutex::new(None);
}

/// The plugin runtime: component registry, instance factory, library
/// loader and event bus in one process-wide service.
///
/// Constructed with [`PluginManager::create`], which also publishes the
/// instance as the process-wide active one; plugins reach it through
/// [`PluginManager::active`] or the free functions in
/// [`locator`](crate::locator). The manager is itself a component and
/// serves the built-in [`EventBus`] and [`PluginQuery`] services.
pub struct PluginManager {
    self_weak: Weak<PluginManager>,
    state: RwLock<RegistryState>,
    load_lock: Mutex<()>,
    bus: Arc<BusState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

static_assertions::assert_impl_all!(PluginManager: Send, Sync);

impl PluginManager {
    /// Creates the manager with the default async queue capacity.
    pub fn create() -> Result<Arc<Self>, PluginError> {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates the manager with an explicit async queue capacity.
    ///
    /// Registers the built-in services, starts the bus worker and
    /// publishes the instance as the active one. Fails when another
    /// instance is already active.
    pub fn with_queue_capacity(capacity: usize) -> Result<Arc<Self>, PluginError> {
        let manager = Arc::new_cyclic(|self_weak| PluginManager {
            self_weak: self_weak.clone(),
            state: RwLock::new(RegistryState::new()),
            load_lock: Mutex::new(()),
            bus: Arc::new(BusState::new(capacity)),
            worker: Mutex::new(None),
        });

        {
            let mut active = ACTIVE_INSTANCE.lock();
            if active.is_some() {
                return Err(PluginError::Internal(String::from(
                    "a plugin manager instance is already active",
                )));
            }
            *active = Some(manager.clone());
        }

        let started = manager
            .register_builtin_services()
            .and_then(|()| match BusState::spawn_worker(&manager.bus) {
                Ok(worker) => {
                    *manager.worker.lock() = Some(worker);
                    Ok(())
                }
                Err(error) => Err(PluginError::Internal(format!(
                    "failed to start the event worker: {}",
                    error
                ))),
            });
        if let Err(error) = started {
            ACTIVE_INSTANCE.lock().take();
            return Err(error);
        }

        Ok(manager)
    }

    /// The process-wide active instance, if one exists.
    ///
    /// Safe against teardown: after [`destroy`](PluginManager::destroy)
    /// this returns `None`.
    pub fn active() -> Option<Arc<PluginManager>> {
        ACTIVE_INSTANCE.lock().clone()
    }

    /// Unloads every plugin and drops the process-wide reference.
    ///
    /// Plugins resolving the active instance afterwards see `None`.
    /// The unload also empties the singleton caches, which hold the
    /// manager's own built-in services; without that the self-reference
    /// would keep the runtime alive forever. Hosts still holding a
    /// handle keep a usable, freshly reset runtime; the worker thread is
    /// joined when the last handle drops.
    pub fn destroy() {
        let holder = { ACTIVE_INSTANCE.lock().take() };
        if let Some(manager) = &holder {
            manager.unload_all_plugins();
        }
        drop(holder);
    }

    pub(crate) fn bus(&self) -> &BusState {
        &self.bus
    }

    pub(crate) fn self_weak(&self) -> Weak<PluginManager> {
        self.self_weak.clone()
    }

    fn register_builtin_services(&self) -> Result<(), PluginError> {
        let factory: FactoryFn = Arc::new(|| {
            PluginManager::active().map(|manager| manager as ComponentHandle)
        });
        let interfaces = <Self as ComponentClass>::interface_table().to_vec();

        self.state.write().current_loading_path = String::from(BUILTIN_PLUGIN_PATH);
        let registered = [
            (clsid::EVENT_BUS, "veld.core.eventbus", true),
            (clsid::PLUGIN_QUERY, "veld.core.pluginquery", false),
            (clsid::PLUGIN_MANAGER, "veld.core.manager", false),
        ]
        .into_iter()
        .try_for_each(|(clsid, alias, is_default)| {
            self.register_component(ComponentRegistration {
                clsid,
                factory: factory.clone(),
                is_singleton: true,
                alias: String::from(alias),
                interfaces: interfaces.clone(),
                is_default,
            })
        });
        self.state.write().current_loading_path.clear();
        registered
    }

    // --- instance factory ---

    /// Creates a fresh instance of the transient component `clsid`.
    pub fn create_transient(&self, clsid: ClassId) -> Result<ComponentHandle, PluginError> {
        let factory = {
            let state = self.state.read();
            let info = state
                .components
                .get(&clsid)
                .ok_or(PluginError::ClsidNotFound(clsid))?;
            if info.is_singleton {
                return Err(PluginError::NotAComponent(clsid));
            }
            info.factory.clone()
        };
        Self::run_factory(&factory)
    }

    /// Returns the singleton service `clsid`, constructing it on first
    /// use.
    ///
    /// A failed construction is sticky: the captured error is returned to
    /// every current and future caller. Racing callers block until the
    /// first construction settles.
    pub fn get_service_handle(&self, clsid: ClassId) -> Result<ComponentHandle, PluginError> {
        let slot = {
            let state = self.state.read();
            match state.singletons.get(&clsid) {
                Some(slot) => slot.clone(),
                None => {
                    let info = state
                        .components
                        .get(&clsid)
                        .ok_or(PluginError::ClsidNotFound(clsid))?;
                    return Err(if info.is_singleton {
                        PluginError::Internal(String::from("singleton registry inconsistent"))
                    } else {
                        PluginError::NotAService(clsid)
                    });
                }
            }
        };
        slot.cell
            .get_or_init(|| Self::run_factory(&slot.factory))
            .clone()
    }

    fn run_factory(factory: &FactoryFn) -> Result<ComponentHandle, PluginError> {
        let produced = catch_unwind(AssertUnwindSafe(|| factory()))
            .map_err(|payload| PluginError::FactoryFailed(panic_message(&*payload)))?;
        let handle = produced.ok_or_else(|| {
            PluginError::FactoryFailed(String::from("factory returned no instance"))
        })?;
        catch_unwind(AssertUnwindSafe(|| handle.initialize()))
            .map_err(|payload| PluginError::FactoryFailed(panic_message(&*payload)))?;
        Ok(handle)
    }

    /// Resolves a non-empty alias to its class id.
    pub fn clsid_from_alias(&self, alias: &str) -> Result<ClassId, PluginError> {
        self.state
            .read()
            .alias_map
            .get(alias)
            .copied()
            .ok_or_else(|| PluginError::AliasNotFound(String::from(alias)))
    }

    /// The class registered as default implementation of `iid`, if any.
    pub fn default_clsid(&self, iid: InterfaceId) -> Option<ClassId> {
        self.state.read().default_map.get(&iid).copied()
    }

    // --- typed convenience forms ---

    /// Fetches the service `clsid` as interface `T`.
    pub fn get_service<T>(&self, clsid: ClassId) -> Result<Arc<T>, PluginError>
    where
        T: InterfaceMeta + ?Sized,
    {
        let handle = self.get_service_handle(clsid)?;
        plugin_cast::<T>(&handle)
    }

    /// Fetches the service registered under `alias` as interface `T`.
    pub fn get_service_by_alias<T>(&self, alias: &str) -> Result<Arc<T>, PluginError>
    where
        T: InterfaceMeta + ?Sized,
    {
        let clsid = self.clsid_from_alias(alias)?;
        self.get_service::<T>(clsid)
    }

    /// Fetches the default service for interface `T`.
    pub fn get_default_service<T>(&self) -> Result<Arc<T>, PluginError>
    where
        T: InterfaceMeta + ?Sized,
    {
        let clsid = self
            .default_clsid(T::IID)
            .ok_or_else(|| PluginError::AliasNotFound(format!("no default for {}", T::NAME)))?;
        self.get_service::<T>(clsid)
    }

    /// Creates a transient instance of `clsid` as interface `T`.
    pub fn create_instance<T>(&self, clsid: ClassId) -> Result<Arc<T>, PluginError>
    where
        T: InterfaceMeta + ?Sized,
    {
        let handle = self.create_transient(clsid)?;
        plugin_cast::<T>(&handle)
    }

    /// Creates a transient instance of the class aliased `alias` as
    /// interface `T`.
    pub fn create_instance_by_alias<T>(&self, alias: &str) -> Result<Arc<T>, PluginError>
    where
        T: InterfaceMeta + ?Sized,
    {
        let clsid = self.clsid_from_alias(alias)?;
        self.create_instance::<T>(clsid)
    }

    /// Creates a transient instance of the default implementation of `T`.
    pub fn create_default_instance<T>(&self) -> Result<Arc<T>, PluginError>
    where
        T: InterfaceMeta + ?Sized,
    {
        let clsid = self
            .default_clsid(T::IID)
            .ok_or_else(|| PluginError::AliasNotFound(format!("no default for {}", T::NAME)))?;
        self.create_instance::<T>(clsid)
    }

    // --- loader ---

    /// Loads one plugin library through the default entry symbol.
    ///
    /// Loading an already loaded path is a no-op success.
    pub fn load_plugin(&self, path: impl AsRef<Path>) -> Result<(), PluginError> {
        self.load_plugin_with_entry(path, DEFAULT_PLUGIN_ENTRY)
    }

    /// Loads one plugin library, resolving `entry_symbol` as the entry
    /// point.
    pub fn load_plugin_with_entry(
        &self,
        path: impl AsRef<Path>,
        entry_symbol: &str,
    ) -> Result<(), PluginError> {
        let path = path.as_ref();
        if !is_plugin_file(path) {
            return Err(PluginError::LoadFailed {
                path: path.display().to_string(),
                message: String::from("not a shared library file"),
            });
        }
        self.load_plugin_internal(path, entry_symbol)
    }

    /// Loads every shared library in `dir`, optionally recursing.
    ///
    /// Successes are silent; the returned list pairs each failing path
    /// with its error.
    pub fn load_plugins_from_directory(
        &self,
        dir: impl AsRef<Path>,
        recursive: bool,
    ) -> Vec<(PathBuf, PluginError)> {
        self.load_plugins_from_directory_with_entry(dir, recursive, DEFAULT_PLUGIN_ENTRY)
    }

    /// Directory load with an explicit entry symbol.
    pub fn load_plugins_from_directory_with_entry(
        &self,
        dir: impl AsRef<Path>,
        recursive: bool,
        entry_symbol: &str,
    ) -> Vec<(PathBuf, PluginError)> {
        let dir = dir.as_ref();
        let mut failures = Vec::new();
        if !dir.is_dir() {
            failures.push((
                dir.to_path_buf(),
                PluginError::LoadFailed {
                    path: dir.display().to_string(),
                    message: String::from("directory not found or not a directory"),
                },
            ));
            return failures;
        }

        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let entries = match std::fs::read_dir(&current) {
                Ok(entries) => entries,
                Err(error) => {
                    failures.push((
                        current.clone(),
                        PluginError::LoadFailed {
                            path: current.display().to_string(),
                            message: error.to_string(),
                        },
                    ));
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    if recursive {
                        pending.push(path);
                    }
                } else if is_plugin_file(&path) {
                    if let Err(error) = self.load_plugin_internal(&path, entry_symbol) {
                        failures.push((path, error));
                    }
                }
            }
        }
        failures
    }

    /// Runs a statically linked plugin pack through the regular load
    /// transaction.
    ///
    /// The pack is tracked under the pseudo-path `static:<name>`, takes
    /// part in unload ordering and shutdown hooks like a dynamic plugin,
    /// and is rolled back completely when `entry` fails or panics.
    /// Running the same name twice is a no-op success.
    pub fn register_static_plugin<F>(&self, name: &str, entry: F) -> Result<(), PluginError>
    where
        F: FnOnce(&mut Registrar<'_>) -> Result<(), PluginError>,
    {
        let _guard = self.load_lock.lock();
        let path = format!("{}{}", STATIC_PLUGIN_PREFIX, name);
        if self.state.read().is_loaded(&path) {
            return Ok(());
        }
        self.run_entry_transaction(path, None, |registrar| {
            let outcome = catch_unwind(AssertUnwindSafe(|| entry(&mut *registrar)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => registrar.record_failure(error),
                Err(payload) => registrar
                    .record_failure(PluginError::Internal(panic_message(&*payload))),
            }
        })
    }

    fn load_plugin_internal(&self, path: &Path, entry_symbol: &str) -> Result<(), PluginError> {
        let _guard = self.load_lock.lock();
        let path_str = path.to_string_lossy().into_owned();
        if self.state.read().is_loaded(&path_str) {
            return Ok(());
        }

        let library = match platform::open_library(path) {
            Ok(library) => library,
            Err(message) => {
                let error = PluginError::LoadFailed {
                    path: path_str.clone(),
                    message: format!("failed to open library: {}", message),
                };
                self.publish_load_failure(&path_str, &error);
                return Err(error);
            }
        };

        // SAFETY: the entry-point contract fixes the symbol's type to
        // `PluginInitFn`.
        let resolved = unsafe { platform::resolve_symbol::<PluginInitFn>(&library, entry_symbol) };
        let init_fn = match resolved {
            Some(init_fn) => init_fn,
            None => {
                let error = PluginError::LoadFailed {
                    path: path_str.clone(),
                    message: format!("entry symbol '{}' not found", entry_symbol),
                };
                platform::close_library(library);
                self.publish_load_failure(&path_str, &error);
                return Err(error);
            }
        };

        self.run_entry_transaction(path_str, Some(library), |registrar| {
            // SAFETY: the registrar outlives the call and the symbol was
            // resolved as the plugin entry type; the exporting macro
            // keeps panics on the far side of the boundary.
            unsafe { init_fn(registrar) }
        })
    }

    /// Runs one entry point under a registration transaction: every
    /// registration it makes is tagged with `path` and rolled back in
    /// full when the entry reports failure.
    fn run_entry_transaction(
        &self,
        path: String,
        library: Option<platform::LibraryHandle>,
        invoke: impl FnOnce(&mut Registrar<'_>),
    ) -> Result<(), PluginError> {
        {
            let mut state = self.state.write();
            state.current_loading_path = path.clone();
            state.current_rollback = Some(Vec::new());
        }

        let mut registrar = Registrar::new(self);
        invoke(&mut registrar);

        match registrar.finish() {
            Ok(()) => {
                {
                    let mut state = self.state.write();
                    state.current_loading_path.clear();
                    state.current_rollback = None;
                    state.loaded_libs.push((path.clone(), library));
                }
                tracing::debug!(path = %path, "plugin loaded");
                (self as &dyn EventBus).fire_global(PluginLoadSuccessEvent {
                    plugin_path: path,
                });
                Ok(())
            }
            Err(entry_error) => {
                {
                    let mut state = self.state.write();
                    state.current_loading_path.clear();
                    let rollback = state.current_rollback.take().unwrap_or_default();
                    state.rollback(&rollback);
                }
                if let Some(library) = library {
                    platform::close_library(library);
                }
                let error = PluginError::LoadFailed {
                    path: path.clone(),
                    message: format!("plugin entry failed: {}", entry_error),
                };
                self.publish_load_failure(&path, &error);
                Err(error)
            }
        }
    }

    fn publish_load_failure(&self, path: &str, error: &PluginError) {
        tracing::warn!(path, %error, "plugin load failed");
        (self as &dyn EventBus).fire_global(PluginLoadFailureEvent {
            plugin_path: String::from(path),
            error_message: error.to_string(),
        });
    }

    // --- unload ---

    /// Unloads every plugin in three strict phases (shutdown hooks,
    /// object destruction, library unmap), then re-registers the
    /// built-in services so the runtime stays usable.
    ///
    /// Must not be called from an event callback: phase 1 waits for the
    /// async queue to drain.
    pub fn unload_all_plugins(&self) {
        self.clear_all_registries();
        if let Err(error) = self.register_builtin_services() {
            tracing::error!(%error, "failed to restore built-in services after unload");
        }
    }

    fn clear_all_registries(&self) {
        // Phase 1: collect initialized singletons, newest plugin first,
        // and run their shutdown hooks. Every service is still reachable
        // through the non-raising lookup path here.
        let shutdown_list: Vec<ComponentHandle> = {
            let state = self.state.read();
            let mut list = Vec::new();
            for (path, _library) in state.loaded_libs.iter().rev() {
                let Some(clsids) = state.plugin_path_index.get(path) else {
                    continue;
                };
                for clsid in clsids {
                    let Some(slot) = state.singletons.get(clsid) else {
                        continue;
                    };
                    if let Some(Ok(instance)) = slot.cell.get() {
                        list.push(instance.clone());
                    }
                }
            }
            list
        };
        for instance in &shutdown_list {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| instance.shutdown())) {
                self.bus
                    .report_panic(PanicOrigin::ShutdownHook, panic_message(&*payload));
            }
        }

        // Let in-flight queued deliveries finish while services are
        // still reachable.
        self.bus.drain();

        // Phase 2: destroy every object while the libraries are still
        // mapped, with the world stopped.
        let mut state = self.state.write();
        self.bus.pending_gc.lock().clear();
        let mut maps = self.bus.maps.lock();
        let mut queue = self.bus.queue.lock();
        queue.tasks.clear();
        maps.clear();
        drop(shutdown_list);
        state.singletons.clear();
        state.components.clear();
        state.alias_map.clear();
        state.default_map.clear();
        state.interface_index.clear();
        state.plugin_path_index.clear();
        state.current_loading_path.clear();
        state.current_rollback = None;
        *self.bus.trace_hook.lock() = None;
        *self.bus.exception_handler.lock() = None;

        // Phase 3: no live plugin object remains; unmap in reverse load
        // order.
        for (_path, library) in state.loaded_libs.drain(..).rev() {
            if let Some(library) = library {
                platform::close_library(library);
            }
        }
    }

    // --- diagnostics ---

    /// Installs the out-of-band sink for plugin panics.
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&crate::event_bus::PanicReport) + Send + Sync + 'static,
    {
        *self.bus.exception_handler.lock() = Some(Arc::new(handler) as ExceptionHandler);
    }

    /// Installs the delivery-pipeline trace hook.
    pub fn set_trace_hook<F>(&self, hook: F)
    where
        F: Fn(TracePoint, EventId, &str) + Send + Sync + 'static,
    {
        *self.bus.trace_hook.lock() = Some(Arc::new(hook) as TraceHook);
    }

    /// Number of queued tasks dropped because the queue was full.
    pub fn dropped_task_count(&self) -> u64 {
        self.bus.dropped_tasks()
    }
}

fn is_plugin_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|extension| extension.to_str())
            .map_or(false, |extension| {
                extension == platform::shared_library_extension()
            })
}

impl PluginRegistry for PluginManager {
    fn register_component(&self, registration: ComponentRegistration) -> Result<(), PluginError> {
        let clsid = registration.clsid;
        let alias = registration.alias.clone();
        let is_singleton = registration.is_singleton;
        let plugin_path;
        {
            let mut state = self.state.write();
            plugin_path = state.current_loading_path.clone();
            state.register(registration)?;
        }
        // Published outside the registry lock.
        (self as &dyn EventBus).fire_global(ComponentRegisterEvent {
            clsid,
            alias,
            plugin_path,
            is_singleton,
        });
        Ok(())
    }
}

impl PluginQuery for PluginManager {
    fn all_components(&self) -> Vec<ComponentDetails> {
        let state = self.state.read();
        state.components.values().map(ComponentInfo::details).collect()
    }

    fn component_details(&self, clsid: ClassId) -> Option<ComponentDetails> {
        self.state.read().details_of(clsid)
    }

    fn component_details_by_alias(&self, alias: &str) -> Option<ComponentDetails> {
        let state = self.state.read();
        let clsid = *state.alias_map.get(alias)?;
        state.details_of(clsid)
    }

    fn components_implementing(&self, iid: InterfaceId) -> Vec<ComponentDetails> {
        let state = self.state.read();
        let Some(implementors) = state.interface_index.get(&iid) else {
            return Vec::new();
        };
        implementors
            .iter()
            .filter_map(|clsid| state.details_of(*clsid))
            .collect()
    }

    fn loaded_plugin_files(&self) -> Vec<String> {
        self.state
            .read()
            .loaded_libs
            .iter()
            .map(|(path, _library)| path.clone())
            .collect()
    }

    fn components_of_plugin(&self, plugin_path: &str) -> Vec<ComponentDetails> {
        let state = self.state.read();
        let Some(registered) = state.plugin_path_index.get(plugin_path) else {
            return Vec::new();
        };
        registered
            .iter()
            .filter_map(|clsid| state.details_of(*clsid))
            .collect()
    }
}

veld_component::declare_component! {
    impl PluginManager {
        clsid: "veld-core-plugin-manager-SERVICE-UUID-42F0BD6E",
        interfaces: [dyn EventBus, dyn PluginQuery],
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("(PluginManager)")
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        self.bus.request_stop();
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.join();
        }
        self.clear_all_registries();
    }
}
