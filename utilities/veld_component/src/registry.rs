//! The registration surface a plugin sees while its entry point runs.

use crate::component::{ComponentClass, ComponentHandle};
use crate::error::PluginError;
use crate::ids::ClassId;
use crate::interface::InterfaceDescriptor;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Factory producing a fresh component instance.
///
/// Returning `None` (or panicking) surfaces as
/// [`PluginError::FactoryFailed`] at the call site that invoked it.
pub type FactoryFn = Arc<dyn Fn() -> Option<ComponentHandle> + Send + Sync>;

/// Default name of the exported plugin entry symbol.
pub const DEFAULT_PLUGIN_ENTRY: &str = "plugin_init";

/// One registration request, as handed to
/// [`PluginRegistry::register_component`].
#[derive(Clone)]
pub struct ComponentRegistration {
    /// Class identifier; must be globally unique.
    pub clsid: ClassId,
    /// Factory producing instances of the class.
    pub factory: FactoryFn,
    /// `true` registers a singleton service, `false` a transient
    /// component.
    pub is_singleton: bool,
    /// Optional alias; non-empty aliases must be unique.
    pub alias: String,
    /// Every interface the factory's product answers to, including the
    /// base interface.
    pub interfaces: Vec<InterfaceDescriptor>,
    /// Claims the default slot for each listed interface except the base.
    pub is_default: bool,
}

impl Debug for ComponentRegistration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistration")
            .field("clsid", &self.clsid)
            .field("is_singleton", &self.is_singleton)
            .field("alias", &self.alias)
            .field("interfaces", &self.interfaces)
            .field("is_default", &self.is_default)
            .finish_non_exhaustive()
    }
}

/// Registration sink implemented by the plugin manager.
pub trait PluginRegistry: Send + Sync {
    /// Records one component registration.
    ///
    /// Rejects duplicate class ids, duplicate non-empty aliases and
    /// conflicting default claims without touching any index.
    fn register_component(&self, registration: ComponentRegistration) -> Result<(), PluginError>;
}

/// Adaptor handed to a plugin's entry point.
///
/// Wraps the registry and carries the entry outcome back to the loader:
/// an entry that fails (or panics) marks the whole load as failed, and
/// every registration it made is rolled back.
pub struct Registrar<'a> {
    registry: &'a dyn PluginRegistry,
    failure: Option<PluginError>,
}

impl<'a> Registrar<'a> {
    /// Wraps a registry for one entry-point invocation.
    pub fn new(registry: &'a dyn PluginRegistry) -> Self {
        Registrar {
            registry,
            failure: None,
        }
    }

    /// Forwards a raw registration to the registry.
    pub fn register(&mut self, registration: ComponentRegistration) -> Result<(), PluginError> {
        self.registry.register_component(registration)
    }

    /// Registers `T` as a transient component.
    pub fn register_component_of<T>(
        &mut self,
        alias: &str,
        is_default: bool,
    ) -> Result<(), PluginError>
    where
        T: ComponentClass + Default,
    {
        self.register(registration_of::<T>(false, alias, is_default))
    }

    /// Registers `T` as a singleton service.
    pub fn register_service_of<T>(
        &mut self,
        alias: &str,
        is_default: bool,
    ) -> Result<(), PluginError>
    where
        T: ComponentClass + Default,
    {
        self.register(registration_of::<T>(true, alias, is_default))
    }

    /// Records the entry outcome. Used by [`export_plugin!`](crate::export_plugin);
    /// plugins report failure by returning an error from their entry
    /// function instead.
    #[doc(hidden)]
    pub fn record_failure(&mut self, error: PluginError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    /// Consumes the adaptor and yields the entry outcome.
    pub fn finish(self) -> Result<(), PluginError> {
        match self.failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Debug for Registrar<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Registrar(failed: {})", self.failure.is_some())
    }
}

fn registration_of<T>(is_singleton: bool, alias: &str, is_default: bool) -> ComponentRegistration
where
    T: ComponentClass + Default,
{
    ComponentRegistration {
        clsid: T::CLSID,
        factory: Arc::new(|| Some(Arc::new(T::default()) as ComponentHandle)),
        is_singleton,
        alias: alias.to_string(),
        interfaces: T::interface_table().to_vec(),
        is_default,
    }
}

/// Signature of the C-linkage entry symbol exported by a plugin library.
pub type PluginInitFn = for<'a> unsafe extern "C" fn(*mut Registrar<'a>);

/// Exports the plugin entry symbol from a `cdylib`/`dylib` crate.
///
/// Wraps a `fn(&mut Registrar<'_>) -> Result<(), PluginError>` so that a
/// returned error, or a panic, is recorded in the registrar instead of
/// unwinding across the C boundary. The one-argument form exports the
/// default symbol name; pass an identifier first to export under a
/// different name.
///
/// ```
/// use veld_component::{PluginError, Registrar};
///
/// fn init(_registrar: &mut Registrar<'_>) -> Result<(), PluginError> {
///     Ok(())
/// }
///
/// veld_component::export_plugin!(init);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($init:path) => {
        $crate::export_plugin!(plugin_init, $init);
    };
    ($symbol:ident, $init:path) => {
        /// Plugin entry point invoked by the loader.
        ///
        /// # Safety
        ///
        /// `registrar` must be the exclusive pointer handed in by the
        /// loader for the duration of this call.
        #[no_mangle]
        pub unsafe extern "C" fn $symbol(registrar: *mut $crate::Registrar<'_>) {
            // SAFETY: the loader passes a valid, exclusive registrar
            // pointer and keeps it alive across the call.
            let registrar = unsafe { &mut *registrar };
            let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                $init(registrar)
            }));
            match outcome {
                ::std::result::Result::Ok(::std::result::Result::Ok(())) => {}
                ::std::result::Result::Ok(::std::result::Result::Err(error)) => {
                    registrar.record_failure(error);
                }
                ::std::result::Result::Err(payload) => {
                    registrar.record_failure($crate::PluginError::Internal(
                        $crate::panic_message(&*payload),
                    ));
                }
            }
        }
    };
}

/// Built-in class ids of the runtime's own services.
pub mod clsid {
    use crate::ids::{class_id, ClassId};

    /// The event bus service.
    pub const EVENT_BUS: ClassId = class_id("veld-core-event-bus-SERVICE-UUID-D54E82F1");
    /// The registry introspection service.
    pub const PLUGIN_QUERY: ClassId = class_id("veld-core-plugin-query-SERVICE-UUID-7C31A09B");
    /// The plugin manager itself.
    pub const PLUGIN_MANAGER: ClassId = class_id("veld-core-plugin-manager-SERVICE-UUID-42F0BD6E");
}
