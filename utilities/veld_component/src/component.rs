//! The component base trait, reference-counted handles and the typed
//! interface query.

use crate::error::PluginError;
use crate::ids::{ClassId, InterfaceId};
use crate::interface::{InterfaceDescriptor, InterfaceMeta};
use std::any::Any;
use std::sync::Arc;

/// Reference-counted handle to a component.
///
/// All sharing of component objects between the host and plugins goes
/// through these handles. The drop glue of the concrete type was compiled
/// into the plugin that allocated the object, so the object is destroyed
/// exactly once, inside the module that produced it, before that module's
/// library is closed.
pub type ComponentHandle = Arc<dyn Component>;

/// Type-erased interface reference produced by [`Component::query_raw`].
///
/// Always contains an `Arc<dyn SomeInterface>` cloned from the queried
/// handle, so the boxed reference shares ownership with it.
pub type InterfaceBox = Box<dyn Any + Send + Sync>;

/// Base trait of every component and interface in the runtime.
///
/// Implementations are generated by
/// [`declare_component!`](crate::declare_component); only the lifecycle
/// hooks are meant to be written by hand.
pub trait Component: Send + Sync + 'static {
    /// The static interface table of the implementing class, including the
    /// base interface.
    fn interfaces(&self) -> &'static [InterfaceDescriptor];

    /// Produces a typed interface reference for `iid`, or `None` when the
    /// class does not expose it.
    ///
    /// Callers go through [`query_interface_raw`] or [`plugin_cast`],
    /// which apply the version policy first.
    fn query_raw(self: Arc<Self>, iid: InterfaceId) -> Option<InterfaceBox>;

    /// Shares the handle as `Arc<dyn Any>` for identity-based bookkeeping.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Lifecycle hook run after construction, before the handle is handed
    /// to the caller.
    ///
    /// Must not fetch other services; dependency ordering is the caller's
    /// responsibility and lazy lookup at first use avoids startup cycles.
    fn initialize(&self) {}

    /// Lifecycle hook run exactly once while the runtime shuts a plugin
    /// down, before any object is destroyed.
    ///
    /// All services are still reachable here through the non-raising
    /// lookup path.
    fn shutdown(&self) {}
}

impl std::fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component").finish_non_exhaustive()
    }
}

impl InterfaceMeta for dyn Component {
    const IID: InterfaceId = crate::ids::interface_id("veld-core-Component-IID-A0000001");
    const NAME: &'static str = "Component";
    const VERSION_MAJOR: u32 = 1;
    const VERSION_MINOR: u32 = 0;
}

/// Compile-time metadata of a concrete component class.
///
/// Generated by [`declare_component!`](crate::declare_component).
pub trait ComponentClass: Component + Sized {
    /// Class identifier, hashed from the class UUID.
    const CLSID: ClassId;

    /// Static list of the interfaces the class responds to in
    /// [`Component::query_raw`], terminated by the base interface.
    fn interface_table() -> &'static [InterfaceDescriptor];
}

/// Queries a handle for an interface by id and version requirement.
///
/// Policy, evaluated against the class's static descriptor for `iid`:
/// an unlisted `iid` is [`PluginError::InterfaceNotImpl`]; a differing
/// major is [`PluginError::VersionMajorMismatch`]; a provided minor below
/// `minor` is [`PluginError::VersionMinorTooLow`]. On success the returned
/// box holds an `Arc` sharing ownership with `handle`.
pub fn query_interface_raw(
    handle: &ComponentHandle,
    iid: InterfaceId,
    major: u32,
    minor: u32,
) -> Result<InterfaceBox, PluginError> {
    let descriptor = handle
        .interfaces()
        .iter()
        .find(|descriptor| descriptor.iid == iid)
        .ok_or(PluginError::InterfaceNotImpl(iid))?;

    if descriptor.major != major {
        return Err(PluginError::VersionMajorMismatch {
            requested: major,
            provided: descriptor.major,
        });
    }
    if descriptor.minor < minor {
        return Err(PluginError::VersionMinorTooLow {
            requested: minor,
            provided: descriptor.minor,
        });
    }

    handle.clone().query_raw(iid).ok_or_else(|| {
        PluginError::Internal(format!(
            "interface {:#018x} is listed but not answered by the class",
            iid
        ))
    })
}

/// Casts a component handle to one of its interfaces.
///
/// The typed counterpart of [`query_interface_raw`]: the requested id and
/// version come from the interface's [`InterfaceMeta`]. The returned
/// `Arc<T>` shares ownership with `handle`; the component is destroyed
/// when the last reference drops, whichever interface it is held through.
pub fn plugin_cast<T>(handle: &ComponentHandle) -> Result<Arc<T>, PluginError>
where
    T: InterfaceMeta + ?Sized,
{
    let boxed = query_interface_raw(handle, T::IID, T::VERSION_MAJOR, T::VERSION_MINOR)?;
    boxed
        .downcast::<Arc<T>>()
        .map(|arc| *arc)
        .map_err(|_| {
            PluginError::Internal(format!(
                "query for interface {:#018x} produced a mismatched reference type",
                T::IID
            ))
        })
}

/// Generates the [`Component`] and [`ComponentClass`] implementations for
/// a concrete class.
///
/// The interface list names every interface the class answers to; the
/// base interface is appended automatically. Lifecycle hooks may be
/// supplied inline and default to no-ops.
///
/// ```
/// use veld_component::Component;
///
/// pub trait Greeter: Component {
///     fn greet(&self) -> String;
/// }
/// veld_component::declare_interface!(Greeter, "veld-doc-greeter2-IID-5BD07310", 1, 0);
///
/// #[derive(Default)]
/// pub struct EnglishGreeter;
///
/// impl Greeter for EnglishGreeter {
///     fn greet(&self) -> String {
///         String::from("hello")
///     }
/// }
///
/// veld_component::declare_component! {
///     impl EnglishGreeter {
///         clsid: "veld-doc-english-greeter-CLSID-90E144AF",
///         interfaces: [dyn Greeter],
///     }
/// }
/// ```
#[macro_export]
macro_rules! declare_component {
    (
        impl $class:ty {
            clsid: $uuid:literal,
            interfaces: [$($iface:ty),* $(,)?]
            $(,)?
            $(fn initialize(&$self_init:ident) $init:block)?
            $(fn shutdown(&$self_shut:ident) $shut:block)?
        }
    ) => {
        impl $crate::ComponentClass for $class {
            const CLSID: $crate::ClassId = $crate::class_id($uuid);

            fn interface_table() -> &'static [$crate::InterfaceDescriptor] {
                const TABLE: &[$crate::InterfaceDescriptor] = &[
                    $(<$iface as $crate::InterfaceMeta>::DESCRIPTOR,)*
                    <dyn $crate::Component as $crate::InterfaceMeta>::DESCRIPTOR,
                ];
                TABLE
            }
        }

        impl $crate::Component for $class {
            fn interfaces(&self) -> &'static [$crate::InterfaceDescriptor] {
                <Self as $crate::ComponentClass>::interface_table()
            }

            fn query_raw(
                self: ::std::sync::Arc<Self>,
                iid: $crate::InterfaceId,
            ) -> ::std::option::Option<$crate::InterfaceBox> {
                $(
                    if iid == <$iface as $crate::InterfaceMeta>::IID {
                        let typed: ::std::sync::Arc<$iface> = self;
                        return ::std::option::Option::Some(::std::boxed::Box::new(typed));
                    }
                )*
                if iid == <dyn $crate::Component as $crate::InterfaceMeta>::IID {
                    let base: ::std::sync::Arc<dyn $crate::Component> = self;
                    return ::std::option::Option::Some(::std::boxed::Box::new(base));
                }
                ::std::option::Option::None
            }

            fn as_any_arc(
                self: ::std::sync::Arc<Self>,
            ) -> ::std::sync::Arc<dyn ::std::any::Any + Send + Sync> {
                self
            }

            $(fn initialize(&$self_init) $init)?
            $(fn shutdown(&$self_shut) $shut)?
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::interface_id;

    pub trait Counter: Component {
        fn value(&self) -> u32;
    }
    crate::declare_interface!(Counter, "veld-test-counter-IID-0FD11532", 1, 2);

    #[derive(Default)]
    struct FixedCounter;

    impl Counter for FixedCounter {
        fn value(&self) -> u32 {
            7
        }
    }

    crate::declare_component! {
        impl FixedCounter {
            clsid: "veld-test-fixed-counter-CLSID-3A8B0C61",
            interfaces: [dyn Counter],
        }
    }

    fn handle() -> ComponentHandle {
        Arc::new(FixedCounter)
    }

    #[test]
    fn table_ends_with_base_interface() {
        let table = FixedCounter::interface_table();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].iid, <dyn Counter as InterfaceMeta>::IID);
        assert_eq!(table[1].iid, <dyn Component as InterfaceMeta>::IID);
    }

    #[test]
    fn cast_to_declared_interface() {
        let handle = handle();
        let counter = plugin_cast::<dyn Counter>(&handle).unwrap();
        assert_eq!(counter.value(), 7);
    }

    #[test]
    fn cast_to_base_interface() {
        let handle = handle();
        let base = plugin_cast::<dyn Component>(&handle).unwrap();
        assert_eq!(base.interfaces().len(), 2);
    }

    #[test]
    fn cast_shares_ownership() {
        let handle = handle();
        let before = Arc::strong_count(&handle);
        let counter = plugin_cast::<dyn Counter>(&handle).unwrap();
        assert_eq!(Arc::strong_count(&handle), before + 1);
        drop(counter);
        assert_eq!(Arc::strong_count(&handle), before);
    }

    #[test]
    fn unknown_interface_is_rejected() {
        let handle = handle();
        let unknown = interface_id("veld-test-unknown-IID-77AA0001");
        assert_eq!(
            query_interface_raw(&handle, unknown, 1, 0).unwrap_err(),
            PluginError::InterfaceNotImpl(unknown)
        );
    }

    #[test]
    fn version_policy() {
        let handle = handle();
        let iid = <dyn Counter as InterfaceMeta>::IID;

        assert!(query_interface_raw(&handle, iid, 1, 0).is_ok());
        assert!(query_interface_raw(&handle, iid, 1, 2).is_ok());
        assert_eq!(
            query_interface_raw(&handle, iid, 1, 3).unwrap_err(),
            PluginError::VersionMinorTooLow {
                requested: 3,
                provided: 2
            }
        );
        assert_eq!(
            query_interface_raw(&handle, iid, 2, 0).unwrap_err(),
            PluginError::VersionMajorMismatch {
                requested: 2,
                provided: 1
            }
        );
    }

    #[test]
    fn listed_but_unanswered_interface_is_internal() {
        struct Liar;

        impl Component for Liar {
            fn interfaces(&self) -> &'static [InterfaceDescriptor] {
                const TABLE: &[InterfaceDescriptor] =
                    &[<dyn Counter as InterfaceMeta>::DESCRIPTOR];
                TABLE
            }

            fn query_raw(self: Arc<Self>, _iid: InterfaceId) -> Option<InterfaceBox> {
                None
            }

            fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
                self
            }
        }

        let handle: ComponentHandle = Arc::new(Liar);
        let iid = <dyn Counter as InterfaceMeta>::IID;
        assert!(matches!(
            query_interface_raw(&handle, iid, 1, 0),
            Err(PluginError::Internal(_))
        ));
    }
}
