//! Interface queries, version gating and cross-interface ownership.

mod common;

use common::{object_addr, with_manager, EnglishGreeter, Greeter};
use std::sync::Arc;
use veld_component::{
    interface_id, plugin_cast, query_interface_raw, Component, ComponentClass, InterfaceMeta,
    PluginError, PluginQuery,
};

#[test]
fn version_gate() {
    with_manager(|manager| {
        manager
            .register_static_plugin("gate", |registrar| {
                registrar.register_component_of::<EnglishGreeter>("", false)
            })
            .unwrap();

        // Greeter is declared at version (1, 2).
        let handle = manager.create_transient(EnglishGreeter::CLSID).unwrap();
        let iid = <dyn Greeter as InterfaceMeta>::IID;

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

        let absent = interface_id("veld-test-absent-IID-D0000001");
        assert_eq!(
            query_interface_raw(&handle, absent, 1, 0).unwrap_err(),
            PluginError::InterfaceNotImpl(absent)
        );
    });
}

#[test]
fn typed_cast_shares_ownership_with_the_handle() {
    with_manager(|manager| {
        manager
            .register_static_plugin("ownership", |registrar| {
                registrar.register_component_of::<EnglishGreeter>("", false)
            })
            .unwrap();

        let handle = manager.create_transient(EnglishGreeter::CLSID).unwrap();
        let before = Arc::strong_count(&handle);

        let greeter = plugin_cast::<dyn Greeter>(&handle).unwrap();
        assert_eq!(greeter.greet(), "hello");
        assert_eq!(Arc::strong_count(&handle), before + 1);

        let base = plugin_cast::<dyn Component>(&handle).unwrap();
        assert_eq!(object_addr(&base), object_addr(&handle));

        drop(greeter);
        drop(base);
        assert_eq!(Arc::strong_count(&handle), before);
    });
}

#[test]
fn typed_service_lookup_goes_through_the_cast() {
    with_manager(|manager| {
        // The built-in query service resolved as its interface in one
        // call.
        let query = manager
            .get_service::<dyn PluginQuery>(veld_component::clsid::PLUGIN_QUERY)
            .unwrap();
        assert!(query
            .component_details(veld_component::clsid::EVENT_BUS)
            .is_some());
    });
}

#[test]
fn default_implementation_resolution() {
    with_manager(|manager| {
        manager
            .register_static_plugin("default", |registrar| {
                registrar.register_component_of::<EnglishGreeter>("test.greeter", true)
            })
            .unwrap();

        assert_eq!(
            manager.default_clsid(<dyn Greeter as InterfaceMeta>::IID),
            Some(EnglishGreeter::CLSID)
        );

        let greeter = manager.create_default_instance::<dyn Greeter>().unwrap();
        assert_eq!(greeter.greet(), "hello");

        // A second default claim on the same interface is rejected.
        let error = manager
            .register_static_plugin("conflicting-default", |registrar| {
                registrar.register(veld_component::ComponentRegistration {
                    clsid: veld_component::class_id("veld-test-other-greeter-CLSID-D1000001"),
                    factory: Arc::new(|| None),
                    is_singleton: false,
                    alias: String::new(),
                    interfaces: EnglishGreeter::interface_table().to_vec(),
                    is_default: true,
                })
            })
            .unwrap_err();
        assert!(matches!(error, PluginError::LoadFailed { .. }));
    });
}

#[test]
fn missing_default_is_alias_not_found() {
    with_manager(|manager| {
        assert!(matches!(
            manager.create_default_instance::<dyn Greeter>().unwrap_err(),
            PluginError::AliasNotFound(_)
        ));
    });
}
