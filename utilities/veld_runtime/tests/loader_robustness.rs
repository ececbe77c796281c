//! Loader failure handling, transactional rollback and the three-phase
//! unload.

mod common;

use common::{with_manager, EnglishGreeter, Greeter, PingEvent, Recorder};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use veld_component::{
    class_id, Component, ComponentClass, ComponentHandle, ComponentRegistration, DeliveryMode,
    EventBus, PluginError, PluginLoadFailureEvent, PluginQuery,
};
use veld_runtime::{locator, shared_library_extension, PluginManager};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("veld-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("failed to create scratch directory");
    dir
}

#[test]
fn wrong_extension_is_rejected_up_front() {
    with_manager(|manager| {
        let dir = scratch_dir("wrong-ext");
        let path = dir.join("plugin.txt");
        std::fs::write(&path, b"plain text").unwrap();

        let error = manager.load_plugin(&path).unwrap_err();
        assert!(matches!(error, PluginError::LoadFailed { .. }));
        assert!(manager.loaded_plugin_files().is_empty());

        let _ = std::fs::remove_dir_all(dir);
    });
}

#[test]
fn unopenable_library_fails_and_publishes_the_failure() {
    with_manager(|manager| {
        let dir = scratch_dir("bogus-lib");
        let path = dir.join(format!("bogus.{}", shared_library_extension()));
        std::fs::write(&path, b"this is not a shared library").unwrap();

        let bus: &dyn EventBus = manager.as_ref();
        let listener = Arc::new(Recorder::default());
        let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let _connection = {
            let failures = failures.clone();
            bus.subscribe_global(
                &listener,
                DeliveryMode::Direct,
                move |_: &Recorder, event: &PluginLoadFailureEvent| {
                    failures.lock().unwrap().push(event.error_message.clone());
                },
            )
        };

        let error = manager.load_plugin(&path).unwrap_err();
        assert!(matches!(error, PluginError::LoadFailed { .. }));
        assert!(manager.loaded_plugin_files().is_empty());

        let failures = failures.lock().unwrap().clone();
        assert_eq!(failures.len(), 1);
        assert!(!failures[0].is_empty());

        let _ = std::fs::remove_dir_all(dir);
    });
}

#[test]
fn directory_load_reports_per_file_failures() {
    with_manager(|manager| {
        // A missing directory is itself one failure.
        let missing = std::env::temp_dir().join("veld-no-such-dir-ever");
        let failures = manager.load_plugins_from_directory(&missing, false);
        assert_eq!(failures.len(), 1);

        // An empty directory yields none.
        let empty = scratch_dir("empty-dir");
        assert!(manager.load_plugins_from_directory(&empty, true).is_empty());

        // A directory with one broken library yields exactly that one.
        let broken = scratch_dir("broken-dir");
        let bogus = broken.join(format!("bogus.{}", shared_library_extension()));
        std::fs::write(&bogus, b"junk").unwrap();
        std::fs::write(broken.join("readme.txt"), b"ignored").unwrap();

        let failures = manager.load_plugins_from_directory(&broken, false);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, bogus);

        let _ = std::fs::remove_dir_all(empty);
        let _ = std::fs::remove_dir_all(broken);
    });
}

#[test]
fn failing_entry_rolls_back_every_registration() {
    with_manager(|manager| {
        let first = class_id("veld-test-rollback-one-CLSID-E0000001");
        let second = class_id("veld-test-rollback-two-CLSID-E0000002");
        let registration = |clsid| ComponentRegistration {
            clsid,
            factory: Arc::new(|| Some(Arc::new(EnglishGreeter) as ComponentHandle)),
            is_singleton: false,
            alias: String::new(),
            interfaces: EnglishGreeter::interface_table().to_vec(),
            is_default: false,
        };

        let error = manager
            .register_static_plugin("rolls-back", |registrar| {
                registrar.register(registration(first))?;
                registrar.register(registration(second))?;
                Err(PluginError::Internal(String::from("entry gave up")))
            })
            .unwrap_err();
        assert!(matches!(error, PluginError::LoadFailed { .. }));

        // No trace in any index.
        assert!(manager.component_details(first).is_none());
        assert!(manager.component_details(second).is_none());
        assert!(manager
            .components_implementing(<dyn Greeter as veld_component::InterfaceMeta>::IID)
            .is_empty());
        assert!(!manager
            .loaded_plugin_files()
            .iter()
            .any(|path| path.contains("rolls-back")));

        // The same class ids register cleanly from another plugin.
        manager
            .register_static_plugin("second-attempt", |registrar| {
                registrar.register(registration(first))?;
                registrar.register(registration(second))
            })
            .unwrap();
        assert!(manager.component_details(first).is_some());
        assert!(manager.component_details(second).is_some());
    });
}

#[test]
fn panicking_entry_is_contained_and_rolled_back() {
    with_manager(|manager| {
        let clsid = class_id("veld-test-panicking-entry-CLSID-E0000003");
        let error = manager
            .register_static_plugin("panicking", move |registrar| {
                registrar.register(ComponentRegistration {
                    clsid,
                    factory: Arc::new(|| None),
                    is_singleton: false,
                    alias: String::new(),
                    interfaces: Vec::new(),
                    is_default: false,
                })?;
                panic!("entry exploded");
            })
            .unwrap_err();
        assert!(matches!(error, PluginError::LoadFailed { .. }));
        assert!(manager.component_details(clsid).is_none());
    });
}

#[test]
fn static_plugin_load_is_idempotent() {
    with_manager(|manager| {
        let entries = Arc::new(AtomicUsize::new(0));
        let register = |registrar: &mut veld_component::Registrar<'_>| {
            registrar.register_component_of::<EnglishGreeter>("test.greeter", false)
        };

        let counting = entries.clone();
        manager
            .register_static_plugin("idempotent", move |registrar| {
                counting.fetch_add(1, Ordering::SeqCst);
                register(registrar)
            })
            .unwrap();
        let counting = entries.clone();
        manager
            .register_static_plugin("idempotent", move |registrar| {
                counting.fetch_add(1, Ordering::SeqCst);
                register(registrar)
            })
            .unwrap();

        // The second call never ran its entry.
        assert_eq!(entries.load(Ordering::SeqCst), 1);
        assert_eq!(manager.loaded_plugin_files().len(), 1);
    });
}

#[test]
fn unload_runs_shutdown_hooks_lifo_and_resets_the_runtime() {
    static SHUTDOWN_ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static CROSS_LOOKUPS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct ServiceA;

    veld_component::declare_component! {
        impl ServiceA {
            clsid: "veld-test-service-a-CLSID-E1000001",
            interfaces: [],
            fn shutdown(&self) {
                if locator::try_get_service_by_alias::<dyn Component>("svc.b").is_some() {
                    CROSS_LOOKUPS.fetch_add(1, Ordering::SeqCst);
                }
                SHUTDOWN_ORDER.lock().unwrap().push("a");
            }
        }
    }

    #[derive(Default)]
    struct ServiceB;

    veld_component::declare_component! {
        impl ServiceB {
            clsid: "veld-test-service-b-CLSID-E1000002",
            interfaces: [],
            fn shutdown(&self) {
                if locator::try_get_service_by_alias::<dyn Component>("svc.a").is_some() {
                    CROSS_LOOKUPS.fetch_add(1, Ordering::SeqCst);
                }
                SHUTDOWN_ORDER.lock().unwrap().push("b");
            }
        }
    }

    with_manager(|manager| {
        let load_packs = |manager: &PluginManager| {
            manager
                .register_static_plugin("pack-a", |registrar| {
                    registrar.register_service_of::<ServiceA>("svc.a", false)
                })
                .unwrap();
            manager
                .register_static_plugin("pack-b", |registrar| {
                    registrar.register_service_of::<ServiceB>("svc.b", false)
                })
                .unwrap();
        };
        load_packs(manager);

        // Initialize both singletons so their hooks take part in
        // shutdown.
        manager.get_service_handle(ServiceA::CLSID).unwrap();
        manager.get_service_handle(ServiceB::CLSID).unwrap();

        let populated: Vec<u64> = {
            let mut clsids: Vec<u64> = manager
                .all_components()
                .into_iter()
                .map(|details| details.clsid)
                .collect();
            clsids.sort_unstable();
            clsids
        };

        manager.unload_all_plugins();

        // Hooks ran newest-plugin-first, and both could still resolve
        // the other service through the non-raising path.
        assert_eq!(SHUTDOWN_ORDER.lock().unwrap().clone(), vec!["b", "a"]);
        assert_eq!(CROSS_LOOKUPS.load(Ordering::SeqCst), 2);

        // Only the built-in services remain, and the bus still works.
        assert!(manager.component_details(ServiceA::CLSID).is_none());
        assert!(manager.loaded_plugin_files().is_empty());
        assert_eq!(manager.all_components().len(), 3);

        let bus: &dyn EventBus = manager.as_ref();
        let recorder = Arc::new(Recorder::default());
        let _connection = bus.subscribe_global(
            &recorder,
            DeliveryMode::Queued,
            |recorder: &Recorder, event: &PingEvent| recorder.record(event.value),
        );
        bus.fire_global(PingEvent { value: 4 });
        bus.drain_async_events();
        assert_eq!(recorder.seen(), vec![4]);

        // Reloading the same packs restores the identical population.
        load_packs(manager);
        let repopulated: Vec<u64> = {
            let mut clsids: Vec<u64> = manager
                .all_components()
                .into_iter()
                .map(|details| details.clsid)
                .collect();
            clsids.sort_unstable();
            clsids
        };
        assert_eq!(populated, repopulated);
    });
}
