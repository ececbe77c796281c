//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use veld_runtime::PluginManager;

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serializes a test body; the active manager is a process-wide slot.
pub fn serialized(test: impl FnOnce()) {
    let _guard = TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    test();
}

struct ActiveManager(Option<Arc<PluginManager>>);

impl Drop for ActiveManager {
    fn drop(&mut self) {
        PluginManager::destroy();
        self.0.take();
    }
}

/// Runs a test against a freshly created manager and tears it down
/// afterwards, also when the test panics.
pub fn with_manager(test: impl FnOnce(&Arc<PluginManager>)) {
    with_manager_capacity(veld_runtime::DEFAULT_QUEUE_CAPACITY, test);
}

/// [`with_manager`] with an explicit async queue capacity.
pub fn with_manager_capacity(capacity: usize, test: impl FnOnce(&Arc<PluginManager>)) {
    serialized(|| {
        let manager =
            PluginManager::with_queue_capacity(capacity).expect("failed to create the manager");
        let guard = ActiveManager(Some(manager));
        test(guard.0.as_ref().expect("manager is present"));
    });
}

/// Raw address of the object behind a handle, for identity assertions.
pub fn object_addr<T: ?Sized>(handle: &Arc<T>) -> usize {
    Arc::as_ptr(handle) as *const () as usize
}

// --- shared test interfaces, components and events ---

use veld_component::Component;

pub trait Greeter: Component {
    fn greet(&self) -> String;
}
veld_component::declare_interface!(Greeter, "veld-test-greeter-IID-B0000001", 1, 2);

impl std::fmt::Debug for dyn Greeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Greeter").finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct EnglishGreeter;

impl Greeter for EnglishGreeter {
    fn greet(&self) -> String {
        String::from("hello")
    }
}

veld_component::declare_component! {
    impl EnglishGreeter {
        clsid: "veld-test-english-greeter-CLSID-B1000001",
        interfaces: [dyn Greeter],
    }
}

#[derive(Clone, Debug)]
pub struct PingEvent {
    pub value: u32,
}
veld_component::declare_event!(PingEvent, "veld-test-ping-EVENT-C0000001");

#[derive(Clone, Debug)]
pub struct PongEvent {
    pub value: u32,
}
veld_component::declare_event!(PongEvent, "veld-test-pong-EVENT-C0000002");

/// Event subscriber recording what it saw.
#[derive(Default)]
pub struct Recorder {
    pub values: Mutex<Vec<u32>>,
    pub hits: AtomicUsize,
}

impl Recorder {
    pub fn record(&self, value: u32) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(value);
    }

    pub fn seen(&self) -> Vec<u32> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
