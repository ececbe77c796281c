//! Event bus internals: subscription storage, the task queue and worker,
//! garbage collection and the bus interface of the manager.

use crate::manager::PluginManager;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use veld_component::{
    panic_message, Connection, DeliveryMode, EventBus, EventCallback, EventId, EventRef, WeakKey,
};

/// Default capacity of the asynchronous task queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Where in the delivery pipeline a trace callback fires.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, PartialEq, Eq)]
pub enum TracePoint {
    /// An event with at least one subscription is being fired.
    EventFired,
    /// A synchronous callback is about to run on the firing thread.
    DirectCallStart,
    /// A task was appended to the asynchronous queue.
    TaskEnqueued,
    /// The worker is about to run a task.
    TaskExecuteStart,
    /// The worker finished running a task.
    TaskExecuteEnd,
}

/// Diagnostic callback observing the delivery pipeline.
///
/// Must not panic; a panicking hook is silently dropped for the call.
pub type TraceHook = Arc<dyn Fn(TracePoint, EventId, &str) + Send + Sync>;

/// Where a reported plugin panic escaped from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PanicOrigin {
    /// A synchronous event callback, on the firing thread.
    SyncCallback(EventId),
    /// A queued task, on the worker thread.
    QueuedTask(EventId),
    /// A component's `shutdown` hook during unload.
    ShutdownHook,
}

/// A plugin panic that could not be returned to any direct caller.
#[derive(Clone, Debug)]
pub struct PanicReport {
    /// Where the panic escaped from.
    pub origin: PanicOrigin,
    /// The panic payload, rendered as text.
    pub message: String,
}

/// Out-of-band sink for [`PanicReport`]s, installed by the host.
///
/// Invoked from whichever thread observed the panic; the host
/// synchronizes its own output.
pub type ExceptionHandler = Arc<dyn Fn(&PanicReport) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Subscription {
    pub(crate) subscriber: WeakKey,
    pub(crate) callback: EventCallback,
    pub(crate) mode: DeliveryMode,
    pub(crate) token: Arc<AtomicBool>,
}

/// Copy-on-write subscription list: readers snapshot the `Arc`, writers
/// publish a rebuilt vector (or mutate in place while solely owned).
pub(crate) type SubList = Arc<Vec<Subscription>>;

#[derive(Default)]
pub(crate) struct SubscriberMaps {
    pub(crate) global: HashMap<EventId, SubList>,
    pub(crate) per_sender: HashMap<WeakKey, HashMap<EventId, SubList>>,
    pub(crate) global_lookup: HashMap<WeakKey, HashSet<EventId>>,
    pub(crate) sender_lookup: HashMap<WeakKey, HashSet<(WeakKey, EventId)>>,
}

impl SubscriberMaps {
    pub(crate) fn clear(&mut self) {
        self.global.clear();
        self.per_sender.clear();
        self.global_lookup.clear();
        self.sender_lookup.clear();
    }
}

pub(crate) struct EventTask {
    pub(crate) event_id: EventId,
    pub(crate) run: Box<dyn FnOnce() + Send>,
}

pub(crate) struct QueueState {
    pub(crate) tasks: VecDeque<EventTask>,
    pub(crate) running: bool,
    pub(crate) busy: bool,
}

type GcKey = (Option<usize>, EventId);

/// Bus state shared between the manager and the worker thread.
pub(crate) struct BusState {
    pub(crate) maps: Mutex<SubscriberMaps>,
    pub(crate) queue: Mutex<QueueState>,
    queue_signal: Condvar,
    capacity: usize,
    dropped_tasks: AtomicU64,
    pub(crate) pending_gc: Mutex<HashSet<GcKey>>,
    pub(crate) trace_hook: Mutex<Option<TraceHook>>,
    pub(crate) exception_handler: Mutex<Option<ExceptionHandler>>,
}

impl BusState {
    pub(crate) fn new(capacity: usize) -> Self {
        BusState {
            maps: Mutex::new(SubscriberMaps::default()),
            queue: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                running: true,
                busy: false,
            }),
            queue_signal: Condvar::new(),
            capacity,
            dropped_tasks: AtomicU64::new(0),
            pending_gc: Mutex::new(HashSet::new()),
            trace_hook: Mutex::new(None),
            exception_handler: Mutex::new(None),
        }
    }

    pub(crate) fn spawn_worker(bus: &Arc<BusState>) -> std::io::Result<JoinHandle<()>> {
        let bus = Arc::clone(bus);
        std::thread::Builder::new()
            .name(String::from("veld-event-worker"))
            .spawn(move || bus.event_loop())
    }

    fn event_loop(&self) {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(task) = queue.tasks.pop_front() {
                        queue.busy = true;
                        break task;
                    }
                    if !queue.running {
                        return;
                    }
                    self.queue_signal.wait(&mut queue);
                }
            };

            let EventTask { event_id, run } = task;
            self.trace(TracePoint::TaskExecuteStart, event_id, "async-exec-start");
            if let Err(payload) = catch_unwind(AssertUnwindSafe(run)) {
                self.report_panic(PanicOrigin::QueuedTask(event_id), panic_message(&*payload));
            }
            self.trace(TracePoint::TaskExecuteEnd, event_id, "async-exec-end");

            let mut queue = self.queue.lock();
            queue.busy = false;
            if queue.tasks.is_empty() {
                self.queue_signal.notify_all();
            }
        }
    }

    /// Appends a task. Over-capacity tasks are dropped and counted.
    pub(crate) fn enqueue(&self, task: EventTask) -> bool {
        let event_id = task.event_id;
        {
            let mut queue = self.queue.lock();
            if !queue.running {
                return false;
            }
            if queue.tasks.len() >= self.capacity {
                drop(queue);
                let total = self.dropped_tasks.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    event_id,
                    dropped_total = total,
                    "event task queue is full, dropping task"
                );
                return false;
            }
            queue.tasks.push_back(task);
        }
        self.queue_signal.notify_all();
        self.trace(TracePoint::TaskEnqueued, event_id, "queue-push");
        true
    }

    /// Blocks until the queue is empty and the worker idle.
    pub(crate) fn drain(&self) {
        let mut queue = self.queue.lock();
        while queue.running && (!queue.tasks.is_empty() || queue.busy) {
            self.queue_signal.wait(&mut queue);
        }
    }

    pub(crate) fn request_stop(&self) {
        self.queue.lock().running = false;
        self.queue_signal.notify_all();
    }

    pub(crate) fn dropped_tasks(&self) -> u64 {
        self.dropped_tasks.load(Ordering::Relaxed)
    }

    pub(crate) fn trace(&self, point: TracePoint, event_id: EventId, detail: &str) {
        let hook = { self.trace_hook.lock().clone() };
        if let Some(hook) = hook {
            // A panicking trace hook is dropped for this call.
            let _ = catch_unwind(AssertUnwindSafe(|| hook(point, event_id, detail)));
        }
    }

    pub(crate) fn report_panic(&self, origin: PanicOrigin, message: String) {
        let handler = { self.exception_handler.lock().clone() };
        let report = PanicReport { origin, message };
        match handler {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(&report))).is_err() {
                    tracing::error!("the installed exception handler itself panicked");
                }
            }
            None => {
                tracing::error!(
                    origin = ?report.origin,
                    message = %report.message,
                    "unhandled plugin panic"
                );
            }
        }
    }
}

fn push_cow(slot: &mut SubList, subscription: Subscription) {
    if let Some(list) = Arc::get_mut(slot) {
        list.push(subscription);
    } else {
        let mut list = Vec::with_capacity(slot.len() + 4);
        list.extend(slot.iter().cloned());
        list.push(subscription);
        *slot = Arc::new(list);
    }
}

fn remove_subscriber_cow(slot: &mut SubList, subscriber: &WeakKey) {
    if !slot.iter().any(|sub| sub.subscriber == *subscriber) {
        return;
    }
    let remaining: Vec<Subscription> = slot
        .iter()
        .filter(|sub| sub.subscriber != *subscriber)
        .cloned()
        .collect();
    *slot = Arc::new(remaining);
}

/// Rebuilds the list without dead entries; untouched when fully live.
fn compact_cow(slot: &mut SubList) {
    let any_dead = slot
        .iter()
        .any(|sub| sub.subscriber.is_expired() || !sub.token.load(Ordering::Relaxed));
    if !any_dead {
        return;
    }
    let live: Vec<Subscription> = slot
        .iter()
        .filter(|sub| !sub.subscriber.is_expired() && sub.token.load(Ordering::Relaxed))
        .cloned()
        .collect();
    *slot = Arc::new(live);
}

impl PluginManager {
    fn weak_bus(&self) -> Weak<dyn EventBus> {
        self.self_weak()
    }

    /// Walks a snapshot outside any lock and delivers to each live entry.
    /// Returns whether dead entries were seen.
    fn deliver_snapshot(&self, snapshot: &SubList, event: &EventRef) -> bool {
        let event_id = event.event_id();
        let mut needs_gc = false;
        for sub in snapshot.iter() {
            if !sub.token.load(Ordering::Acquire) || sub.subscriber.is_expired() {
                needs_gc = true;
                continue;
            }
            match sub.mode {
                DeliveryMode::Direct => {
                    self.bus()
                        .trace(TracePoint::DirectCallStart, event_id, "direct-call");
                    let callback = &sub.callback;
                    let outcome = catch_unwind(AssertUnwindSafe(|| callback(event.as_ref())));
                    if let Err(payload) = outcome {
                        self.bus().report_panic(
                            PanicOrigin::SyncCallback(event_id),
                            panic_message(&*payload),
                        );
                    }
                }
                DeliveryMode::Queued => {
                    let callback = sub.callback.clone();
                    let token = sub.token.clone();
                    let event = event.clone();
                    // The task re-checks the token at dequeue time and
                    // keeps the event alive across the invocation.
                    self.bus().enqueue(EventTask {
                        event_id,
                        run: Box::new(move || {
                            if token.load(Ordering::Acquire) {
                                callback(event.as_ref());
                            }
                        }),
                    });
                }
            }
        }
        needs_gc
    }

    fn schedule_gc(&self, sender: Option<WeakKey>, event_id: EventId) {
        let gc_key = (sender.as_ref().map(WeakKey::addr), event_id);
        if !self.bus().pending_gc.lock().insert(gc_key) {
            return;
        }
        let manager = self.self_weak();
        let queued = self.bus().enqueue(EventTask {
            event_id,
            run: Box::new(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.perform_gc(sender, event_id);
                }
            }),
        });
        if !queued {
            self.bus().pending_gc.lock().remove(&gc_key);
        }
    }

    fn perform_gc(&self, sender: Option<WeakKey>, event_id: EventId) {
        let gc_key = (sender.as_ref().map(WeakKey::addr), event_id);
        self.bus().pending_gc.lock().remove(&gc_key);

        let mut guard = self.bus().maps.lock();
        let maps = &mut *guard;
        match &sender {
            None => {
                if let Some(slot) = maps.global.get_mut(&event_id) {
                    compact_cow(slot);
                }
            }
            Some(key) if key.is_expired() => {
                maps.per_sender.remove(key);
            }
            Some(key) => {
                if let Some(per_event) = maps.per_sender.get_mut(key) {
                    if let Some(slot) = per_event.get_mut(&event_id) {
                        compact_cow(slot);
                    }
                }
            }
        }
    }
}

impl EventBus for PluginManager {
    fn subscribe_global_raw(
        &self,
        event_id: EventId,
        subscriber: WeakKey,
        callback: EventCallback,
        mode: DeliveryMode,
    ) -> Connection {
        let token = Arc::new(AtomicBool::new(true));
        {
            let mut guard = self.bus().maps.lock();
            let maps = &mut *guard;
            push_cow(
                maps.global.entry(event_id).or_default(),
                Subscription {
                    subscriber: subscriber.clone(),
                    callback,
                    mode,
                    token: token.clone(),
                },
            );
            maps.global_lookup
                .entry(subscriber.clone())
                .or_default()
                .insert(event_id);
        }
        Connection::new(self.weak_bus(), subscriber, event_id, None, token)
    }

    fn subscribe_to_sender_raw(
        &self,
        event_id: EventId,
        subscriber: WeakKey,
        sender: WeakKey,
        callback: EventCallback,
        mode: DeliveryMode,
    ) -> Connection {
        let token = Arc::new(AtomicBool::new(true));
        {
            let mut guard = self.bus().maps.lock();
            let maps = &mut *guard;
            let per_event = maps.per_sender.entry(sender.clone()).or_default();
            push_cow(
                per_event.entry(event_id).or_default(),
                Subscription {
                    subscriber: subscriber.clone(),
                    callback,
                    mode,
                    token: token.clone(),
                },
            );
            maps.sender_lookup
                .entry(subscriber.clone())
                .or_default()
                .insert((sender.clone(), event_id));
        }
        Connection::new(self.weak_bus(), subscriber, event_id, Some(sender), token)
    }

    fn fire_global_raw(&self, event: EventRef) {
        let event_id = event.event_id();
        let snapshot = { self.bus().maps.lock().global.get(&event_id).cloned() };
        let Some(snapshot) = snapshot else { return };
        if snapshot.is_empty() {
            return;
        }
        self.bus().trace(TracePoint::EventFired, event_id, "global-fire");
        if self.deliver_snapshot(&snapshot, &event) {
            self.schedule_gc(None, event_id);
        }
    }

    fn fire_to_sender_raw(&self, sender: &WeakKey, event: EventRef) {
        let event_id = event.event_id();
        let snapshot = {
            self.bus()
                .maps
                .lock()
                .per_sender
                .get(sender)
                .and_then(|per_event| per_event.get(&event_id))
                .cloned()
        };
        let Some(snapshot) = snapshot else { return };
        if snapshot.is_empty() {
            return;
        }
        self.bus().trace(TracePoint::EventFired, event_id, "sender-fire");
        if self.deliver_snapshot(&snapshot, &event) {
            self.schedule_gc(Some(sender.clone()), event_id);
        }
    }

    fn is_global_subscribed(&self, event_id: EventId) -> bool {
        self.bus()
            .maps
            .lock()
            .global
            .get(&event_id)
            .map_or(false, |list| !list.is_empty())
    }

    fn is_sender_subscribed(&self, sender: &WeakKey, event_id: EventId) -> bool {
        self.bus()
            .maps
            .lock()
            .per_sender
            .get(sender)
            .and_then(|per_event| per_event.get(&event_id))
            .map_or(false, |list| !list.is_empty())
    }

    fn unsubscribe_raw(&self, subscriber: &WeakKey) {
        let mut guard = self.bus().maps.lock();
        let maps = &mut *guard;
        if let Some(event_ids) = maps.global_lookup.remove(subscriber) {
            for event_id in event_ids {
                if let Some(slot) = maps.global.get_mut(&event_id) {
                    remove_subscriber_cow(slot, subscriber);
                }
            }
        }
        if let Some(pairs) = maps.sender_lookup.remove(subscriber) {
            for (sender, event_id) in pairs {
                if let Some(per_event) = maps.per_sender.get_mut(&sender) {
                    if let Some(slot) = per_event.get_mut(&event_id) {
                        remove_subscriber_cow(slot, subscriber);
                    }
                }
            }
        }
    }

    fn unsubscribe_event_raw(
        &self,
        subscriber: &WeakKey,
        event_id: EventId,
        sender: Option<&WeakKey>,
    ) {
        let mut guard = self.bus().maps.lock();
        let maps = &mut *guard;
        match sender {
            None => {
                if let Some(slot) = maps.global.get_mut(&event_id) {
                    remove_subscriber_cow(slot, subscriber);
                }
                if let Some(set) = maps.global_lookup.get_mut(subscriber) {
                    set.remove(&event_id);
                    if set.is_empty() {
                        maps.global_lookup.remove(subscriber);
                    }
                }
            }
            Some(sender_key) => {
                if let Some(per_event) = maps.per_sender.get_mut(sender_key) {
                    if let Some(slot) = per_event.get_mut(&event_id) {
                        remove_subscriber_cow(slot, subscriber);
                    }
                }
                if let Some(set) = maps.sender_lookup.get_mut(subscriber) {
                    set.remove(&(sender_key.clone(), event_id));
                    if set.is_empty() {
                        maps.sender_lookup.remove(subscriber);
                    }
                }
            }
        }
    }

    fn remove_subscription(
        &self,
        event_id: EventId,
        sender: Option<&WeakKey>,
        token: &Arc<AtomicBool>,
    ) {
        let mut guard = self.bus().maps.lock();
        let maps = &mut *guard;
        let slot = match sender {
            None => maps.global.get_mut(&event_id),
            Some(sender_key) => maps
                .per_sender
                .get_mut(sender_key)
                .and_then(|per_event| per_event.get_mut(&event_id)),
        };
        let Some(slot) = slot else { return };
        let Some(subscriber) = slot
            .iter()
            .find(|sub| Arc::ptr_eq(&sub.token, token))
            .map(|sub| sub.subscriber.clone())
        else {
            return;
        };
        let remaining: Vec<Subscription> = slot
            .iter()
            .filter(|sub| !Arc::ptr_eq(&sub.token, token))
            .cloned()
            .collect();
        let subscriber_still_listed = remaining
            .iter()
            .any(|sub| sub.subscriber == subscriber);
        *slot = Arc::new(remaining);
        if subscriber_still_listed {
            return;
        }
        match sender {
            None => {
                if let Some(set) = maps.global_lookup.get_mut(&subscriber) {
                    set.remove(&event_id);
                    if set.is_empty() {
                        maps.global_lookup.remove(&subscriber);
                    }
                }
            }
            Some(sender_key) => {
                if let Some(set) = maps.sender_lookup.get_mut(&subscriber) {
                    set.remove(&(sender_key.clone(), event_id));
                    if set.is_empty() {
                        maps.sender_lookup.remove(&subscriber);
                    }
                }
            }
        }
    }

    fn drain_async_events(&self) {
        self.bus().drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drops_over_capacity_tasks() {
        // No worker thread: tasks stay queued.
        let bus = BusState::new(2);
        for _ in 0..3 {
            bus.enqueue(EventTask {
                event_id: 1,
                run: Box::new(|| {}),
            });
        }
        assert_eq!(bus.queue.lock().tasks.len(), 2);
        assert_eq!(bus.dropped_tasks(), 1);
    }

    #[test]
    fn push_cow_publishes_new_vector_while_snapshotted() {
        let subscription = Subscription {
            subscriber: WeakKey::new(&Arc::new(0_u8)),
            callback: Arc::new(|_| {}),
            mode: DeliveryMode::Direct,
            token: Arc::new(AtomicBool::new(true)),
        };

        let mut slot: SubList = Arc::new(vec![subscription.clone()]);
        let snapshot = slot.clone();
        push_cow(&mut slot, subscription.clone());
        // The held snapshot is untouched; the slot was republished.
        assert_eq!(snapshot.len(), 1);
        assert_eq!(slot.len(), 2);

        // Solely owned lists are extended in place.
        let before = Arc::as_ptr(&slot);
        drop(snapshot);
        push_cow(&mut slot, subscription);
        assert_eq!(Arc::as_ptr(&slot), before);
        assert_eq!(slot.len(), 3);
    }

    #[test]
    fn compact_does_not_touch_fully_live_lists() {
        let keep_alive = Arc::new(1_u8);
        let mut slot: SubList = Arc::new(vec![Subscription {
            subscriber: WeakKey::new(&keep_alive),
            callback: Arc::new(|_| {}),
            mode: DeliveryMode::Direct,
            token: Arc::new(AtomicBool::new(true)),
        }]);
        let before = Arc::as_ptr(&slot);
        compact_cow(&mut slot);
        assert_eq!(Arc::as_ptr(&slot), before);

        drop(keep_alive);
        compact_cow(&mut slot);
        assert!(slot.is_empty());
    }
}
