//! Update Scheduler - phased dispatch to the consumer
//!
//! For each phase in a requested mask, in canonical order:
//! 1. Pre-update callback (last chance to inject events)
//! 2. Drain the event queue and hand the batch to the update callback
//! 3. Deliver pending device discoveries, oldest first
//!
//! Everything here runs on the consumer context. The scheduler is not
//! thread-safe and relies on that: callback slots and the state machine use
//! `Cell`/`RefCell`, so it can be neither shared nor sent across threads.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, warn};

use tactile_core::{
    CallbackFault, CallbackKind, DeviceDescription, DeviceId, EventBatch, TactileError,
    TactileResult, UpdateType,
};

use crate::{DeviceRegistry, DrainBuffer, EventQueue};

/// `(phase)`
pub type BeforeUpdateCallback = dyn FnMut(UpdateType);
/// `(phase, drained batch)`; the batch is only valid during the call
pub type UpdateCallback = dyn FnMut(UpdateType, EventBatch<'_>);
/// `(device, description)`
pub type DeviceDiscoveredCallback = dyn FnMut(DeviceId, &DeviceDescription);
pub type ShutdownCallback = dyn FnOnce();

/// Where the scheduler is in an update run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    RunningBeforeUpdate,
    Dispatching,
    RunningDiscovery,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::RunningBeforeUpdate => "before-update",
            SchedulerState::Dispatching => "dispatching",
            SchedulerState::RunningDiscovery => "discovery",
        };
        f.write_str(name)
    }
}

/// Single registration slot with last-writer-wins semantics.
///
/// The callback is moved out while it runs, so it may re-register or clear
/// its own slot. A registration made during the call wins over the
/// callback being put back.
struct CallbackSlot<F: ?Sized> {
    slot: RefCell<Option<Box<F>>>,
    generation: Cell<u64>,
}

impl<F: ?Sized> CallbackSlot<F> {
    fn new() -> Self {
        CallbackSlot {
            slot: RefCell::new(None),
            generation: Cell::new(0),
        }
    }

    fn set(&self, callback: Box<F>) {
        *self.slot.borrow_mut() = Some(callback);
        self.generation.set(self.generation.get() + 1);
    }

    fn clear(&self) -> bool {
        let had = self.slot.borrow_mut().take().is_some();
        self.generation.set(self.generation.get() + 1);
        had
    }

    fn is_set(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Run the callback with panics caught. `None` if the slot is empty.
    fn invoke(
        &self,
        call: impl FnOnce(&mut F),
    ) -> Option<Result<(), Box<dyn Any + Send + 'static>>> {
        let mut callback = self.slot.borrow_mut().take()?;
        let generation = self.generation.get();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(&mut *callback)));

        if self.generation.get() == generation {
            *self.slot.borrow_mut() = Some(callback);
        }
        Some(outcome)
    }
}

/// Summary of one successful `run_update`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Phases that ran
    pub phases: UpdateType,
    pub events_delivered: usize,
    pub devices_discovered: usize,
}

/// Consumer-side counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Runs per phase, indexed in canonical order
    pub phase_runs: [u64; 5],
    pub events_delivered: u64,
    pub devices_delivered: u64,
    pub callback_faults: u64,
    pub reentrant_calls: u64,
}

impl SchedulerStats {
    pub fn runs_of(&self, phase: UpdateType) -> u64 {
        if !phase.is_single_phase() || phase.unknown_bits() != 0 {
            return 0;
        }
        self.phase_runs[phase.bits().trailing_zeros() as usize]
    }
}

/// Resets the state machine even if a step unwinds
struct ReturnToIdle<'a>(&'a Cell<SchedulerState>);

impl Drop for ReturnToIdle<'_> {
    fn drop(&mut self) {
        self.0.set(SchedulerState::Idle);
    }
}

/// Drives update phases and owns the consumer callbacks
pub struct UpdateScheduler {
    state: Cell<SchedulerState>,
    before_update: CallbackSlot<BeforeUpdateCallback>,
    update: CallbackSlot<UpdateCallback>,
    device_discovered: CallbackSlot<DeviceDiscoveredCallback>,
    shutdown: RefCell<Option<Box<ShutdownCallback>>>,
    drain: RefCell<DrainBuffer>,
    stats: RefCell<SchedulerStats>,
}

impl UpdateScheduler {
    pub fn new() -> Self {
        UpdateScheduler {
            state: Cell::new(SchedulerState::Idle),
            before_update: CallbackSlot::new(),
            update: CallbackSlot::new(),
            device_discovered: CallbackSlot::new(),
            shutdown: RefCell::new(None),
            drain: RefCell::new(DrainBuffer::new()),
            stats: RefCell::new(SchedulerStats::default()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state.get()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.borrow().clone()
    }

    pub fn set_on_before_update<F>(&self, callback: F)
    where
        F: FnMut(UpdateType) + 'static,
    {
        self.before_update.set(Box::new(callback));
    }

    pub fn set_on_update<F>(&self, callback: F)
    where
        F: FnMut(UpdateType, EventBatch<'_>) + 'static,
    {
        self.update.set(Box::new(callback));
    }

    /// Register the discovery callback.
    ///
    /// When idle, every announcement still pending is replayed to the new
    /// callback right away, in discovery order. From inside an update run the
    /// replay happens in that run's discovery step instead.
    pub fn set_on_device_discovered<F>(
        &self,
        callback: F,
        registry: &DeviceRegistry,
    ) -> TactileResult<usize>
    where
        F: FnMut(DeviceId, &DeviceDescription) + 'static,
    {
        self.device_discovered.set(Box::new(callback));
        if self.state.get() != SchedulerState::Idle {
            return Ok(0);
        }

        let mut faults = Vec::new();
        self.state.set(SchedulerState::RunningDiscovery);
        let delivered = {
            let _idle = ReturnToIdle(&self.state);
            self.deliver_discoveries(UpdateType::NONE, registry, &mut faults)
        };
        if delivered > 0 {
            debug!(devices = delivered, "replayed pending discoveries");
        }
        self.finish(faults).map(|_| delivered)
    }

    pub fn set_on_shutdown<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        *self.shutdown.borrow_mut() = Some(Box::new(callback));
    }

    pub fn clear_callback(&self, kind: CallbackKind) -> bool {
        match kind {
            CallbackKind::BeforeUpdate => self.before_update.clear(),
            CallbackKind::Update => self.update.clear(),
            CallbackKind::DeviceDiscovered => self.device_discovered.clear(),
            CallbackKind::Shutdown => self.shutdown.borrow_mut().take().is_some(),
        }
    }

    pub fn has_callback(&self, kind: CallbackKind) -> bool {
        match kind {
            CallbackKind::BeforeUpdate => self.before_update.is_set(),
            CallbackKind::Update => self.update.is_set(),
            CallbackKind::DeviceDiscovered => self.device_discovered.is_set(),
            CallbackKind::Shutdown => self.shutdown.borrow().is_some(),
        }
    }

    /// Run every phase in `mask`, in canonical order.
    ///
    /// Fails with `Reentrancy` and changes nothing when called from one of
    /// its own callbacks. Callback panics are isolated: the pipeline runs to
    /// completion and the faults are returned together as `CallbackFailed`.
    pub fn run_update(
        &self,
        mask: UpdateType,
        queue: &EventQueue,
        registry: &DeviceRegistry,
    ) -> TactileResult<UpdateReport> {
        let state = self.state.get();
        if state != SchedulerState::Idle {
            self.stats.borrow_mut().reentrant_calls += 1;
            warn!(%mask, %state, "update requested from inside an update callback");
            return Err(TactileError::Reentrancy(mask));
        }
        if mask.unknown_bits() != 0 {
            debug!(bits = mask.unknown_bits(), "ignoring unknown update phase bits");
        }

        let mut report = UpdateReport::default();
        let mut faults = Vec::new();
        {
            let _idle = ReturnToIdle(&self.state);
            for phase in mask.phases() {
                let (events, devices) = self.run_phase(phase, queue, registry, &mut faults);
                report.phases |= phase;
                report.events_delivered += events;
                report.devices_discovered += devices;

                let mut stats = self.stats.borrow_mut();
                stats.phase_runs[phase.bits().trailing_zeros() as usize] += 1;
                stats.events_delivered += events as u64;
            }
        }

        self.finish(faults).map(|_| report)
    }

    fn run_phase(
        &self,
        phase: UpdateType,
        queue: &EventQueue,
        registry: &DeviceRegistry,
        faults: &mut Vec<CallbackFault>,
    ) -> (usize, usize) {
        self.state.set(SchedulerState::RunningBeforeUpdate);
        if let Some(Err(payload)) = self.before_update.invoke(|callback| callback(phase)) {
            faults.push(fault(CallbackKind::BeforeUpdate, phase, None, payload));
        }

        self.state.set(SchedulerState::Dispatching);
        let mut events = 0;
        // Without a consumer the events stay queued for a later phase
        if self.update.is_set() {
            let mut drain = self.drain.borrow_mut();
            events = queue.drain_for(phase, &mut drain);
            let batch = drain.batch();
            if let Some(Err(payload)) = self.update.invoke(|callback| callback(phase, batch)) {
                faults.push(fault(CallbackKind::Update, phase, None, payload));
            }
            drain.clear();
        }

        self.state.set(SchedulerState::RunningDiscovery);
        let devices = self.deliver_discoveries(phase, registry, faults);

        debug!(%phase, events, devices, "update phase complete");
        (events, devices)
    }

    fn deliver_discoveries(
        &self,
        phase: UpdateType,
        registry: &DeviceRegistry,
        faults: &mut Vec<CallbackFault>,
    ) -> usize {
        let mut delivered = 0;
        // Announcements stay pending until someone is listening
        while self.device_discovered.is_set() {
            let Some((device, description)) = registry.pop_pending() else {
                break;
            };
            delivered += 1;
            if let Some(Err(payload)) = self
                .device_discovered
                .invoke(|callback| callback(device, &description))
            {
                faults.push(fault(CallbackKind::DeviceDiscovered, phase, Some(device), payload));
            }
        }
        self.stats.borrow_mut().devices_delivered += delivered as u64;
        delivered
    }

    /// Run the shutdown callback if one is registered
    pub fn run_shutdown(&self) -> TactileResult<()> {
        let callback = self.shutdown.borrow_mut().take();
        let mut faults = Vec::new();
        if let Some(callback) = callback {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                faults.push(fault(CallbackKind::Shutdown, UpdateType::NONE, None, payload));
            }
        }
        self.finish(faults)
    }

    fn finish(&self, faults: Vec<CallbackFault>) -> TactileResult<()> {
        if faults.is_empty() {
            return Ok(());
        }
        self.stats.borrow_mut().callback_faults += faults.len() as u64;
        for fault in &faults {
            warn!(kind = %fault.kind, phase = %fault.phase, device = ?fault.device, message = %fault.message, "consumer callback failed");
        }
        Err(TactileError::CallbackFailed { faults })
    }
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UpdateScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateScheduler")
            .field("state", &self.state.get())
            .field("before_update", &self.before_update.is_set())
            .field("update", &self.update.is_set())
            .field("device_discovered", &self.device_discovered.is_set())
            .finish()
    }
}

fn fault(
    kind: CallbackKind,
    phase: UpdateType,
    device: Option<DeviceId>,
    payload: Box<dyn Any + Send>,
) -> CallbackFault {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_string()
    };
    CallbackFault {
        kind,
        phase,
        device,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OverflowPolicy;
    use std::rc::Rc;
    use tactile_core::{event_types, EventRecord};

    struct Fixture {
        scheduler: Rc<UpdateScheduler>,
        queue: Rc<EventQueue>,
        registry: Rc<DeviceRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                scheduler: Rc::new(UpdateScheduler::new()),
                queue: Rc::new(EventQueue::new(4096, 256, OverflowPolicy::Reject)),
                registry: Rc::new(DeviceRegistry::new()),
            }
        }

        fn run(&self, mask: UpdateType) -> TactileResult<UpdateReport> {
            self.scheduler.run_update(mask, &self.queue, &self.registry)
        }

        fn push(&self, tag: u8) {
            let record = EventRecord::new(event_types::STATE, DeviceId::new(1), vec![tag]);
            self.queue.enqueue(&record.encode()).unwrap();
        }

        fn discover(&self, name: &str) -> DeviceId {
            let id = self.registry.allocate_id().unwrap();
            self.registry.announce(id, DeviceDescription::from(name)).unwrap();
            id
        }
    }

    type Log = Rc<RefCell<Vec<String>>>;

    fn log() -> Log {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn test_phases_run_in_canonical_order() {
        let fx = Fixture::new();
        let seen = log();
        {
            let seen = Rc::clone(&seen);
            fx.scheduler
                .set_on_before_update(move |phase| seen.borrow_mut().push(format!("before {}", phase)));
        }
        {
            let seen = Rc::clone(&seen);
            fx.scheduler.set_on_update(move |phase, batch| {
                seen.borrow_mut().push(format!("update {} {}", phase, batch.len()))
            });
        }
        fx.push(1);

        let report = fx.run(UpdateType::FIXED | UpdateType::DYNAMIC).unwrap();
        assert_eq!(report.phases, UpdateType::DYNAMIC | UpdateType::FIXED);
        assert_eq!(report.events_delivered, 1);
        assert_eq!(
            *seen.borrow(),
            vec![
                "before Dynamic",
                "update Dynamic 1",
                "before Fixed",
                "update Fixed 0",
            ]
        );
        assert_eq!(fx.scheduler.state(), SchedulerState::Idle);
        assert_eq!(fx.scheduler.stats().runs_of(UpdateType::FIXED), 1);
    }

    #[test]
    fn test_before_update_injection_lands_in_same_drain() {
        let fx = Fixture::new();
        {
            let queue = Rc::clone(&fx.queue);
            fx.scheduler.set_on_before_update(move |_| {
                let record = EventRecord::new(event_types::DELTA, DeviceId::new(9), vec![42]);
                queue.enqueue(&record.encode()).unwrap();
            });
        }
        let delivered = log();
        {
            let delivered = Rc::clone(&delivered);
            fx.scheduler.set_on_update(move |_, batch| {
                for event in batch {
                    delivered.borrow_mut().push(format!("{}", event.payload()[0]));
                }
            });
        }

        fx.run(UpdateType::DYNAMIC).unwrap();
        assert_eq!(*delivered.borrow(), vec!["42"]);
    }

    #[test]
    fn test_missing_callbacks_are_no_ops() {
        let fx = Fixture::new();
        fx.push(1);
        fx.discover("pad");

        let report = fx.run(UpdateType::ALL).unwrap();
        assert_eq!(report.events_delivered, 0);
        assert_eq!(report.devices_discovered, 0);

        // Nothing was lost while nobody listened
        assert_eq!(fx.queue.len(), 1);
        assert_eq!(fx.registry.pending_count(), 1);
    }

    #[test]
    fn test_reentrant_run_is_rejected_without_side_effects() {
        let fx = Fixture::new();
        let inner_result: Rc<RefCell<Option<TactileResult<UpdateReport>>>> = Rc::new(RefCell::new(None));
        {
            let scheduler = Rc::downgrade(&fx.scheduler);
            let queue = Rc::clone(&fx.queue);
            let registry = Rc::clone(&fx.registry);
            let inner_result = Rc::clone(&inner_result);
            fx.scheduler.set_on_update(move |_, _| {
                if let Some(scheduler) = scheduler.upgrade() {
                    let state_before = scheduler.state();
                    let result = scheduler.run_update(UpdateType::FIXED, &queue, &registry);
                    assert_eq!(scheduler.state(), state_before);
                    *inner_result.borrow_mut() = Some(result);
                }
            });
        }
        fx.push(1);

        let report = fx.run(UpdateType::DYNAMIC).unwrap();
        assert_eq!(report.events_delivered, 1);
        assert!(matches!(
            inner_result.borrow_mut().take(),
            Some(Err(TactileError::Reentrancy(mask))) if mask == UpdateType::FIXED
        ));

        let stats = fx.scheduler.stats();
        assert_eq!(stats.runs_of(UpdateType::FIXED), 0);
        assert_eq!(stats.runs_of(UpdateType::DYNAMIC), 1);
        assert_eq!(stats.reentrant_calls, 1);
        assert_eq!(fx.scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_late_discovery_registration_replays_in_order() {
        let fx = Fixture::new();
        let first = fx.discover("first");
        let second = fx.discover("second");

        let seen: Rc<RefCell<Vec<DeviceId>>> = Rc::new(RefCell::new(Vec::new()));
        let callback_seen = Rc::clone(&seen);
        let replayed = fx
            .scheduler
            .set_on_device_discovered(
                move |device, _| callback_seen.borrow_mut().push(device),
                &fx.registry,
            )
            .unwrap();

        assert_eq!(replayed, 2);
        assert_eq!(*seen.borrow(), vec![first, second]);

        let third = fx.discover("third");
        fx.run(UpdateType::DYNAMIC).unwrap();
        fx.run(UpdateType::DYNAMIC).unwrap();
        assert_eq!(*seen.borrow(), vec![first, second, third]);
    }

    #[test]
    fn test_callback_faults_are_isolated_and_reported() {
        let fx = Fixture::new();
        let bad = fx.discover("bad");
        let good = fx.discover("good");

        let seen: Rc<RefCell<Vec<DeviceId>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = Rc::clone(&seen);
            fx.scheduler.set_on_update(|_, _| panic!("update exploded"));
            // Registered mid-run so nothing is replayed yet
            fx.scheduler.state.set(SchedulerState::Dispatching);
            fx.scheduler
                .set_on_device_discovered(
                    move |device, _| {
                        if device == bad {
                            panic!("cannot parse description");
                        }
                        seen.borrow_mut().push(device);
                    },
                    &fx.registry,
                )
                .unwrap();
            fx.scheduler.state.set(SchedulerState::Idle);
        }
        fx.push(1);
        fx.push(2);

        let faults = match fx.run(UpdateType::DYNAMIC) {
            Err(TactileError::CallbackFailed { faults }) => faults,
            other => panic!("expected CallbackFailed, got {:?}", other),
        };
        assert_eq!(faults.len(), 2);
        assert_eq!(faults[0].kind, CallbackKind::Update);
        assert_eq!(faults[0].message, "update exploded");
        assert_eq!(faults[1].kind, CallbackKind::DeviceDiscovered);
        assert_eq!(faults[1].device, Some(bad));

        // The good device was still delivered and the drain still consumed
        assert_eq!(*seen.borrow(), vec![good]);
        assert!(fx.queue.is_empty());
        assert_eq!(fx.scheduler.state(), SchedulerState::Idle);

        // The panicking callbacks stay registered; the next run is clean
        fx.scheduler.clear_callback(CallbackKind::Update);
        assert!(fx.scheduler.has_callback(CallbackKind::DeviceDiscovered));
        assert!(fx.run(UpdateType::DYNAMIC).is_ok());
        assert_eq!(fx.scheduler.stats().callback_faults, 2);
    }

    #[test]
    fn test_reregistration_from_inside_callback_wins() {
        let fx = Fixture::new();
        let seen = log();
        {
            let scheduler = Rc::downgrade(&fx.scheduler);
            let seen = Rc::clone(&seen);
            fx.scheduler.set_on_update(move |_, _| {
                seen.borrow_mut().push("old".into());
                if let Some(scheduler) = scheduler.upgrade() {
                    let seen = Rc::clone(&seen);
                    scheduler.set_on_update(move |_, _| seen.borrow_mut().push("new".into()));
                }
            });
        }

        fx.run(UpdateType::DYNAMIC | UpdateType::FIXED).unwrap();
        assert_eq!(*seen.borrow(), vec!["old", "new"]);
    }

    #[test]
    fn test_shutdown_runs_once() {
        let scheduler = UpdateScheduler::new();
        let count = Rc::new(Cell::new(0));
        {
            let count = Rc::clone(&count);
            scheduler.set_on_shutdown(move || count.set(count.get() + 1));
        }
        scheduler.run_shutdown().unwrap();
        scheduler.run_shutdown().unwrap();
        assert_eq!(count.get(), 1);
        assert!(!scheduler.has_callback(CallbackKind::Shutdown));
    }
}
