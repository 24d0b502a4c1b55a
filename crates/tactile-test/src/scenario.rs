//! End-to-end scenario harness
//!
//! Runs simulated producer threads against a real runtime while the calling
//! thread plays the consumer, then checks the delivery invariants:
//! - every event delivered exactly once
//! - per-producer FIFO order and non-decreasing timestamps
//! - event ids increasing across the whole delivery
//! - every device discovered exactly once

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use tactile_core::{event_types, DeviceId, EventId, InputTime, UpdateType, RECORD_ALIGNMENT};
use tactile_runtime::{InputRuntime, OverflowPolicy, RuntimeConfig};

use crate::simulator::{payload_seq, DeviceSimulator, Pacing, SimulatedDeviceConfig};
use crate::{SimulationError, SimulationResult};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Scenario configuration
#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    pub producers: usize,
    pub events_per_producer: u32,
    pub payload_len: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Phases run on every consumer tick
    pub update_mask: UpdateType,
    pub pacing: Pacing,
    /// Give up if delivery is not complete by then
    pub timeout: Duration,
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            producers: 3,
            events_per_producer: 100,
            payload_len: 16,
            queue_capacity: 64 * 1024,
            overflow: OverflowPolicy::Reject,
            update_mask: UpdateType::DEFAULT,
            pacing: Pacing::Burst,
            timeout: Duration::from_secs(20),
            seed: 7,
        }
    }
}

impl ScenarioConfig {
    pub fn minimal() -> Self {
        Self {
            producers: 1,
            events_per_producer: 10,
            ..Self::default()
        }
    }

    /// Many producers hammering one queue
    pub fn contended() -> Self {
        Self {
            producers: 8,
            events_per_producer: 1_000,
            ..Self::default()
        }
    }

    /// A queue far too small for the load, so producers see `QueueFull`
    pub fn back_pressure() -> Self {
        Self {
            producers: 4,
            events_per_producer: 500,
            queue_capacity: 1024,
            overflow: OverflowPolicy::Reject,
            ..Self::default()
        }
    }

    /// A tiny queue that is allowed to grow
    pub fn growing() -> Self {
        Self {
            producers: 4,
            events_per_producer: 500,
            queue_capacity: 256,
            overflow: OverflowPolicy::Grow,
            ..Self::default()
        }
    }

    pub fn with_update_mask(mut self, mask: UpdateType) -> Self {
        self.update_mask = mask;
        self
    }

    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            update_mask: self.update_mask,
            queue_capacity: self.queue_capacity,
            overflow: self.overflow,
            // Largest record whose padded size still fits the queue
            max_record_size: RuntimeConfig::default()
                .max_record_size
                .min(self.queue_capacity / RECORD_ALIGNMENT * RECORD_ALIGNMENT),
            ..RuntimeConfig::default()
        }
    }

    fn expected_events(&self) -> usize {
        self.producers * self.events_per_producer as usize
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// One event as the consumer saw it
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeliveredEvent {
    pub device: DeviceId,
    pub seq: u32,
    pub id: EventId,
    pub time: InputTime,
    pub phase: UpdateType,
    /// Index of the update callback invocation that delivered it
    pub drain: usize,
}

/// Result of a scenario run
#[derive(Clone, Debug)]
pub struct ScenarioResult {
    pub events_expected: usize,
    pub events_delivered: usize,
    /// Update callback invocations
    pub drains: usize,
    /// `QueueFull` refusals the producers retried
    pub retries: u64,
    pub devices_discovered: usize,
    pub violations: Vec<String>,
}

impl ScenarioResult {
    pub fn passed(&self) -> bool {
        self.violations.is_empty() && self.events_delivered == self.events_expected
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// Scenario harness
pub struct ScenarioHarness {
    config: ScenarioConfig,
}

impl ScenarioHarness {
    pub fn new(config: ScenarioConfig) -> Self {
        Self { config }
    }

    /// Run the scenario on the calling thread as consumer
    pub fn run(&self) -> SimulationResult<ScenarioResult> {
        let config = &self.config;
        let runtime_config = config.runtime_config();
        runtime_config.init_logging();
        let runtime = InputRuntime::new(runtime_config)?;

        let delivered: Rc<RefCell<Vec<DeliveredEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let drains = Rc::new(RefCell::new(0usize));
        {
            let delivered = Rc::clone(&delivered);
            let drains = Rc::clone(&drains);
            runtime.set_on_update(move |phase, batch| {
                let drain = {
                    let mut drains = drains.borrow_mut();
                    *drains += 1;
                    *drains
                };
                let mut delivered = delivered.borrow_mut();
                for event in batch.iter().filter(|e| e.event_type() == event_types::STATE) {
                    delivered.push(DeliveredEvent {
                        device: event.device(),
                        seq: payload_seq(event.payload()).unwrap_or(u32::MAX),
                        id: event.id(),
                        time: event.time(),
                        phase,
                        drain,
                    });
                }
            });
        }

        let discovered: Rc<RefCell<Vec<DeviceId>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let discovered = Rc::clone(&discovered);
            runtime.set_on_device_discovered(move |device, _| discovered.borrow_mut().push(device))?;
        }

        let mut simulator = DeviceSimulator::new(runtime.sender(), runtime.announcer());
        let mut devices = Vec::with_capacity(config.producers);
        for index in 0..config.producers {
            let device_config = SimulatedDeviceConfig {
                payload_len: config.payload_len,
                event_count: config.events_per_producer,
                pacing: config.pacing,
                seed: config.seed.wrapping_add(index as u64),
                ..SimulatedDeviceConfig::default()
            };
            devices.push(simulator.spawn(device_config)?);
        }

        let expected = config.expected_events();
        let deadline = Instant::now() + config.timeout;
        loop {
            runtime.run_scheduled_update()?;
            let count = delivered.borrow().len();
            if count >= expected {
                break;
            }
            if Instant::now() > deadline {
                simulator.stop();
                simulator.join()?;
                return Err(SimulationError::Timeout {
                    delivered: count,
                    expected,
                });
            }
            std::thread::sleep(Duration::from_micros(200));
        }

        let reports = simulator.join()?;
        // Anything still queued would be a duplicate or a stray
        runtime.run_scheduled_update()?;

        let delivered = delivered.borrow();
        let discovered = discovered.borrow();
        let mut violations = Vec::new();
        violations.extend(check_exactly_once(&delivered, &devices, config.events_per_producer));
        violations.extend(check_per_producer_order(&delivered));
        violations.extend(check_id_order(&delivered));
        violations.extend(check_discovery(&discovered, &devices));

        let result = ScenarioResult {
            events_expected: expected,
            events_delivered: delivered.len(),
            drains: *drains.borrow(),
            retries: reports.iter().map(|report| report.retries).sum(),
            devices_discovered: discovered.len(),
            violations,
        };
        info!(
            delivered = result.events_delivered,
            drains = result.drains,
            retries = result.retries,
            violations = result.violations.len(),
            "scenario finished"
        );
        Ok(result)
    }
}

// ============================================================================
// INVARIANT CHECKS
// ============================================================================

/// Every (device, seq) pair delivered once, none missing
pub fn check_exactly_once(
    delivered: &[DeliveredEvent],
    devices: &[DeviceId],
    events_per_device: u32,
) -> Vec<String> {
    let mut violations = Vec::new();
    let mut seen = HashSet::new();
    for event in delivered {
        if !seen.insert((event.device, event.seq)) {
            violations.push(format!(
                "device {} seq {} delivered more than once",
                event.device, event.seq
            ));
        }
        if !devices.contains(&event.device) {
            violations.push(format!("event from unexpected device {}", event.device));
        }
    }
    for device in devices {
        let missing = (0..events_per_device)
            .filter(|seq| !seen.contains(&(*device, *seq)))
            .count();
        if missing > 0 {
            violations.push(format!("device {} lost {} events", device, missing));
        }
    }
    violations
}

/// Per producer, sequence numbers increase and timestamps never decrease
pub fn check_per_producer_order(delivered: &[DeliveredEvent]) -> Vec<String> {
    let mut violations = Vec::new();
    let mut last: HashMap<DeviceId, (u32, InputTime)> = HashMap::new();
    for event in delivered {
        if let Some((seq, time)) = last.get(&event.device) {
            if event.seq <= *seq {
                violations.push(format!(
                    "device {} seq {} delivered after seq {}",
                    event.device, event.seq, seq
                ));
            }
            if event.time < *time {
                violations.push(format!(
                    "device {} seq {} timestamp runs backwards",
                    event.device, event.seq
                ));
            }
        }
        last.insert(event.device, (event.seq, event.time));
    }
    violations
}

/// Event ids follow delivery order
pub fn check_id_order(delivered: &[DeliveredEvent]) -> Vec<String> {
    delivered
        .windows(2)
        .filter(|pair| pair[1].id <= pair[0].id)
        .map(|pair| format!("event id {:?} delivered after {:?}", pair[1].id, pair[0].id))
        .collect()
}

/// Each device discovered exactly once
pub fn check_discovery(discovered: &[DeviceId], devices: &[DeviceId]) -> Vec<String> {
    let mut violations = Vec::new();
    for device in devices {
        let count = discovered.iter().filter(|d| *d == device).count();
        if count != 1 {
            violations.push(format!("device {} discovered {} times", device, count));
        }
    }
    debug!(discovered = discovered.len(), "discovery checked");
    violations
}

// ============================================================================
// STANDARD SCENARIOS
// ============================================================================

pub fn run_minimal_scenario() -> SimulationResult<ScenarioResult> {
    ScenarioHarness::new(ScenarioConfig::minimal()).run()
}

pub fn run_contended_scenario() -> SimulationResult<ScenarioResult> {
    ScenarioHarness::new(ScenarioConfig::contended()).run()
}

pub fn run_back_pressure_scenario() -> SimulationResult<ScenarioResult> {
    ScenarioHarness::new(ScenarioConfig::back_pressure()).run()
}

pub fn run_growing_scenario() -> SimulationResult<ScenarioResult> {
    ScenarioHarness::new(ScenarioConfig::growing()).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::{Arc, Barrier};

    use proptest::prelude::*;
    use tactile_core::{
        CallbackKind, CommandResult, DeviceCommand, DeviceDescription, FourCC, SetRumble,
        TactileError, TactileResult,
    };
    use tactile_runtime::UpdateReport;

    use crate::simulator::SimulatedPad;

    fn assert_passed(result: &ScenarioResult) {
        assert!(result.passed(), "violations: {:?}", result.violations);
    }

    #[test]
    fn test_minimal_scenario() {
        let result = run_minimal_scenario().unwrap();
        assert_passed(&result);
        assert_eq!(result.devices_discovered, 1);
    }

    #[test]
    fn test_contended_scenario() {
        let result = run_contended_scenario().unwrap();
        assert_passed(&result);
        assert_eq!(result.events_delivered, 8_000);
    }

    #[test]
    fn test_back_pressure_loses_nothing() {
        let result = run_back_pressure_scenario().unwrap();
        assert_passed(&result);
    }

    #[test]
    fn test_growing_queue_loses_nothing() {
        let result = run_growing_scenario().unwrap();
        assert_passed(&result);
        assert_eq!(result.retries, 0);
    }

    #[test]
    fn test_all_phases_mask() {
        let config = ScenarioConfig::default().with_update_mask(UpdateType::ALL);
        let result = ScenarioHarness::new(config).run().unwrap();
        assert_passed(&result);
    }

    #[test]
    fn test_two_threads_interleaved_single_drain() {
        let runtime = InputRuntime::new(RuntimeConfig::default()).unwrap();
        let a = DeviceId::new(1);
        let b = DeviceId::new(2);
        let barrier = Arc::new(Barrier::new(2));

        let spawn = |device: DeviceId, times: Vec<f64>| {
            let sender = runtime.sender();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for time in times {
                    sender
                        .send_at(device, event_types::STATE, &[], InputTime::from_secs_f64(time))
                        .unwrap();
                    std::thread::yield_now();
                }
            })
        };
        let thread_a = spawn(a, vec![1.0, 2.0, 3.0]);
        let thread_b = spawn(b, vec![4.0, 5.0]);
        thread_a.join().unwrap();
        thread_b.join().unwrap();

        let seen: Rc<RefCell<Vec<(DeviceId, f64)>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = Rc::clone(&seen);
            runtime.set_on_update(move |_, batch| {
                seen.borrow_mut()
                    .extend(batch.iter().map(|e| (e.device(), e.time().as_secs_f64())));
            });
        }
        let report = runtime.run_update(UpdateType::DYNAMIC).unwrap();
        assert_eq!(report.events_delivered, 5);

        let seen = seen.borrow();
        let from = |device: DeviceId| -> Vec<f64> {
            seen.iter().filter(|(d, _)| *d == device).map(|(_, t)| *t).collect()
        };
        assert_eq!(from(a), vec![1.0, 2.0, 3.0]);
        assert_eq!(from(b), vec![4.0, 5.0]);
    }

    #[test]
    fn test_command_to_unallocated_id_leaves_buffer_untouched() {
        let runtime = InputRuntime::new(RuntimeConfig::default()).unwrap();
        runtime.announcer().discover("pad").unwrap();

        let mut command = DeviceCommand::with_payload(FourCC::new(b"CALB"), vec![0xAA; 12]);
        let before = command.clone();
        let never_allocated = DeviceId::new(10_000);
        assert!(matches!(
            runtime.send_command(never_allocated, &mut command),
            Err(TactileError::UnknownDevice(id)) if id == never_allocated
        ));
        assert_eq!(command, before);
    }

    #[test]
    fn test_late_discovery_callback_replays_before_new_devices() {
        let runtime = InputRuntime::new(RuntimeConfig::default()).unwrap();
        let announcer = runtime.announcer();
        let first = announcer.discover("first").unwrap();
        let second = announcer.discover("second").unwrap();

        let seen: Rc<RefCell<Vec<(DeviceId, String)>>> = Rc::new(RefCell::new(Vec::new()));
        let replayed = {
            let seen = Rc::clone(&seen);
            runtime
                .set_on_device_discovered(move |device, description: &DeviceDescription| {
                    seen.borrow_mut().push((device, description.to_string()))
                })
                .unwrap()
        };
        assert_eq!(replayed, 2);
        assert_eq!(
            *seen.borrow(),
            vec![(first, "first".to_string()), (second, "second".to_string())]
        );

        let third = announcer.discover("third").unwrap();
        runtime.run_update(UpdateType::DYNAMIC).unwrap();
        let order: Vec<DeviceId> = seen.borrow().iter().map(|(d, _)| *d).collect();
        assert_eq!(order, vec![first, second, third]);
    }

    #[test]
    fn test_combined_mask_runs_canonical_order() {
        let runtime = InputRuntime::new(RuntimeConfig::default()).unwrap();
        let trace: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let trace = Rc::clone(&trace);
            runtime.set_on_before_update(move |phase| trace.borrow_mut().push(format!("before:{}", phase)));
        }
        {
            let trace = Rc::clone(&trace);
            runtime.set_on_update(move |phase, batch| {
                trace.borrow_mut().push(format!("update:{}:{}", phase, batch.len()))
            });
        }
        runtime.queue_event(DeviceId::new(1), event_types::STATE, &[1]).unwrap();

        runtime.run_update(UpdateType::FIXED | UpdateType::DYNAMIC).unwrap();
        assert_eq!(
            *trace.borrow(),
            vec!["before:Dynamic", "update:Dynamic:1", "before:Fixed", "update:Fixed:0"]
        );
    }

    #[test]
    fn test_recursive_update_is_rejected() {
        let runtime = Rc::new(InputRuntime::new(RuntimeConfig::default()).unwrap());
        let inner: Rc<RefCell<Option<TactileResult<UpdateReport>>>> = Rc::new(RefCell::new(None));
        {
            let weak = Rc::downgrade(&runtime);
            let inner = Rc::clone(&inner);
            runtime.set_on_update(move |_, _| {
                if let Some(runtime) = weak.upgrade() {
                    *inner.borrow_mut() = Some(runtime.run_update(UpdateType::DYNAMIC));
                }
            });
        }
        runtime.queue_event(DeviceId::new(1), event_types::STATE, &[]).unwrap();

        let report = runtime.run_update(UpdateType::DYNAMIC).unwrap();
        assert_eq!(report.events_delivered, 1);
        assert!(matches!(
            inner.borrow_mut().take(),
            Some(Err(TactileError::Reentrancy(_)))
        ));

        let stats = runtime.stats();
        assert_eq!(stats.runs_of(UpdateType::DYNAMIC), 1);
        assert_eq!(stats.events_delivered, 1);
        assert_eq!(stats.reentrant_updates, 1);

        // Scheduler state is intact: the next run behaves normally
        runtime.clear_callback(CallbackKind::Update);
        assert!(runtime.run_update(UpdateType::DYNAMIC).is_ok());
    }

    #[test]
    fn test_allocation_never_returns_sentinel_or_live_id() {
        let runtime = InputRuntime::new(RuntimeConfig::default()).unwrap();
        let announcer = runtime.announcer();
        let mut live = HashSet::new();

        announcer.announce(DeviceId::new(5), "external").unwrap();
        live.insert(DeviceId::new(5));
        for round in 0..200 {
            let id = runtime.allocate_device_id().unwrap();
            assert!(id.is_valid());
            assert!(live.insert(id), "id {} handed out while live", id);
            announcer.announce(id, format!("device {}", round)).unwrap();
            if round % 3 == 0 {
                runtime.remove_device(id).unwrap();
                live.remove(&id);
            }
        }
    }

    #[test]
    fn test_discovery_callback_can_command_device() {
        let runtime = InputRuntime::new(RuntimeConfig::default()).unwrap();
        let channel = runtime.command_channel();
        let results: Rc<RefCell<Vec<CommandResult>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let results = Rc::clone(&results);
            runtime
                .set_on_device_discovered(move |device, _| {
                    let mut rumble = DeviceCommand::from_typed(&SetRumble {
                        low_frequency: 1.0,
                        high_frequency: 0.5,
                    });
                    results.borrow_mut().push(channel.send(device, &mut rumble).unwrap());
                })
                .unwrap();
        }

        let pad = SimulatedPad::new();
        let device = runtime
            .announcer()
            .discover_with_commands("pad", pad.clone())
            .unwrap();
        runtime.run_update(UpdateType::DYNAMIC).unwrap();

        assert_eq!(*results.borrow(), vec![CommandResult::SUCCESS]);
        assert_eq!(pad.state().rumble.low_frequency, 1.0);
        assert!(runtime.devices().iter().any(|(d, _)| *d == device));
    }

    #[test]
    fn test_missing_update_callback_keeps_events() {
        let runtime = InputRuntime::new(RuntimeConfig::default()).unwrap();
        runtime.queue_event(DeviceId::new(1), event_types::STATE, &[1]).unwrap();
        runtime.run_update(UpdateType::ALL).unwrap();

        let count = Rc::new(Cell::new(0));
        {
            let count = Rc::clone(&count);
            runtime.set_on_update(move |_, batch| count.set(count.get() + batch.len()));
        }
        runtime.run_update(UpdateType::DYNAMIC).unwrap();
        assert_eq!(count.get(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_random_load_delivers_everything_once(
            producers in 1usize..5,
            events in 1u32..200,
            capacity in 512usize..8192,
            grow in any::<bool>(),
        ) {
            let config = ScenarioConfig {
                producers,
                events_per_producer: events,
                queue_capacity: capacity,
                overflow: if grow { OverflowPolicy::Grow } else { OverflowPolicy::Reject },
                ..ScenarioConfig::default()
            };
            let result = ScenarioHarness::new(config).run().unwrap();
            prop_assert!(result.passed(), "violations: {:?}", result.violations);
        }
    }
}
