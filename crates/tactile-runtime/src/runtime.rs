//! Input Runtime - the consumer-facing facade
//!
//! One explicitly constructed `InputRuntime` owns the event queue, device
//! registry, command channel and time base. It lives on the consumer
//! context and is neither `Send` nor `Sync`. Producers get cheap cloneable
//! handles instead:
//! - [`EventSender`] to queue events from any thread
//! - [`DeviceAnnouncer`] to allocate ids, announce and remove devices
//! - `Arc<CommandChannel>` to talk to devices directly

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use tactile_core::{
    event_types, CallbackKind, CommandInfo, CommandResult, DeviceCommand, DeviceDescription,
    DeviceId, EventBatch, EventHeader, EventId, EventRecord, FourCC, InputTime, TactileError,
    TactileResult, UpdateType,
};
use tactile_time::TimeBase;

use crate::config::{validate_polling_frequency, validate_update_mask};
use crate::{
    Analytics, AnalyticsOutcome, AnalyticsSink, Announcement, CommandChannel, CommandHandler,
    DeviceRegistry, EventQueue, RuntimeConfig, SchedulerState, UpdateReport, UpdateScheduler,
};

/// State shared between the runtime and its producer handles
struct Shared {
    queue: EventQueue,
    registry: Arc<DeviceRegistry>,
    commands: Arc<CommandChannel>,
    time_base: Arc<TimeBase>,
    /// Polling frequency in Hz, as f64 bits
    polling_frequency: AtomicU64,
    /// Held while a device is being removed
    removals: Mutex<()>,
}

impl Shared {
    fn polling_frequency(&self) -> f64 {
        f64::from_bits(self.polling_frequency.load(Ordering::Relaxed))
    }

    fn remove_device(&self, device: DeviceId) -> TactileResult<DeviceDescription> {
        let _removing = self.removals.lock();
        if !self.registry.contains(device) {
            return Err(TactileError::UnknownDevice(device));
        }

        // The removal event goes first: if the queue refuses it the device
        // stays live and the error reaches the caller
        let header = EventHeader::new(event_types::DEVICE_REMOVED, device, 0, self.time_base.now());
        self.queue.enqueue_parts(&header, &[])?;

        let description = self
            .registry
            .remove(device)
            .ok_or(TactileError::UnknownDevice(device))?;
        self.commands.detach(device);
        Ok(description)
    }
}

/// Snapshot of runtime counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Update runs per phase, in canonical order
    pub phase_runs: [u64; 5],
    pub events_queued: u64,
    pub events_delivered: u64,
    pub events_rejected: u64,
    pub devices_discovered: u64,
    pub devices_delivered: u64,
    pub devices_removed: u64,
    pub commands_sent: u64,
    pub callback_faults: u64,
    pub reentrant_updates: u64,
    pub analytics_sent: u64,
    pub analytics_rejected: u64,
}

impl RuntimeStats {
    pub fn runs_of(&self, phase: UpdateType) -> u64 {
        if !phase.is_single_phase() || phase.unknown_bits() != 0 {
            return 0;
        }
        self.phase_runs[phase.bits().trailing_zeros() as usize]
    }

    pub fn total_updates(&self) -> u64 {
        self.phase_runs.iter().sum()
    }
}

/// The input runtime
pub struct InputRuntime {
    shared: Arc<Shared>,
    scheduler: UpdateScheduler,
    analytics: Analytics,
    update_mask: Cell<UpdateType>,
    shut_down: Cell<bool>,
}

impl InputRuntime {
    /// Create a runtime driven by the OS monotonic clock
    pub fn new(config: RuntimeConfig) -> TactileResult<Self> {
        Self::with_time_base(config, Arc::new(TimeBase::new()))
    }

    pub fn with_time_base(config: RuntimeConfig, time_base: Arc<TimeBase>) -> TactileResult<Self> {
        config.validate()?;

        let registry = Arc::new(DeviceRegistry::new());
        let shared = Arc::new(Shared {
            queue: EventQueue::new(config.queue_capacity, config.max_record_size, config.overflow),
            commands: Arc::new(CommandChannel::new(Arc::clone(&registry))),
            registry,
            time_base,
            polling_frequency: AtomicU64::new(config.polling_frequency.to_bits()),
            removals: Mutex::new(()),
        });

        info!(
            polling_frequency = config.polling_frequency,
            update_mask = %config.update_mask,
            queue_capacity = config.queue_capacity,
            overflow = ?config.overflow,
            "input runtime started"
        );

        Ok(InputRuntime {
            shared,
            scheduler: UpdateScheduler::new(),
            analytics: Analytics::new(),
            update_mask: Cell::new(config.update_mask),
            shut_down: Cell::new(false),
        })
    }

    // ---- producer handles ----

    pub fn sender(&self) -> EventSender {
        EventSender {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn announcer(&self) -> DeviceAnnouncer {
        DeviceAnnouncer {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn command_channel(&self) -> Arc<CommandChannel> {
        Arc::clone(&self.shared.commands)
    }

    pub fn time_base(&self) -> &Arc<TimeBase> {
        &self.shared.time_base
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.shared.registry
    }

    pub fn queue(&self) -> &EventQueue {
        &self.shared.queue
    }

    /// Current input time
    pub fn now(&self) -> InputTime {
        self.shared.time_base.now()
    }

    // ---- devices ----

    pub fn allocate_device_id(&self) -> TactileResult<DeviceId> {
        self.shared.registry.allocate_id()
    }

    pub fn announce_device(
        &self,
        device: DeviceId,
        description: impl Into<DeviceDescription>,
    ) -> TactileResult<Announcement> {
        self.shared.registry.announce(device, description.into())
    }

    /// Remove a live device: a `DREM` event for it is queued, then its id
    /// is retired, its description dropped, its command handler detached
    /// and an undelivered discovery cancelled.
    ///
    /// If the queue refuses the `DREM` event (`QueueFull`, `Shutdown`) the
    /// device is left untouched and the error is returned.
    pub fn remove_device(&self, device: DeviceId) -> TactileResult<DeviceDescription> {
        self.shared.remove_device(device)
    }

    /// Live devices in discovery order
    pub fn devices(&self) -> Vec<(DeviceId, DeviceDescription)> {
        self.shared.registry.devices()
    }

    // ---- events ----

    /// Queue an event stamped with the current input time
    pub fn queue_event(
        &self,
        device: DeviceId,
        event_type: FourCC,
        payload: &[u8],
    ) -> TactileResult<EventId> {
        self.sender().send(device, event_type, payload)
    }

    /// Queue an already encoded record as is
    pub fn queue_raw(&self, record: &[u8]) -> TactileResult<EventId> {
        self.shared.queue.enqueue(record)
    }

    // ---- commands ----

    pub fn attach_command_handler(
        &self,
        device: DeviceId,
        handler: impl CommandHandler + 'static,
    ) -> TactileResult<()> {
        self.shared.commands.attach(device, handler)
    }

    /// Send a command buffer to a device and block until it answers
    pub fn send_command(
        &self,
        device: DeviceId,
        command: &mut DeviceCommand,
    ) -> TactileResult<CommandResult> {
        self.shared.commands.send(device, command)
    }

    /// Send a typed command; on success the device's answer is read back
    /// into `command`
    pub fn execute_command<C: CommandInfo>(
        &self,
        device: DeviceId,
        command: &mut C,
    ) -> TactileResult<CommandResult> {
        let mut buffer = DeviceCommand::from_typed(command);
        let result = self.send_command(device, &mut buffer)?;
        if result.is_success() {
            *command = buffer.read_typed::<C>()?;
        }
        Ok(result)
    }

    // ---- callbacks ----

    pub fn set_on_before_update<F>(&self, callback: F)
    where
        F: FnMut(UpdateType) + 'static,
    {
        self.scheduler.set_on_before_update(callback);
    }

    pub fn set_on_update<F>(&self, callback: F)
    where
        F: FnMut(UpdateType, EventBatch<'_>) + 'static,
    {
        self.scheduler.set_on_update(callback);
    }

    /// Register the discovery callback. Devices announced before this call
    /// are delivered to it immediately, in discovery order; returns how many.
    pub fn set_on_device_discovered<F>(&self, callback: F) -> TactileResult<usize>
    where
        F: FnMut(DeviceId, &DeviceDescription) + 'static,
    {
        self.scheduler
            .set_on_device_discovered(callback, &self.shared.registry)
    }

    pub fn set_on_shutdown<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.scheduler.set_on_shutdown(callback);
    }

    pub fn clear_callback(&self, kind: CallbackKind) -> bool {
        self.scheduler.clear_callback(kind)
    }

    pub fn has_callback(&self, kind: CallbackKind) -> bool {
        self.scheduler.has_callback(kind)
    }

    // ---- settings ----

    pub fn polling_frequency(&self) -> f64 {
        self.shared.polling_frequency()
    }

    pub fn set_polling_frequency(&self, hz: f64) -> TactileResult<()> {
        validate_polling_frequency(hz)?;
        self.shared
            .polling_frequency
            .store(hz.to_bits(), Ordering::Relaxed);
        debug!(hz, "polling frequency changed");
        Ok(())
    }

    /// Phases run by [`run_scheduled_update`](Self::run_scheduled_update)
    pub fn update_mask(&self) -> UpdateType {
        self.update_mask.get()
    }

    pub fn set_update_mask(&self, mask: UpdateType) -> TactileResult<()> {
        validate_update_mask(mask)?;
        self.update_mask.set(mask);
        debug!(%mask, "update mask changed");
        Ok(())
    }

    // ---- updates ----

    /// Run exactly the phases in `mask`
    pub fn run_update(&self, mask: UpdateType) -> TactileResult<UpdateReport> {
        if self.shut_down.get() {
            return Err(TactileError::Shutdown);
        }
        self.scheduler
            .run_update(mask, &self.shared.queue, &self.shared.registry)
    }

    /// Run the phases of the configured update mask, as a periodic driver would
    pub fn run_scheduled_update(&self) -> TactileResult<UpdateReport> {
        self.run_update(self.update_mask.get())
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    // ---- analytics ----

    pub fn set_analytics_sink(&self, sink: impl AnalyticsSink + 'static) {
        self.analytics.set_sink(sink);
    }

    pub fn register_analytics_event(&self, name: &str, max_per_hour: u32, max_properties: u32) {
        self.analytics
            .register(name, max_per_hour, max_properties, self.now());
    }

    pub fn send_analytics_event(&self, name: &str, payload: &Value) -> AnalyticsOutcome {
        self.analytics.send(name, payload, self.now())
    }

    // ---- lifecycle ----

    pub fn stats(&self) -> RuntimeStats {
        let scheduler = self.scheduler.stats();
        let shared = &self.shared;
        RuntimeStats {
            phase_runs: scheduler.phase_runs,
            events_queued: shared.queue.enqueued_count(),
            events_delivered: scheduler.events_delivered,
            events_rejected: shared.queue.rejected_count(),
            devices_discovered: shared.registry.announced_count(),
            devices_delivered: scheduler.devices_delivered,
            devices_removed: shared.registry.removed_count(),
            commands_sent: shared.commands.sent_count(),
            callback_faults: scheduler.callback_faults,
            reentrant_updates: scheduler.reentrant_calls,
            analytics_sent: self.analytics.sent_count(),
            analytics_rejected: self.analytics.rejected_count(),
        }
    }

    /// Close the queue and run the shutdown callback. Dropping the runtime
    /// does the same; the callback runs at most once.
    pub fn shutdown(self) -> TactileResult<()> {
        self.close()
    }

    fn close(&self) -> TactileResult<()> {
        if self.shut_down.replace(true) {
            return Ok(());
        }
        self.shared.queue.close();
        let result = self.scheduler.run_shutdown();
        info!(
            events_pending = self.shared.queue.len(),
            devices = self.shared.registry.len(),
            "input runtime shut down"
        );
        result
    }
}

impl Drop for InputRuntime {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "shutdown callback failed during drop");
        }
    }
}

impl std::fmt::Debug for InputRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputRuntime")
            .field("state", &self.scheduler.state())
            .field("update_mask", &self.update_mask.get())
            .field("polling_frequency", &self.polling_frequency())
            .field("queue", &self.shared.queue)
            .field("registry", &*self.shared.registry)
            .finish()
    }
}

/// Producer handle for queueing events from any thread
#[derive(Clone)]
pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    /// Queue an event stamped with the current input time
    pub fn send(
        &self,
        device: DeviceId,
        event_type: FourCC,
        payload: &[u8],
    ) -> TactileResult<EventId> {
        self.send_at(device, event_type, payload, self.shared.time_base.now())
    }

    /// Queue an event with a timestamp taken by the producer
    pub fn send_at(
        &self,
        device: DeviceId,
        event_type: FourCC,
        payload: &[u8],
        time: InputTime,
    ) -> TactileResult<EventId> {
        let header = EventHeader::new(event_type, device, payload.len(), time);
        self.shared.queue.enqueue_parts(&header, payload)
    }

    /// Queue a record, keeping its timestamp
    pub fn send_record(&self, record: &EventRecord) -> TactileResult<EventId> {
        self.shared.queue.enqueue_parts(&record.header(), &record.payload)
    }

    /// Queue an already encoded record
    pub fn send_raw(&self, record: &[u8]) -> TactileResult<EventId> {
        self.shared.queue.enqueue(record)
    }

    pub fn now(&self) -> InputTime {
        self.shared.time_base.now()
    }

    pub fn polling_frequency(&self) -> f64 {
        self.shared.polling_frequency()
    }

    /// Sampling interval for polled devices
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.shared.polling_frequency())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }
}

impl std::fmt::Debug for EventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Producer handle for device discovery and removal
#[derive(Clone)]
pub struct DeviceAnnouncer {
    shared: Arc<Shared>,
}

impl DeviceAnnouncer {
    pub fn allocate_id(&self) -> TactileResult<DeviceId> {
        self.shared.registry.allocate_id()
    }

    pub fn announce(
        &self,
        device: DeviceId,
        description: impl Into<DeviceDescription>,
    ) -> TactileResult<Announcement> {
        self.shared.registry.announce(device, description.into())
    }

    pub fn attach_commands(
        &self,
        device: DeviceId,
        handler: impl CommandHandler + 'static,
    ) -> TactileResult<()> {
        self.shared.commands.attach(device, handler)
    }

    /// Allocate an id and announce the device under it
    pub fn discover(&self, description: impl Into<DeviceDescription>) -> TactileResult<DeviceId> {
        let device = self.allocate_id()?;
        self.announce(device, description)?;
        Ok(device)
    }

    /// Allocate an id, install its command handler, then announce it, so the
    /// consumer can send commands from its discovery callback
    pub fn discover_with_commands(
        &self,
        description: impl Into<DeviceDescription>,
        handler: impl CommandHandler + 'static,
    ) -> TactileResult<DeviceId> {
        let device = self.allocate_id()?;
        self.attach_commands(device, handler)?;
        self.announce(device, description)?;
        Ok(device)
    }

    pub fn remove(&self, device: DeviceId) -> TactileResult<DeviceDescription> {
        self.shared.remove_device(device)
    }

    /// Give back an id that was allocated but never announced, for a device
    /// that went away before its description was ready. Its command handler,
    /// if any, is detached and the id is never handed out again.
    pub fn release(&self, device: DeviceId) -> TactileResult<()> {
        if !self.shared.registry.retire(device) {
            return Err(TactileError::UnknownDevice(device));
        }
        self.shared.commands.detach(device);
        debug!(device = device.0, "device id released");
        Ok(())
    }
}

impl std::fmt::Debug for DeviceAnnouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAnnouncer")
            .field("registry", &*self.shared.registry)
            .finish()
    }
}
