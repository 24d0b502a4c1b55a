//! Command Channel - synchronous per-device I/O commands
//!
//! Independent of the event queue. Each device has at most one handler,
//! and commands to the same device are serialized by that handler's lock.
//! Commands to different devices run concurrently.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use tactile_core::{CommandResult, DeviceCommand, DeviceId, TactileError, TactileResult};

use crate::DeviceRegistry;

/// Device side of the command channel
///
/// Reads and writes the buffer in place. Negative results are failures
/// whose meaning is defined by the device.
pub trait CommandHandler: Send {
    fn execute(&mut self, command: &mut DeviceCommand) -> CommandResult;
}

impl<F> CommandHandler for F
where
    F: FnMut(&mut DeviceCommand) -> CommandResult + Send,
{
    fn execute(&mut self, command: &mut DeviceCommand) -> CommandResult {
        self(command)
    }
}

type SharedHandler = Arc<Mutex<Box<dyn CommandHandler>>>;

thread_local! {
    /// Device whose handler is running on this thread
    static EXECUTING: Cell<Option<DeviceId>> = const { Cell::new(None) };
}

/// Marks the current thread as running a device's handler
struct Executing(Option<DeviceId>);

impl Executing {
    fn enter(device: DeviceId) -> Self {
        Executing(EXECUTING.with(|current| current.replace(Some(device))))
    }

    fn is_running(device: DeviceId) -> bool {
        EXECUTING.with(|current| current.get() == Some(device))
    }
}

impl Drop for Executing {
    fn drop(&mut self) {
        EXECUTING.with(|current| current.set(self.0));
    }
}

/// Routes command buffers to device handlers
pub struct CommandChannel {
    registry: Arc<DeviceRegistry>,
    handlers: RwLock<HashMap<DeviceId, SharedHandler>>,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl CommandChannel {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        CommandChannel {
            registry,
            handlers: RwLock::new(HashMap::new()),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Install the handler for a device, replacing any previous one.
    ///
    /// The id must have been allocated by the registry and not removed.
    /// Removal retires the id in the registry before detaching, and the
    /// check here runs under the handler map lock, so a handler can never
    /// outlive a concurrent removal.
    pub fn attach(&self, device: DeviceId, handler: impl CommandHandler + 'static) -> TactileResult<()> {
        if !device.is_valid() {
            return Err(TactileError::InvalidDeviceId);
        }
        let handler: Box<dyn CommandHandler> = Box::new(handler);

        let mut handlers = self.handlers.write();
        if !self.registry.is_allocated(device) || self.registry.is_removed(device) {
            return Err(TactileError::UnknownDevice(device));
        }
        let replaced = handlers
            .insert(device, Arc::new(Mutex::new(handler)))
            .is_some();
        drop(handlers);

        debug!(device = device.0, replaced, "command handler attached");
        Ok(())
    }

    /// Remove the handler for a device. A command already running on it
    /// completes first, unless the caller is that command's own handler.
    pub fn detach(&self, device: DeviceId) -> bool {
        let removed = self.handlers.write().remove(&device);
        match removed {
            Some(handler) => {
                if !Executing::is_running(device) {
                    // Wait out an in-flight command
                    drop(handler.lock());
                }
                true
            }
            None => false,
        }
    }

    pub fn has_handler(&self, device: DeviceId) -> bool {
        self.handlers.read().contains_key(&device)
    }

    /// Send a command and block until the device answers.
    ///
    /// Fails with `UnknownDevice`, leaving the buffer untouched, if the
    /// device was removed, or has no handler and is not live in the
    /// registry. A live device without a handler answers
    /// `CommandResult::UNSUPPORTED`.
    pub fn send(&self, device: DeviceId, command: &mut DeviceCommand) -> TactileResult<CommandResult> {
        // Release the map lock before the device transaction starts
        let handler = self.handlers.read().get(&device).cloned();
        let handler = match handler {
            Some(handler) => handler,
            None if self.registry.contains(device) => {
                trace!(device = device.0, command = %command.command_type(), "device has no command handler");
                return Ok(CommandResult::UNSUPPORTED);
            }
            None => return Err(TactileError::UnknownDevice(device)),
        };

        let mut handler = handler.lock();
        // Removed while this call waited for the handler
        if self.registry.is_removed(device) {
            return Err(TactileError::UnknownDevice(device));
        }
        let result = {
            let _executing = Executing::enter(device);
            handler.execute(command)
        };
        drop(handler);
        self.sent.fetch_add(1, Ordering::Relaxed);
        if result.is_failure() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        trace!(device = device.0, command = %command.command_type(), result = result.code(), "command executed");
        Ok(result)
    }

    /// Commands delivered to a handler
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Delivered commands that returned a negative result
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("handlers", &self.handlers.read().len())
            .field("sent", &self.sent_count())
            .finish()
    }
}
