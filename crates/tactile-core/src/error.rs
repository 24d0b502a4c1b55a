//! Error types for Tactile

use std::fmt;

use thiserror::Error;

use crate::{DeviceId, FourCC, UpdateType};

/// Core Tactile errors
#[derive(Error, Debug, Clone)]
pub enum TactileError {
    // Registry errors
    #[error("Device id space exhausted")]
    Exhausted,

    #[error("Invalid device id")]
    InvalidDeviceId,

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    // Queue errors
    #[error("Event queue full: requested {requested} bytes, {available} available")]
    QueueFull { requested: usize, available: usize },

    #[error("Event record too large: {size} bytes, max {max}")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Invalid event record: {0}")]
    InvalidRecord(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    // Scheduler errors
    #[error("Update {0} requested while an update is already running")]
    Reentrancy(UpdateType),

    #[error("{}", describe_faults(.faults))]
    CallbackFailed { faults: Vec<CallbackFault> },

    // Command errors
    #[error("Command type mismatch: expected {expected}, got {actual}")]
    CommandTypeMismatch { expected: FourCC, actual: FourCC },

    #[error("Command payload too short: expected {expected}, got {actual}")]
    CommandPayloadTooShort { expected: usize, actual: usize },

    // Runtime errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Runtime is shut down")]
    Shutdown,
}

/// Result type for Tactile operations
pub type TactileResult<T> = Result<T, TactileError>;

/// Which consumer callback raised a fault
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    BeforeUpdate,
    Update,
    DeviceDiscovered,
    Shutdown,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallbackKind::BeforeUpdate => "before-update",
            CallbackKind::Update => "update",
            CallbackKind::DeviceDiscovered => "device-discovered",
            CallbackKind::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// A fault raised by a consumer callback during dispatch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackFault {
    pub kind: CallbackKind,
    pub phase: UpdateType,
    pub device: Option<DeviceId>,
    pub message: String,
}

impl fmt::Display for CallbackFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} callback failed in {}", self.kind, self.phase)?;
        if let Some(device) = self.device {
            write!(f, " for device {}", device)?;
        }
        write!(f, ": {}", self.message)
    }
}

fn describe_faults(faults: &[CallbackFault]) -> String {
    match faults {
        [] => "Callback failed".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{} (and {} more)", first, rest.len()),
    }
}
