//! Harness errors

use thiserror::Error;

use tactile_core::{DeviceId, TactileError};

/// Errors raised by the simulation harness itself
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("runtime error: {0}")]
    Runtime(#[from] TactileError),

    #[error("cannot spawn producer thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("producer for device {0} panicked")]
    ProducerPanicked(DeviceId),

    #[error("scenario timed out with {delivered} of {expected} events delivered")]
    Timeout { delivered: usize, expected: usize },
}

pub type SimulationResult<T> = Result<T, SimulationError>;
