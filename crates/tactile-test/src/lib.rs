//! Tactile Test Harness - simulated devices and end-to-end scenarios
//!
//! This crate provides:
//! - Simulated input devices on producer threads
//! - A simulated command handler for the standard device commands
//! - A scenario harness that checks delivery invariants end to end
//! - Queue and time base benchmarks (see `benches/`)

pub mod error;
pub mod scenario;
pub mod simulator;

pub use error::*;
pub use scenario::*;
pub use simulator::*;
