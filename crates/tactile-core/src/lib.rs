//! Tactile Core - Fundamental input types and primitives
//!
//! This crate defines the core types shared by the input runtime:
//! - Identifiers (DeviceId, EventId)
//! - Device descriptions
//! - Time primitives (InputTime)
//! - Update phases (UpdateType)
//! - Event records and drained batches
//! - Device command buffers
//! - The error taxonomy

pub mod id;
pub mod device;
pub mod time;
pub mod update;
pub mod event;
pub mod command;
pub mod error;

pub use id::*;
pub use device::*;
pub use time::*;
pub use update::*;
pub use event::*;
pub use command::*;
pub use error::*;
