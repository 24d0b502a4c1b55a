//! Tactile Runtime - input pipeline and update dispatch
//!
//! This crate connects input producers to a single consumer:
//! 1. Producers queue timestamped events from any thread
//! 2. Devices are allocated ids and announced to the registry
//! 3. The consumer runs update phases; each phase drains the queue
//! 4. Discoveries are delivered after the phase's events
//! 5. Device commands travel on their own synchronous channel

pub mod analytics;
pub mod command;
pub mod config;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod scheduler;

pub use analytics::*;
pub use command::*;
pub use config::RuntimeConfig;
pub use logging::*;
pub use queue::*;
pub use registry::*;
pub use runtime::*;
pub use scheduler::*;
