//! Tactile Time Base - the input timeline
//!
//! This crate implements the authoritative clock used to stamp input events:
//! - Clock sources (OS monotonic, manually driven)
//! - A lock-free, never-decreasing `now()`
//! - Offset to an external reference clock with drift correction

pub mod clock;
pub mod timebase;

pub use clock::*;
pub use timebase::*;
