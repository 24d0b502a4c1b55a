//! Time Base - the authoritative input timeline
//!
//! Every event is stamped with `TimeBase::now()` when it is ingested. Two
//! guarantees hold for the lifetime of a time base:
//! - `now()` never runs backwards, from any thread, even if the clock
//!   source does
//! - the reference offset may drift, but it only affects conversions made
//!   after the change, never timestamps already handed out

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tactile_core::{InputTime, TactileError, TactileResult};

use crate::{ClockSource, MonotonicClock};

/// Process-wide input timeline
pub struct TimeBase {
    source: Box<dyn ClockSource>,
    /// Last time handed out, as f64 bits
    last: AtomicU64,
    /// input time minus reference time, as f64 bits
    offset: AtomicU64,
}

impl TimeBase {
    /// Time base driven by the OS monotonic clock
    pub fn new() -> Self {
        Self::with_source(MonotonicClock::new())
    }

    pub fn with_source(source: impl ClockSource + 'static) -> Self {
        let start = source.now();
        let start = if start.is_finite() { start } else { InputTime::ZERO };
        TimeBase {
            source: Box::new(source),
            last: AtomicU64::new(start.to_bits()),
            offset: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Current input time. Lock-free and non-decreasing.
    pub fn now(&self) -> InputTime {
        let sampled = self.source.now();
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let last = InputTime::from_bits(current);
            // A NaN sample is unordered, so a broken source can only stall time
            if sampled.partial_cmp(&last) != Some(std::cmp::Ordering::Greater) {
                return last;
            }
            match self.last.compare_exchange_weak(
                current,
                sampled.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return sampled,
                Err(actual) => current = actual,
            }
        }
    }

    /// Last time handed out, without sampling the source
    pub fn last(&self) -> InputTime {
        InputTime::from_bits(self.last.load(Ordering::Acquire))
    }

    /// Offset of the input timeline to the reference clock, in seconds
    pub fn offset_to_reference(&self) -> f64 {
        f64::from_bits(self.offset.load(Ordering::Acquire))
    }

    /// Replace the reference offset
    pub fn set_offset_to_reference(&self, offset: f64) -> TactileResult<()> {
        if !offset.is_finite() {
            return Err(TactileError::InvalidConfig(format!(
                "reference offset must be finite, got {}",
                offset
            )));
        }
        self.offset.store(offset.to_bits(), Ordering::Release);
        Ok(())
    }

    /// Apply a drift correction to the reference offset, returning the new offset
    pub fn correct_drift(&self, delta: f64) -> TactileResult<f64> {
        if !delta.is_finite() {
            return Err(TactileError::InvalidConfig(format!(
                "drift correction must be finite, got {}",
                delta
            )));
        }
        let mut current = self.offset.load(Ordering::Acquire);
        loop {
            let next = f64::from_bits(current) + delta;
            match self.offset.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Convert an input time to the reference clock
    pub fn to_reference(&self, time: InputTime) -> f64 {
        time.as_secs_f64() - self.offset_to_reference()
    }

    /// Convert a reference clock reading to the input timeline
    pub fn from_reference(&self, reference: f64) -> InputTime {
        InputTime::from_secs_f64(reference + self.offset_to_reference())
    }

    /// Current time on the reference clock
    pub fn reference_now(&self) -> f64 {
        self.to_reference(self.now())
    }

    /// Time elapsed since `earlier` on the input timeline
    pub fn elapsed_since(&self, earlier: InputTime) -> Duration {
        self.now() - earlier
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeBase")
            .field("last", &self.last())
            .field("offset_to_reference", &self.offset_to_reference())
            .finish()
    }
}
