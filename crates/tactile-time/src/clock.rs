//! Clock sources for the Tactile time base

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tactile_core::InputTime;

/// A monotonic clock supplied by the platform
///
/// Implementations are sampled from arbitrary threads. They should not go
/// backwards, but the time base tolerates it.
pub trait ClockSource: Send + Sync {
    fn now(&self) -> InputTime;
}

impl<C: ClockSource + ?Sized> ClockSource for Arc<C> {
    fn now(&self) -> InputTime {
        (**self).now()
    }
}

impl<C: ClockSource + ?Sized> ClockSource for Box<C> {
    fn now(&self) -> InputTime {
        (**self).now()
    }
}

/// Monotonic OS clock, zero at construction
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }

    /// Clock whose zero is `origin`
    pub fn with_origin(origin: Instant) -> Self {
        MonotonicClock { origin }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for MonotonicClock {
    fn now(&self) -> InputTime {
        InputTime::from_duration(self.origin.elapsed())
    }
}

/// Manually driven clock for simulation and tests
///
/// Share it through an `Arc` to keep a handle after giving it to a time base.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(InputTime::ZERO)
    }

    pub fn starting_at(time: InputTime) -> Self {
        ManualClock {
            bits: AtomicU64::new(time.to_bits()),
        }
    }

    /// Jump to an absolute time, backwards jumps included
    pub fn set(&self, time: InputTime) {
        self.bits.store(time.to_bits(), Ordering::Release);
    }

    /// Advance by `dt` and return the new time
    pub fn advance(&self, dt: Duration) -> InputTime {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let next = (InputTime::from_bits(current) + dt).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return InputTime::from_bits(next),
                Err(actual) => current = actual,
            }
        }
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> InputTime {
        InputTime::from_bits(self.bits.load(Ordering::Acquire))
    }
}
