//! Time primitives for Tactile
//!
//! All input events live on one timeline: seconds since the time base
//! started, stored as `f64` to match what consumers frame their update
//! loops in.

use std::cmp::Ordering;
use std::ops::{Add, Sub};
use std::time::Duration;

/// A point on the input timeline, in seconds
#[derive(Clone, Copy, PartialEq, Default)]
pub struct InputTime(pub f64);

impl InputTime {
    pub const ZERO: InputTime = InputTime(0.0);

    #[inline]
    pub fn from_secs_f64(secs: f64) -> Self {
        InputTime(secs)
    }

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        InputTime(millis as f64 / 1_000.0)
    }

    #[inline]
    pub fn from_duration(duration: Duration) -> Self {
        InputTime(duration.as_secs_f64())
    }

    #[inline]
    pub fn as_secs_f64(self) -> f64 {
        self.0
    }

    #[inline]
    pub fn as_millis_f64(self) -> f64 {
        self.0 * 1_000.0
    }

    #[inline]
    pub fn to_bits(self) -> u64 {
        self.0.to_bits()
    }

    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        InputTime(f64::from_bits(bits))
    }

    #[inline]
    pub fn is_finite(self) -> bool {
        self.0.is_finite()
    }

    /// The later of two times
    #[inline]
    pub fn max(self, other: InputTime) -> InputTime {
        if other > self {
            other
        } else {
            self
        }
    }
}

impl PartialOrd for InputTime {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.0.partial_cmp(&other.0)
    }
}

impl Add<Duration> for InputTime {
    type Output = InputTime;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        InputTime(self.0 + rhs.as_secs_f64())
    }
}

impl Sub<InputTime> for InputTime {
    type Output = Duration;

    /// Elapsed time between two points; saturates at zero
    #[inline]
    fn sub(self, rhs: InputTime) -> Self::Output {
        let diff = self.0 - rhs.0;
        if diff > 0.0 && diff.is_finite() {
            Duration::from_secs_f64(diff)
        } else {
            Duration::ZERO
        }
    }
}

impl std::fmt::Debug for InputTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t({:.3}ms)", self.as_millis_f64())
    }
}
