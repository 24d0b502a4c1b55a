//! Identity types for Tactile
//!
//! Device ids are 32-bit so they fit the fixed event header without
//! padding, which is more than enough for any practical device count.

use std::fmt;

/// Device identity - allocated by the device registry, unique per process
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Reserved sentinel meaning "invalid / unassigned"
    pub const INVALID: DeviceId = DeviceId(0);

    /// First id handed out by an allocator
    pub const FIRST: DeviceId = DeviceId(1);

    #[inline]
    pub fn new(id: u32) -> Self {
        DeviceId(id)
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        DeviceId(u32::from_le_bytes(bytes))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Device({})", self.0)
        } else {
            f.write_str("Device(invalid)")
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event identity - assigned by the event queue at enqueue time
///
/// Ids increase in enqueue order, so within one drain they double as a
/// total order over the delivered batch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventId(pub u32);

impl EventId {
    pub const ZERO: EventId = EventId(0);

    #[inline]
    pub fn new(id: u32) -> Self {
        EventId(id)
    }

    #[inline]
    pub fn next(self) -> Self {
        EventId(self.0.wrapping_add(1))
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event(#{})", self.0)
    }
}
