//! Update phases
//!
//! An `UpdateType` is a bitmask of phases. A single update run may request
//! several phases at once; each set bit is dispatched as its own
//! sub-update, always in canonical order (ascending bit order).

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Update phase mask (1 byte)
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UpdateType(pub u8);

impl UpdateType {
    pub const NONE: UpdateType = UpdateType(0);

    // Phase bits, listed in canonical dispatch order
    pub const DYNAMIC: UpdateType = UpdateType(0b0000_0001);
    pub const FIXED: UpdateType = UpdateType(0b0000_0010);
    pub const BEFORE_RENDER: UpdateType = UpdateType(0b0000_0100);
    pub const EDITOR: UpdateType = UpdateType(0b0000_1000);
    pub const MANUAL: UpdateType = UpdateType(0b0001_0000);

    /// Every defined phase
    pub const ALL: UpdateType = UpdateType(0b0001_1111);

    /// Default mask for periodic updates
    pub const DEFAULT: UpdateType = UpdateType(0b0000_0011);

    const CANONICAL: [UpdateType; 5] = [
        Self::DYNAMIC,
        Self::FIXED,
        Self::BEFORE_RENDER,
        Self::EDITOR,
        Self::MANUAL,
    ];

    #[inline]
    pub fn new(bits: u8) -> Self {
        UpdateType(bits)
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: UpdateType) -> bool {
        !other.is_empty() && self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: UpdateType) -> bool {
        self.0 & other.0 != 0
    }

    /// True if exactly one phase bit is set
    #[inline]
    pub fn is_single_phase(self) -> bool {
        self.0.count_ones() == 1
    }

    /// Bits outside of the defined phases
    #[inline]
    pub fn unknown_bits(self) -> u8 {
        self.0 & !Self::ALL.0
    }

    #[inline]
    pub fn set(&mut self, phase: UpdateType, value: bool) {
        if value {
            self.0 |= phase.0;
        } else {
            self.0 &= !phase.0;
        }
    }

    /// Individual phases in canonical order, ignoring unknown bits
    pub fn phases(self) -> impl Iterator<Item = UpdateType> {
        Self::CANONICAL
            .into_iter()
            .filter(move |phase| self.contains(*phase))
    }

    /// Name of a single phase
    pub fn name(self) -> &'static str {
        match self {
            Self::DYNAMIC => "Dynamic",
            Self::FIXED => "Fixed",
            Self::BEFORE_RENDER => "BeforeRender",
            Self::EDITOR => "Editor",
            Self::MANUAL => "Manual",
            Self::NONE => "None",
            _ => "Mixed",
        }
    }

    /// Parse a phase name, case-insensitive
    pub fn from_name(name: &str) -> Option<Self> {
        Self::CANONICAL
            .into_iter()
            .find(|phase| phase.name().eq_ignore_ascii_case(name))
    }
}

impl BitOr for UpdateType {
    type Output = UpdateType;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        UpdateType(self.0 | rhs.0)
    }
}

impl BitOrAssign for UpdateType {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for UpdateType {
    type Output = UpdateType;

    #[inline]
    fn bitand(self, rhs: Self) -> Self::Output {
        UpdateType(self.0 & rhs.0)
    }
}

impl Not for UpdateType {
    type Output = UpdateType;

    #[inline]
    fn not(self) -> Self::Output {
        UpdateType(!self.0 & Self::ALL.0)
    }
}

impl From<u8> for UpdateType {
    fn from(bits: u8) -> Self {
        UpdateType(bits)
    }
}

impl From<UpdateType> for u8 {
    fn from(mask: UpdateType) -> Self {
        mask.0
    }
}

impl fmt::Debug for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("UpdateType(None)");
        }
        f.write_str("UpdateType(")?;
        for (i, phase) in self.phases().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            f.write_str(phase.name())?;
        }
        if self.unknown_bits() != 0 {
            write!(f, " | {:#04x}", self.unknown_bits())?;
        }
        f.write_str(")")
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single_phase() || self.is_empty() {
            f.write_str(self.name())
        } else {
            write!(f, "{:?}", self)
        }
    }
}
