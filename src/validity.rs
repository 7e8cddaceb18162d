//! Per-sounding and per-bin validity flags.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Number of bits a validity word occupies on disk.
pub const VALIDITY_BITS: u8 = 19;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Validity(u32);

impl Validity {
    pub const NONE: Validity = Validity(0);
    pub const MANUALLY_INVAL: Validity = Validity(1 << 0);
    pub const FILTER_INVAL: Validity = Validity(1 << 1);
    /// Logically removed: never contributes to aggregates or searches.
    pub const DELETED: Validity = Validity(1 << 2);
    pub const CHECKED: Validity = Validity(1 << 3);
    pub const SUSPECT: Validity = Validity(1 << 4);
    pub const SELECTED_SOUNDING: Validity = Validity(1 << 5);
    pub const SELECTED_FEATURE: Validity = Validity(1 << 6);
    pub const DESIGNATED_SOUNDING: Validity = Validity(1 << 7);
    pub const USER_01: Validity = Validity(1 << 8);
    pub const USER_02: Validity = Validity(1 << 9);
    pub const USER_03: Validity = Validity(1 << 10);
    pub const USER_04: Validity = Validity(1 << 11);
    pub const USER_05: Validity = Validity(1 << 12);
    /// Reference-only data, kept for display but excluded from surfaces.
    pub const REFERENCE: Validity = Validity(1 << 13);
    pub const INTERPOLATED: Validity = Validity(1 << 14);
    pub const VERIFIED: Validity = Validity(1 << 15);
    pub const MODIFIED: Validity = Validity(1 << 16);
    /// Bin only: the chain holds at least one sounding that is not deleted.
    pub const DATA: Validity = Validity(1 << 17);
    /// Bin only: at least one sounding in the chain is invalid.
    pub const HAS_INVALID: Validity = Validity(1 << 18);

    pub const INVAL: Validity = Validity(Self::MANUALLY_INVAL.0 | Self::FILTER_INVAL.0);
    pub const USER: Validity = Validity(
        Self::USER_01.0 | Self::USER_02.0 | Self::USER_03.0 | Self::USER_04.0 | Self::USER_05.0,
    );
    /// Flags set directly on a bin by the user rather than derived from its soundings.
    pub const BIN_ONLY: Validity = Validity(Self::CHECKED.0 | Self::VERIFIED.0);
    /// Sounding flags whose presence anywhere in the chain is summarized on the bin.
    pub const SUMMARY: Validity = Validity(
        Self::DELETED.0
            | Self::SUSPECT.0
            | Self::SELECTED_SOUNDING.0
            | Self::SELECTED_FEATURE.0
            | Self::DESIGNATED_SOUNDING.0
            | Self::USER.0
            | Self::REFERENCE.0
            | Self::INTERPOLATED.0
            | Self::MODIFIED.0,
    );

    pub const fn from_bits(bits: u32) -> Self {
        Validity(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Validity) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Validity) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Validity) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Validity) {
        self.0 &= !other.0;
    }

    pub fn is_invalid(self) -> bool {
        self.intersects(Self::INVAL)
    }

    pub fn is_deleted(self) -> bool {
        self.intersects(Self::DELETED)
    }

    /// The user flag for a 1-based class type, if it names one.
    pub fn user_flag(class_type: u8) -> Option<Validity> {
        match class_type {
            1..=5 => Some(Validity(Self::USER_01.0 << (class_type - 1))),
            _ => None,
        }
    }
}

impl BitOr for Validity {
    type Output = Validity;

    fn bitor(self, rhs: Validity) -> Validity {
        Validity(self.0 | rhs.0)
    }
}

impl BitOrAssign for Validity {
    fn bitor_assign(&mut self, rhs: Validity) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Validity {
    type Output = Validity;

    fn bitand(self, rhs: Validity) -> Validity {
        Validity(self.0 & rhs.0)
    }
}

impl Not for Validity {
    type Output = Validity;

    fn not(self) -> Validity {
        Validity(!self.0)
    }
}

impl fmt::Debug for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validity({:#07x})", self.0)
    }
}
