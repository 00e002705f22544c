//! Partition signal masks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// A set of signal bits local to one partition
///
/// Bits 0 to 2 are reserved, bit 3 is the doorbell and service signals
/// occupy bits 4 to 31.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SignalSet(u32);

impl SignalSet {
    pub const EMPTY: SignalSet = SignalSet(0);

    /// Doorbell signal raised by `notify`
    pub const DOORBELL: SignalSet = SignalSet(1 << 3);

    /// Bits that may never be declared by a manifest
    pub const RESERVED: SignalSet = SignalSet(0x7);

    /// Lowest bit available to service signals
    pub const FIRST_SERVICE_BIT: u32 = 4;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Signal for a single bit number
    pub const fn bit(n: u32) -> Self {
        Self(1 << n)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if exactly one bit is set
    pub const fn is_single(&self) -> bool {
        self.0 != 0 && self.0 & (self.0 - 1) == 0
    }

    pub const fn contains(&self, other: SignalSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(&self, other: SignalSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: SignalSet) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SignalSet) {
        self.0 &= !other.0;
    }
}

impl BitOr for SignalSet {
    type Output = SignalSet;

    fn bitor(self, rhs: SignalSet) -> SignalSet {
        SignalSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for SignalSet {
    fn bitor_assign(&mut self, rhs: SignalSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SignalSet {
    type Output = SignalSet;

    fn bitand(self, rhs: SignalSet) -> SignalSet {
        SignalSet(self.0 & rhs.0)
    }
}

impl Not for SignalSet {
    type Output = SignalSet;

    fn not(self) -> SignalSet {
        SignalSet(!self.0)
    }
}

impl fmt::Display for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_bit() {
        assert!(SignalSet::DOORBELL.is_single());
        assert!(SignalSet::bit(31).is_single());
        assert!(!SignalSet::EMPTY.is_single());
        assert!(!(SignalSet::bit(4) | SignalSet::bit(5)).is_single());
    }

    #[test]
    fn test_set_operations() {
        let mut set = SignalSet::bit(4) | SignalSet::DOORBELL;
        assert!(set.contains(SignalSet::bit(4)));
        assert!(set.intersects(SignalSet::bit(4) | SignalSet::bit(9)));

        set.remove(SignalSet::bit(4));
        assert_eq!(set, SignalSet::DOORBELL);
        assert!(!set.intersects(SignalSet::bit(4)));
    }

    #[test]
    fn test_reserved_bits_exclude_doorbell() {
        assert!(!SignalSet::RESERVED.intersects(SignalSet::DOORBELL));
        assert!(!SignalSet::RESERVED.intersects(SignalSet::bit(SignalSet::FIRST_SERVICE_BIT)));
    }
}
