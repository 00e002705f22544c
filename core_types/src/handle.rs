//! Opaque handles handed to clients and services
//!
//! A handle is just a number. Connection handles are produced and decoded
//! by the partition manager's handle codec; stateless service handles have
//! a fixed layout known at build time:
//!
//! ```text
//!  31  30  29      16 15      8 7   5 4     0
//! +---+---+----------+---------+-----+-------+
//! | 0 | 1 | reserved | version | res | index |
//! +---+---+----------+---------+-----+-------+
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bit marking a stateless service handle
pub const STATELESS_INDICATOR: i32 = 1 << 30;

/// Number of entries in the stateless service table
pub const STATELESS_TABLE_SIZE: usize = 32;

const STATELESS_INDEX_MASK: i32 = 0x1f;
const STATELESS_VERSION_SHIFT: u32 = 8;
const STATELESS_VERSION_MASK: i32 = 0xff;

/// A client-visible reference to a connection, message or stateless service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(i32);

impl Handle {
    /// The null handle. Closing it has no effect.
    pub const NULL: Handle = Handle(0);

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> i32 {
        self.0
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Builds the static handle of a stateless service
    ///
    /// `index` selects the entry in the stateless table and `version` is
    /// the version the client was built against. Both are truncated to
    /// their fields.
    pub const fn stateless(index: u8, version: u8) -> Self {
        Self(
            STATELESS_INDICATOR
                | ((version as i32 & STATELESS_VERSION_MASK) << STATELESS_VERSION_SHIFT)
                | (index as i32 & STATELESS_INDEX_MASK),
        )
    }

    /// Returns true if this is a stateless service handle
    pub const fn is_stateless(&self) -> bool {
        self.0 > 0 && self.0 & STATELESS_INDICATOR != 0
    }

    /// Table index of a stateless handle
    pub const fn stateless_index(&self) -> usize {
        (self.0 & STATELESS_INDEX_MASK) as usize
    }

    /// Client version packed into a stateless handle
    pub const fn stateless_version(&self) -> u32 {
        ((self.0 >> STATELESS_VERSION_SHIFT) & STATELESS_VERSION_MASK) as u32
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_stateless() {
            write!(
                f,
                "Handle(stateless:{}/v{})",
                self.stateless_index(),
                self.stateless_version()
            )
        } else {
            write!(f, "Handle({:#x})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle() {
        assert!(Handle::NULL.is_null());
        assert!(!Handle::NULL.is_stateless());
    }

    #[test]
    fn test_stateless_layout() {
        let handle = Handle::stateless(7, 2);
        assert!(handle.is_stateless());
        assert_eq!(handle.stateless_index(), 7);
        assert_eq!(handle.stateless_version(), 2);
        assert_eq!(handle.as_raw(), 0x4000_0207);
    }

    #[test]
    fn test_stateless_index_is_truncated() {
        let handle = Handle::stateless(33, 1);
        assert_eq!(handle.stateless_index(), 1);
    }

    #[test]
    fn test_negative_status_is_not_stateless() {
        // Error codes returned in place of a handle must never look stateless
        assert!(!Handle::from_raw(-130).is_stateless());
        assert!(!Handle::from_raw(i32::MIN | STATELESS_INDICATOR).is_stateless());
    }
}
