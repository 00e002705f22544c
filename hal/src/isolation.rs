//! Isolation boundary abstraction

use bitflags::bitflags;
use core_types::PartitionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

bitflags! {
    /// Kind of access requested by a memory check
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
    pub struct AccessFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// The access is made on behalf of the non-secure world
        const NS = 1 << 2;
        const READABLE = Self::READ.bits();
        const READWRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Errors reported by the isolation HAL
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IsolationError {
    /// The token was never returned by `bind_boundary`
    #[error("Unknown boundary token: {0}")]
    UnknownBoundary(u32),

    /// The range is not covered by a region with the requested access
    #[error("Access denied: {addr:#x}+{len:#x} ({access:?})")]
    AccessDenied {
        addr: usize,
        len: usize,
        access: AccessFlags,
    },

    /// The range wraps around the address space
    #[error("Address range overflows: {addr:#x}+{len:#x}")]
    Overflow { addr: usize, len: usize },

    /// A region in the descriptor is malformed
    #[error("Invalid region: {base:#x}+{len:#x}")]
    InvalidRegion { base: usize, len: usize },
}

/// Opaque handle to a bound isolation boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundaryToken(u32);

impl BoundaryToken {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> u32 {
        self.0
    }
}

/// A memory region assigned to a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub base: usize,
    pub len: usize,
    #[serde(default)]
    pub writable: bool,
    /// Region belongs to the non-secure world
    #[serde(default)]
    pub non_secure: bool,
}

impl MemoryRegion {
    /// Read-only secure region
    pub const fn read_only(base: usize, len: usize) -> Self {
        Self {
            base,
            len,
            writable: false,
            non_secure: false,
        }
    }

    /// Read-write secure region
    pub const fn read_write(base: usize, len: usize) -> Self {
        Self {
            base,
            len,
            writable: true,
            non_secure: false,
        }
    }

    /// Read-write non-secure region
    pub const fn non_secure(base: usize, len: usize) -> Self {
        Self {
            base,
            len,
            writable: true,
            non_secure: true,
        }
    }

    /// Accesses this region grants
    pub fn grants(&self) -> AccessFlags {
        let mut flags = AccessFlags::READ;
        if self.writable {
            flags |= AccessFlags::WRITE;
        }
        if self.non_secure {
            flags |= AccessFlags::NS;
        }
        flags
    }

    /// Returns true if `[addr, addr + len)` lies inside this region
    pub fn covers(&self, addr: usize, len: usize) -> bool {
        match (addr.checked_add(len), self.base.checked_add(self.len)) {
            (Some(end), Some(region_end)) => addr >= self.base && end <= region_end,
            _ => false,
        }
    }
}

/// Everything the platform needs to bind one partition's boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryDescriptor {
    pub partition: PartitionId,
    /// Partition runs privileged
    pub privileged: bool,
    pub regions: Vec<MemoryRegion>,
}

/// Isolation operations consumed by the partition manager
///
/// Implementations must be callable from any execution context, hence
/// `&self` receivers and `Send + Sync`.
pub trait IsolationHal: Send + Sync {
    /// Binds a partition's boundary at load time
    fn bind_boundary(&self, descriptor: &BoundaryDescriptor)
        -> Result<BoundaryToken, IsolationError>;

    /// Activates a boundary on a cross-partition switch
    fn update_boundaries(
        &self,
        descriptor: &BoundaryDescriptor,
        token: BoundaryToken,
    ) -> Result<(), IsolationError>;

    /// Checks that `boundary` may access `[addr, addr + len)` as requested
    fn memory_check(
        &self,
        boundary: BoundaryToken,
        addr: usize,
        len: usize,
        access: AccessFlags,
    ) -> Result<(), IsolationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_grants() {
        assert_eq!(MemoryRegion::read_only(0, 4).grants(), AccessFlags::READABLE);
        assert_eq!(MemoryRegion::read_write(0, 4).grants(), AccessFlags::READWRITE);
        assert!(MemoryRegion::non_secure(0, 4)
            .grants()
            .contains(AccessFlags::READWRITE | AccessFlags::NS));
    }

    #[test]
    fn test_region_covers() {
        let region = MemoryRegion::read_write(0x1000, 0x100);
        assert!(region.covers(0x1000, 0x100));
        assert!(region.covers(0x10ff, 1));
        assert!(!region.covers(0x10ff, 2));
        assert!(!region.covers(0xfff, 1));
        assert!(!region.covers(usize::MAX, 2));
    }
}
