//! Software isolation for host simulation
//!
//! Boundaries are kept as region lists and checked in software. The active
//! boundary and the number of switches are recorded so tests can observe
//! what the partition manager asked for.

use crate::isolation::{
    AccessFlags, BoundaryDescriptor, BoundaryToken, IsolationError, IsolationHal,
};
use core_types::PartitionId;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct SimState {
    boundaries: Vec<BoundaryDescriptor>,
    active: Option<BoundaryToken>,
    switches: u64,
}

/// Region-list isolation checked entirely in software
#[derive(Debug, Default)]
pub struct SimulatedIsolation {
    state: Mutex<SimState>,
}

impl SimulatedIsolation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partition whose boundary is currently active
    pub fn active_partition(&self) -> Option<PartitionId> {
        let state = self.state.lock();
        state
            .active
            .and_then(|token| state.boundaries.get(token.as_raw() as usize))
            .map(|descriptor| descriptor.partition)
    }

    /// Number of `update_boundaries` calls so far
    pub fn switch_count(&self) -> u64 {
        self.state.lock().switches
    }
}

impl IsolationHal for SimulatedIsolation {
    fn bind_boundary(
        &self,
        descriptor: &BoundaryDescriptor,
    ) -> Result<BoundaryToken, IsolationError> {
        for region in &descriptor.regions {
            if region.len == 0 || region.base.checked_add(region.len).is_none() {
                return Err(IsolationError::InvalidRegion {
                    base: region.base,
                    len: region.len,
                });
            }
        }

        let mut state = self.state.lock();
        let token = BoundaryToken::new(state.boundaries.len() as u32);
        state.boundaries.push(descriptor.clone());
        log::debug!("bound boundary {} for {}", token.as_raw(), descriptor.partition);
        Ok(token)
    }

    fn update_boundaries(
        &self,
        _descriptor: &BoundaryDescriptor,
        token: BoundaryToken,
    ) -> Result<(), IsolationError> {
        let mut state = self.state.lock();
        if token.as_raw() as usize >= state.boundaries.len() {
            return Err(IsolationError::UnknownBoundary(token.as_raw()));
        }
        state.active = Some(token);
        state.switches += 1;
        Ok(())
    }

    fn memory_check(
        &self,
        boundary: BoundaryToken,
        addr: usize,
        len: usize,
        access: AccessFlags,
    ) -> Result<(), IsolationError> {
        if addr.checked_add(len).is_none() {
            return Err(IsolationError::Overflow { addr, len });
        }
        if len == 0 {
            return Ok(());
        }

        let state = self.state.lock();
        let descriptor = state
            .boundaries
            .get(boundary.as_raw() as usize)
            .ok_or(IsolationError::UnknownBoundary(boundary.as_raw()))?;

        let allowed = descriptor
            .regions
            .iter()
            .any(|region| region.covers(addr, len) && region.grants().contains(access));
        if allowed {
            Ok(())
        } else {
            Err(IsolationError::AccessDenied { addr, len, access })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::MemoryRegion;

    fn bind(hal: &SimulatedIsolation, id: i32, regions: Vec<MemoryRegion>) -> BoundaryToken {
        hal.bind_boundary(&BoundaryDescriptor {
            partition: PartitionId::new(id),
            privileged: false,
            regions,
        })
        .unwrap()
    }

    #[test]
    fn test_read_only_region_rejects_writes() {
        let hal = SimulatedIsolation::new();
        let token = bind(&hal, 1, vec![MemoryRegion::read_only(0x1000, 0x100)]);

        assert!(hal.memory_check(token, 0x1000, 0x10, AccessFlags::READABLE).is_ok());
        assert_eq!(
            hal.memory_check(token, 0x1000, 0x10, AccessFlags::READWRITE),
            Err(IsolationError::AccessDenied {
                addr: 0x1000,
                len: 0x10,
                access: AccessFlags::READWRITE
            })
        );
    }

    #[test]
    fn test_boundaries_are_separate() {
        let hal = SimulatedIsolation::new();
        let a = bind(&hal, 1, vec![MemoryRegion::read_write(0x1000, 0x100)]);
        let b = bind(&hal, 2, vec![MemoryRegion::read_write(0x2000, 0x100)]);

        assert!(hal.memory_check(a, 0x1000, 4, AccessFlags::READWRITE).is_ok());
        assert!(hal.memory_check(b, 0x1000, 4, AccessFlags::READWRITE).is_err());
    }

    #[test]
    fn test_ns_access_needs_ns_region() {
        let hal = SimulatedIsolation::new();
        let token = bind(
            &hal,
            1,
            vec![
                MemoryRegion::read_write(0x1000, 0x100),
                MemoryRegion::non_secure(0x8000, 0x100),
            ],
        );
        let ns_read = AccessFlags::READABLE | AccessFlags::NS;

        assert!(hal.memory_check(token, 0x8000, 0x10, ns_read).is_ok());
        assert!(hal.memory_check(token, 0x1000, 0x10, ns_read).is_err());
    }

    #[test]
    fn test_overflow_and_empty_ranges() {
        let hal = SimulatedIsolation::new();
        let token = bind(&hal, 1, vec![MemoryRegion::read_write(0x1000, 0x100)]);

        assert_eq!(
            hal.memory_check(token, usize::MAX, 2, AccessFlags::READABLE),
            Err(IsolationError::Overflow {
                addr: usize::MAX,
                len: 2
            })
        );
        assert!(hal.memory_check(token, 0, 0, AccessFlags::READWRITE).is_ok());
    }

    #[test]
    fn test_switches_are_recorded() {
        let hal = SimulatedIsolation::new();
        let descriptor = BoundaryDescriptor {
            partition: PartitionId::new(7),
            privileged: true,
            regions: vec![MemoryRegion::read_write(0x1000, 0x100)],
        };
        let token = hal.bind_boundary(&descriptor).unwrap();

        assert_eq!(hal.active_partition(), None);
        hal.update_boundaries(&descriptor, token).unwrap();
        assert_eq!(hal.active_partition(), Some(PartitionId::new(7)));
        assert_eq!(hal.switch_count(), 1);
        assert!(hal
            .update_boundaries(&descriptor, BoundaryToken::new(9))
            .is_err());
    }

    #[test]
    fn test_invalid_region_rejected() {
        let hal = SimulatedIsolation::new();
        let result = hal.bind_boundary(&BoundaryDescriptor {
            partition: PartitionId::new(1),
            privileged: false,
            regions: vec![MemoryRegion::read_write(0x1000, 0)],
        });
        assert!(matches!(result, Err(IsolationError::InvalidRegion { .. })));
    }
}
