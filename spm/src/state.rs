//! Mutable kernel state
//!
//! All of it sits behind the single critical-section mutex in
//! [`SpmCore`](crate::SpmCore). Backends extend it with their own runtime
//! through the `R` parameter.

use crate::audit::{SpmAuditLog, SpmEvent};
use crate::config::SpmConfig;
use crate::connection::Connection;
use crate::error::FatalError;
use crate::handle::HandleCodec;
use crate::pool::{Pool, SlotRef};
use crate::registry::PartitionIdx;
use core_types::SignalSet;
use hal::BoundaryToken;
use std::collections::VecDeque;

/// Per-partition runtime fields
#[derive(Debug)]
pub struct PartitionRuntime {
    pub boundary: BoundaryToken,
    pub signals_asserted: SignalSet,
    /// Mask the partition is parked on; empty while running
    pub signals_waiting: SignalSet,
    /// Requests not yet taken by `get`, oldest first
    pub pending: VecDeque<SlotRef>,
}

impl PartitionRuntime {
    pub fn new(boundary: BoundaryToken) -> Self {
        Self {
            boundary,
            signals_asserted: SignalSet::EMPTY,
            signals_waiting: SignalSet::EMPTY,
            pending: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
pub struct KernelState<R> {
    pub pool: Pool<Connection>,
    pub codec: HandleCodec,
    pub partitions: Vec<PartitionRuntime>,
    /// Partition whose boundary is active
    pub current: Option<PartitionIdx>,
    pub halted: Option<FatalError>,
    pub started: bool,
    /// Every non-secure agent has returned
    pub finished: bool,
    pub audit: SpmAuditLog,
    pub runtime: R,
}

impl<R> KernelState<R> {
    pub fn new(config: &SpmConfig, boundaries: Vec<BoundaryToken>, runtime: R) -> Self {
        Self {
            pool: Pool::new(config.connection_pool_size),
            codec: HandleCodec::new(config.handle_salt_bits),
            partitions: boundaries.into_iter().map(PartitionRuntime::new).collect(),
            current: None,
            halted: None,
            started: false,
            finished: false,
            audit: SpmAuditLog::new(),
            runtime,
        }
    }

    pub fn partition(&self, idx: PartitionIdx) -> &PartitionRuntime {
        &self.partitions[idx.index()]
    }

    pub fn partition_mut(&mut self, idx: PartitionIdx) -> &mut PartitionRuntime {
        &mut self.partitions[idx.index()]
    }

    pub fn connection(&self, slot: SlotRef) -> Result<&Connection, FatalError> {
        Ok(self.pool.get(slot)?)
    }

    pub fn connection_mut(&mut self, slot: SlotRef) -> Result<&mut Connection, FatalError> {
        Ok(self.pool.get_mut(slot)?)
    }

    /// Returns a connection to the pool
    pub fn free_connection(&mut self, slot: SlotRef) -> Result<(), FatalError> {
        self.pool.free(slot)?;
        self.audit.record(SpmEvent::ConnectionFreed { slot: slot.index() });
        Ok(())
    }

    /// Whether a request matching `matches` is still queued on `partition`
    pub fn has_pending(
        &self,
        partition: PartitionIdx,
        matches: impl Fn(&Connection) -> bool,
    ) -> bool {
        self.partition(partition)
            .pending
            .iter()
            .any(|slot| self.pool.get(*slot).map(&matches).unwrap_or(false))
    }
}
