//! Error types for loading and running the partition manager

use crate::pool::PoolError;
use core_types::{IrqSource, PartitionId, PsaStatus, Sid, SignalSet};
use hal::{IsolationError, MemoryError};
use thiserror::Error;

/// Errors detected while building a system from its manifests
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Manifest parse error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Invalid partition id: {0}")]
    InvalidPartitionId(PartitionId),

    #[error("Duplicate partition id: {0}")]
    DuplicatePartition(PartitionId),

    #[error("Duplicate service id: {0}")]
    DuplicateSid(Sid),

    #[error("Service {service} has invalid signal {signal}")]
    InvalidSignal { service: String, signal: SignalSet },

    #[error("Signal {signal} declared twice in partition {partition}")]
    DuplicateSignal {
        partition: PartitionId,
        signal: SignalSet,
    },

    #[error("Stateless index {index} of service {service} is out of range")]
    StatelessIndexOutOfRange { service: String, index: u8 },

    #[error("Stateless index {0} used twice")]
    DuplicateStatelessIndex(u8),

    #[error("Partition {partition} depends on unknown service {sid}")]
    UnknownDependency { partition: PartitionId, sid: Sid },

    #[error("Non-secure agent {0} must use a negative client id")]
    InvalidNsClientId(PartitionId),

    #[error("Partition {0} has no entry point")]
    MissingEntry(PartitionId),

    #[error("Partition {partition} cannot run on the {backend} backend: {reason}")]
    UnsupportedPartition {
        partition: PartitionId,
        backend: &'static str,
        reason: &'static str,
    },

    #[error("System needs {expected} non-secure agent(s), found {found}")]
    NsAgentCount { expected: &'static str, found: usize },

    #[error("Interrupt source {0} is owned twice")]
    DuplicateIrqSource(IrqSource),

    #[error("Partition {0} declares interrupts but no interrupt controller is attached")]
    NoInterruptController(PartitionId),

    #[error("Boundary binding failed: {0}")]
    Boundary(#[from] IsolationError),
}

/// Conditions that halt the whole system
///
/// These are never returned to partition code. The execution context that
/// detects one records it and unwinds; `Spm::run` reports it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("Programmer error by {partition}: {status}")]
    ProgrammerError {
        partition: PartitionId,
        status: PsaStatus,
    },

    #[error("{partition} used an invalid message handle")]
    InvalidMessageHandle { partition: PartitionId },

    #[error("{partition} misused the service API: {reason}")]
    ServiceApiMisuse {
        partition: PartitionId,
        reason: &'static str,
    },

    #[error("{partition} wrote past the end of an output vector")]
    WriteOverflow { partition: PartitionId },

    #[error("{partition} replied to a connect request with {status}")]
    InvalidConnectReply {
        partition: PartitionId,
        status: PsaStatus,
    },

    #[error("Connection pool corrupted: {0}")]
    PoolCorruption(PoolError),

    #[error("Scheduler invariant violated: {0}")]
    SchedulerInvariant(&'static str),

    #[error("All partitions are blocked and nothing can wake them")]
    Deadlock,

    #[error("Isolation fault: {0}")]
    Isolation(IsolationError),

    #[error("Memory fault: {0}")]
    Memory(MemoryError),

    #[error("{partition} panicked: {message}")]
    PartitionPanicked {
        partition: PartitionId,
        message: String,
    },

    #[error("Initialization of {partition} failed with {status}")]
    PartitionInitFailed {
        partition: PartitionId,
        status: PsaStatus,
    },

    #[error("{partition} requested a system reset")]
    ResetRequested { partition: PartitionId },

    #[error("Failed to start partition thread: {0}")]
    ThreadSpawn(String),
}

impl From<PoolError> for FatalError {
    fn from(err: PoolError) -> Self {
        FatalError::PoolCorruption(err)
    }
}
