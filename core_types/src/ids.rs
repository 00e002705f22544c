//! Identifiers for partitions, clients and services

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a partition, assigned in its manifest
///
/// Secure partitions use strictly positive ids. The same value is reported
/// as the [`ClientId`] of requests the partition issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(i32);

impl PartitionId {
    /// Creates a partition ID from its raw manifest value
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub const fn as_raw(&self) -> i32 {
        self.0
    }

    /// The client id requests from this partition carry
    pub const fn as_client(&self) -> ClientId {
        ClientId(self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Partition({})", self.0)
    }
}

/// Identity of the caller of a service, as seen by the service
///
/// Negative values identify callers outside the secure boundary (the
/// non-secure world or a remote core); positive values are partition ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(i32);

impl ClientId {
    /// Default client id of the non-secure world
    pub const NON_SECURE_DEFAULT: ClientId = ClientId(-1);

    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> i32 {
        self.0
    }

    /// Returns true if the client lives outside the secure boundary
    pub const fn is_non_secure(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_non_secure() {
            write!(f, "Client(ns:{})", self.0)
        } else {
            write!(f, "Client({})", self.0)
        }
    }
}

/// Service identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sid(u32);

impl Sid {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({:#x})", self.0)
    }
}

/// Platform interrupt line owned by a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IrqSource(u32);

impl IrqSource {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for IrqSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Irq({})", self.0)
    }
}
