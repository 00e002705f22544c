//! Audit trail of partition manager activity
//!
//! Every state change that matters for the trust model is recorded in
//! order: allocations and frees, message delivery, wakeups, context
//! switches, replies and halts. Tests query the trail to check ordering
//! properties that are not visible through return values.
//!
//! ```
//! use spm::audit::{SpmAuditLog, SpmEvent};
//!
//! let mut log = SpmAuditLog::new();
//! log.record(SpmEvent::ConnectionFreed { slot: 3 });
//! assert!(log.has_event(|e| matches!(e, SpmEvent::ConnectionFreed { slot: 3 })));
//! ```

use core_types::{Handle, IrqSource, PartitionId, PsaStatus, Sid, SignalSet};
use serde::{Deserialize, Serialize};

/// One audited state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpmEvent {
    ConnectionAllocated {
        slot: u32,
        sid: Sid,
        client: PartitionId,
    },
    ConnectionFreed {
        slot: u32,
    },
    /// Linked onto the service partition's pending list
    MessageQueued {
        slot: u32,
        partition: PartitionId,
        signal: SignalSet,
    },
    /// Handed out by `get`
    MessageRetrieved {
        handle: Handle,
        partition: PartitionId,
    },
    WaitBlocked {
        partition: PartitionId,
        mask: SignalSet,
    },
    PartitionWoken {
        partition: PartitionId,
        signals: SignalSet,
    },
    ContextSwitch {
        from: Option<PartitionId>,
        to: PartitionId,
    },
    Replied {
        handle: Handle,
        status: PsaStatus,
    },
    /// A programmer error was returned to an untrusted caller
    ProgrammerErrorReturned {
        partition: PartitionId,
        status: PsaStatus,
    },
    /// `signalled` is false when a first-level handler finished the work
    InterruptTaken {
        source: IrqSource,
        partition: PartitionId,
        signalled: bool,
    },
    PartitionInitialized {
        partition: PartitionId,
    },
    Halted {
        reason: String,
    },
}

/// Chronological record of [`SpmEvent`]s
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SpmAuditLog {
    events: Vec<SpmEvent>,
}

impl SpmAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: SpmEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[SpmEvent] {
        &self.events
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&SpmEvent) -> bool,
    {
        self.events.iter().any(predicate)
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SpmEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).count()
    }

    /// Position of the first event matching `predicate`
    pub fn position<F>(&self, predicate: F) -> Option<usize>
    where
        F: Fn(&SpmEvent) -> bool,
    {
        self.events.iter().position(predicate)
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
