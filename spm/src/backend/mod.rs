//! Partition execution backends
//!
//! A backend decides how partition code runs and how a request travels
//! from client to service and back. Everything above this trait is shared:
//! the connection state machine, the API checks and the remote bridge.
//!
//! Two implementations exist:
//!
//! - [`ThreadedBackend`]: every partition owns an execution context and a
//!   priority; clients block until the service replies.
//! - [`DirectBackend`]: one stack; a request switches the current
//!   partition and calls the service function in place.

mod direct;
mod threaded;

pub use direct::{DirectBackend, DirectRuntime};
pub use threaded::{Scheduler, ThreadState, ThreadedBackend};

use crate::error::{FatalError, LoadError};
use crate::pool::SlotRef;
use crate::registry::{PartitionDesc, PartitionIdx, Registry};
use crate::state::KernelState;
use crate::SpmCore;
use core_types::CallReply;
use parking_lot::MutexGuard;
use psa_api::RpcClientData;
use std::sync::Arc;

/// Guard over the kernel state of a system running on backend `B`
pub type StateGuard<'a, B> = MutexGuard<'a, KernelState<<B as Backend>::Runtime>>;

pub trait Backend: Default + Send + Sync + Sized + 'static {
    /// Backend-specific part of the kernel state
    type Runtime: Send + 'static;

    const NAME: &'static str;

    /// Whether a remote request is answered after the agent regains control
    const DEFERS_RPC_REPLY: bool;

    /// Rejects partitions this backend cannot run
    fn check_partition(partition: &PartitionDesc) -> Result<(), LoadError>;

    fn check_system(registry: &Registry) -> Result<(), LoadError>;

    fn init_runtime(registry: &Registry) -> Self::Runtime;

    /// Runs the system until every non-secure agent returns or it halts
    fn run(core: &Arc<SpmCore<Self>>);

    /// Delivers the request in `slot`, already linked to its service
    ///
    /// For local clients this returns once the reply is available. For
    /// remote clients the reply goes through `RpcOps` instead and the
    /// returned value carries no information.
    fn messaging<'a>(
        &self,
        core: &'a SpmCore<Self>,
        guard: StateGuard<'a, Self>,
        slot: SlotRef,
    ) -> CallReply;

    /// Hands a reply back to the partition that issued the request
    fn replying(
        &self,
        core: &SpmCore<Self>,
        state: &mut KernelState<Self::Runtime>,
        client: PartitionIdx,
        rpc: Option<RpcClientData>,
        reply: CallReply,
    ) -> Result<(), FatalError>;

    /// Parks `partition` until a signal in `mask` is asserted
    ///
    /// Called with `signals_waiting` already set and nothing in `mask`
    /// asserted.
    fn wait_signals<'a>(
        &self,
        core: &'a SpmCore<Self>,
        guard: StateGuard<'a, Self>,
        partition: PartitionIdx,
    ) -> StateGuard<'a, Self>;

    /// Makes a parked partition runnable again
    fn wake(&self, state: &mut KernelState<Self::Runtime>, partition: PartitionIdx);

    /// Gives a higher priority partition the chance to run
    fn yield_point<'a>(
        &self,
        _core: &'a SpmCore<Self>,
        guard: StateGuard<'a, Self>,
    ) -> StateGuard<'a, Self> {
        guard
    }

    fn lock_scheduler(&self, _state: &mut KernelState<Self::Runtime>) {}

    fn unlock_scheduler(&self, _state: &mut KernelState<Self::Runtime>) {}

    /// A signal was raised from outside the partition set
    fn external_event(
        &self,
        _core: &SpmCore<Self>,
        _state: &mut KernelState<Self::Runtime>,
    ) -> Result<(), FatalError> {
        Ok(())
    }

    /// Releases every context parked in the backend after a halt
    fn on_halt(&self) {}
}

/// Unwind payload of an execution context leaving because the system halted
#[derive(Debug)]
pub(crate) struct SystemHalt;

/// Unwind payload of a partition stopped because the system finished
#[derive(Debug)]
pub(crate) struct SchedulerExit;

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
