//! Direct-call backend
//!
//! There is a single thread of control. A request switches the current
//! partition to the service owner, calls the service function on the
//! caller's stack and switches back when the function returns. Services
//! cannot suspend in the middle of a request.
//!
//! Exactly one non-secure agent runs, on the thread that calls
//! [`Spm::run`](crate::Spm::run). Secure partitions only provide service
//! functions and an optional initializer, which runs once before the
//! partition serves its first request.

use super::{panic_message, Backend, StateGuard, SystemHalt};
use crate::audit::SpmEvent;
use crate::error::{FatalError, LoadError};
use crate::manifest::PartitionEntry;
use crate::pool::SlotRef;
use crate::psa::Psa;
use crate::registry::{PartitionDesc, PartitionIdx, Registry};
use crate::state::KernelState;
use crate::SpmCore;
use core_types::{CallReply, PartitionId, PsaStatus};
use parking_lot::Condvar;
use psa_api::RpcClientData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Runtime of the direct-call backend
#[derive(Debug)]
pub struct DirectRuntime {
    initialized: Vec<bool>,
    /// Reply of the innermost request that just completed
    last_reply: Option<CallReply>,
}

impl DirectRuntime {
    pub fn is_initialized(&self, partition: PartitionIdx) -> bool {
        self.initialized[partition.index()]
    }
}

/// Backend calling service functions in place
#[derive(Debug, Default)]
pub struct DirectBackend {
    /// Signals raised from outside the partition set
    doorbell: Condvar,
}

impl DirectBackend {
    /// Runs the initializer of `partition` unless it already ran
    fn ensure_initialized<'a>(
        &self,
        core: &'a SpmCore<Self>,
        mut guard: StateGuard<'a, Self>,
        partition: PartitionIdx,
    ) -> StateGuard<'a, Self> {
        if guard.runtime.initialized[partition.index()] {
            return guard;
        }
        guard.runtime.initialized[partition.index()] = true;

        let desc = core.registry.partition(partition);
        if let PartitionEntry::Sfn { init: Some(init) } = &desc.entry {
            let previous = guard.current;
            if let Err(err) = core.switch_to(&mut guard, partition) {
                core.halt(guard, err);
            }
            drop(guard);

            let status = init.call(&Psa::new(core));

            guard = core.state.lock();
            if status.as_raw() < 0 {
                core.halt(
                    guard,
                    FatalError::PartitionInitFailed {
                        partition: desc.id,
                        status,
                    },
                );
            }
            if let Some(previous) = previous {
                if let Err(err) = core.switch_to(&mut guard, previous) {
                    core.halt(guard, err);
                }
            }
        }

        log::debug!("partition {} initialized", desc.id);
        guard
            .audit
            .record(SpmEvent::PartitionInitialized { partition: desc.id });
        guard
    }
}

impl Backend for DirectBackend {
    type Runtime = DirectRuntime;

    const NAME: &'static str = "direct";
    const DEFERS_RPC_REPLY: bool = false;

    fn check_partition(partition: &PartitionDesc) -> Result<(), LoadError> {
        let unsupported = |reason| LoadError::UnsupportedPartition {
            partition: partition.id,
            backend: Self::NAME,
            reason,
        };
        if !partition.irqs.is_empty() {
            return Err(unsupported("interrupts need the threaded backend"));
        }
        match &partition.entry {
            PartitionEntry::Thread(_) if partition.ns_agent => Ok(()),
            PartitionEntry::Thread(_) => {
                Err(unsupported("secure partitions need service functions"))
            }
            PartitionEntry::Sfn { .. } if partition.ns_agent => {
                Err(unsupported("the non-secure agent needs a thread entry"))
            }
            PartitionEntry::Sfn { .. } => Ok(()),
            PartitionEntry::Missing => Err(LoadError::MissingEntry(partition.id)),
        }
    }

    fn check_system(registry: &Registry) -> Result<(), LoadError> {
        let found = registry.ns_agents().count();
        if found != 1 {
            return Err(LoadError::NsAgentCount {
                expected: "exactly one",
                found,
            });
        }
        for (_, partition) in registry.partitions() {
            let services = &partition.services;
            if !partition.ns_agent
                && services.iter().any(|s| registry.service(*s).sfn.is_none())
            {
                return Err(LoadError::UnsupportedPartition {
                    partition: partition.id,
                    backend: Self::NAME,
                    reason: "every service needs a service function",
                });
            }
        }
        Ok(())
    }

    fn init_runtime(registry: &Registry) -> DirectRuntime {
        DirectRuntime {
            initialized: vec![false; registry.partition_count()],
            last_reply: None,
        }
    }

    fn run(core: &Arc<SpmCore<Self>>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            for (idx, desc) in core.registry.partitions() {
                if desc.is_sfn() {
                    let guard = core.backend.ensure_initialized(core, core.state.lock(), idx);
                    drop(guard);
                }
            }

            let Some((agent, desc)) = core.registry.ns_agents().next() else {
                return;
            };
            {
                let mut guard = core.state.lock();
                if let Err(err) = core.switch_to(&mut guard, agent) {
                    core.halt(guard, err);
                }
            }
            if let PartitionEntry::Thread(entry) = &desc.entry {
                entry.call(&Psa::new(core));
            }
        }));

        let mut state = core.state.lock();
        match outcome {
            Ok(()) => {
                state.finished = true;
                log::debug!("non-secure agent returned");
            }
            Err(payload) if payload.is::<SystemHalt>() => {}
            Err(payload) => {
                let partition = state
                    .current
                    .map(|p| core.registry.partition(p).id)
                    .unwrap_or(PartitionId::new(0));
                let err = FatalError::PartitionPanicked {
                    partition,
                    message: panic_message(payload.as_ref()),
                };
                core.record_halt(&mut state, err);
            }
        }
    }

    fn messaging<'a>(
        &self,
        core: &'a SpmCore<Self>,
        guard: StateGuard<'a, Self>,
        slot: SlotRef,
    ) -> CallReply {
        let target = guard.connection(slot).map(|conn| (conn.service, conn.message()));
        let (service, msg) = match target {
            Ok((Some(service), msg)) => (core.registry.service(service), msg),
            Ok((None, _)) => {
                core.halt(guard, FatalError::SchedulerInvariant("request without service"))
            }
            Err(err) => core.halt(guard, err),
        };
        let Some(sfn) = service.sfn.clone() else {
            core.halt(guard, FatalError::SchedulerInvariant("service without function"));
        };

        let mut guard = self.ensure_initialized(core, guard, service.partition);
        if let Err(err) = core.switch_to(&mut guard, service.partition) {
            core.halt(guard, err);
        }
        guard.audit.record(SpmEvent::MessageRetrieved {
            handle: msg.handle,
            partition: core.registry.partition(service.partition).id,
        });
        drop(guard);

        let status = sfn.call(&Psa::new(core), &msg);

        let mut guard = core.complete_message(core.state.lock(), slot, status);
        guard
            .runtime
            .last_reply
            .take()
            .unwrap_or(CallReply::status(PsaStatus::SUCCESS))
    }

    fn replying(
        &self,
        core: &SpmCore<Self>,
        state: &mut KernelState<DirectRuntime>,
        client: PartitionIdx,
        rpc: Option<RpcClientData>,
        reply: CallReply,
    ) -> Result<(), FatalError> {
        core.switch_to(state, client)?;
        match rpc {
            Some(data) => {
                let ops = core
                    .rpc_ops
                    .as_ref()
                    .ok_or(FatalError::SchedulerInvariant("remote reply without a bridge"))?;
                ops.reply(data, reply);
            }
            None => state.runtime.last_reply = Some(reply),
        }
        Ok(())
    }

    fn wait_signals<'a>(
        &self,
        core: &'a SpmCore<Self>,
        mut guard: StateGuard<'a, Self>,
        partition: PartitionIdx,
    ) -> StateGuard<'a, Self> {
        loop {
            guard = core.check_halted(guard);
            if guard.partition(partition).signals_waiting.is_empty() {
                return guard;
            }
            self.doorbell.wait(&mut guard);
        }
    }

    fn wake(&self, _state: &mut KernelState<DirectRuntime>, _partition: PartitionIdx) {
        self.doorbell.notify_all();
    }

    fn on_halt(&self) {
        self.doorbell.notify_all();
    }
}
