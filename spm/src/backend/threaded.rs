//! Threaded backend
//!
//! Every partition runs on its own OS thread, but only one of them runs at
//! a time: the scheduler hands a baton to the highest priority ready
//! partition and every other thread sleeps on the turn condvar until the
//! baton comes back to it.
//!
//! ## Design
//!
//! - **Priority first**: the ready partition with the best priority runs;
//!   ties go to the partition declared first.
//! - **Switch points**: a partition gives up the baton only when it blocks
//!   (wait, or a request awaiting its reply), exits, or reaches a yield
//!   point while a better partition is ready.
//! - **One critical section**: queueing a request, asserting its signal and
//!   waking the service all happen under the kernel state mutex, so a
//!   partition entering `wait` either sees the signal or is woken later.
//! - **Scheduler lock**: while held, yield points do nothing; the holder
//!   reaches a yield point of its own after unlocking.

use super::{panic_message, Backend, SchedulerExit, StateGuard, SystemHalt};
use crate::audit::SpmEvent;
use crate::error::{FatalError, LoadError};
use crate::manifest::{PartitionEntry, Priority, ThreadFn};
use crate::pool::SlotRef;
use crate::psa::Psa;
use crate::registry::{PartitionDesc, PartitionIdx, Registry};
use crate::state::KernelState;
use crate::SpmCore;
use core_types::{CallReply, PsaStatus};
use parking_lot::Condvar;
use psa_api::RpcClientData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// Smallest host stack given to a partition thread
const MIN_HOST_STACK: usize = 256 * 1024;

/// Scheduling state of one partition thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Spawned, not yet released by `run`
    Created,
    Ready,
    Running,
    /// Parked in `wait`
    WaitingSignals,
    /// Parked until the reply to its request arrives
    WaitingReply,
    Exited,
}

#[derive(Debug)]
struct PartitionThread {
    priority: Priority,
    state: ThreadState,
    reply: Option<CallReply>,
}

/// Runtime of the threaded backend
#[derive(Debug)]
pub struct Scheduler {
    threads: Vec<PartitionThread>,
    lock_count: u32,
    live_agents: usize,
}

impl Scheduler {
    fn new(registry: &Registry) -> Self {
        Self {
            threads: registry
                .partitions()
                .map(|(_, p)| PartitionThread {
                    priority: p.priority,
                    state: ThreadState::Created,
                    reply: None,
                })
                .collect(),
            lock_count: 0,
            live_agents: 0,
        }
    }

    pub fn thread_state(&self, partition: PartitionIdx) -> ThreadState {
        self.threads[partition.index()].state
    }

    fn set_state(&mut self, partition: PartitionIdx, state: ThreadState) {
        self.threads[partition.index()].state = state;
    }

    /// Best ready partition: lowest priority value, then lowest index
    fn next_ready(&self) -> Option<PartitionIdx> {
        self.threads
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state == ThreadState::Ready)
            .min_by_key(|(i, t)| (t.priority, *i))
            .map(|(i, _)| PartitionIdx::new(i))
    }

    /// Ready partition that should take over from `running`
    fn preemptor(&self, running: PartitionIdx) -> Option<PartitionIdx> {
        let next = self.next_ready()?;
        (self.threads[next.index()].priority < self.threads[running.index()].priority)
            .then_some(next)
    }

    /// Preemptor of `running`, unless the scheduler is locked
    fn should_yield(&self, running: PartitionIdx) -> Option<PartitionIdx> {
        if self.lock_count > 0 {
            return None;
        }
        self.preemptor(running)
    }
}

/// Backend running each partition on a dedicated thread
#[derive(Debug, Default)]
pub struct ThreadedBackend {
    turn: Condvar,
}

impl ThreadedBackend {
    /// Passes the baton to the best ready partition
    ///
    /// With nothing ready the system idles; that is only legal while a
    /// remote bridge or an interrupt line can still bring in work.
    fn dispatch(
        &self,
        core: &SpmCore<Self>,
        state: &mut KernelState<Scheduler>,
    ) -> Result<(), FatalError> {
        match state.runtime.next_ready() {
            Some(next) => {
                state.runtime.set_state(next, ThreadState::Running);
                core.switch_to(state, next)?;
            }
            None => {
                state.current = None;
                if core.rpc_ops.is_none() && !core.registry.has_irqs() && !state.finished {
                    return Err(FatalError::Deadlock);
                }
                log::debug!("all partitions idle");
            }
        }
        self.turn.notify_all();
        Ok(())
    }

    /// Sleeps until `me` holds the baton
    fn wait_turn<'a>(
        &self,
        guard: StateGuard<'a, Self>,
        me: PartitionIdx,
    ) -> StateGuard<'a, Self> {
        let mut guard = guard;
        loop {
            if guard.halted.is_some() {
                drop(guard);
                panic::resume_unwind(Box::new(SystemHalt));
            }
            if guard.finished {
                drop(guard);
                panic::resume_unwind(Box::new(SchedulerExit));
            }
            if guard.current == Some(me) {
                return guard;
            }
            self.turn.wait(&mut guard);
        }
    }

    /// Parks the running partition in `reason` and passes the baton on
    fn block_on<'a>(
        &self,
        core: &'a SpmCore<Self>,
        mut guard: StateGuard<'a, Self>,
        me: PartitionIdx,
        reason: ThreadState,
    ) -> StateGuard<'a, Self> {
        guard.runtime.set_state(me, reason);
        if let Err(err) = self.dispatch(core, &mut guard) {
            core.halt(guard, err);
        }
        self.wait_turn(guard, me)
    }

    fn thread_main(core: Arc<SpmCore<Self>>, me: PartitionIdx, entry: ThreadFn) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let guard = core.backend.wait_turn(core.state.lock(), me);
            drop(guard);
            entry.call(&Psa::new(&core));
        }));

        let desc = core.registry.partition(me);
        let mut state = core.state.lock();
        match outcome {
            Ok(()) if desc.ns_agent => {
                log::debug!("non-secure agent {} returned", desc.id);
                state.runtime.set_state(me, ThreadState::Exited);
                state.runtime.live_agents = state.runtime.live_agents.saturating_sub(1);
                if state.runtime.live_agents == 0 {
                    state.finished = true;
                    state.current = None;
                    core.backend.turn.notify_all();
                } else if let Err(err) = core.backend.dispatch(&core, &mut state) {
                    core.record_halt(&mut state, err);
                }
            }
            Ok(()) => {
                log::warn!("partition {} returned from its entry", desc.id);
                state.runtime.set_state(me, ThreadState::Exited);
                if let Err(err) = core.backend.dispatch(&core, &mut state) {
                    core.record_halt(&mut state, err);
                }
            }
            Err(payload) if payload.is::<SystemHalt>() || payload.is::<SchedulerExit>() => {}
            Err(payload) => {
                let err = FatalError::PartitionPanicked {
                    partition: desc.id,
                    message: panic_message(payload.as_ref()),
                };
                core.record_halt(&mut state, err);
            }
        }
    }
}

impl Backend for ThreadedBackend {
    type Runtime = Scheduler;

    const NAME: &'static str = "threaded";
    const DEFERS_RPC_REPLY: bool = true;

    fn check_partition(partition: &PartitionDesc) -> Result<(), LoadError> {
        match partition.entry {
            PartitionEntry::Thread(_) => Ok(()),
            _ => Err(LoadError::UnsupportedPartition {
                partition: partition.id,
                backend: Self::NAME,
                reason: "partitions need a thread entry",
            }),
        }
    }

    fn check_system(registry: &Registry) -> Result<(), LoadError> {
        match registry.ns_agents().count() {
            0 => Err(LoadError::NsAgentCount {
                expected: "at least one",
                found: 0,
            }),
            _ => Ok(()),
        }
    }

    fn init_runtime(registry: &Registry) -> Scheduler {
        Scheduler::new(registry)
    }

    fn run(core: &Arc<SpmCore<Self>>) {
        let mut handles = Vec::new();
        let mut spawn_error = None;

        for (idx, desc) in core.registry.partitions() {
            let PartitionEntry::Thread(entry) = &desc.entry else {
                continue;
            };
            let thread_core = Arc::clone(core);
            let entry = entry.clone();
            let spawned = thread::Builder::new()
                .name(desc.name.clone())
                .stack_size(desc.stack_size.max(MIN_HOST_STACK))
                .spawn(move || Self::thread_main(thread_core, idx, entry));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    spawn_error = Some(FatalError::ThreadSpawn(err.to_string()));
                    break;
                }
            }
        }

        {
            let mut state = core.state.lock();
            match spawn_error {
                Some(err) => core.record_halt(&mut state, err),
                None => {
                    for thread in state.runtime.threads.iter_mut() {
                        thread.state = ThreadState::Ready;
                    }
                    state.runtime.live_agents = core.registry.ns_agents().count();
                    if let Err(err) = core.backend.dispatch(core, &mut state) {
                        core.record_halt(&mut state, err);
                    }
                }
            }
        }

        for handle in handles {
            if handle.join().is_err() {
                log::error!("partition thread ended abnormally");
            }
        }
    }

    fn messaging<'a>(
        &self,
        core: &'a SpmCore<Self>,
        guard: StateGuard<'a, Self>,
        slot: SlotRef,
    ) -> CallReply {
        let (mut guard, me) = core.caller(guard);

        let target = guard
            .connection(slot)
            .map(|conn| (conn.service, conn.rpc.is_some()));
        let (service, remote) = match target {
            Ok((Some(service), remote)) => (core.registry.service(service), remote),
            Ok((None, _)) => {
                core.halt(guard, FatalError::SchedulerInvariant("request without service"))
            }
            Err(err) => core.halt(guard, err),
        };

        guard.partition_mut(service.partition).pending.push_back(slot);
        guard.audit.record(SpmEvent::MessageQueued {
            slot: slot.index(),
            partition: core.registry.partition(service.partition).id,
            signal: service.signal,
        });
        core.assert_signal(&mut guard, service.partition, service.signal);

        if remote {
            drop(self.yield_point(core, guard));
            return CallReply::status(PsaStatus::SUCCESS);
        }

        let mut guard = self.block_on(core, guard, me, ThreadState::WaitingReply);
        match guard.runtime.threads[me.index()].reply.take() {
            Some(reply) => reply,
            None => core.halt(guard, FatalError::SchedulerInvariant("woken without a reply")),
        }
    }

    fn replying(
        &self,
        core: &SpmCore<Self>,
        state: &mut KernelState<Scheduler>,
        client: PartitionIdx,
        rpc: Option<RpcClientData>,
        reply: CallReply,
    ) -> Result<(), FatalError> {
        if let Some(data) = rpc {
            let ops = core
                .rpc_ops
                .as_ref()
                .ok_or(FatalError::SchedulerInvariant("remote reply without a bridge"))?;
            ops.reply(data, reply);
            return Ok(());
        }

        let thread = &mut state.runtime.threads[client.index()];
        if thread.state != ThreadState::WaitingReply {
            return Err(FatalError::SchedulerInvariant("reply to a client that is not waiting"));
        }
        thread.reply = Some(reply);
        thread.state = ThreadState::Ready;
        Ok(())
    }

    fn wait_signals<'a>(
        &self,
        core: &'a SpmCore<Self>,
        guard: StateGuard<'a, Self>,
        partition: PartitionIdx,
    ) -> StateGuard<'a, Self> {
        self.block_on(core, guard, partition, ThreadState::WaitingSignals)
    }

    fn wake(&self, state: &mut KernelState<Scheduler>, partition: PartitionIdx) {
        if state.runtime.thread_state(partition) == ThreadState::WaitingSignals {
            state.runtime.set_state(partition, ThreadState::Ready);
        }
    }

    fn yield_point<'a>(
        &self,
        core: &'a SpmCore<Self>,
        guard: StateGuard<'a, Self>,
    ) -> StateGuard<'a, Self> {
        let Some(me) = guard.current else {
            return guard;
        };
        if guard.runtime.should_yield(me).is_none() {
            return guard;
        }

        log::debug!("{} preempted", core.registry.partition(me).id);
        self.block_on(core, guard, me, ThreadState::Ready)
    }

    fn lock_scheduler(&self, state: &mut KernelState<Scheduler>) {
        state.runtime.lock_count += 1;
    }

    fn unlock_scheduler(&self, state: &mut KernelState<Scheduler>) {
        state.runtime.lock_count = state.runtime.lock_count.saturating_sub(1);
    }

    fn external_event(
        &self,
        core: &SpmCore<Self>,
        state: &mut KernelState<Scheduler>,
    ) -> Result<(), FatalError> {
        if state.current.is_none() {
            self.dispatch(core, state)?;
        }
        Ok(())
    }

    fn on_halt(&self) {
        self.turn.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PartitionManifest;

    fn registry() -> Registry {
        Registry::load(vec![
            PartitionManifest::new("ns", 1).as_ns_agent().with_thread(|_| {}),
            PartitionManifest::new("low", 2)
                .with_priority(Priority::Low)
                .with_thread(|_| {}),
            PartitionManifest::new("high", 3)
                .with_priority(Priority::High)
                .with_thread(|_| {}),
            PartitionManifest::new("high2", 4)
                .with_priority(Priority::High)
                .with_thread(|_| {}),
        ])
        .unwrap()
    }

    #[test]
    fn test_next_ready_by_priority_then_order() {
        let mut scheduler = Scheduler::new(&registry());
        assert_eq!(scheduler.next_ready(), None);

        for i in 0..4 {
            scheduler.set_state(PartitionIdx::new(i), ThreadState::Ready);
        }
        assert_eq!(scheduler.next_ready(), Some(PartitionIdx::new(2)));

        scheduler.set_state(PartitionIdx::new(2), ThreadState::WaitingSignals);
        assert_eq!(scheduler.next_ready(), Some(PartitionIdx::new(3)));

        scheduler.set_state(PartitionIdx::new(3), ThreadState::Exited);
        assert_eq!(scheduler.next_ready(), Some(PartitionIdx::new(1)));
    }

    #[test]
    fn test_preemptor_needs_strictly_better_priority() {
        let mut scheduler = Scheduler::new(&registry());
        scheduler.set_state(PartitionIdx::new(3), ThreadState::Ready);

        assert_eq!(
            scheduler.preemptor(PartitionIdx::new(1)),
            Some(PartitionIdx::new(3))
        );
        assert_eq!(scheduler.preemptor(PartitionIdx::new(2)), None);
    }

    #[test]
    fn test_scheduler_lock_suppresses_preemption() {
        let mut scheduler = Scheduler::new(&registry());
        scheduler.set_state(PartitionIdx::new(3), ThreadState::Ready);

        scheduler.lock_count = 1;
        assert_eq!(scheduler.should_yield(PartitionIdx::new(1)), None);
        scheduler.lock_count = 0;
        assert_eq!(
            scheduler.should_yield(PartitionIdx::new(1)),
            Some(PartitionIdx::new(3))
        );
    }

    #[test]
    fn test_rejects_sfn_partitions() {
        let registry = Registry::load(vec![PartitionManifest::new("sfn", 2).as_sfn()]).unwrap();
        let (_, desc) = registry.partitions().next().unwrap();
        assert!(matches!(
            ThreadedBackend::check_partition(desc),
            Err(LoadError::UnsupportedPartition { .. })
        ));
        assert!(matches!(
            ThreadedBackend::check_system(&registry),
            Err(LoadError::NsAgentCount { found: 0, .. })
        ));
    }
}
