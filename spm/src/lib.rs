//! # Secure Partition Manager
//!
//! This crate hosts isolated partitions and routes requests between them
//! through the PSA client/service API.
//!
//! ## Structure
//!
//! - [`pool`] and [`handle`]: the fixed connection pool and the salted
//!   encoding of its slots into client handles
//! - [`registry`] and [`manifest`]: the static partition and service tables
//! - [`connection`]: the per-request state machine
//! - [`backend`]: how partition code runs (threaded or direct calls)
//! - [`psa`]: the API surface partition code programs against
//! - [`rpc`]: entry points for requests forwarded from another core
//!
//! Partitions that own interrupt lines receive them as signals. A line is
//! raised from outside the partition set with [`Spm::raise_irq`].
//!
//! ## Trust model
//!
//! Requests from the non-secure world or a remote core are untrusted: a
//! malformed request gets an error status back. The same mistake made by a
//! secure partition halts the system, and [`Spm::run`] reports why.
//!
//! ```
//! use core_types::{PsaStatus, Sid};
//! use hal::{RamBus, SimulatedIsolation};
//! use psa_api::Timeout;
//! use spm::manifest::{PartitionManifest, ServiceManifest};
//! use spm::{Spm, SpmConfig, ThreadedBackend};
//! use std::sync::Arc;
//!
//! let echo = Sid::new(0x40);
//! let spm = Spm::<ThreadedBackend>::builder(SpmConfig::default())
//!     .with_partition(
//!         PartitionManifest::new("server", 2)
//!             .with_service(ServiceManifest::new("echo", echo, 4).non_secure_accessible())
//!             .with_thread(|psa| loop {
//!                 let signals = psa.wait(core_types::SignalSet::bit(4), Timeout::Block);
//!                 if let Ok(msg) = psa.get(signals) {
//!                     psa.reply(msg.handle, PsaStatus::SUCCESS);
//!                 }
//!             }),
//!     )
//!     .with_partition(PartitionManifest::new("ns", 1).as_ns_agent().with_thread(move |psa| {
//!         let handle = psa.connect(echo, 1).unwrap();
//!         psa.close(handle);
//!     }))
//!     .build(Arc::new(SimulatedIsolation::new()), Arc::new(RamBus::new(0x1000, 0x100)))
//!     .unwrap();
//!
//! assert!(spm.run().is_ok());
//! ```

pub mod audit;
pub mod backend;
mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handle;
pub mod manifest;
pub mod pool;
pub mod psa;
pub mod registry;
pub mod rpc;
mod service;
pub mod state;

#[cfg(test)]
mod test_utils;

pub use backend::{Backend, DirectBackend, StateGuard, ThreadedBackend};
pub use config::SpmConfig;
pub use error::{FatalError, LoadError};
pub use psa::Psa;
pub use rpc::RpcOps;

use audit::{SpmAuditLog, SpmEvent};
use backend::SystemHalt;
use core_types::{IrqSource, PartitionId, PsaStatus, SignalSet};
use hal::{BoundaryDescriptor, InterruptHal, IsolationHal, MemoryBus};
use manifest::PartitionManifest;
use parking_lot::Mutex;
use psa_api::FlihResult;
use registry::{IrqDesc, PartitionIdx, Registry};
use state::KernelState;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Shared core of a running system
///
/// Owned through an `Arc` by [`Spm`] and by every partition context.
pub struct SpmCore<B: Backend> {
    pub(crate) config: SpmConfig,
    pub(crate) registry: Registry,
    pub(crate) boundaries: Vec<BoundaryDescriptor>,
    pub(crate) isolation: Arc<dyn IsolationHal>,
    pub(crate) memory: Arc<dyn MemoryBus>,
    pub(crate) rpc_ops: Option<Arc<dyn RpcOps>>,
    pub(crate) interrupts: Option<Arc<dyn InterruptHal>>,
    pub(crate) state: Mutex<KernelState<B::Runtime>>,
    pub(crate) backend: B,
}

impl<B: Backend> fmt::Debug for SpmCore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpmCore")
            .field("backend", &B::NAME)
            .field("config", &self.config)
            .field("partitions", &self.registry.partition_count())
            .field("rpc", &self.rpc_ops.is_some())
            .field("interrupts", &self.interrupts.is_some())
            .finish()
    }
}

impl<B: Backend> SpmCore<B> {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Records a fatal error without leaving the calling context
    ///
    /// Only the first error is kept.
    pub(crate) fn record_halt(&self, state: &mut KernelState<B::Runtime>, err: FatalError) {
        if state.halted.is_none() {
            log::error!("system halted: {}", err);
            state.audit.record(SpmEvent::Halted {
                reason: err.to_string(),
            });
            state.halted = Some(err);
        }
        self.backend.on_halt();
    }

    /// Records a fatal error and unwinds the calling execution context
    pub(crate) fn halt(&self, mut guard: StateGuard<'_, B>, err: FatalError) -> ! {
        self.record_halt(&mut guard, err);
        drop(guard);
        std::panic::resume_unwind(Box::new(SystemHalt))
    }

    /// Unwinds if the system halted while the caller was parked
    pub(crate) fn check_halted<'a>(&'a self, guard: StateGuard<'a, B>) -> StateGuard<'a, B> {
        if guard.halted.is_some() {
            drop(guard);
            std::panic::resume_unwind(Box::new(SystemHalt))
        }
        guard
    }

    /// Partition whose code is calling into the manager
    pub(crate) fn caller<'a>(&'a self, guard: StateGuard<'a, B>) -> (StateGuard<'a, B>, PartitionIdx) {
        let current = guard.current;
        match current {
            Some(p) => (guard, p),
            None => self.halt(
                guard,
                FatalError::SchedulerInvariant("API call with no current partition"),
            ),
        }
    }

    /// Makes `to` the current partition and activates its boundary
    pub(crate) fn switch_to(
        &self,
        state: &mut KernelState<B::Runtime>,
        to: PartitionIdx,
    ) -> Result<(), FatalError> {
        if state.current == Some(to) {
            return Ok(());
        }
        let from = state.current.map(|p| self.registry.partition(p).id);
        let descriptor = &self.boundaries[to.index()];
        self.isolation
            .update_boundaries(descriptor, state.partition(to).boundary)
            .map_err(FatalError::Isolation)?;
        state.current = Some(to);
        state.audit.record(SpmEvent::ContextSwitch {
            from,
            to: descriptor.partition,
        });
        Ok(())
    }

    /// Asserts `signal` on `partition`, waking it if it waits for it
    pub(crate) fn assert_signal(
        &self,
        state: &mut KernelState<B::Runtime>,
        partition: PartitionIdx,
        signal: SignalSet,
    ) {
        let runtime = state.partition_mut(partition);
        runtime.signals_asserted.insert(signal);
        if runtime.signals_waiting.intersects(signal) {
            let signals = runtime.signals_asserted & runtime.signals_waiting;
            runtime.signals_waiting = SignalSet::EMPTY;
            state.audit.record(SpmEvent::PartitionWoken {
                partition: self.registry.partition(partition).id,
                signals,
            });
            self.backend.wake(state, partition);
        }
    }

    /// Handles an interrupt taken on a line owned by `partition`
    ///
    /// A line without a first-level handler is masked until the partition
    /// calls `eoi`.
    pub(crate) fn take_interrupt(
        &self,
        state: &mut KernelState<B::Runtime>,
        partition: PartitionIdx,
        irq: &IrqDesc,
    ) {
        let signalled = match &irq.flih {
            Some(flih) => flih.call() == FlihResult::Signal,
            None => {
                if let Some(interrupts) = &self.interrupts {
                    interrupts.disable(irq.source);
                }
                true
            }
        };
        state.audit.record(SpmEvent::InterruptTaken {
            source: irq.source,
            partition: self.registry.partition(partition).id,
            signalled,
        });
        if signalled {
            self.assert_signal(state, partition, irq.signal);
        }
    }

    /// Lets the backend react to a signal asserted from outside
    fn external_event(&self, state: &mut KernelState<B::Runtime>) -> Result<(), PsaStatus> {
        if !state.started {
            return Ok(());
        }
        self.backend.external_event(self, state).map_err(|err| {
            self.record_halt(state, err);
            PsaStatus::BAD_STATE
        })
    }
}

/// Handle to a system of partitions
pub struct Spm<B: Backend> {
    core: Arc<SpmCore<B>>,
}

impl<B: Backend> Clone for Spm<B> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<B: Backend> fmt::Debug for Spm<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Spm").field(&self.core).finish()
    }
}

impl<B: Backend> Spm<B> {
    pub fn builder(config: SpmConfig) -> SpmBuilder<B> {
        SpmBuilder::new(config)
    }

    /// Runs every partition until the non-secure agents return
    ///
    /// Returns the fatal error if the system halted.
    pub fn run(&self) -> Result<(), FatalError> {
        {
            let mut state = self.core.state.lock();
            if state.started {
                return Err(FatalError::SchedulerInvariant("system already started"));
            }
            state.started = true;
        }
        log::debug!(
            "starting {} partitions on the {} backend",
            self.core.registry.partition_count(),
            B::NAME
        );

        B::run(&self.core);

        let state = self.core.state.lock();
        match &state.halted {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Rings the doorbell of a partition from outside the partition set
    pub fn raise_doorbell(&self, partition: PartitionId) -> Result<(), PsaStatus> {
        let core = &self.core;
        let idx = core
            .registry
            .find_partition(partition)
            .ok_or(PsaStatus::DOES_NOT_EXIST)?;

        let mut state = core.state.lock();
        if state.halted.is_some() || state.finished {
            return Err(PsaStatus::BAD_STATE);
        }
        core.assert_signal(&mut state, idx, SignalSet::DOORBELL);
        core.external_event(&mut state)
    }

    /// Raises an interrupt line from outside the partition set
    ///
    /// An interrupt on a masked line stays latched in the controller and is
    /// delivered when the owning partition enables the line.
    pub fn raise_irq(&self, source: IrqSource) -> Result<(), PsaStatus> {
        let core = &self.core;
        let (idx, irq) = core
            .registry
            .find_irq(source)
            .ok_or(PsaStatus::DOES_NOT_EXIST)?;
        let interrupts = core.interrupts.as_ref().ok_or(PsaStatus::DOES_NOT_EXIST)?;

        let mut state = core.state.lock();
        if state.halted.is_some() || state.finished {
            return Err(PsaStatus::BAD_STATE);
        }
        if !interrupts.trigger(source) {
            return Ok(());
        }
        core.take_interrupt(&mut state, idx, irq);
        core.external_event(&mut state)
    }

    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    /// Snapshot of the audit trail
    pub fn audit_log(&self) -> SpmAuditLog {
        self.core.state.lock().audit.clone()
    }

    pub fn connections_in_use(&self) -> usize {
        self.core.state.lock().pool.allocated()
    }

    /// The error that halted the system, if any
    pub fn fault(&self) -> Option<FatalError> {
        self.core.state.lock().halted.clone()
    }

    pub fn core(&self) -> &Arc<SpmCore<B>> {
        &self.core
    }
}

/// Collects manifests and builds an [`Spm`]
pub struct SpmBuilder<B: Backend> {
    config: SpmConfig,
    manifests: Vec<PartitionManifest>,
    rpc_ops: Option<Arc<dyn RpcOps>>,
    interrupts: Option<Arc<dyn InterruptHal>>,
    _backend: PhantomData<B>,
}

impl<B: Backend> SpmBuilder<B> {
    pub fn new(config: SpmConfig) -> Self {
        Self {
            config,
            manifests: Vec::new(),
            rpc_ops: None,
            interrupts: None,
            _backend: PhantomData,
        }
    }

    pub fn with_partition(mut self, manifest: PartitionManifest) -> Self {
        self.manifests.push(manifest);
        self
    }

    /// Registers the bridge that serves remote clients
    pub fn with_rpc_ops(mut self, ops: Arc<dyn RpcOps>) -> Self {
        self.rpc_ops = Some(ops);
        self
    }

    /// Attaches the controller behind the partitions' interrupt lines
    pub fn with_interrupts(mut self, interrupts: Arc<dyn InterruptHal>) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    /// Validates the system and binds every partition boundary
    pub fn build(
        self,
        isolation: Arc<dyn IsolationHal>,
        memory: Arc<dyn MemoryBus>,
    ) -> Result<Spm<B>, LoadError> {
        self.config.validate()?;
        let registry = Registry::load(self.manifests)?;
        for (_, partition) in registry.partitions() {
            B::check_partition(partition)?;
            if !partition.irqs.is_empty() && self.interrupts.is_none() {
                return Err(LoadError::NoInterruptController(partition.id));
            }
        }
        B::check_system(&registry)?;

        let boundaries: Vec<BoundaryDescriptor> = registry
            .partitions()
            .map(|(_, p)| BoundaryDescriptor {
                partition: p.id,
                privileged: p.privileged,
                regions: p.regions.clone(),
            })
            .collect();
        let tokens = boundaries
            .iter()
            .map(|descriptor| isolation.bind_boundary(descriptor))
            .collect::<Result<Vec<_>, _>>()?;

        let runtime = B::init_runtime(&registry);
        let state = KernelState::new(&self.config, tokens, runtime);
        log::debug!(
            "loaded {} partitions, pool of {} connections",
            registry.partition_count(),
            self.config.connection_pool_size
        );

        Ok(Spm {
            core: Arc::new(SpmCore {
                config: self.config,
                registry,
                boundaries,
                isolation,
                memory,
                rpc_ops: self.rpc_ops,
                interrupts: self.interrupts,
                state: Mutex::new(state),
                backend: B::default(),
            }),
        })
    }
}

impl<B: Backend> Default for SpmBuilder<B> {
    fn default() -> Self {
        Self::new(SpmConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{build, echo_server};
    use core_types::Sid;

    const ECHO: Sid = Sid::new(0x100);

    fn ns_agent(body: impl Fn(&dyn psa_api::PsaApi) + Send + Sync + 'static) -> PartitionManifest {
        PartitionManifest::new("ns", 1).as_ns_agent().with_thread(body)
    }

    #[test]
    fn test_threaded_echo_round_trip() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&statuses);
        let spm: Spm<ThreadedBackend> = build(
            SpmConfig::default(),
            vec![
                echo_server(2, ECHO, 4),
                ns_agent(move |psa| {
                    let handle = psa.connect(ECHO, 1).expect("connect");
                    seen.lock().push(psa.call(handle, 0, &[], &mut []));
                    psa.close(handle);
                }),
            ],
        );

        assert!(spm.run().is_ok());
        assert_eq!(*statuses.lock(), vec![PsaStatus::SUCCESS]);
        assert_eq!(spm.connections_in_use(), 0);
        assert!(spm.fault().is_none());
    }

    #[test]
    fn test_run_twice_is_rejected() {
        let spm: Spm<ThreadedBackend> =
            build(SpmConfig::default(), vec![echo_server(2, ECHO, 4), ns_agent(|_| {})]);

        assert!(spm.run().is_ok());
        assert!(spm.run().is_err());
    }

    #[test]
    fn test_doorbell_for_unknown_partition() {
        let spm: Spm<ThreadedBackend> =
            build(SpmConfig::default(), vec![echo_server(2, ECHO, 4), ns_agent(|_| {})]);

        assert_eq!(
            spm.raise_doorbell(PartitionId::new(99)),
            Err(PsaStatus::DOES_NOT_EXIST)
        );
    }

    #[test]
    fn test_doorbell_after_finish_is_bad_state() {
        let spm: Spm<ThreadedBackend> =
            build(SpmConfig::default(), vec![echo_server(2, ECHO, 4), ns_agent(|_| {})]);

        spm.run().unwrap();
        assert_eq!(
            spm.raise_doorbell(PartitionId::new(2)),
            Err(PsaStatus::BAD_STATE)
        );
    }
}
