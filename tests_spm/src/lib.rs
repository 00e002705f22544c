//! End-to-end Test Utilities
//!
//! Shared fixtures for scenarios that boot a whole system of partitions and
//! drive it through the client and service APIs.
//!
//! ## Test Philosophy
//!
//! - **Both backends**: behavior visible to partition code must not depend
//!   on how partitions are scheduled
//! - **Trust boundary**: untrusted callers get status codes back, secure
//!   callers that misbehave halt the system
//! - **Observable ordering**: the audit log shows what return values hide
//! - **Nothing leaks**: every scenario ends with an empty connection pool

use core_types::{InVec, Message, MessageType, OutVec, PsaStatus, SignalSet};
use hal::{MemoryBus, MemoryRegion, RamBus, SimulatedInterrupts, SimulatedIsolation};
use parking_lot::Mutex;
use psa_api::{PsaApi, Timeout};
use spm::audit::SpmAuditLog;
use spm::manifest::{PartitionManifest, ServiceManifest};
use spm::{Backend, FatalError, RpcOps, Spm, SpmConfig};
use std::sync::Arc;

pub const NS_AGENT_ID: i32 = 1;

pub const RAM_BASE: usize = 0x2000_0000;
pub const RAM_SIZE: usize = 0x2000;

/// Buffers owned by the non-secure world
pub const NS_BUFFERS: usize = RAM_BASE;
pub const NS_BUFFERS_LEN: usize = 0x1000;

/// Buffers owned by secure client partitions
pub const SECURE_BUFFERS: usize = RAM_BASE + 0x1000;
pub const SECURE_BUFFERS_LEN: usize = 0x1000;

/// A booted system plus the simulated hardware under it
pub struct TestSystem<B: Backend> {
    pub spm: Spm<B>,
    pub memory: Arc<RamBus>,
    pub isolation: Arc<SimulatedIsolation>,
    pub interrupts: Arc<SimulatedInterrupts>,
}

impl<B: Backend> TestSystem<B> {
    pub fn boot(partitions: Vec<PartitionManifest>) -> Self {
        Self::boot_with(SpmConfig::default(), partitions, None)
    }

    pub fn boot_with(
        config: SpmConfig,
        partitions: Vec<PartitionManifest>,
        rpc_ops: Option<Arc<dyn RpcOps>>,
    ) -> Self {
        Self::boot_on(test_memory(), config, partitions, rpc_ops)
    }

    /// Boots on memory the caller already holds, for services that access
    /// client buffers directly
    pub fn boot_on(
        memory: Arc<RamBus>,
        config: SpmConfig,
        partitions: Vec<PartitionManifest>,
        rpc_ops: Option<Arc<dyn RpcOps>>,
    ) -> Self {
        let isolation = Arc::new(SimulatedIsolation::new());
        let interrupts = Arc::new(SimulatedInterrupts::new());

        let mut builder = partitions
            .into_iter()
            .fold(Spm::<B>::builder(config), |b, p| b.with_partition(p))
            .with_interrupts(interrupts.clone());
        if let Some(ops) = rpc_ops {
            builder = builder.with_rpc_ops(ops);
        }
        let spm = builder
            .build(isolation.clone(), memory.clone())
            .expect("Failed to build system");

        Self {
            spm,
            memory,
            isolation,
            interrupts,
        }
    }

    pub fn run(&self) -> Result<(), FatalError> {
        self.spm.run()
    }

    pub fn audit(&self) -> SpmAuditLog {
        self.spm.audit_log()
    }

    pub fn write(&self, addr: usize, data: &[u8]) {
        self.memory.write(addr, data).expect("Failed to write test memory");
    }

    pub fn read(&self, addr: usize, len: usize) -> Vec<u8> {
        self.memory.read_vec(addr, len).expect("Failed to read test memory")
    }
}

/// RAM holding the non-secure and secure buffers
pub fn test_memory() -> Arc<RamBus> {
    Arc::new(RamBus::new(RAM_BASE, RAM_SIZE))
}

/// Collects values produced inside partitions for assertions after `run`
#[derive(Debug)]
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: T) {
        self.0.lock().push(value);
    }

    pub fn values(&self) -> Vec<T> {
        self.0.lock().clone()
    }
}

/// The non-secure agent with access to the non-secure buffers
pub fn ns_agent(body: impl Fn(&dyn PsaApi) + Send + Sync + 'static) -> PartitionManifest {
    PartitionManifest::new("ns_agent", NS_AGENT_ID)
        .as_ns_agent()
        .with_region(MemoryRegion::non_secure(NS_BUFFERS, NS_BUFFERS_LEN))
        .with_thread(body)
}

/// A secure client partition with access to the secure buffers
pub fn secure_client(
    id: i32,
    body: impl Fn(&dyn PsaApi) + Send + Sync + 'static,
) -> PartitionManifest {
    PartitionManifest::new("secure_client", id)
        .with_region(MemoryRegion::read_write(SECURE_BUFFERS, SECURE_BUFFERS_LEN))
        .with_thread(body)
}

/// Thread partition serving `services` with `handler`
pub fn service_thread(
    id: i32,
    services: Vec<ServiceManifest>,
    handler: impl Fn(&dyn PsaApi, &Message) -> PsaStatus + Send + Sync + 'static,
) -> PartitionManifest {
    let mask = services
        .iter()
        .fold(SignalSet::EMPTY, |mask, service| mask | service.signal());
    let manifest = services
        .into_iter()
        .fold(PartitionManifest::new("service", id), |p, s| p.with_service(s));
    manifest.with_thread(move |psa| serve_forever(psa, mask, &handler))
}

/// Service-function partition serving `services` with `handler`
pub fn service_sfn(
    id: i32,
    services: Vec<ServiceManifest>,
    handler: impl Fn(&dyn PsaApi, &Message) -> PsaStatus + Send + Sync + Clone + 'static,
) -> PartitionManifest {
    services
        .into_iter()
        .fold(PartitionManifest::new("service", id).as_sfn(), |p, s| {
            p.with_service(s.with_sfn(handler.clone()))
        })
}

/// Service loop of a thread partition
pub fn serve_forever(
    psa: &dyn PsaApi,
    mask: SignalSet,
    handler: &dyn Fn(&dyn PsaApi, &Message) -> PsaStatus,
) -> ! {
    loop {
        let asserted = psa.wait(mask, Timeout::Block);
        for bit in SignalSet::FIRST_SERVICE_BIT..32 {
            let signal = SignalSet::bit(bit);
            if !asserted.contains(signal) {
                continue;
            }
            if let Ok(msg) = psa.get(signal) {
                let status = handler(psa, &msg);
                psa.reply(msg.handle, status);
            }
        }
    }
}

/// Accepts connections and copies the first input vector to the first
/// output vector
pub fn echo(psa: &dyn PsaApi, msg: &Message) -> PsaStatus {
    match msg.msg_type {
        MessageType::Connect | MessageType::Disconnect => PsaStatus::SUCCESS,
        MessageType::Call(_) => {
            let mut buf = vec![0; msg.in_size[0]];
            let n = psa.read(msg.handle, 0, &mut buf);
            let n = n.min(msg.out_size[0]);
            psa.write(msg.handle, 0, &buf[..n]);
            PsaStatus::SUCCESS
        }
    }
}

/// Input vector over `data` placed at `addr`
pub fn stage(memory: &RamBus, addr: usize, data: &[u8]) -> InVec {
    memory.write(addr, data).expect("Failed to stage input");
    InVec::new(addr, data.len())
}

pub fn out_buffer(addr: usize, len: usize) -> OutVec {
    OutVec::new(addr, len)
}
