//! Partition and service manifests
//!
//! A manifest has a static half (ids, signals, policies, memory regions)
//! that can be written as JSON, and a code half (entry points and service
//! functions) that is attached in Rust. The static half of the two
//! partitions below is all a JSON manifest needs to carry:
//!
//! ```
//! use spm::manifest::PartitionManifest;
//!
//! let manifest = PartitionManifest::from_json(r#"{
//!     "name": "crypto",
//!     "id": 3,
//!     "priority": "high",
//!     "services": [
//!         { "name": "hash", "sid": 256, "signal_bit": 4, "version": 2,
//!           "policy": "strict", "non_secure_clients": true }
//!     ]
//! }"#).unwrap();
//! assert_eq!(manifest.services[0].version, 2);
//! ```

use crate::error::LoadError;
use core_types::{IrqSource, Message, PartitionId, PsaStatus, Sid, SignalSet, VersionPolicy};
use hal::MemoryRegion;
use psa_api::{FlihResult, PsaApi};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Default stack reserved for a partition
pub const DEFAULT_STACK_SIZE: usize = 0x800;

/// Scheduling priority; earlier variants preempt later ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Highest,
    High,
    #[default]
    Normal,
    Low,
    Lowest,
}

/// Body of a thread-model partition
#[derive(Clone)]
pub struct ThreadFn(Arc<dyn Fn(&dyn PsaApi) + Send + Sync>);

impl ThreadFn {
    pub fn new(f: impl Fn(&dyn PsaApi) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, api: &dyn PsaApi) {
        (self.0)(api)
    }
}

impl fmt::Debug for ThreadFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ThreadFn(..)")
    }
}

/// One-time initializer of a service-function partition
#[derive(Clone)]
pub struct InitFn(Arc<dyn Fn(&dyn PsaApi) -> PsaStatus + Send + Sync>);

impl InitFn {
    pub fn new(f: impl Fn(&dyn PsaApi) -> PsaStatus + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, api: &dyn PsaApi) -> PsaStatus {
        (self.0)(api)
    }
}

impl fmt::Debug for InitFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InitFn(..)")
    }
}

/// Service function invoked directly with each message
#[derive(Clone)]
pub struct ServiceFn(Arc<dyn Fn(&dyn PsaApi, &Message) -> PsaStatus + Send + Sync>);

impl ServiceFn {
    pub fn new(f: impl Fn(&dyn PsaApi, &Message) -> PsaStatus + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, api: &dyn PsaApi, msg: &Message) -> PsaStatus {
        (self.0)(api, msg)
    }
}

impl fmt::Debug for ServiceFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServiceFn(..)")
    }
}

/// First-level interrupt handler, run when the interrupt is taken
#[derive(Clone)]
pub struct FlihFn(Arc<dyn Fn() -> FlihResult + Send + Sync>);

impl FlihFn {
    pub fn new(f: impl Fn() -> FlihResult + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self) -> FlihResult {
        (self.0)()
    }
}

impl fmt::Debug for FlihFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FlihFn(..)")
    }
}

/// How a partition's code is run
#[derive(Debug, Clone, Default)]
pub enum PartitionEntry {
    /// Not attached yet
    #[default]
    Missing,
    /// Runs on its own execution context
    Thread(ThreadFn),
    /// Services are plain functions; `init` runs once before the first one
    Sfn { init: Option<InitFn> },
}

/// Static description of one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub name: String,
    pub sid: Sid,
    /// Bit number of the service signal in the owning partition
    pub signal_bit: u32,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub policy: VersionPolicy,
    /// Reachable from the non-secure world
    #[serde(default)]
    pub non_secure_clients: bool,
    /// Slot in the stateless table; absent for connection-based services
    #[serde(default)]
    pub stateless_index: Option<u8>,
    /// Allows the service to map call vectors instead of copying them
    #[serde(default)]
    pub mm_iovec: bool,
    #[serde(skip)]
    pub sfn: Option<ServiceFn>,
}

fn default_version() -> u32 {
    1
}

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

fn default_ns_client_id() -> i32 {
    -1
}

impl ServiceManifest {
    pub fn new(name: impl Into<String>, sid: Sid, signal_bit: u32) -> Self {
        Self {
            name: name.into(),
            sid,
            signal_bit,
            version: default_version(),
            policy: VersionPolicy::default(),
            non_secure_clients: false,
            stateless_index: None,
            mm_iovec: false,
            sfn: None,
        }
    }

    pub fn with_version(mut self, version: u32, policy: VersionPolicy) -> Self {
        self.version = version;
        self.policy = policy;
        self
    }

    /// Allows non-secure and remote clients
    pub fn non_secure_accessible(mut self) -> Self {
        self.non_secure_clients = true;
        self
    }

    /// Makes the service stateless, reachable through `Handle::stateless(index, ..)`
    pub fn stateless(mut self, index: u8) -> Self {
        self.stateless_index = Some(index);
        self
    }

    pub fn with_mm_iovec(mut self) -> Self {
        self.mm_iovec = true;
        self
    }

    pub fn with_sfn(
        mut self,
        f: impl Fn(&dyn PsaApi, &Message) -> PsaStatus + Send + Sync + 'static,
    ) -> Self {
        self.sfn = Some(ServiceFn::new(f));
        self
    }

    pub fn signal(&self) -> SignalSet {
        signal_for_bit(self.signal_bit)
    }
}

fn signal_for_bit(bit: u32) -> SignalSet {
    if bit < 32 {
        SignalSet::bit(bit)
    } else {
        SignalSet::EMPTY
    }
}

/// Interrupt line owned by a partition
///
/// Without a first-level handler the interrupt is masked when taken and
/// the partition acknowledges it with `eoi`. With one, the handler decides
/// whether the signal is asserted and the partition clears it with
/// `reset_signal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrqManifest {
    pub name: String,
    pub source: IrqSource,
    pub signal_bit: u32,
    #[serde(skip)]
    pub flih: Option<FlihFn>,
}

impl IrqManifest {
    pub fn new(name: impl Into<String>, source: IrqSource, signal_bit: u32) -> Self {
        Self {
            name: name.into(),
            source,
            signal_bit,
            flih: None,
        }
    }

    pub fn with_flih(mut self, f: impl Fn() -> FlihResult + Send + Sync + 'static) -> Self {
        self.flih = Some(FlihFn::new(f));
        self
    }

    pub fn signal(&self) -> SignalSet {
        signal_for_bit(self.signal_bit)
    }
}

/// Static description of one partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub name: String,
    pub id: PartitionId,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
    /// Stands in for the non-secure world
    #[serde(default)]
    pub ns_agent: bool,
    /// Non-secure agent that forwards requests from another core
    #[serde(default)]
    pub mailbox: bool,
    #[serde(default)]
    pub privileged: bool,
    /// Client id reported for requests issued by a non-secure agent
    #[serde(default = "default_ns_client_id")]
    pub ns_client_id: i32,
    /// Services this partition may connect to
    #[serde(default)]
    pub dependencies: Vec<Sid>,
    #[serde(default)]
    pub services: Vec<ServiceManifest>,
    #[serde(default)]
    pub irqs: Vec<IrqManifest>,
    #[serde(default)]
    pub regions: Vec<MemoryRegion>,
    #[serde(skip)]
    pub entry: PartitionEntry,
}

impl PartitionManifest {
    pub fn new(name: impl Into<String>, id: i32) -> Self {
        Self {
            name: name.into(),
            id: PartitionId::new(id),
            priority: Priority::default(),
            stack_size: DEFAULT_STACK_SIZE,
            ns_agent: false,
            mailbox: false,
            privileged: false,
            ns_client_id: default_ns_client_id(),
            dependencies: Vec::new(),
            services: Vec::new(),
            irqs: Vec::new(),
            regions: Vec::new(),
            entry: PartitionEntry::Missing,
        }
    }

    /// Parses the static half of a manifest
    pub fn from_json(json: &str) -> Result<Self, LoadError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Marks the partition as the non-secure agent
    pub fn as_ns_agent(mut self) -> Self {
        self.ns_agent = true;
        self.priority = Priority::Lowest;
        self
    }

    /// Marks the partition as the mailbox agent for remote clients
    pub fn as_mailbox_agent(mut self) -> Self {
        self.mailbox = true;
        self.as_ns_agent()
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn with_ns_client_id(mut self, client_id: i32) -> Self {
        self.ns_client_id = client_id;
        self
    }

    pub fn with_dependency(mut self, sid: Sid) -> Self {
        self.dependencies.push(sid);
        self
    }

    pub fn with_service(mut self, service: ServiceManifest) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_irq(mut self, irq: IrqManifest) -> Self {
        self.irqs.push(irq);
        self
    }

    pub fn with_region(mut self, region: MemoryRegion) -> Self {
        self.regions.push(region);
        self
    }

    /// Attaches a thread-model body
    pub fn with_thread(mut self, f: impl Fn(&dyn PsaApi) + Send + Sync + 'static) -> Self {
        self.entry = PartitionEntry::Thread(ThreadFn::new(f));
        self
    }

    /// Makes the partition a service-function partition without initializer
    pub fn as_sfn(mut self) -> Self {
        self.entry = PartitionEntry::Sfn { init: None };
        self
    }

    /// Makes the partition a service-function partition with initializer
    pub fn with_sfn_init(
        mut self,
        f: impl Fn(&dyn PsaApi) -> PsaStatus + Send + Sync + 'static,
    ) -> Self {
        self.entry = PartitionEntry::Sfn {
            init: Some(InitFn::new(f)),
        };
        self
    }

    /// Attaches a service function to the named service
    pub fn attach_sfn(
        mut self,
        service: &str,
        f: impl Fn(&dyn PsaApi, &Message) -> PsaStatus + Send + Sync + 'static,
    ) -> Self {
        if let Some(svc) = self.services.iter_mut().find(|svc| svc.name == service) {
            svc.sfn = Some(ServiceFn::new(f));
        }
        self
    }

    /// Attaches a first-level handler to the named interrupt
    pub fn attach_flih(
        mut self,
        irq: &str,
        f: impl Fn() -> FlihResult + Send + Sync + 'static,
    ) -> Self {
        if let Some(line) = self.irqs.iter_mut().find(|line| line.name == irq) {
            line.flih = Some(FlihFn::new(f));
        }
        self
    }
}
