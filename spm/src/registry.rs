//! Partition and service tables
//!
//! Built once from the manifests and never mutated afterwards. Everything
//! else in the crate refers to entries by [`PartitionIdx`] and
//! [`ServiceIdx`], which are positions in these tables.

use crate::error::LoadError;
use crate::manifest::{FlihFn, PartitionEntry, PartitionManifest, Priority, ServiceFn};
use core_types::handle::STATELESS_TABLE_SIZE;
use core_types::{ClientId, IrqSource, PartitionId, Sid, SignalSet, VersionPolicy};
use hal::MemoryRegion;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Position of a partition in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionIdx(usize);

impl PartitionIdx {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for PartitionIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Position of a service in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceIdx(usize);

impl ServiceIdx {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> usize {
        self.0
    }
}

/// Interrupt line owned by a partition
#[derive(Debug, Clone)]
pub struct IrqDesc {
    pub name: String,
    pub source: IrqSource,
    pub signal: SignalSet,
    /// Present for first-level handling; absent lines are handled at
    /// second level through `eoi`
    pub flih: Option<FlihFn>,
}

#[derive(Debug, Clone)]
pub struct PartitionDesc {
    pub id: PartitionId,
    pub name: String,
    pub priority: Priority,
    pub stack_size: usize,
    pub ns_agent: bool,
    pub mailbox: bool,
    pub privileged: bool,
    pub ns_client_id: ClientId,
    pub dependencies: Vec<Sid>,
    pub services: Vec<ServiceIdx>,
    pub irqs: Vec<IrqDesc>,
    /// Doorbell plus the signals of the partition's own services and irqs
    pub signals_allowed: SignalSet,
    pub regions: Vec<MemoryRegion>,
    pub entry: PartitionEntry,
}

impl PartitionDesc {
    /// Client id carried by requests this partition issues
    pub fn client_id(&self) -> ClientId {
        if self.ns_agent {
            self.ns_client_id
        } else {
            self.id.as_client()
        }
    }

    pub fn is_sfn(&self) -> bool {
        matches!(self.entry, PartitionEntry::Sfn { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ServiceDesc {
    pub name: String,
    pub sid: Sid,
    pub signal: SignalSet,
    pub version: u32,
    pub policy: VersionPolicy,
    pub ns_accessible: bool,
    pub mm_iovec: bool,
    pub stateless_index: Option<u8>,
    pub partition: PartitionIdx,
    pub sfn: Option<ServiceFn>,
}

impl ServiceDesc {
    pub fn is_stateless(&self) -> bool {
        self.stateless_index.is_some()
    }
}

/// Immutable tables of every partition and service in the system
#[derive(Debug, Default)]
pub struct Registry {
    partitions: Vec<PartitionDesc>,
    services: Vec<ServiceDesc>,
    by_sid: HashMap<Sid, ServiceIdx>,
    by_id: HashMap<PartitionId, PartitionIdx>,
    by_irq: HashMap<IrqSource, (PartitionIdx, usize)>,
    stateless: [Option<ServiceIdx>; STATELESS_TABLE_SIZE],
}

impl Registry {
    /// Validates the manifests and builds the tables
    pub fn load(manifests: Vec<PartitionManifest>) -> Result<Self, LoadError> {
        let mut registry = Registry::default();

        for manifest in manifests {
            registry.add_partition(manifest)?;
        }

        for partition in &registry.partitions {
            for sid in &partition.dependencies {
                if !registry.by_sid.contains_key(sid) {
                    return Err(LoadError::UnknownDependency {
                        partition: partition.id,
                        sid: *sid,
                    });
                }
            }
        }

        Ok(registry)
    }

    fn add_partition(&mut self, manifest: PartitionManifest) -> Result<(), LoadError> {
        let id = manifest.id;
        if id.as_raw() <= 0 {
            return Err(LoadError::InvalidPartitionId(id));
        }
        if self.by_id.contains_key(&id) {
            return Err(LoadError::DuplicatePartition(id));
        }
        if manifest.ns_agent && manifest.ns_client_id >= 0 {
            return Err(LoadError::InvalidNsClientId(id));
        }
        if matches!(manifest.entry, PartitionEntry::Missing) {
            return Err(LoadError::MissingEntry(id));
        }

        let pidx = PartitionIdx::new(self.partitions.len());
        let mut signals_allowed = SignalSet::DOORBELL;
        let mut services = Vec::with_capacity(manifest.services.len());

        for service in manifest.services {
            let signal = claim_signal(id, &mut signals_allowed, &service.name, service.signal_bit)?;
            if self.by_sid.contains_key(&service.sid) {
                return Err(LoadError::DuplicateSid(service.sid));
            }
            if let Some(index) = service.stateless_index {
                let entry = self.stateless.get_mut(index as usize).ok_or_else(|| {
                    LoadError::StatelessIndexOutOfRange {
                        service: service.name.clone(),
                        index,
                    }
                })?;
                if entry.is_some() {
                    return Err(LoadError::DuplicateStatelessIndex(index));
                }
                *entry = Some(ServiceIdx::new(self.services.len()));
            }

            let sidx = ServiceIdx::new(self.services.len());
            self.by_sid.insert(service.sid, sidx);
            services.push(sidx);
            self.services.push(ServiceDesc {
                name: service.name,
                sid: service.sid,
                signal,
                version: service.version,
                policy: service.policy,
                ns_accessible: service.non_secure_clients,
                mm_iovec: service.mm_iovec,
                stateless_index: service.stateless_index,
                partition: pidx,
                sfn: service.sfn,
            });
        }

        let mut irqs = Vec::with_capacity(manifest.irqs.len());
        for irq in manifest.irqs {
            let signal = claim_signal(id, &mut signals_allowed, &irq.name, irq.signal_bit)?;
            if self.by_irq.contains_key(&irq.source) {
                return Err(LoadError::DuplicateIrqSource(irq.source));
            }
            self.by_irq.insert(irq.source, (pidx, irqs.len()));
            irqs.push(IrqDesc {
                name: irq.name,
                source: irq.source,
                signal,
                flih: irq.flih,
            });
        }

        self.by_id.insert(id, pidx);
        self.partitions.push(PartitionDesc {
            id,
            name: manifest.name,
            priority: manifest.priority,
            stack_size: manifest.stack_size,
            ns_agent: manifest.ns_agent,
            mailbox: manifest.mailbox,
            privileged: manifest.privileged,
            ns_client_id: ClientId::new(manifest.ns_client_id),
            dependencies: manifest.dependencies,
            services,
            irqs,
            signals_allowed,
            regions: manifest.regions,
            entry: manifest.entry,
        });
        Ok(())
    }

    pub fn partition(&self, idx: PartitionIdx) -> &PartitionDesc {
        &self.partitions[idx.0]
    }

    pub fn service(&self, idx: ServiceIdx) -> &ServiceDesc {
        &self.services[idx.0]
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partitions(&self) -> impl Iterator<Item = (PartitionIdx, &PartitionDesc)> {
        self.partitions
            .iter()
            .enumerate()
            .map(|(i, p)| (PartitionIdx::new(i), p))
    }

    pub fn ns_agents(&self) -> impl Iterator<Item = (PartitionIdx, &PartitionDesc)> {
        self.partitions().filter(|(_, p)| p.ns_agent)
    }

    pub fn find_service(&self, sid: Sid) -> Option<ServiceIdx> {
        self.by_sid.get(&sid).copied()
    }

    pub fn find_partition(&self, id: PartitionId) -> Option<PartitionIdx> {
        self.by_id.get(&id).copied()
    }

    /// Service behind a stateless table index
    pub fn stateless_service(&self, index: usize) -> Option<ServiceIdx> {
        self.stateless.get(index).copied().flatten()
    }

    /// Owner of an interrupt source and the line's position in its table
    pub fn find_irq(&self, source: IrqSource) -> Option<(PartitionIdx, &IrqDesc)> {
        let (pidx, i) = *self.by_irq.get(&source)?;
        Some((pidx, &self.partition(pidx).irqs[i]))
    }

    /// Interrupt line of `partition` signalled by the given single-bit signal
    pub fn irq_for_signal(&self, partition: PartitionIdx, signal: SignalSet) -> Option<&IrqDesc> {
        self.partition(partition)
            .irqs
            .iter()
            .find(|irq| irq.signal == signal)
    }

    pub fn has_irqs(&self) -> bool {
        !self.by_irq.is_empty()
    }

    /// Service of `partition` that owns the given single-bit signal
    pub fn service_for_signal(
        &self,
        partition: PartitionIdx,
        signal: SignalSet,
    ) -> Option<ServiceIdx> {
        self.partition(partition)
            .services
            .iter()
            .copied()
            .find(|s| self.service(*s).signal == signal)
    }
}

/// Reserves a service or irq signal bit in a partition's signal set
fn claim_signal(
    partition: PartitionId,
    allowed: &mut SignalSet,
    name: &str,
    bit: u32,
) -> Result<SignalSet, LoadError> {
    if bit < SignalSet::FIRST_SERVICE_BIT || bit >= 32 {
        return Err(LoadError::InvalidSignal {
            service: name.to_string(),
            signal: SignalSet::from_bits(1u32.checked_shl(bit).unwrap_or(0)),
        });
    }
    let signal = SignalSet::bit(bit);
    if allowed.intersects(signal) {
        return Err(LoadError::DuplicateSignal { partition, signal });
    }
    allowed.insert(signal);
    Ok(signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{IrqManifest, ServiceManifest};

    fn server(id: i32) -> PartitionManifest {
        PartitionManifest::new("server", id)
            .with_service(ServiceManifest::new("echo", Sid::new(0x100), 4))
            .with_service(ServiceManifest::new("hash", Sid::new(0x101), 5).stateless(2))
            .with_thread(|_| {})
    }

    fn agent() -> PartitionManifest {
        PartitionManifest::new("ns", 1)
            .as_ns_agent()
            .with_dependency(Sid::new(0x100))
            .with_thread(|_| {})
    }

    #[test]
    fn test_load_tables() {
        let registry = Registry::load(vec![agent(), server(2)]).unwrap();

        assert_eq!(registry.partition_count(), 2);
        let echo = registry.find_service(Sid::new(0x100)).unwrap();
        let server = registry.find_partition(PartitionId::new(2)).unwrap();
        assert_eq!(registry.service(echo).partition, server);
        assert_eq!(registry.stateless_service(2), registry.find_service(Sid::new(0x101)));
        assert_eq!(registry.stateless_service(3), None);
        assert_eq!(
            registry.partition(server).signals_allowed,
            SignalSet::DOORBELL | SignalSet::bit(4) | SignalSet::bit(5)
        );
        assert_eq!(registry.service_for_signal(server, SignalSet::bit(4)), Some(echo));
        assert_eq!(registry.service_for_signal(server, SignalSet::DOORBELL), None);
    }

    #[test]
    fn test_client_ids() {
        let registry = Registry::load(vec![agent().with_ns_client_id(-5), server(2)]).unwrap();
        let (_, ns) = registry.ns_agents().next().unwrap();
        assert_eq!(ns.client_id(), ClientId::new(-5));
        let server = registry.find_partition(PartitionId::new(2)).unwrap();
        assert_eq!(registry.partition(server).client_id(), ClientId::new(2));
    }

    #[test]
    fn test_rejects_duplicates() {
        assert!(matches!(
            Registry::load(vec![server(2), server(2)]),
            Err(LoadError::DuplicatePartition(_))
        ));
        assert!(matches!(
            Registry::load(vec![server(2), server(3)]),
            Err(LoadError::DuplicateSid(_))
        ));
    }

    #[test]
    fn test_rejects_bad_signals() {
        let reserved = PartitionManifest::new("p", 2)
            .with_service(ServiceManifest::new("s", Sid::new(1), 3))
            .with_thread(|_| {});
        assert!(matches!(
            Registry::load(vec![reserved]),
            Err(LoadError::InvalidSignal { .. })
        ));

        let shared = PartitionManifest::new("p", 2)
            .with_service(ServiceManifest::new("a", Sid::new(1), 6))
            .with_service(ServiceManifest::new("b", Sid::new(2), 6))
            .with_thread(|_| {});
        assert!(matches!(
            Registry::load(vec![shared]),
            Err(LoadError::DuplicateSignal { .. })
        ));
    }

    #[test]
    fn test_irq_tables() {
        let timer = IrqManifest::new("timer", IrqSource::new(17), 9);
        let driver = server(3)
            .with_irq(timer.clone())
            .with_irq(IrqManifest::new("uart", IrqSource::new(18), 10));
        let registry = Registry::load(vec![driver]).unwrap();

        let (owner, irq) = registry.find_irq(IrqSource::new(17)).unwrap();
        assert_eq!(irq.signal, SignalSet::bit(9));
        assert!(irq.flih.is_none());
        assert!(registry.partition(owner).signals_allowed.contains(SignalSet::bit(10)));
        assert_eq!(
            registry.irq_for_signal(owner, SignalSet::bit(10)).map(|i| i.source),
            Some(IrqSource::new(18))
        );
        assert!(registry.irq_for_signal(owner, SignalSet::bit(4)).is_none());
        assert!(registry.find_irq(IrqSource::new(19)).is_none());

        let clash = server(2).with_irq(IrqManifest::new("timer", IrqSource::new(17), 4));
        assert!(matches!(
            Registry::load(vec![clash]),
            Err(LoadError::DuplicateSignal { .. })
        ));
        let twice = server(2)
            .with_irq(timer.clone())
            .with_irq(IrqManifest::new("again", IrqSource::new(17), 11));
        assert!(matches!(
            Registry::load(vec![twice]),
            Err(LoadError::DuplicateIrqSource(_))
        ));
    }

    #[test]
    fn test_rejects_bad_stateless_index() {
        let out_of_range = PartitionManifest::new("p", 2)
            .with_service(ServiceManifest::new("s", Sid::new(1), 4).stateless(32))
            .with_thread(|_| {});
        assert!(matches!(
            Registry::load(vec![out_of_range]),
            Err(LoadError::StatelessIndexOutOfRange { index: 32, .. })
        ));

        let twice = PartitionManifest::new("p", 2)
            .with_service(ServiceManifest::new("a", Sid::new(1), 4).stateless(0))
            .with_service(ServiceManifest::new("b", Sid::new(2), 5).stateless(0))
            .with_thread(|_| {});
        assert!(matches!(
            Registry::load(vec![twice]),
            Err(LoadError::DuplicateStatelessIndex(0))
        ));
    }

    #[test]
    fn test_rejects_bad_partitions() {
        assert!(matches!(
            Registry::load(vec![PartitionManifest::new("p", 0).with_thread(|_| {})]),
            Err(LoadError::InvalidPartitionId(_))
        ));
        assert!(matches!(
            Registry::load(vec![PartitionManifest::new("p", 2)]),
            Err(LoadError::MissingEntry(_))
        ));
        assert!(matches!(
            Registry::load(vec![agent().with_ns_client_id(4)]),
            Err(LoadError::InvalidNsClientId(_))
        ));
        assert!(matches!(
            Registry::load(vec![agent()]),
            Err(LoadError::UnknownDependency { .. })
        ));
    }
}
