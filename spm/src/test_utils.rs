//! Fixtures shared by the unit tests

use crate::manifest::{PartitionManifest, ServiceManifest};
use crate::{Backend, Spm, SpmConfig};
use core_types::{PsaStatus, Sid, SignalSet};
use hal::{RamBus, SimulatedIsolation};
use psa_api::Timeout;
use std::sync::Arc;

pub const RAM_BASE: usize = 0x2000_0000;
pub const RAM_SIZE: usize = 0x1000;

/// Thread partition hosting one service that replies SUCCESS to everything
pub fn echo_server(id: i32, sid: Sid, bit: u32) -> PartitionManifest {
    PartitionManifest::new("echo", id)
        .with_service(ServiceManifest::new("echo", sid, bit).non_secure_accessible())
        .with_thread(move |psa| loop {
            let signals = psa.wait(SignalSet::bit(bit), Timeout::Block);
            if let Ok(msg) = psa.get(signals) {
                psa.reply(msg.handle, PsaStatus::SUCCESS);
            }
        })
}

pub fn build<B: Backend>(config: SpmConfig, partitions: Vec<PartitionManifest>) -> Spm<B> {
    let builder = partitions
        .into_iter()
        .fold(Spm::<B>::builder(config), |b, p| b.with_partition(p));
    builder
        .build(
            Arc::new(SimulatedIsolation::new()),
            Arc::new(RamBus::new(RAM_BASE, RAM_SIZE)),
        )
        .expect("system should load")
}
