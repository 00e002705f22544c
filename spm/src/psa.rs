//! The API handed to partition code
//!
//! [`Psa`] borrows the system core and forwards every call to it. Partition
//! entries and service functions receive it as `&dyn PsaApi`.

use crate::backend::Backend;
use crate::SpmCore;
use core_types::{Handle, InVec, Message, OutVec, PartitionId, PsaStatus, Sid, SignalSet};
use psa_api::{
    PsaApi, PsaClient, PsaService, RpcAgent, RpcClientData, RpcDispatch, RpcOrigin, Timeout,
};

pub struct Psa<'a, B: Backend> {
    core: &'a SpmCore<B>,
}

impl<'a, B: Backend> Psa<'a, B> {
    pub fn new(core: &'a SpmCore<B>) -> Self {
        Self { core }
    }
}

impl<B: Backend> PsaClient for Psa<'_, B> {
    fn framework_version(&self) -> u32 {
        self.core.psa_framework_version()
    }

    fn version(&self, sid: Sid) -> u32 {
        self.core.psa_version(sid)
    }

    fn connect(&self, sid: Sid, version: u32) -> Result<Handle, PsaStatus> {
        self.core.psa_connect(sid, version)
    }

    fn call(
        &self,
        handle: Handle,
        call_type: i16,
        in_vec: &[InVec],
        out_vec: &mut [OutVec],
    ) -> PsaStatus {
        self.core.psa_call(handle, call_type, in_vec, out_vec)
    }

    fn close(&self, handle: Handle) {
        self.core.psa_close(handle)
    }
}

impl<B: Backend> PsaService for Psa<'_, B> {
    fn wait(&self, mask: SignalSet, timeout: Timeout) -> SignalSet {
        self.core.psa_wait(mask, timeout)
    }

    fn get(&self, signal: SignalSet) -> Result<Message, PsaStatus> {
        self.core.psa_get(signal)
    }

    fn set_rhandle(&self, msg_handle: Handle, rhandle: usize) {
        self.core.psa_set_rhandle(msg_handle, rhandle)
    }

    fn read(&self, msg_handle: Handle, idx: usize, buf: &mut [u8]) -> usize {
        self.core.psa_read(msg_handle, idx, buf)
    }

    fn skip(&self, msg_handle: Handle, idx: usize, n: usize) -> usize {
        self.core.psa_skip(msg_handle, idx, n)
    }

    fn write(&self, msg_handle: Handle, idx: usize, buf: &[u8]) {
        self.core.psa_write(msg_handle, idx, buf)
    }

    fn reply(&self, msg_handle: Handle, status: PsaStatus) {
        self.core.psa_reply(msg_handle, status)
    }

    fn notify(&self, partition: PartitionId) {
        self.core.psa_notify(partition)
    }

    fn clear(&self) {
        self.core.psa_clear()
    }

    fn panic(&self) -> ! {
        self.core.psa_panic()
    }

    fn irq_enable(&self, irq_signal: SignalSet) {
        self.core.psa_irq_enable(irq_signal)
    }

    fn irq_disable(&self, irq_signal: SignalSet) -> bool {
        self.core.psa_irq_disable(irq_signal)
    }

    fn eoi(&self, irq_signal: SignalSet) {
        self.core.psa_eoi(irq_signal)
    }

    fn reset_signal(&self, irq_signal: SignalSet) {
        self.core.psa_reset_signal(irq_signal)
    }

    fn map_invec(&self, msg_handle: Handle, idx: usize) -> InVec {
        self.core.psa_map_invec(msg_handle, idx)
    }

    fn unmap_invec(&self, msg_handle: Handle, idx: usize) {
        self.core.psa_unmap_invec(msg_handle, idx)
    }

    fn map_outvec(&self, msg_handle: Handle, idx: usize) -> OutVec {
        self.core.psa_map_outvec(msg_handle, idx)
    }

    fn unmap_outvec(&self, msg_handle: Handle, idx: usize, len: usize) {
        self.core.psa_unmap_outvec(msg_handle, idx, len)
    }
}

impl<B: Backend> RpcAgent for Psa<'_, B> {
    fn rpc_version(&self, origin: RpcOrigin, sid: Sid) -> u32 {
        self.core.rpc_version(origin, sid)
    }

    fn rpc_connect(
        &self,
        origin: RpcOrigin,
        sid: Sid,
        version: u32,
        client_data: RpcClientData,
    ) -> RpcDispatch {
        self.core.rpc_connect(origin, sid, version, client_data)
    }

    fn rpc_call(
        &self,
        origin: RpcOrigin,
        handle: Handle,
        call_type: i16,
        in_vec: &[InVec],
        out_vec: &[OutVec],
        client_data: RpcClientData,
    ) -> RpcDispatch {
        self.core
            .rpc_call(origin, handle, call_type, in_vec, out_vec, client_data)
    }

    fn rpc_close(
        &self,
        origin: RpcOrigin,
        handle: Handle,
        client_data: RpcClientData,
    ) -> RpcDispatch {
        self.core.rpc_close(origin, handle, client_data)
    }
}

impl<B: Backend> PsaApi for Psa<'_, B> {
    fn current_partition(&self) -> PartitionId {
        let (_guard, me) = self.core.caller(self.core.state.lock());
        self.core.registry.partition(me).id
    }

    fn rpc_agent(&self) -> &dyn RpcAgent {
        self
    }
}
