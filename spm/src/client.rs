//! Client side of the connection state machine
//!
//! Admission checks are shared between local clients and the remote
//! bridge. They report failures as a [`Refusal`]; only the outermost entry
//! point decides whether a refusal is returned or halts the system.

use crate::audit::SpmEvent;
use crate::backend::{Backend, StateGuard};
use crate::connection::ConnectionStatus;
use crate::error::FatalError;
use crate::pool::SlotRef;
use crate::registry::{PartitionIdx, ServiceDesc, ServiceIdx};
use crate::state::KernelState;
use crate::SpmCore;
use core_types::iovec::find_overlap;
use core_types::{
    ClientId, Handle, InVec, MessageType, OutVec, PsaStatus, Sid, FRAMEWORK_VERSION, MAX_IOVEC,
    VERSION_NONE,
};
use hal::AccessFlags;
use psa_api::RpcClientData;

/// Why a request was not admitted
#[derive(Debug)]
pub(crate) enum Refusal {
    /// Returned to every caller
    Status(PsaStatus),
    /// Returned to untrusted callers, fatal for secure partitions
    Programmer(PsaStatus),
    Fatal(FatalError),
}

impl From<FatalError> for Refusal {
    fn from(err: FatalError) -> Self {
        Refusal::Fatal(err)
    }
}

/// Identity of the issuer of a request
#[derive(Debug, Clone, Copy)]
pub(crate) struct Caller {
    /// Calling partition; the mailbox agent for remote clients
    pub idx: PartitionIdx,
    pub client_id: ClientId,
    /// Outside the secure boundary
    pub ns: bool,
    pub rpc: Option<RpcClientData>,
}

impl<B: Backend> SpmCore<B> {
    pub(crate) fn local_caller(&self, idx: PartitionIdx) -> Caller {
        let desc = self.registry.partition(idx);
        Caller {
            idx,
            client_id: desc.client_id(),
            ns: desc.ns_agent,
            rpc: None,
        }
    }

    /// Turns a refusal into the status the caller sees
    pub(crate) fn refuse(
        &self,
        mut guard: StateGuard<'_, B>,
        caller: &Caller,
        refusal: Refusal,
    ) -> PsaStatus {
        let partition = self.registry.partition(caller.idx).id;
        match refusal {
            Refusal::Status(status) => {
                log::debug!("{} ({}) refused: {}", caller.client_id, partition, status);
                status
            }
            Refusal::Programmer(status) if caller.ns => {
                log::warn!(
                    "programmer error from {} ({}): {}",
                    caller.client_id,
                    partition,
                    status
                );
                guard
                    .audit
                    .record(SpmEvent::ProgrammerErrorReturned { partition, status });
                status
            }
            Refusal::Programmer(status) => {
                self.halt(guard, FatalError::ProgrammerError { partition, status })
            }
            Refusal::Fatal(err) => self.halt(guard, err),
        }
    }

    pub(crate) fn authorized(&self, caller: &Caller, service: &ServiceDesc) -> bool {
        if caller.ns {
            service.ns_accessible
        } else {
            self.registry
                .partition(caller.idx)
                .dependencies
                .contains(&service.sid)
        }
    }

    pub(crate) fn service_version(&self, caller: &Caller, sid: Sid) -> u32 {
        self.registry
            .find_service(sid)
            .map(|idx| self.registry.service(idx))
            .filter(|service| self.authorized(caller, service))
            .map_or(VERSION_NONE, |service| service.version)
    }

    fn admit_connect(&self, caller: &Caller, sid: Sid, version: u32) -> Result<ServiceIdx, Refusal> {
        let idx = self
            .registry
            .find_service(sid)
            .ok_or(Refusal::Programmer(PsaStatus::CONNECTION_REFUSED))?;
        let service = self.registry.service(idx);

        if service.is_stateless() {
            return Err(Refusal::Programmer(PsaStatus::PROGRAMMER_ERROR));
        }
        if !self.authorized(caller, service) {
            return Err(Refusal::Programmer(PsaStatus::CONNECTION_REFUSED));
        }
        if !service.policy.accepts(service.version, version) {
            return Err(Refusal::Programmer(PsaStatus::CONNECTION_REFUSED));
        }
        Ok(idx)
    }

    fn admit_stateless(&self, caller: &Caller, handle: Handle) -> Result<ServiceIdx, Refusal> {
        let idx = self
            .registry
            .stateless_service(handle.stateless_index())
            .ok_or(Refusal::Programmer(PsaStatus::PROGRAMMER_ERROR))?;
        let service = self.registry.service(idx);

        if !self.authorized(caller, service) {
            return Err(Refusal::Programmer(PsaStatus::CONNECTION_REFUSED));
        }
        if !service
            .policy
            .accepts(service.version, handle.stateless_version())
        {
            return Err(Refusal::Programmer(PsaStatus::PROGRAMMER_ERROR));
        }
        Ok(idx)
    }

    /// Allocates and initializes a connection for `caller`
    fn open_connection(
        &self,
        state: &mut KernelState<B::Runtime>,
        caller: &Caller,
        service: ServiceIdx,
    ) -> Result<(Handle, SlotRef), Refusal> {
        let slot = state
            .pool
            .alloc()
            .ok_or(Refusal::Status(PsaStatus::CONNECTION_BUSY))?;
        let (handle, slot) = state
            .codec
            .encode(&mut state.pool, slot)
            .map_err(FatalError::from)?;

        let conn = state.connection_mut(slot)?;
        conn.init(service, caller.idx, caller.client_id, handle);
        conn.rpc = caller.rpc;

        state.audit.record(SpmEvent::ConnectionAllocated {
            slot: slot.index(),
            sid: self.registry.service(service).sid,
            client: self.registry.partition(caller.idx).id,
        });
        Ok((handle, slot))
    }

    /// Maps a client handle back to its connection
    ///
    /// Fails unless the slot is live, carries the handle's tag and belongs
    /// to `caller`.
    fn resolve_client_handle(
        &self,
        state: &KernelState<B::Runtime>,
        caller: &Caller,
        handle: Handle,
    ) -> Option<SlotRef> {
        let slot = state.codec.decode(handle)?;
        let conn = state.pool.get(slot).ok()?;
        (conn.client == Some(caller.idx) && conn.client_id() == caller.client_id).then_some(slot)
    }

    /// Checks and records the vectors of a call
    fn record_io_vectors(
        &self,
        state: &mut KernelState<B::Runtime>,
        caller: &Caller,
        slot: SlotRef,
        in_vec: &[InVec],
        out_vec: &[OutVec],
    ) -> Result<(), Refusal> {
        if let Some((a, b)) = find_overlap(in_vec) {
            log::warn!("input vectors {} and {} overlap", a, b);
            return Err(Refusal::Programmer(PsaStatus::PROGRAMMER_ERROR));
        }

        let boundary = state.partition(caller.idx).boundary;
        let ns = if caller.ns {
            AccessFlags::NS
        } else {
            AccessFlags::empty()
        };
        for v in in_vec {
            self.isolation
                .memory_check(boundary, v.base, v.len, AccessFlags::READABLE | ns)
                .map_err(|_| Refusal::Programmer(PsaStatus::PROGRAMMER_ERROR))?;
        }
        for v in out_vec {
            self.isolation
                .memory_check(boundary, v.base, v.len, AccessFlags::READWRITE | ns)
                .map_err(|_| Refusal::Programmer(PsaStatus::PROGRAMMER_ERROR))?;
        }

        state.connection_mut(slot)?.set_vectors(in_vec, out_vec);
        Ok(())
    }

    /// Opens a connection and turns it into an active CONNECT request
    pub(crate) fn prepare_connect(
        &self,
        state: &mut KernelState<B::Runtime>,
        caller: &Caller,
        sid: Sid,
        version: u32,
    ) -> Result<(Handle, SlotRef), Refusal> {
        let service = self.admit_connect(caller, sid, version)?;
        let (handle, slot) = self.open_connection(state, caller, service)?;
        state
            .connection_mut(slot)?
            .begin(MessageType::Connect)
            .map_err(|_| FatalError::SchedulerInvariant("fresh connection is not idle"))?;
        Ok((handle, slot))
    }

    /// Resolves `handle` and turns its connection into an active CALL request
    pub(crate) fn prepare_call(
        &self,
        state: &mut KernelState<B::Runtime>,
        caller: &Caller,
        handle: Handle,
        call_type: i16,
        in_vec: &[InVec],
        out_vec: &[OutVec],
    ) -> Result<SlotRef, Refusal> {
        if call_type < 0 || in_vec.len() + out_vec.len() > MAX_IOVEC || handle.is_null() {
            return Err(Refusal::Programmer(PsaStatus::PROGRAMMER_ERROR));
        }

        let slot = if handle.is_stateless() {
            let service = self.admit_stateless(caller, handle)?;
            self.open_connection(state, caller, service)?.1
        } else {
            let slot = self
                .resolve_client_handle(state, caller, handle)
                .ok_or(Refusal::Programmer(PsaStatus::PROGRAMMER_ERROR))?;
            let conn = state.connection(slot)?;
            if conn.status != ConnectionStatus::Idle {
                return Err(Refusal::Programmer(PsaStatus::PROGRAMMER_ERROR));
            }
            if conn.terminated {
                return Err(Refusal::Status(PsaStatus::PROGRAMMER_ERROR));
            }
            slot
        };

        if let Err(refusal) = self.record_io_vectors(state, caller, slot, in_vec, out_vec) {
            if handle.is_stateless() {
                state.free_connection(slot)?;
            }
            return Err(refusal);
        }

        let conn = state.connection_mut(slot)?;
        conn.rpc = caller.rpc;
        conn.begin(MessageType::Call(call_type)).map_err(Refusal::Programmer)?;
        Ok(slot)
    }

    /// Resolves `handle` for closing
    ///
    /// Returns `None` when there is nothing to deliver to the service.
    pub(crate) fn prepare_close(
        &self,
        state: &mut KernelState<B::Runtime>,
        caller: &Caller,
        handle: Handle,
    ) -> Result<Option<SlotRef>, Refusal> {
        if handle.is_null() {
            return Ok(None);
        }
        if handle.is_stateless() {
            return Err(Refusal::Programmer(PsaStatus::PROGRAMMER_ERROR));
        }

        let slot = self
            .resolve_client_handle(state, caller, handle)
            .ok_or(Refusal::Programmer(PsaStatus::PROGRAMMER_ERROR))?;
        let conn = state.connection(slot)?;
        if conn.status != ConnectionStatus::Idle {
            return Err(Refusal::Programmer(PsaStatus::PROGRAMMER_ERROR));
        }
        if conn.terminated {
            state.free_connection(slot)?;
            return Ok(None);
        }
        let conn = state.connection_mut(slot)?;
        conn.rpc = caller.rpc;
        conn.begin(MessageType::Disconnect).map_err(Refusal::Programmer)?;
        Ok(Some(slot))
    }

    pub(crate) fn psa_framework_version(&self) -> u32 {
        FRAMEWORK_VERSION
    }

    pub(crate) fn psa_version(&self, sid: Sid) -> u32 {
        let (_guard, me) = self.caller(self.state.lock());
        self.service_version(&self.local_caller(me), sid)
    }

    pub(crate) fn psa_connect(&self, sid: Sid, version: u32) -> Result<Handle, PsaStatus> {
        let (mut guard, me) = self.caller(self.state.lock());
        let caller = self.local_caller(me);

        let (handle, slot) = match self.prepare_connect(&mut guard, &caller, sid, version) {
            Ok(opened) => opened,
            Err(refusal) => return Err(self.refuse(guard, &caller, refusal)),
        };

        let reply = self.backend.messaging(self, guard, slot);
        if reply.status.as_raw() > 0 {
            return Ok(handle);
        }

        if reply.status == PsaStatus::CONNECTION_BUSY {
            // The service left the connection idle; nobody else holds its handle.
            let mut guard = self.state.lock();
            if let Err(err) = guard.free_connection(slot) {
                self.halt(guard, err);
            }
        }
        Err(reply.status)
    }

    pub(crate) fn psa_call(
        &self,
        handle: Handle,
        call_type: i16,
        in_vec: &[InVec],
        out_vec: &mut [OutVec],
    ) -> PsaStatus {
        let (mut guard, me) = self.caller(self.state.lock());
        let caller = self.local_caller(me);

        let slot = match self.prepare_call(&mut guard, &caller, handle, call_type, in_vec, out_vec)
        {
            Ok(slot) => slot,
            Err(refusal) => return self.refuse(guard, &caller, refusal),
        };

        let reply = self.backend.messaging(self, guard, slot);
        for (v, len) in out_vec.iter_mut().zip(reply.out_len) {
            v.len = len;
        }
        reply.status
    }

    pub(crate) fn psa_close(&self, handle: Handle) {
        let (mut guard, me) = self.caller(self.state.lock());
        let caller = self.local_caller(me);

        match self.prepare_close(&mut guard, &caller, handle) {
            Ok(Some(slot)) => {
                self.backend.messaging(self, guard, slot);
            }
            Ok(None) => {}
            Err(refusal) => {
                self.refuse(guard, &caller, refusal);
            }
        }
    }
}
