//! Service side of the connection state machine

use crate::audit::SpmEvent;
use crate::backend::{Backend, StateGuard};
use crate::connection::{Connection, ConnectionStatus, InCursor, IovecStatus, OutCursor};
use crate::error::FatalError;
use crate::pool::SlotRef;
use crate::registry::{IrqDesc, PartitionIdx, ServiceIdx};
use crate::state::KernelState;
use crate::SpmCore;
use core_types::{
    CallReply, Handle, InVec, Message, MessageType, OutVec, PartitionId, PsaStatus, SignalSet,
    MAX_IOVEC,
};
use hal::{AccessFlags, InterruptHal};
use psa_api::{RpcClientData, Timeout};

/// Where a reply goes and what happens to the connection afterwards
struct ReplyRoute {
    client: PartitionIdx,
    rpc: Option<RpcClientData>,
    reply: CallReply,
    handle: Handle,
    free: bool,
    terminated: bool,
}

impl<B: Backend> SpmCore<B> {
    pub(crate) fn misuse(
        &self,
        guard: StateGuard<'_, B>,
        partition: PartitionIdx,
        reason: &'static str,
    ) -> ! {
        let partition = self.registry.partition(partition).id;
        self.halt(guard, FatalError::ServiceApiMisuse { partition, reason })
    }

    /// Maps a message handle to an active request served by the caller
    fn resolve_message<'a>(
        &'a self,
        guard: StateGuard<'a, B>,
        handle: Handle,
    ) -> (StateGuard<'a, B>, PartitionIdx, SlotRef) {
        let (guard, me) = self.caller(guard);
        let slot = guard.codec.decode(handle).filter(|slot| {
            guard
                .pool
                .get(*slot)
                .map(|conn| {
                    conn.status == ConnectionStatus::Active
                        && conn.service.map(|s| self.registry.service(s).partition) == Some(me)
                })
                .unwrap_or(false)
        });
        match slot {
            Some(slot) => (guard, me, slot),
            None => {
                let partition = self.registry.partition(me).id;
                self.halt(guard, FatalError::InvalidMessageHandle { partition })
            }
        }
    }

    pub(crate) fn psa_wait(&self, mask: SignalSet, timeout: Timeout) -> SignalSet {
        let (mut guard, me) = self.caller(self.state.lock());
        let desc = self.registry.partition(me);
        if !mask.intersects(desc.signals_allowed) {
            self.misuse(guard, me, "wait mask selects no signal of the partition");
        }

        let mask = mask & desc.signals_allowed;
        let asserted = guard.partition(me).signals_asserted & mask;
        if !asserted.is_empty() || timeout == Timeout::Poll {
            return asserted;
        }

        guard.partition_mut(me).signals_waiting = mask;
        guard.audit.record(SpmEvent::WaitBlocked {
            partition: desc.id,
            mask,
        });
        let guard = self.backend.wait_signals(self, guard, me);
        guard.partition(me).signals_asserted & mask
    }

    /// Unlinks the oldest request queued for `service`
    fn take_message(
        &self,
        state: &mut KernelState<B::Runtime>,
        me: PartitionIdx,
        service: ServiceIdx,
        signal: SignalSet,
    ) -> Result<Option<Message>, FatalError> {
        let position = state.partition(me).pending.iter().position(|slot| {
            state
                .pool
                .get(*slot)
                .map(|conn| conn.service == Some(service))
                .unwrap_or(false)
        });
        let Some(slot) = position.and_then(|pos| state.partition_mut(me).pending.remove(pos))
        else {
            return Ok(None);
        };

        if !state.has_pending(me, |conn| conn.service == Some(service)) {
            state.partition_mut(me).signals_asserted.remove(signal);
        }

        let msg = state.connection(slot)?.message();
        state.audit.record(SpmEvent::MessageRetrieved {
            handle: msg.handle,
            partition: self.registry.partition(me).id,
        });
        Ok(Some(msg))
    }

    pub(crate) fn psa_get(&self, signal: SignalSet) -> Result<Message, PsaStatus> {
        let (mut guard, me) = self.caller(self.state.lock());
        if !signal.is_single() {
            self.misuse(guard, me, "get needs exactly one signal");
        }
        if !guard.partition(me).signals_asserted.contains(signal) {
            self.misuse(guard, me, "get on a signal that is not asserted");
        }
        let Some(service) = self.registry.service_for_signal(me, signal) else {
            self.misuse(guard, me, "get on a signal that belongs to no service");
        };

        match self.take_message(&mut guard, me, service, signal) {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(PsaStatus::DOES_NOT_EXIST),
            Err(err) => self.halt(guard, err),
        }
    }

    pub(crate) fn psa_set_rhandle(&self, handle: Handle, rhandle: usize) {
        let (mut guard, me, slot) = self.resolve_message(self.state.lock(), handle);
        let stateless = guard
            .connection(slot)
            .ok()
            .and_then(|conn| conn.service)
            .map_or(true, |s| self.registry.service(s).is_stateless());
        if stateless {
            self.misuse(guard, me, "set_rhandle on a stateless service");
        }
        if let Ok(conn) = guard.connection_mut(slot) {
            conn.rhandle = Some(rhandle);
        }
    }

    /// Client partition, access flags and one vector cursor of a call
    fn call_vector<T>(
        &self,
        state: &KernelState<B::Runtime>,
        slot: SlotRef,
        idx: usize,
        pick: impl Fn(&Connection) -> T,
    ) -> Result<(PartitionIdx, AccessFlags, T), &'static str> {
        let conn = state.pool.get(slot).map_err(|_| "message vanished")?;
        if !conn.msg.msg_type.is_call() {
            return Err("vector access on a message that is not a call");
        }
        if idx >= MAX_IOVEC {
            return Err("vector index out of range");
        }
        let client = conn.client.ok_or("message without client")?;
        let ns = if conn.client_id().is_non_secure() {
            AccessFlags::NS
        } else {
            AccessFlags::empty()
        };
        Ok((client, ns, pick(conn)))
    }

    /// Like `call_vector`, for services that map their vectors
    fn mapped_vector<T>(
        &self,
        state: &KernelState<B::Runtime>,
        slot: SlotRef,
        idx: usize,
        pick: impl Fn(&Connection) -> T,
    ) -> Result<(PartitionIdx, AccessFlags, T), &'static str> {
        let mm_iovec = state
            .pool
            .get(slot)
            .ok()
            .and_then(|conn| conn.service)
            .map_or(false, |s| self.registry.service(s).mm_iovec);
        if !mm_iovec {
            return Err("vector mapping by a service that does not allow it");
        }
        self.call_vector(state, slot, idx, pick)
    }

    fn read_cursor<'a>(
        &'a self,
        handle: Handle,
        idx: usize,
    ) -> (StateGuard<'a, B>, SlotRef, PartitionIdx, AccessFlags, InCursor) {
        let (mut guard, me, slot) = self.resolve_message(self.state.lock(), handle);
        let (client, ns, cursor) =
            match self.call_vector(&guard, slot, idx, |conn| conn.invec[idx.min(MAX_IOVEC - 1)]) {
                Ok(found) => found,
                Err(reason) => self.misuse(guard, me, reason),
            };
        if cursor.status.contains(IovecStatus::MAPPED) {
            self.misuse(guard, me, "copy access to a mapped input vector");
        }
        if let Ok(conn) = guard.connection_mut(slot) {
            conn.invec[idx].status.insert(IovecStatus::ACCESSED);
        }
        (guard, slot, client, ns, cursor)
    }

    pub(crate) fn psa_read(&self, handle: Handle, idx: usize, buf: &mut [u8]) -> usize {
        let (mut guard, slot, client, ns, cursor) = self.read_cursor(handle, idx);
        let n = buf.len().min(cursor.remaining);
        if n == 0 {
            return 0;
        }

        let boundary = guard.partition(client).boundary;
        let copied = self
            .isolation
            .memory_check(boundary, cursor.base, n, AccessFlags::READABLE | ns)
            .map_err(FatalError::Isolation)
            .and_then(|()| {
                self.memory
                    .read(cursor.base, &mut buf[..n])
                    .map_err(FatalError::Memory)
            });
        if let Err(err) = copied {
            self.halt(guard, err);
        }

        self.advance_input(&mut guard, slot, idx, n);
        n
    }

    pub(crate) fn psa_skip(&self, handle: Handle, idx: usize, n: usize) -> usize {
        let (mut guard, slot, _, _, cursor) = self.read_cursor(handle, idx);
        let n = n.min(cursor.remaining);
        self.advance_input(&mut guard, slot, idx, n);
        n
    }

    fn advance_input(
        &self,
        state: &mut KernelState<B::Runtime>,
        slot: SlotRef,
        idx: usize,
        n: usize,
    ) {
        if let Ok(conn) = state.connection_mut(slot) {
            let cursor = &mut conn.invec[idx];
            cursor.base += n;
            cursor.remaining -= n;
        }
    }

    pub(crate) fn psa_write(&self, handle: Handle, idx: usize, buf: &[u8]) {
        let (mut guard, me, slot) = self.resolve_message(self.state.lock(), handle);
        let (client, ns, cursor): (_, _, OutCursor) =
            match self.call_vector(&guard, slot, idx, |conn| conn.outvec[idx.min(MAX_IOVEC - 1)]) {
                Ok(found) => found,
                Err(reason) => self.misuse(guard, me, reason),
            };
        if cursor.status.contains(IovecStatus::MAPPED) {
            self.misuse(guard, me, "copy access to a mapped output vector");
        }
        if let Ok(conn) = guard.connection_mut(slot) {
            conn.outvec[idx].status.insert(IovecStatus::ACCESSED);
        }

        if buf.len() > cursor.space() {
            let partition = self.registry.partition(me).id;
            self.halt(guard, FatalError::WriteOverflow { partition });
        }
        if buf.is_empty() {
            return;
        }

        let addr = cursor.base + cursor.written;
        let boundary = guard.partition(client).boundary;
        let copied = self
            .isolation
            .memory_check(boundary, addr, buf.len(), AccessFlags::READWRITE | ns)
            .map_err(FatalError::Isolation)
            .and_then(|()| self.memory.write(addr, buf).map_err(FatalError::Memory));
        if let Err(err) = copied {
            self.halt(guard, err);
        }

        if let Ok(conn) = guard.connection_mut(slot) {
            conn.outvec[idx].written += buf.len();
        }
    }

    /// Grants direct access to one vector of a call
    ///
    /// Returns the vector's client address and declared length.
    fn map_vector(&self, handle: Handle, idx: usize, output: bool) -> (usize, usize) {
        let (mut guard, me, slot) = self.resolve_message(self.state.lock(), handle);
        let picked = self.mapped_vector(&guard, slot, idx, |conn| {
            let i = idx.min(MAX_IOVEC - 1);
            if output {
                (conn.outvec[i].base, conn.msg.out_size[i], conn.outvec[i].status)
            } else {
                (conn.invec[i].base, conn.msg.in_size[i], conn.invec[i].status)
            }
        });
        let (client, ns, (base, len, status)) = match picked {
            Ok(found) => found,
            Err(reason) => self.misuse(guard, me, reason),
        };
        if len == 0 {
            self.misuse(guard, me, "mapping an empty vector");
        }
        if !status.is_empty() {
            self.misuse(guard, me, "vector already mapped or accessed");
        }

        let access = if output {
            AccessFlags::READWRITE
        } else {
            AccessFlags::READABLE
        };
        let boundary = guard.partition(client).boundary;
        if let Err(err) = self.isolation.memory_check(boundary, base, len, access | ns) {
            self.halt(guard, FatalError::Isolation(err));
        }

        if let Ok(conn) = guard.connection_mut(slot) {
            let status = if output {
                &mut conn.outvec[idx].status
            } else {
                &mut conn.invec[idx].status
            };
            status.insert(IovecStatus::MAPPED);
        }
        (base, len)
    }

    /// Ends direct access to one vector, returning its capacity
    fn unmap_vector<'a>(
        &'a self,
        handle: Handle,
        idx: usize,
        output: bool,
    ) -> (StateGuard<'a, B>, PartitionIdx, SlotRef, usize) {
        let (mut guard, me, slot) = self.resolve_message(self.state.lock(), handle);
        let picked = self.mapped_vector(&guard, slot, idx, |conn| {
            let i = idx.min(MAX_IOVEC - 1);
            if output {
                (conn.outvec[i].status, conn.outvec[i].capacity)
            } else {
                (conn.invec[i].status, conn.invec[i].remaining)
            }
        });
        let (status, capacity) = match picked {
            Ok((_, _, found)) => found,
            Err(reason) => self.misuse(guard, me, reason),
        };
        if !status.contains(IovecStatus::MAPPED) {
            self.misuse(guard, me, "unmapping a vector that is not mapped");
        }
        if status.contains(IovecStatus::UNMAPPED) {
            self.misuse(guard, me, "vector already unmapped");
        }

        if let Ok(conn) = guard.connection_mut(slot) {
            let status = if output {
                &mut conn.outvec[idx].status
            } else {
                &mut conn.invec[idx].status
            };
            status.insert(IovecStatus::UNMAPPED);
        }
        (guard, me, slot, capacity)
    }

    pub(crate) fn psa_map_invec(&self, handle: Handle, idx: usize) -> InVec {
        let (base, len) = self.map_vector(handle, idx, false);
        InVec::new(base, len)
    }

    pub(crate) fn psa_unmap_invec(&self, handle: Handle, idx: usize) {
        drop(self.unmap_vector(handle, idx, false));
    }

    pub(crate) fn psa_map_outvec(&self, handle: Handle, idx: usize) -> OutVec {
        let (base, len) = self.map_vector(handle, idx, true);
        OutVec::new(base, len)
    }

    pub(crate) fn psa_unmap_outvec(&self, handle: Handle, idx: usize, len: usize) {
        let (mut guard, me, slot, capacity) = self.unmap_vector(handle, idx, true);
        if len > capacity {
            let partition = self.registry.partition(me).id;
            self.halt(guard, FatalError::WriteOverflow { partition });
        }
        if let Ok(conn) = guard.connection_mut(slot) {
            conn.outvec[idx].written = len;
        }
    }

    /// Settles the connection for a reply and computes where it goes
    fn route_reply(
        &self,
        state: &mut KernelState<B::Runtime>,
        slot: SlotRef,
        status: PsaStatus,
    ) -> Result<ReplyRoute, FatalError> {
        let conn = state.connection_mut(slot)?;
        if conn.status != ConnectionStatus::Active {
            return Err(FatalError::SchedulerInvariant("reply to an inactive message"));
        }
        let client = conn
            .client
            .ok_or(FatalError::SchedulerInvariant("connection without client"))?;
        let service = conn
            .service
            .ok_or(FatalError::SchedulerInvariant("connection without service"))?;
        let service = self.registry.service(service);

        let mut terminated = false;
        let (reply, next) = match conn.msg.msg_type {
            MessageType::Connect => match status {
                PsaStatus::SUCCESS => (
                    CallReply::status(PsaStatus::from_raw(conn.msg.handle.as_raw())),
                    ConnectionStatus::Idle,
                ),
                PsaStatus::CONNECTION_REFUSED => {
                    (CallReply::status(status), ConnectionStatus::PendingFree)
                }
                PsaStatus::CONNECTION_BUSY if conn.rpc.is_some() => {
                    (CallReply::status(status), ConnectionStatus::PendingFree)
                }
                PsaStatus::CONNECTION_BUSY => (CallReply::status(status), ConnectionStatus::Idle),
                _ => {
                    return Err(FatalError::InvalidConnectReply {
                        partition: self.registry.partition(service.partition).id,
                        status,
                    })
                }
            },
            MessageType::Disconnect => (
                CallReply::status(PsaStatus::SUCCESS),
                ConnectionStatus::PendingFree,
            ),
            MessageType::Call(_) => {
                if status == PsaStatus::PROGRAMMER_ERROR {
                    if !conn.client_id().is_non_secure() {
                        return Err(FatalError::ProgrammerError {
                            partition: self.registry.partition(client).id,
                            status,
                        });
                    }
                    conn.terminated = true;
                    terminated = true;
                }
                conn.release_mappings();
                let next = if service.is_stateless() {
                    ConnectionStatus::PendingFree
                } else {
                    ConnectionStatus::Idle
                };
                (conn.call_reply(status), next)
            }
        };
        conn.status = next;

        Ok(ReplyRoute {
            client,
            rpc: conn.rpc,
            reply,
            handle: conn.msg.handle,
            free: next == ConnectionStatus::PendingFree,
            terminated,
        })
    }

    /// Replies to the request in `slot` and hands the result to its client
    pub(crate) fn complete_message<'a>(
        &'a self,
        mut guard: StateGuard<'a, B>,
        slot: SlotRef,
        status: PsaStatus,
    ) -> StateGuard<'a, B> {
        let route = match self.route_reply(&mut guard, slot, status) {
            Ok(route) => route,
            Err(err) => self.halt(guard, err),
        };

        guard.audit.record(SpmEvent::Replied {
            handle: route.handle,
            status,
        });
        if route.terminated {
            let partition = self.registry.partition(route.client).id;
            log::warn!("connection {} terminated with a programmer error", route.handle);
            guard.audit.record(SpmEvent::ProgrammerErrorReturned {
                partition,
                status,
            });
        }

        self.backend.lock_scheduler(&mut guard);
        let mut delivered =
            self.backend
                .replying(self, &mut guard, route.client, route.rpc, route.reply);
        if delivered.is_ok() && route.free {
            delivered = guard.free_connection(slot);
        }
        self.backend.unlock_scheduler(&mut guard);
        if let Err(err) = delivered {
            self.halt(guard, err);
        }

        self.backend.yield_point(self, guard)
    }

    pub(crate) fn psa_reply(&self, handle: Handle, status: PsaStatus) {
        let (guard, _, slot) = self.resolve_message(self.state.lock(), handle);
        drop(self.complete_message(guard, slot, status));
    }

    pub(crate) fn psa_notify(&self, partition: PartitionId) {
        let (mut guard, me) = self.caller(self.state.lock());
        let Some(target) = self.registry.find_partition(partition) else {
            self.misuse(guard, me, "notify target does not exist");
        };
        self.assert_signal(&mut guard, target, SignalSet::DOORBELL);
        drop(self.backend.yield_point(self, guard));
    }

    pub(crate) fn psa_clear(&self) {
        let (mut guard, me) = self.caller(self.state.lock());
        if !guard
            .partition(me)
            .signals_asserted
            .contains(SignalSet::DOORBELL)
        {
            self.misuse(guard, me, "clear without an asserted doorbell");
        }
        guard
            .partition_mut(me)
            .signals_asserted
            .remove(SignalSet::DOORBELL);
    }

    /// Interrupt line behind one of the caller's irq signals
    fn caller_irq<'a>(
        &'a self,
        signal: SignalSet,
    ) -> (StateGuard<'a, B>, PartitionIdx, &'a IrqDesc, &'a dyn InterruptHal) {
        let (guard, me) = self.caller(self.state.lock());
        let irq = signal
            .is_single()
            .then(|| self.registry.irq_for_signal(me, signal))
            .flatten();
        let Some(irq) = irq else {
            self.misuse(guard, me, "signal is not an interrupt of the partition");
        };
        match &self.interrupts {
            Some(interrupts) => (guard, me, irq, &**interrupts),
            None => self.halt(
                guard,
                FatalError::SchedulerInvariant("interrupt line without a controller"),
            ),
        }
    }

    pub(crate) fn psa_irq_enable(&self, signal: SignalSet) {
        let (mut guard, me, irq, interrupts) = self.caller_irq(signal);
        if interrupts.enable(irq.source) {
            self.take_interrupt(&mut guard, me, irq);
        }
    }

    pub(crate) fn psa_irq_disable(&self, signal: SignalSet) -> bool {
        let (_guard, _, irq, interrupts) = self.caller_irq(signal);
        interrupts.disable(irq.source)
    }

    pub(crate) fn psa_eoi(&self, signal: SignalSet) {
        let (mut guard, me, irq, interrupts) = self.caller_irq(signal);
        if irq.flih.is_some() {
            self.misuse(guard, me, "eoi on a first-level interrupt");
        }
        if !guard.partition(me).signals_asserted.contains(signal) {
            self.misuse(guard, me, "eoi on a signal that is not asserted");
        }
        guard.partition_mut(me).signals_asserted.remove(signal);
        interrupts.clear_pending(irq.source);
        interrupts.enable(irq.source);
    }

    pub(crate) fn psa_reset_signal(&self, signal: SignalSet) {
        let (mut guard, me, irq, _) = self.caller_irq(signal);
        if irq.flih.is_none() {
            self.misuse(guard, me, "reset_signal on a second-level interrupt");
        }
        if !guard.partition(me).signals_asserted.contains(signal) {
            self.misuse(guard, me, "reset_signal on a signal that is not asserted");
        }
        guard.partition_mut(me).signals_asserted.remove(signal);
    }

    pub(crate) fn psa_panic(&self) -> ! {
        let (guard, me) = self.caller(self.state.lock());
        let partition = self.registry.partition(me).id;
        self.halt(guard, FatalError::ResetRequested { partition })
    }
}
