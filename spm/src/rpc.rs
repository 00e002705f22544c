//! Entry points for requests forwarded from another core
//!
//! The mailbox agent partition receives requests from remote clients and
//! feeds them in through [`RpcAgent`](psa_api::RpcAgent). Once admitted, a
//! remote request travels the same messaging and replying path as a local
//! one; its reply leaves through [`RpcOps::reply`] instead of waking a
//! local client.
//!
//! Remote clients are untrusted: every admission failure is answered with
//! a status, never with a halt.

use crate::backend::{Backend, StateGuard};
use crate::client::Caller;
use crate::SpmCore;
use core_types::{CallReply, ClientId, Handle, InVec, OutVec, PsaStatus, Sid, VERSION_NONE};
use psa_api::{RpcClientData, RpcDispatch, RpcOrigin};

/// Hooks the partition manager needs from a remote bridge
///
/// Both are called with the kernel state locked and must not call back
/// into the partition manager.
pub trait RpcOps: Send + Sync {
    /// Maps a remote client to a non-secure client id
    ///
    /// `None`, or a non-negative id, rejects the request.
    fn translate_client_id(&self, origin: RpcOrigin) -> Option<ClientId>;

    /// Delivers the reply to a request admitted earlier
    fn reply(&self, client_data: RpcClientData, reply: CallReply);
}

impl<B: Backend> SpmCore<B> {
    /// Identifies the remote client behind a request from the mailbox agent
    fn rpc_caller<'a>(
        &'a self,
        guard: StateGuard<'a, B>,
        origin: RpcOrigin,
        client_data: RpcClientData,
    ) -> (StateGuard<'a, B>, Option<Caller>) {
        let (guard, me) = self.caller(guard);
        if !self.registry.partition(me).mailbox {
            self.misuse(guard, me, "remote entry used outside the mailbox agent");
        }
        let Some(ops) = self.rpc_ops.as_ref() else {
            self.misuse(guard, me, "remote entry used without a bridge");
        };

        match ops.translate_client_id(origin) {
            Some(client_id) if client_id.is_non_secure() => {
                let caller = Caller {
                    idx: me,
                    client_id,
                    ns: true,
                    rpc: Some(client_data),
                };
                (guard, Some(caller))
            }
            translated => {
                log::warn!(
                    "rejecting remote client {} from source {}: translated to {:?}",
                    origin.client_id,
                    origin.source,
                    translated
                );
                (guard, None)
            }
        }
    }

    fn rpc_dispatched(&self) -> RpcDispatch {
        if B::DEFERS_RPC_REPLY {
            RpcDispatch::Queued
        } else {
            RpcDispatch::Completed
        }
    }

    pub(crate) fn rpc_version(&self, origin: RpcOrigin, sid: Sid) -> u32 {
        let (_guard, caller) = self.rpc_caller(self.state.lock(), origin, RpcClientData(0));
        caller.map_or(VERSION_NONE, |caller| self.service_version(&caller, sid))
    }

    pub(crate) fn rpc_connect(
        &self,
        origin: RpcOrigin,
        sid: Sid,
        version: u32,
        client_data: RpcClientData,
    ) -> RpcDispatch {
        let (mut guard, caller) = self.rpc_caller(self.state.lock(), origin, client_data);
        let Some(caller) = caller else {
            return RpcDispatch::Immediate(PsaStatus::PROGRAMMER_ERROR);
        };

        match self.prepare_connect(&mut guard, &caller, sid, version) {
            Ok((_, slot)) => {
                self.backend.messaging(self, guard, slot);
                self.rpc_dispatched()
            }
            Err(refusal) => RpcDispatch::Immediate(self.refuse(guard, &caller, refusal)),
        }
    }

    pub(crate) fn rpc_call(
        &self,
        origin: RpcOrigin,
        handle: Handle,
        call_type: i16,
        in_vec: &[InVec],
        out_vec: &[OutVec],
        client_data: RpcClientData,
    ) -> RpcDispatch {
        let (mut guard, caller) = self.rpc_caller(self.state.lock(), origin, client_data);
        let Some(caller) = caller else {
            return RpcDispatch::Immediate(PsaStatus::PROGRAMMER_ERROR);
        };

        match self.prepare_call(&mut guard, &caller, handle, call_type, in_vec, out_vec) {
            Ok(slot) => {
                self.backend.messaging(self, guard, slot);
                self.rpc_dispatched()
            }
            Err(refusal) => RpcDispatch::Immediate(self.refuse(guard, &caller, refusal)),
        }
    }

    pub(crate) fn rpc_close(
        &self,
        origin: RpcOrigin,
        handle: Handle,
        client_data: RpcClientData,
    ) -> RpcDispatch {
        let (mut guard, caller) = self.rpc_caller(self.state.lock(), origin, client_data);
        let Some(caller) = caller else {
            return RpcDispatch::Immediate(PsaStatus::PROGRAMMER_ERROR);
        };

        match self.prepare_close(&mut guard, &caller, handle) {
            Ok(Some(slot)) => {
                self.backend.messaging(self, guard, slot);
                self.rpc_dispatched()
            }
            Ok(None) => RpcDispatch::Immediate(PsaStatus::SUCCESS),
            Err(refusal) => RpcDispatch::Immediate(self.refuse(guard, &caller, refusal)),
        }
    }
}
