//! Remote-bridge operations
//!
//! A mailbox agent partition forwards requests that arrived from another
//! core. Once admitted they travel the same path as local requests; the
//! answer is delivered through the bridge's reply callback instead of
//! waking a local caller.

use core_types::{Handle, InVec, OutVec, PsaStatus, Sid};
use serde::{Deserialize, Serialize};

/// Identity of a remote caller before translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RpcOrigin {
    /// Core or mailbox channel the request came from
    pub source: u32,
    /// Client id as known on the remote side
    pub client_id: i32,
}

/// Opaque token the bridge uses to route a reply back to its requester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RpcClientData(pub u64);

/// Outcome of forwarding a remote request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcDispatch {
    /// The request is queued; the reply callback fires later
    Queued,
    /// The request already ran and the reply callback already fired
    Completed,
    /// The request never reached a service; the agent answers it
    Immediate(PsaStatus),
}

/// Operations reserved to a mailbox agent partition
pub trait RpcAgent {
    fn rpc_version(&self, origin: RpcOrigin, sid: Sid) -> u32;

    fn rpc_connect(
        &self,
        origin: RpcOrigin,
        sid: Sid,
        version: u32,
        client_data: RpcClientData,
    ) -> RpcDispatch;

    fn rpc_call(
        &self,
        origin: RpcOrigin,
        handle: Handle,
        call_type: i16,
        in_vec: &[InVec],
        out_vec: &[OutVec],
        client_data: RpcClientData,
    ) -> RpcDispatch;

    fn rpc_close(&self, origin: RpcOrigin, handle: Handle, client_data: RpcClientData)
        -> RpcDispatch;
}
