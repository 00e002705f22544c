//! Remote IPC between a non-secure core and the partition manager.
//!
//! Requests from the other core arrive as JSON frames in a [`Mailbox`].
//! The mailbox agent partition drains them and forwards each one through
//! the remote-bridge entry points; replies travel back through
//! [`MailboxBridge`], the [`RpcOps`](spm::RpcOps) implementation.

mod agent;
mod bridge;
mod client;
mod mailbox;

pub use agent::{agent_partition, serve};
pub use bridge::{MailboxBridge, RangeTranslator};
pub use client::RemoteClient;
pub use mailbox::Mailbox;

use core_types::{CallReply, Handle, InVec, OutVec, PsaStatus, Sid};
use psa_api::RpcOrigin;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const REMOTE_REQUEST_ACTION: &str = "psa.remote.request";
const REMOTE_RESPONSE_ACTION: &str = "psa.remote.response";
const REMOTE_SCHEMA: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteRequest {
    Version {
        sid: Sid,
    },
    Connect {
        sid: Sid,
        version: u32,
    },
    Call {
        handle: Handle,
        call_type: i16,
        in_vec: Vec<InVec>,
        out_vec: Vec<OutVec>,
    },
    Close {
        handle: Handle,
    },
    /// Stops the agent once answered
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestFrame {
    pub request_id: u64,
    pub origin: RpcOrigin,
    pub request: RemoteRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteReply {
    Version(u32),
    Status(CallReply),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseFrame {
    pub request_id: u64,
    pub reply: RemoteReply,
}

#[derive(Debug, Error)]
pub enum RemoteIpcError {
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("No response to request {request_id}")]
    Timeout { request_id: u64 },

    #[error("Doorbell refused: {0}")]
    Doorbell(PsaStatus),

    #[error("Request failed: {0}")]
    Status(PsaStatus),

    #[error("Invalid client id range: {0}")]
    InvalidRange(String),
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    schema: u16,
    action: String,
    body: T,
}

fn encode<T: Serialize>(action: &str, body: T) -> Result<Vec<u8>, RemoteIpcError> {
    let envelope = Envelope {
        schema: REMOTE_SCHEMA,
        action: action.to_string(),
        body,
    };
    serde_json::to_vec(&envelope).map_err(|err| RemoteIpcError::Codec(err.to_string()))
}

fn decode<T: DeserializeOwned>(action: &str, bytes: &[u8]) -> Result<T, RemoteIpcError> {
    let envelope: Envelope<T> =
        serde_json::from_slice(bytes).map_err(|err| RemoteIpcError::Codec(err.to_string()))?;
    if envelope.schema != REMOTE_SCHEMA {
        return Err(RemoteIpcError::Codec(format!(
            "unsupported schema {}",
            envelope.schema
        )));
    }
    if envelope.action != action {
        return Err(RemoteIpcError::Codec("unexpected action".to_string()));
    }
    Ok(envelope.body)
}

pub fn encode_request(frame: &RequestFrame) -> Result<Vec<u8>, RemoteIpcError> {
    encode(REMOTE_REQUEST_ACTION, frame)
}

pub fn decode_request(bytes: &[u8]) -> Result<RequestFrame, RemoteIpcError> {
    decode(REMOTE_REQUEST_ACTION, bytes)
}

pub fn encode_response(frame: &ResponseFrame) -> Result<Vec<u8>, RemoteIpcError> {
    encode(REMOTE_RESPONSE_ACTION, frame)
}

pub fn decode_response(bytes: &[u8]) -> Result<ResponseFrame, RemoteIpcError> {
    decode(REMOTE_RESPONSE_ACTION, bytes)
}
