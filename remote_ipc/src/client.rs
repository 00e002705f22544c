use crate::mailbox::Mailbox;
use crate::{
    decode_response, encode_request, RemoteIpcError, RemoteReply, RemoteRequest, RequestFrame,
};
use core_types::{CallReply, Handle, InVec, OutVec, PsaStatus, Sid};
use psa_api::RpcOrigin;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

type Doorbell = Box<dyn Fn() -> Result<(), PsaStatus> + Send + Sync>;

/// The other core's side of the mailbox
///
/// Every request posts a frame, rings the agent's doorbell and waits for
/// the matching response.
pub struct RemoteClient {
    mailbox: Arc<Mailbox>,
    origin: RpcOrigin,
    doorbell: Doorbell,
    next_id: AtomicU64,
    timeout: Duration,
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("origin", &self.origin)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteClient {
    pub fn new(
        mailbox: Arc<Mailbox>,
        origin: RpcOrigin,
        doorbell: impl Fn() -> Result<(), PsaStatus> + Send + Sync + 'static,
    ) -> Self {
        Self {
            mailbox,
            origin,
            doorbell: Box::new(doorbell),
            next_id: AtomicU64::new(1),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn request(&self, request: RemoteRequest) -> Result<RemoteReply, RemoteIpcError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = RequestFrame {
            request_id,
            origin: self.origin,
            request,
        };
        self.mailbox.post_request(encode_request(&frame)?);

        // The agent may drain the frame and exit before the doorbell rings.
        // Once it has exited any answer it gave is already in the mailbox.
        let bytes = match (self.doorbell)() {
            Ok(()) => self.mailbox.wait_response(request_id, self.timeout),
            Err(status) => Some(
                self.mailbox
                    .try_response(request_id)
                    .ok_or(RemoteIpcError::Doorbell(status))?,
            ),
        }
        .ok_or(RemoteIpcError::Timeout { request_id })?;
        let response = decode_response(&bytes)?;
        if response.request_id != request_id {
            return Err(RemoteIpcError::Codec("request_id mismatch".to_string()));
        }
        Ok(response.reply)
    }

    fn status_request(&self, request: RemoteRequest) -> Result<CallReply, RemoteIpcError> {
        match self.request(request)? {
            RemoteReply::Status(reply) => Ok(reply),
            RemoteReply::Version(_) => {
                Err(RemoteIpcError::Codec("unexpected version reply".to_string()))
            }
        }
    }

    pub fn version(&self, sid: Sid) -> Result<u32, RemoteIpcError> {
        match self.request(RemoteRequest::Version { sid })? {
            RemoteReply::Version(version) => Ok(version),
            RemoteReply::Status(_) => {
                Err(RemoteIpcError::Codec("unexpected status reply".to_string()))
            }
        }
    }

    /// Opens a connection; a refusal comes back as [`RemoteIpcError::Status`]
    pub fn connect(&self, sid: Sid, version: u32) -> Result<Handle, RemoteIpcError> {
        let reply = self.status_request(RemoteRequest::Connect { sid, version })?;
        if reply.status.as_raw() > 0 {
            Ok(Handle::from_raw(reply.status.as_raw()))
        } else {
            Err(RemoteIpcError::Status(reply.status))
        }
    }

    /// Issues a call; the service's status is in the returned reply
    pub fn call(
        &self,
        handle: Handle,
        call_type: i16,
        in_vec: &[InVec],
        out_vec: &[OutVec],
    ) -> Result<CallReply, RemoteIpcError> {
        self.status_request(RemoteRequest::Call {
            handle,
            call_type,
            in_vec: in_vec.to_vec(),
            out_vec: out_vec.to_vec(),
        })
    }

    pub fn close(&self, handle: Handle) -> Result<(), RemoteIpcError> {
        let reply = self.status_request(RemoteRequest::Close { handle })?;
        if reply.status.is_error() {
            return Err(RemoteIpcError::Status(reply.status));
        }
        Ok(())
    }

    /// Asks the agent to stop serving
    pub fn shutdown(&self) -> Result<(), RemoteIpcError> {
        self.status_request(RemoteRequest::Shutdown).map(|_| ())
    }
}
