use crate::bridge::respond;
use crate::mailbox::Mailbox;
use crate::{decode_request, RemoteReply, RemoteRequest, RequestFrame};
use core_types::{CallReply, PsaStatus, SignalSet};
use psa_api::{PsaApi, RpcClientData, RpcDispatch, Timeout};
use spm::manifest::PartitionManifest;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Manifest of a mailbox agent serving `mailbox`
///
/// Give it regions covering the buffers remote clients pass by address.
pub fn agent_partition(id: i32, mailbox: Arc<Mailbox>) -> PartitionManifest {
    PartitionManifest::new("mailbox_agent", id)
        .as_ns_agent()
        .as_mailbox_agent()
        .with_thread(move |psa| serve(psa, &mailbox))
}

/// Agent main loop
///
/// Drains the mailbox, then sleeps on the doorbell. Returns after
/// answering a shutdown request.
pub fn serve(psa: &dyn PsaApi, mailbox: &Mailbox) {
    loop {
        while let Some(bytes) = mailbox.take_request() {
            let flow = match decode_request(&bytes) {
                Ok(frame) => dispatch(psa, mailbox, frame),
                Err(err) => {
                    log::warn!("dropping malformed request frame: {}", err);
                    Flow::Continue
                }
            };
            if flow == Flow::Stop {
                log::debug!("mailbox agent shutting down");
                return;
            }
        }
        psa.wait(SignalSet::DOORBELL, Timeout::Block);
        psa.clear();
    }
}

fn dispatch(psa: &dyn PsaApi, mailbox: &Mailbox, frame: RequestFrame) -> Flow {
    let agent = psa.rpc_agent();
    let id = frame.request_id;
    let origin = frame.origin;
    let client_data = RpcClientData(id);

    let outcome = match frame.request {
        RemoteRequest::Version { sid } => {
            let version = agent.rpc_version(origin, sid);
            respond(mailbox, id, RemoteReply::Version(version));
            return Flow::Continue;
        }
        RemoteRequest::Connect { sid, version } => {
            agent.rpc_connect(origin, sid, version, client_data)
        }
        RemoteRequest::Call {
            handle,
            call_type,
            in_vec,
            out_vec,
        } => agent.rpc_call(origin, handle, call_type, &in_vec, &out_vec, client_data),
        RemoteRequest::Close { handle } => agent.rpc_close(origin, handle, client_data),
        RemoteRequest::Shutdown => {
            respond(
                mailbox,
                id,
                RemoteReply::Status(CallReply::status(PsaStatus::SUCCESS)),
            );
            return Flow::Stop;
        }
    };

    if let RpcDispatch::Immediate(status) = outcome {
        log::debug!("answering request {} directly: {}", id, status);
        respond(mailbox, id, RemoteReply::Status(CallReply::status(status)));
    }
    Flow::Continue
}
