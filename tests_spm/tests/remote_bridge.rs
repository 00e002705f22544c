//! Remote Bridge Tests
//!
//! A client on another core reaches secure services through the mailbox
//! agent. Admitted requests behave like local ones; everything else is
//! answered with a status.

use core_types::{ClientId, InVec, MessageType, PartitionId, PsaStatus, Sid};
use hal::MemoryRegion;
use psa_api::RpcOrigin;
use remote_ipc::{
    agent_partition, decode_response, encode_request, Mailbox, MailboxBridge, RangeTranslator,
    RemoteClient, RemoteIpcError, RemoteReply, RemoteRequest, RequestFrame,
};
use spm::manifest::{PartitionManifest, ServiceManifest};
use spm::{Backend, DirectBackend, RpcOps, SpmConfig, ThreadedBackend};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tests_spm::{
    echo, out_buffer, service_sfn, service_thread, Recorder, TestSystem, NS_AGENT_ID,
    NS_BUFFERS, NS_BUFFERS_LEN,
};

const ECHO: Sid = Sid::new(0x1000);
const SOURCE: u32 = 0;
const RANGE_TOP: i32 = -0x100;

fn echo_service() -> ServiceManifest {
    ServiceManifest::new("echo", ECHO, 4).non_secure_accessible()
}

/// A running system with a mailbox agent in front of it
struct Remote<B: Backend> {
    system: TestSystem<B>,
    mailbox: Arc<Mailbox>,
    client: RemoteClient,
}

impl<B: Backend> Remote<B> {
    /// Another remote client sharing the mailbox
    fn client_with_id(&self, client_id: i32) -> RemoteClient {
        let spm = self.system.spm.clone();
        RemoteClient::new(
            Arc::clone(&self.mailbox),
            RpcOrigin {
                source: SOURCE,
                client_id,
            },
            move || spm.raise_doorbell(PartitionId::new(NS_AGENT_ID)),
        )
    }
}

/// Boots `service` behind a mailbox agent and runs the system on its own
/// thread while `scenario` plays the remote side
fn with_remote_system<B: Backend>(service: PartitionManifest, scenario: impl FnOnce(&Remote<B>)) {
    let mailbox = Arc::new(Mailbox::new());
    let translator = RangeTranslator::new(SOURCE, ClientId::new(RANGE_TOP), 16).unwrap();
    let bridge: Arc<dyn RpcOps> =
        Arc::new(MailboxBridge::new(Arc::clone(&mailbox), translator));

    let agent = agent_partition(NS_AGENT_ID, Arc::clone(&mailbox))
        .with_region(MemoryRegion::non_secure(NS_BUFFERS, NS_BUFFERS_LEN));
    let system =
        TestSystem::<B>::boot_with(SpmConfig::default(), vec![service, agent], Some(bridge));

    let spm = system.spm.clone();
    let runner = thread::spawn(move || spm.run());

    let spm = system.spm.clone();
    let client = RemoteClient::new(
        Arc::clone(&mailbox),
        RpcOrigin {
            source: SOURCE,
            client_id: 3,
        },
        move || spm.raise_doorbell(PartitionId::new(NS_AGENT_ID)),
    );
    let remote = Remote {
        system,
        mailbox,
        client,
    };

    scenario(&remote);

    remote.client.shutdown().expect("shutdown");
    assert_eq!(runner.join().expect("runner thread"), Ok(()));
    assert_eq!(remote.system.spm.connections_in_use(), 0);
}

fn echo_through_bridge<B: Backend>(service: PartitionManifest) {
    with_remote_system::<B>(service, |remote| {
        let (client, system) = (&remote.client, &remote.system);
        assert_eq!(client.version(ECHO).unwrap(), 1);

        let handle = client.connect(ECHO, 1).expect("connect");
        system.write(NS_BUFFERS, b"hello");
        let reply = client
            .call(
                handle,
                0,
                &[InVec::new(NS_BUFFERS, 5)],
                &[out_buffer(NS_BUFFERS + 0x100, 16)],
            )
            .expect("call");
        assert_eq!(reply.status, PsaStatus::SUCCESS);
        assert_eq!(reply.out_len[0], 5);
        assert_eq!(system.read(NS_BUFFERS + 0x100, 5), b"hello".to_vec());

        client.close(handle).expect("close");
    });
}

/// Test: A remote echo works on the threaded backend
#[test]
fn test_remote_echo_threaded() {
    echo_through_bridge::<ThreadedBackend>(service_thread(2, vec![echo_service()], echo));
}

/// Test: A remote echo works on the direct-call backend
#[test]
fn test_remote_echo_direct() {
    echo_through_bridge::<DirectBackend>(service_sfn(2, vec![echo_service()], echo));
}

/// Test: Remote clients appear to services under their translated id
#[test]
fn test_remote_client_id_is_translated() {
    let seen = Recorder::new();
    let s = seen.clone();

    let service = service_thread(2, vec![echo_service()], move |_, msg| {
        s.push(msg.client_id);
        PsaStatus::SUCCESS
    });
    with_remote_system::<ThreadedBackend>(service, |remote| {
        let client = &remote.client;
        let handle = client.connect(ECHO, 1).expect("connect");
        client.close(handle).expect("close");
    });

    assert_eq!(
        seen.values(),
        vec![ClientId::new(RANGE_TOP - 3), ClientId::new(RANGE_TOP - 3)]
    );
}

/// Test: Remote mistakes come back as status codes and never halt
#[test]
fn test_remote_errors_are_returned() {
    let service = service_thread(2, vec![echo_service()], |_, msg| match msg.msg_type {
        MessageType::Call(1) => PsaStatus::PROGRAMMER_ERROR,
        _ => PsaStatus::SUCCESS,
    });

    with_remote_system::<ThreadedBackend>(service, |remote| {
        let (client, system) = (&remote.client, &remote.system);
        assert!(matches!(
            client.connect(Sid::new(0xdead), 1),
            Err(RemoteIpcError::Status(PsaStatus::CONNECTION_REFUSED))
        ));
        assert_eq!(client.version(Sid::new(0xdead)).unwrap(), 0);

        let handle = client.connect(ECHO, 1).expect("connect");
        let overlapping = [InVec::new(NS_BUFFERS, 8), InVec::new(NS_BUFFERS + 4, 8)];
        let reply = client.call(handle, 0, &overlapping, &[]).unwrap();
        assert_eq!(reply.status, PsaStatus::PROGRAMMER_ERROR);

        let reply = client.call(handle, 1, &[], &[]).unwrap();
        assert_eq!(reply.status, PsaStatus::PROGRAMMER_ERROR);
        let reply = client.call(handle, 0, &[], &[]).unwrap();
        assert_eq!(reply.status, PsaStatus::PROGRAMMER_ERROR);
        client.close(handle).expect("close");

        assert!(system.spm.fault().is_none());
    });
}

/// Test: Requests from clients outside the translated range are refused
#[test]
fn test_untranslatable_client_is_refused() {
    let service = service_sfn(2, vec![echo_service()], echo);
    with_remote_system::<DirectBackend>(service, |remote| {
        let stranger = remote.client_with_id(99);

        assert!(matches!(
            stranger.connect(ECHO, 1),
            Err(RemoteIpcError::Status(PsaStatus::PROGRAMMER_ERROR))
        ));
        assert_eq!(stranger.version(ECHO).unwrap(), 0);
    });
}

/// Test: Every request on a connection is answered under its own id
#[test]
fn test_replies_follow_each_request_id() {
    let service = service_thread(2, vec![echo_service()], echo);
    with_remote_system::<ThreadedBackend>(service, |remote| {
        let handle = remote.client.connect(ECHO, 1).expect("connect");
        let origin = RpcOrigin {
            source: SOURCE,
            client_id: 3,
        };
        let requests = [
            (40, RemoteRequest::Call {
                handle,
                call_type: 0,
                in_vec: vec![],
                out_vec: vec![],
            }),
            (41, RemoteRequest::Call {
                handle,
                call_type: 0,
                in_vec: vec![],
                out_vec: vec![],
            }),
            (42, RemoteRequest::Close { handle }),
        ];

        for (request_id, request) in requests {
            let frame = RequestFrame {
                request_id,
                origin,
                request,
            };
            remote.mailbox.post_request(encode_request(&frame).unwrap());
            remote
                .system
                .spm
                .raise_doorbell(PartitionId::new(NS_AGENT_ID))
                .unwrap();

            let bytes = remote
                .mailbox
                .wait_response(request_id, Duration::from_secs(5))
                .expect("response under the request id");
            let response = decode_response(&bytes).unwrap();
            assert_eq!(response.request_id, request_id);
            assert!(matches!(
                response.reply,
                RemoteReply::Status(reply) if reply.status == PsaStatus::SUCCESS
            ));
        }
    });
}

/// Test: Shutting down right after a close never reports a lost doorbell
#[test]
fn test_repeated_sessions_shut_down_cleanly() {
    for _ in 0..20 {
        let service = service_thread(2, vec![echo_service()], echo);
        with_remote_system::<ThreadedBackend>(service, |remote| {
            let handle = remote.client.connect(ECHO, 1).expect("connect");
            remote.client.close(handle).expect("close");
        });
    }
}
