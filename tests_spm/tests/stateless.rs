//! Stateless Service Tests
//!
//! Stateless services are called through static handles; every call gets
//! a fresh connection that is gone once the reply is delivered.

use core_types::{Handle, PsaStatus, Sid, VersionPolicy};
use spm::audit::SpmEvent;
use spm::manifest::ServiceManifest;
use spm::{Backend, DirectBackend, ThreadedBackend};
use tests_spm::{echo, ns_agent, service_sfn, service_thread, Recorder, TestSystem};

const CRYPTO: Sid = Sid::new(0x4000);
const INDEX: u8 = 3;

fn stateless_service() -> ServiceManifest {
    ServiceManifest::new("crypto", CRYPTO, 6)
        .non_secure_accessible()
        .with_version(1, VersionPolicy::Strict)
        .stateless(INDEX)
}

fn run_stateless<B: Backend>(threaded: bool) {
    let results = Recorder::new();
    let r = results.clone();

    let server = if threaded {
        service_thread(2, vec![stateless_service()], echo)
    } else {
        service_sfn(2, vec![stateless_service()], echo)
    };
    let system = TestSystem::<B>::boot(vec![
        server,
        ns_agent(move |psa| {
            let handle = Handle::stateless(INDEX, 1);
            r.push(psa.call(handle, 0, &[], &mut []));
            r.push(psa.call(handle, 1, &[], &mut []));
            // Stateless handles are never closed.
            r.push(psa.call(Handle::stateless(INDEX, 2), 0, &[], &mut []));
            r.push(psa.call(Handle::stateless(INDEX + 1, 1), 0, &[], &mut []));
            r.push(psa.connect(CRYPTO, 1).err().unwrap_or(PsaStatus::SUCCESS));
        }),
    ]);

    assert!(system.run().is_ok());
    assert_eq!(
        results.values(),
        vec![
            PsaStatus::SUCCESS,
            PsaStatus::SUCCESS,
            PsaStatus::PROGRAMMER_ERROR,
            PsaStatus::PROGRAMMER_ERROR,
            PsaStatus::PROGRAMMER_ERROR,
        ]
    );
    assert_eq!(system.spm.connections_in_use(), 0);

    let audit = system.audit();
    assert_eq!(
        audit.count_events(|e| matches!(e, SpmEvent::ConnectionAllocated { .. })),
        2
    );
    assert_eq!(
        audit.count_events(|e| matches!(e, SpmEvent::ConnectionFreed { .. })),
        2
    );
}

/// Test: Stateless calls free their connection on reply (threaded)
#[test]
fn test_stateless_calls_threaded() {
    run_stateless::<ThreadedBackend>(true);
}

/// Test: Stateless calls free their connection on reply (direct)
#[test]
fn test_stateless_calls_direct() {
    run_stateless::<DirectBackend>(false);
}

/// Test: A stateless call that fails admission does not leak a connection
#[test]
fn test_stateless_bad_vectors_do_not_leak() {
    let results = Recorder::new();
    let r = results.clone();

    let system = TestSystem::<ThreadedBackend>::boot(vec![
        service_thread(2, vec![stateless_service()], echo),
        ns_agent(move |psa| {
            let outside = [core_types::InVec::new(0x10, 4)];
            r.push(psa.call(Handle::stateless(INDEX, 1), 0, &outside, &mut []));
        }),
    ]);

    assert!(system.run().is_ok());
    assert_eq!(results.values(), vec![PsaStatus::PROGRAMMER_ERROR]);
    assert_eq!(system.spm.connections_in_use(), 0);
}
