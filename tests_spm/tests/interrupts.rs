//! Interrupt Tests
//!
//! Interrupt lines owned by partitions arrive as signals. Second-level
//! lines stay masked until `eoi`; first-level handlers decide whether the
//! partition sees the interrupt at all.

use core_types::{IrqSource, PartitionId, PsaStatus, SignalSet};
use hal::SimulatedIsolation;
use psa_api::{FlihResult, Timeout};
use spm::audit::SpmEvent;
use spm::manifest::{IrqManifest, PartitionManifest};
use spm::{DirectBackend, FatalError, LoadError, Spm, SpmConfig, ThreadedBackend};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tests_spm::{ns_agent, test_memory, Recorder, TestSystem, NS_AGENT_ID};

const DRIVER_ID: i32 = 2;
const TIMER: IrqSource = IrqSource::new(17);
const TIMER_SIGNAL: SignalSet = SignalSet::bit(6);

/// Agent that returns once the driver reports a handled interrupt
fn waiting_agent() -> PartitionManifest {
    ns_agent(|psa| {
        psa.wait(SignalSet::DOORBELL, Timeout::Block);
        psa.clear();
    })
}

/// Driver that handles each timer interrupt at second level
fn timer_driver(handled: Recorder<bool>) -> PartitionManifest {
    PartitionManifest::new("driver", DRIVER_ID)
        .with_irq(IrqManifest::new("timer", TIMER, 6))
        .with_thread(move |psa| {
            psa.irq_enable(TIMER_SIGNAL);
            loop {
                let signals = psa.wait(TIMER_SIGNAL, Timeout::Block);
                if signals.contains(TIMER_SIGNAL) {
                    // Taking the interrupt masked the line
                    handled.push(psa.irq_disable(TIMER_SIGNAL));
                    psa.eoi(TIMER_SIGNAL);
                    psa.notify(PartitionId::new(NS_AGENT_ID));
                }
            }
        })
}

fn wait_until_enabled(system: &TestSystem<ThreadedBackend>, source: IrqSource) {
    while !system.interrupts.is_enabled(source) {
        thread::sleep(Duration::from_millis(1));
    }
}

/// Test: A second-level interrupt is signalled, masked, then re-enabled by eoi
#[test]
fn test_second_level_interrupt() {
    let handled = Recorder::new();
    let system =
        TestSystem::<ThreadedBackend>::boot(vec![timer_driver(handled.clone()), waiting_agent()]);

    let spm = system.spm.clone();
    let runner = thread::spawn(move || spm.run());
    wait_until_enabled(&system, TIMER);
    system.spm.raise_irq(TIMER).expect("raise timer");

    assert_eq!(runner.join().expect("runner thread"), Ok(()));
    assert_eq!(handled.values(), vec![false]);
    assert!(system.interrupts.is_enabled(TIMER));
    assert!(system.audit().has_event(|e| matches!(
        e,
        SpmEvent::InterruptTaken { source, signalled: true, .. } if *source == TIMER
    )));
}

/// Test: An interrupt raised on a masked line waits for irq_enable
#[test]
fn test_latched_interrupt_delivered_on_enable() {
    let handled = Recorder::new();
    let system =
        TestSystem::<ThreadedBackend>::boot(vec![timer_driver(handled.clone()), waiting_agent()]);

    system.spm.raise_irq(TIMER).expect("raise timer");
    assert!(system.interrupts.is_pending(TIMER));
    assert!(!system.audit().has_event(|e| matches!(e, SpmEvent::InterruptTaken { .. })));

    assert!(system.run().is_ok());
    assert_eq!(handled.values().len(), 1);
    assert!(!system.interrupts.is_pending(TIMER));
}

/// Test: A first-level handler decides whether the partition is signalled
#[test]
fn test_first_level_handler_filters_signal() {
    const UART: IrqSource = IrqSource::new(20);
    const UART_SIGNAL: SignalSet = SignalSet::bit(7);

    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let seen = Recorder::new();
    let s = seen.clone();

    let driver = PartitionManifest::new("uart", DRIVER_ID)
        .with_irq(IrqManifest::new("uart", UART, 7).with_flih(move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                FlihResult::NoSignal
            } else {
                FlihResult::Signal
            }
        }))
        .with_thread(move |psa| {
            psa.irq_enable(UART_SIGNAL);
            loop {
                let signals = psa.wait(UART_SIGNAL, Timeout::Block);
                s.push(signals);
                psa.reset_signal(UART_SIGNAL);
                psa.notify(PartitionId::new(NS_AGENT_ID));
            }
        });
    let system = TestSystem::<ThreadedBackend>::boot(vec![driver, waiting_agent()]);

    let spm = system.spm.clone();
    let runner = thread::spawn(move || spm.run());
    wait_until_enabled(&system, UART);
    system.spm.raise_irq(UART).expect("first raise");
    system.spm.raise_irq(UART).expect("second raise");

    assert_eq!(runner.join().expect("runner thread"), Ok(()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(seen.values(), vec![UART_SIGNAL]);
    let taken: Vec<bool> = system
        .audit()
        .events()
        .iter()
        .filter_map(|e| match e {
            SpmEvent::InterruptTaken { signalled, .. } => Some(*signalled),
            _ => None,
        })
        .collect();
    assert_eq!(taken, vec![false, true]);
    assert!(system.interrupts.is_enabled(UART));
}

/// Test: eoi is reserved for second-level interrupts
#[test]
fn test_eoi_on_first_level_interrupt_halts() {
    let driver = PartitionManifest::new("uart", DRIVER_ID)
        .with_irq(IrqManifest::new("uart", TIMER, 6).with_flih(|| FlihResult::Signal))
        .with_thread(|psa| psa.eoi(TIMER_SIGNAL));
    let system = TestSystem::<ThreadedBackend>::boot(vec![driver, ns_agent(|_| {})]);

    assert!(matches!(
        system.run(),
        Err(FatalError::ServiceApiMisuse { partition, .. }) if partition == PartitionId::new(DRIVER_ID)
    ));
}

/// Test: Interrupt calls on a signal that is no interrupt of the caller halt
#[test]
fn test_irq_enable_on_foreign_signal_halts() {
    let handled = Recorder::new();
    let system = TestSystem::<ThreadedBackend>::boot(vec![
        timer_driver(handled),
        ns_agent(|psa| psa.irq_enable(TIMER_SIGNAL)),
    ]);

    assert!(matches!(
        system.run(),
        Err(FatalError::ServiceApiMisuse { partition, .. }) if partition == PartitionId::new(NS_AGENT_ID)
    ));
}

/// Test: Raising lines nobody owns, or after the system finished, is refused
#[test]
fn test_raise_irq_refusals() {
    let system = TestSystem::<ThreadedBackend>::boot(vec![
        timer_driver(Recorder::new()),
        ns_agent(|_| {}),
    ]);

    assert_eq!(
        system.spm.raise_irq(IrqSource::new(99)),
        Err(PsaStatus::DOES_NOT_EXIST)
    );
    assert!(system.run().is_ok());
    assert_eq!(system.spm.raise_irq(TIMER), Err(PsaStatus::BAD_STATE));
}

/// Test: Interrupt owners need a controller and the threaded backend
#[test]
fn test_interrupt_partitions_rejected_at_load() {
    let no_controller = Spm::<ThreadedBackend>::builder(SpmConfig::default())
        .with_partition(timer_driver(Recorder::new()))
        .with_partition(ns_agent(|_| {}))
        .build(Arc::new(SimulatedIsolation::new()), test_memory());
    assert!(matches!(
        no_controller,
        Err(LoadError::NoInterruptController(partition)) if partition == PartitionId::new(DRIVER_ID)
    ));

    let sfn_driver = PartitionManifest::new("driver", DRIVER_ID)
        .as_sfn()
        .with_irq(IrqManifest::new("timer", TIMER, 6));
    let direct = Spm::<DirectBackend>::builder(SpmConfig::default())
        .with_partition(sfn_driver)
        .with_partition(ns_agent(|_| {}))
        .build(Arc::new(SimulatedIsolation::new()), test_memory());
    assert!(matches!(
        direct,
        Err(LoadError::UnsupportedPartition { .. })
    ));
}
