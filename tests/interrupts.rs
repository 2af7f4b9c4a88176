//! Integration tests for interrupts and break levels

mod support;

use std::thread;
use std::time::Duration;

use support::{Harness, InterruptMode, WorkerOptions, wait_until};
use termbridge::engine::{OutputSpec, Returned, Term};
use termbridge::{EngineConfig, EngineError};

#[test]
fn test_interrupt_when_idle_is_noop() {
    let harness = Harness::start(EngineConfig::default());

    harness.engine.interrupt().unwrap();
    assert!(harness.engine.is_available());
    assert!(harness.engine.call_bool("true").unwrap());
}

#[test]
fn test_interrupt_cancels_running_goal() {
    let harness = Harness::start(EngineConfig::default());
    let engine = harness.engine.clone();

    let blocked = {
        let engine = engine.clone();
        thread::spawn(move || engine.call_bool("block"))
    };
    assert!(wait_until(Duration::from_secs(5), || {
        engine.status().dispatched_goals == 1
    }));

    engine.interrupt().unwrap();
    assert!(matches!(
        blocked.join().unwrap(),
        Err(EngineError::Interrupted(_))
    ));

    let status = engine.status();
    assert!(status.available);
    assert!(!status.paused);
    assert!(status.idle);

    // The goal loop restarts on the next call
    let bindings = engine
        .call("add", vec![Term::Int(1), Term::Int(1)], OutputSpec::vars(["S"]))
        .unwrap()
        .unwrap();
    assert_eq!(bindings.get("S"), Some(&Term::Int(2)));
}

#[test]
fn test_interrupt_leaves_break_level() {
    let options = WorkerOptions {
        interrupt: InterruptMode::BreakLevel,
        ..WorkerOptions::default()
    };
    let harness = Harness::start_with(EngineConfig::default(), options);
    let engine = harness.engine.clone();

    let blocked = {
        let engine = engine.clone();
        thread::spawn(move || engine.call_bool("block"))
    };
    assert!(wait_until(Duration::from_secs(5), || {
        engine.status().dispatched_goals == 1
    }));

    engine.interrupt().unwrap();
    assert!(matches!(
        blocked.join().unwrap(),
        Err(EngineError::Interrupted(_))
    ));
    assert!(!engine.is_paused());
    assert!(engine.is_available());
    assert!(engine.call_bool("true").unwrap());
}

#[test]
fn test_interrupt_abandons_solution_search() {
    let harness = Harness::start(EngineConfig::default());
    let engine = harness.engine.clone();

    let mut solutions = engine
        .solutions("between:10", Vec::new(), OutputSpec::vars(["X"]))
        .unwrap();
    assert!(solutions.next_solution().unwrap().is_some());

    engine.interrupt().unwrap();
    assert!(matches!(
        solutions.next_solution(),
        Err(EngineError::Interrupted(_))
    ));
    drop(solutions);

    assert!(engine.call_bool("true").unwrap());
}

#[test]
fn test_interrupt_during_host_callback() {
    let harness = Harness::start(EngineConfig::default());
    let engine = harness.engine.clone();

    engine
        .registry()
        .register_operation("host", "stall", Vec::new(), |_| {
            thread::sleep(Duration::from_millis(300));
            Ok(Returned::Nothing)
        });

    let stalled = {
        let engine = engine.clone();
        thread::spawn(move || {
            engine.call(
                "callback",
                vec![Term::atom("host"), Term::atom("stall")],
                OutputSpec::empty(),
            )
        })
    };
    assert!(wait_until(Duration::from_secs(5), || {
        engine.status().open_callbacks == 1
    }));

    engine.interrupt().unwrap();
    assert!(matches!(
        stalled.join().unwrap(),
        Err(EngineError::Interrupted(_))
    ));

    // The late outcome is discarded and the engine keeps working
    assert!(engine.call_bool("true").unwrap());
}

#[test]
fn test_interrupt_times_out_on_unresponsive_worker() {
    let config = EngineConfig {
        interrupt_timeout_ms: 100,
        ..EngineConfig::default()
    };
    let options = WorkerOptions {
        interrupt: InterruptMode::Ignore,
        ..WorkerOptions::default()
    };
    let harness = Harness::start_with(config, options);
    let engine = harness.engine.clone();

    let blocked = {
        let engine = engine.clone();
        thread::spawn(move || engine.call_bool("block"))
    };
    assert!(wait_until(Duration::from_secs(5), || {
        engine.status().dispatched_goals == 1
    }));

    assert!(matches!(engine.interrupt(), Err(EngineError::Timeout(_))));
    assert!(matches!(
        blocked.join().unwrap(),
        Err(EngineError::Interrupted(_))
    ));
    assert!(!engine.is_available());
}
