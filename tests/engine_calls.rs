//! Integration tests for goal submission and result correlation
//!
//! Runs the engine against the scripted loopback worker in `support`.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use support::{Harness, RELEASE, WorkerOptions, wait_until};
use termbridge::engine::protocol;
use termbridge::engine::{OutputSpec, Term};
use termbridge::transport::PreservesCodec;
use termbridge::{EngineConfig, EngineError};

fn concurrent() -> EngineConfig {
    EngineConfig {
        allow_concurrent_goals: true,
        ..EngineConfig::default()
    }
}

#[test]
fn test_available_after_startup() {
    let harness = Harness::start(EngineConfig::default());
    let status = harness.engine.status();

    assert!(status.available);
    assert!(status.idle);
    assert!(!status.goal_loop_started);
    assert_eq!(status.open_goals, 0);
}

#[test]
fn test_call_binds_outputs() {
    let harness = Harness::start(EngineConfig::default());
    let engine = &harness.engine;

    let bindings = engine
        .call(
            "add",
            vec![Term::Int(2), Term::Int(40)],
            OutputSpec::vars(["Sum"]),
        )
        .unwrap()
        .unwrap();
    assert_eq!(bindings.get("Sum"), Some(&Term::Int(42)));
    assert!(!bindings.is_undefined());

    assert!(engine.call_bool("true").unwrap());
    assert!(!engine.call_bool("fail").unwrap());

    // Goal loop stays up between calls
    let status = engine.status();
    assert!(status.goal_loop_started);
    assert!(status.available);
    assert!(status.idle);
}

#[test]
fn test_echo_keeps_variable_order() {
    let harness = Harness::start(EngineConfig::default());

    let bindings = harness
        .engine
        .call(
            "echo",
            vec![Term::atom("a"), Term::string("b"), Term::Int(3)],
            OutputSpec::vars(["X", "Y", "Z"]),
        )
        .unwrap()
        .unwrap();

    assert_eq!(bindings.names(), &["X", "Y", "Z"]);
    assert_eq!(
        bindings.values(),
        &[Term::atom("a"), Term::string("b"), Term::Int(3)]
    );
}

#[test]
fn test_worker_error_surfaces() {
    let harness = Harness::start(EngineConfig::default());

    match harness.engine.call("error", Vec::new(), OutputSpec::empty()) {
        Err(EngineError::Worker { error, .. }) => {
            assert_eq!(error, Term::compound("error", vec![Term::atom("boom")]));
        }
        other => panic!("expected worker error, got {:?}", other),
    }

    // The engine stays usable
    assert!(harness.engine.call_bool("true").unwrap());
}

#[test]
fn test_binding_count_mismatch_fails_only_that_call() {
    let harness = Harness::start(EngineConfig::default());

    let result = harness
        .engine
        .call("bad_arity", Vec::new(), OutputSpec::vars(["X"]));
    assert!(matches!(result, Err(EngineError::TransportFailure(_))));

    assert!(harness.engine.status().failure.is_none());
    assert!(harness.engine.call_bool("true").unwrap());
}

#[test]
fn test_bootstrap_sends_type_examples() {
    let harness = Harness::start(EngineConfig::default());

    let bindings = harness
        .engine
        .call("examples", Vec::new(), OutputSpec::vars(["N"]))
        .unwrap()
        .unwrap();
    assert_eq!(
        bindings.get("N"),
        Some(&Term::Int(protocol::type_examples().len() as i64))
    );
}

#[test]
fn test_preserves_codec_roundtrip() {
    let options = WorkerOptions {
        codec: Some(Arc::new(PreservesCodec)),
        ..WorkerOptions::default()
    };
    let harness = Harness::start_with(EngineConfig::default(), options);

    let input = Term::compound(
        "point",
        vec![Term::Float(1.5), Term::List(vec![Term::atom("x"), Term::Nil])],
    );
    let bindings = harness
        .engine
        .call("echo", vec![input.clone()], OutputSpec::vars(["P"]))
        .unwrap()
        .unwrap();
    assert_eq!(bindings.get("P"), Some(&input));
}

#[test]
fn test_admission_holds_second_bare_goal() {
    let harness = Harness::start(EngineConfig::default());
    let engine = harness.engine.clone();

    let blocker = {
        let engine = engine.clone();
        thread::spawn(move || engine.call_bool("block"))
    };
    assert!(wait_until(Duration::from_secs(5), || {
        engine.status().dispatched_goals == 1
    }));

    let second_done = Arc::new(AtomicBool::new(false));
    let second = {
        let engine = engine.clone();
        let done = second_done.clone();
        thread::spawn(move || {
            let result = engine.call_bool("true");
            done.store(true, Ordering::SeqCst);
            result
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!second_done.load(Ordering::SeqCst));
    assert_eq!(engine.status().open_goals, 1);

    engine.send_command(RELEASE).unwrap();
    assert!(blocker.join().unwrap().unwrap());
    assert!(second.join().unwrap().unwrap());
    assert!(engine.is_idle());
}

#[test]
fn test_concurrent_goals_queue_behind_running_goal() {
    let harness = Harness::start(concurrent());
    let engine = harness.engine.clone();

    let blocker = {
        let engine = engine.clone();
        thread::spawn(move || engine.call_bool("block"))
    };
    assert!(wait_until(Duration::from_secs(5), || {
        engine.status().dispatched_goals == 1
    }));

    let results = Arc::new(Mutex::new(Vec::new()));
    let adders: Vec<_> = (1..=2)
        .map(|n| {
            let engine = engine.clone();
            let results = results.clone();
            thread::spawn(move || {
                let bindings = engine
                    .call("add", vec![Term::Int(n), Term::Int(10)], OutputSpec::vars(["S"]))
                    .unwrap()
                    .unwrap();
                results.lock().push(bindings.get("S").cloned());
            })
        })
        .collect();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.status().open_goals == 3
    }));
    assert_eq!(engine.status().dispatched_goals, 1);

    engine.send_command(RELEASE).unwrap();
    assert!(blocker.join().unwrap().unwrap());
    for adder in adders {
        adder.join().unwrap();
    }

    let mut sums = results.lock().clone();
    sums.sort_by_key(|term| term.as_ref().and_then(Term::as_int));
    assert_eq!(sums, vec![Some(Term::Int(11)), Some(Term::Int(12))]);
}

#[test]
fn test_shutdown_aborts_every_open_goal() {
    let harness = Harness::start(concurrent());
    let engine = harness.engine.clone();

    let callers: Vec<_> = ["block", "true", "true"]
        .into_iter()
        .map(|code| {
            let engine = engine.clone();
            thread::spawn(move || engine.call_bool(code))
        })
        .collect();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.status().open_goals == 3
    }));
    engine.shutdown();

    for caller in callers {
        match caller.join().unwrap() {
            Err(EngineError::Aborted(_)) => {}
            other => panic!("expected abort, got {:?}", other),
        }
    }

    // New work is refused
    assert!(matches!(
        engine.call_bool("true"),
        Err(EngineError::Aborted(_))
    ));
}

#[test]
fn test_worker_death_disables_engine() {
    let harness = Harness::start(EngineConfig::default());

    let result = harness.engine.call_bool("die");
    assert!(matches!(result, Err(EngineError::TransportFailure(_))));

    let status = harness.engine.status();
    assert!(status.failure.is_some());
    assert!(matches!(
        harness.engine.call_bool("true"),
        Err(EngineError::TransportFailure(_))
    ));
}

#[test]
fn test_error_marker_listener() {
    let harness = Harness::start(EngineConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let listener = {
        let seen = seen.clone();
        harness
            .engine
            .add_output_listener("error", move |event| {
                let trailing = event.trailing.clone().unwrap_or_default();
                seen.lock().push(String::from_utf8_lossy(&trailing).into_owned());
            })
            .unwrap()
    };

    assert!(harness.engine.call_bool("print:*** oops\n").unwrap());
    assert_eq!(seen.lock().as_slice(), &["oops\n".to_string()]);

    assert!(harness.engine.remove_output_listener("error", listener));
    assert!(harness.engine.call_bool("print:*** again\n").unwrap());
    assert_eq!(seen.lock().len(), 1);

    assert!(harness.engine.add_output_listener("nonexistent", |_| {}).is_none());
}
