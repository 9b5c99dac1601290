//! Registration and supervision lifecycle
//!
//! - re-registration keeps queues and kind, replaces the instance
//! - kind changes are refused without side effects
//! - stop/start produces a fresh worker generation
//! - unregister drains and removes

mod common;

use common::*;
use messaging_bus::{args, Args, Bus, BusError, ComponentKind, Lifecycle, RegisterOptions, Value};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_register_and_answer() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    bus.register::<Echo>("x", ComponentKind::Thread, RegisterOptions::default(), Args::new())
        .unwrap();

    assert!(bus.running("x"));
    assert_eq!(bus.state("x"), Some(Lifecycle::Running));
    let handle = bus.handle();
    assert_eq!(handle.answer("x", "ping", Args::new()), Some(Value::from("pong")));
    assert_eq!(handle.answer("x", "echo", args!["hello"]), Some(Value::from("hello")));
    bus.shutdown();
}

#[test]
fn test_stop_then_start_gives_fresh_generation() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    bus.register::<Echo>("x", ComponentKind::Thread, RegisterOptions::default(), Args::new())
        .unwrap();
    let before = bus.metrics().worker_starts;

    bus.stop("x").unwrap();
    assert!(!bus.running("x"));
    assert_eq!(bus.state("x"), Some(Lifecycle::Stopped));
    assert!(bus.with_instance::<Echo, _>("x", |echo| echo.cleaned).unwrap());

    bus.start("x").unwrap();
    assert!(bus.running("x"));
    assert_eq!(bus.metrics().worker_starts, before + 1);
    assert_eq!(
        bus.handle().answer("x", "ping", Args::new()),
        Some(Value::from("pong"))
    );
    bus.shutdown();
}

#[test]
fn test_calls_queued_while_stopped_run_after_restart() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    bus.register::<Echo>("x", ComponentKind::Thread, RegisterOptions::default(), Args::new())
        .unwrap();
    bus.stop("x").unwrap();

    let handle = bus.handle();
    for i in 0..5 {
        assert!(handle.order("x", "record", args![i]).is_some());
    }
    bus.start("x").unwrap();
    let seen = handle.answer("x", "seen", Args::new()).unwrap();
    assert_eq!(ints(&seen), vec![0, 1, 2, 3, 4]);
    assert!(bus.running("x"));
    bus.shutdown();
}

#[test]
fn test_reregister_replaces_instance_keeps_queues() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    bus.register::<Echo>("x", ComponentKind::Thread, RegisterOptions::default(), args![1])
        .unwrap();
    let handle = bus.handle();
    assert_eq!(handle.answer("x", "generation", Args::new()), Some(Value::Int(1)));

    bus.register::<Echo>("x", ComponentKind::Thread, RegisterOptions::default(), args![2])
        .unwrap();
    assert_eq!(bus.list().len(), 1);
    assert!(bus.running("x"));
    assert_eq!(handle.answer("x", "generation", Args::new()), Some(Value::Int(2)));
    assert_eq!(bus.with_instance::<Echo, _>("x", |echo| echo.generation).unwrap(), 2);

    // A different class under the same name and kind
    bus.register::<Quiet>("x", ComponentKind::Thread, RegisterOptions::default(), Args::new())
        .unwrap();
    assert_eq!(handle.answer("x", "ping", Args::new()), Some(Value::from("quiet")));
    assert!(matches!(
        bus.with_instance::<Echo, _>("x", |_| ()),
        Err(BusError::WrongClass { .. })
    ));
    bus.shutdown();
}

#[test]
fn test_kind_change_is_refused_without_side_effects() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    bus.register::<Echo>("x", ComponentKind::Thread, RegisterOptions::default(), args![7])
        .unwrap();

    let err = bus
        .register::<Echo>("x", ComponentKind::Main, RegisterOptions::default(), args![8])
        .unwrap_err();
    assert!(matches!(err, BusError::ConflictingKind { .. }), "{err}");

    let info = bus.list().remove("x").unwrap();
    assert_eq!(info.kind, ComponentKind::Thread);
    assert!(info.running);
    assert_eq!(
        bus.handle().answer("x", "generation", Args::new()),
        Some(Value::Int(7))
    );
    bus.shutdown();
}

#[test]
fn test_failed_construction_leaves_existing_component() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    bus.register::<Echo>("db", ComponentKind::Thread, RegisterOptions::default(), Args::new())
        .unwrap();

    let err = bus
        .register::<Broken>("db", ComponentKind::Thread, RegisterOptions::default(), Args::new())
        .unwrap_err();
    assert!(matches!(err, BusError::Construct { .. }), "{err}");
    assert!(bus.running("db"));
    assert_eq!(
        bus.handle().answer("db", "ping", Args::new()),
        Some(Value::from("pong"))
    );

    assert!(bus
        .register::<Broken>("fresh", ComponentKind::Thread, RegisterOptions::default(), Args::new())
        .is_err());
    assert_eq!(bus.state("fresh"), None);
    bus.shutdown();
}

#[test]
fn test_deferred_registration() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    bus.register::<Echo>(
        "later",
        ComponentKind::Thread,
        RegisterOptions::default().deferred(),
        Args::new(),
    )
    .unwrap();

    assert_eq!(bus.state("later"), Some(Lifecycle::Registered));
    assert!(!bus.running("later"));
    let handle = bus.handle();
    assert_eq!(
        handle.answer_with_timeout("later", "ping", Args::new(), Duration::from_millis(50)),
        None
    );

    bus.start("later").unwrap();
    assert_eq!(handle.answer("later", "ping", Args::new()), Some(Value::from("pong")));
    bus.shutdown();
}

#[test]
fn test_unregister_removes_component() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    bus.register::<Echo>("x", ComponentKind::Main, RegisterOptions::default(), Args::new())
        .unwrap();
    bus.unregister("x").unwrap();

    assert_eq!(bus.state("x"), None);
    assert!(!bus.running("x"));
    assert!(bus.list().is_empty());
    assert_eq!(bus.handle().order("x", "ping", Args::new()), None);
    assert!(matches!(bus.unregister("x"), Err(BusError::NotRegistered { .. })));
    assert!(matches!(bus.start("x"), Err(BusError::NotRegistered { .. })));

    // The name is free for a fresh registration of any kind
    bus.register::<Echo>("x", ComponentKind::Thread, RegisterOptions::default(), Args::new())
        .unwrap();
    assert_eq!(bus.list()["x"].kind, ComponentKind::Thread);
    bus.shutdown();
}

#[test]
fn test_list_reports_queue_state() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    bus.register::<Echo>(
        "s",
        ComponentKind::Thread,
        RegisterOptions::default().streaming(),
        Args::new(),
    )
    .unwrap();
    bus.register::<Echo>("m", ComponentKind::Main, RegisterOptions::default(), Args::new())
        .unwrap();
    assert!(bus.stream_running("s"));
    assert!(!bus.stream_running("m"));

    let listing = bus.list();
    assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["m", "s"]);
    let s = &listing["s"];
    assert_eq!(s.class, "Echo");
    assert_eq!(s.state, Lifecycle::Running);
    assert!(s.stream_enabled && s.stream_running);
    assert_eq!(listing["m"].kind, ComponentKind::Main);
    bus.shutdown();
}

#[test]
fn test_liveness_does_not_wait_on_a_slow_stop() {
    init_tracing();
    let bus = Arc::new(Bus::new(fast_config()).unwrap());
    bus.register::<Echo>("x", ComponentKind::Thread, RegisterOptions::default(), Args::new())
        .unwrap();
    // Keeps the ctrl loop busy past the thread join timeout
    bus.handle().order("x", "sleep_ms", args![1_500]);
    thread::sleep(Duration::from_millis(50));

    let stopper = {
        let bus = Arc::clone(&bus);
        thread::spawn(move || bus.stop("x"))
    };
    assert!(eventually(Duration::from_secs(1), || {
        bus.state("x") == Some(Lifecycle::Stopping)
    }));

    let started = Instant::now();
    assert!(!bus.running("x"));
    assert!(!bus.stream_running("x"));
    assert!(started.elapsed() < Duration::from_millis(100));

    stopper.join().unwrap().unwrap();
    assert_eq!(bus.state("x"), Some(Lifecycle::Stopped));
    bus.shutdown();
}
