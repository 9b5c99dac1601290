//! Originating verbs between in-process components
//!
//! Covers ordering per queue class, timeouts and result reclamation,
//! stream backpressure, chunked results, broadcast and async answers.

mod common;

use common::*;
use crossbeam_channel::bounded;
use messaging_bus::{args, Args, Bus, BusConfig, ComponentKind, RegisterOptions, Value};
use std::time::{Duration, Instant};

fn bus_with_echo(config: BusConfig, kind: ComponentKind, options: RegisterOptions) -> Bus {
    init_tracing();
    let bus = Bus::new(config).unwrap();
    bus.register::<Echo>("x", kind, options, Args::new()).unwrap();
    bus
}

#[test]
fn test_orders_observed_in_send_order() {
    let bus = bus_with_echo(fast_config(), ComponentKind::Thread, RegisterOptions::default());
    let handle = bus.handle();

    for i in 0..200 {
        assert!(handle.order("x", "record", args![i]).is_some());
    }
    let seen = handle.answer("x", "seen", Args::new()).unwrap();
    assert_eq!(ints(&seen), (0..200).collect::<Vec<i64>>());
    bus.shutdown();
}

#[test]
fn test_orders_leave_no_results_behind() {
    let bus = bus_with_echo(fast_config(), ComponentKind::Thread, RegisterOptions::default());
    let handle = bus.handle();

    for i in 0..5000 {
        assert!(handle.order("x", "record", args![i]).is_some());
    }
    handle.order("x", "fail", Args::new()).unwrap();
    for _ in 0..100 {
        assert_eq!(handle.broadcast("ping", Args::new()).len(), 1);
    }
    // Same ctrl queue, so every order ran before this answer
    let seen = handle.answer("x", "seen", Args::new()).unwrap();
    assert_eq!(ints(&seen).len(), 5000);
    assert_eq!(bus.result_table_sizes().ctrl, 0);
    assert_eq!(bus.metrics().results_swept, 0);
    bus.shutdown();
}

#[test]
fn test_main_component_relays_to_thread_component() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    bus.register::<Echo>("a", ComponentKind::Main, RegisterOptions::default(), Args::new())
        .unwrap();
    bus.register::<Echo>("b", ComponentKind::Thread, RegisterOptions::default(), Args::new())
        .unwrap();

    let relayed = bus.handle().answer("a", "relay", args!["b", "x"]);
    assert_eq!(relayed, Some(Value::from("x")));

    // The relay's handle originates as "a"
    let origin = bus
        .with_instance::<Echo, _>("a", |echo| echo.bus.origin().map(str::to_string))
        .unwrap();
    assert_eq!(origin.as_deref(), Some("a"));
    bus.shutdown();
}

#[test]
fn test_failed_call_answers_none_and_component_survives() {
    let bus = bus_with_echo(fast_config(), ComponentKind::Thread, RegisterOptions::default());
    let handle = bus.handle();

    assert_eq!(handle.answer("x", "fail", Args::new()), None);
    assert_eq!(handle.answer("x", "no_such_method", Args::new()), None);
    assert_eq!(handle.answer("x", "panic", Args::new()), None);
    assert_eq!(handle.answer("x", "ping", Args::new()), Some(Value::from("pong")));
    assert!(bus.running("x"));
    assert_eq!(bus.metrics().answers_failed, 3);
    bus.shutdown();
}

#[test]
fn test_unknown_target() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    let handle = bus.handle();
    let started = Instant::now();

    assert_eq!(handle.answer("ghost", "ping", Args::new()), None);
    assert_eq!(handle.poll("ghost", "ready", Args::new()), None);
    assert_eq!(handle.order("ghost", "ping", Args::new()), None);
    assert!(!handle.stream("ghost", "tick", Args::new()));
    assert!(started.elapsed() < Duration::from_millis(500));
    bus.shutdown();
}

#[test]
fn test_answer_timeout_and_orphan_sweep() {
    let config = BusConfig {
        sweep_every: 10,
        ..fast_config()
    };
    let bus = bus_with_echo(config, ComponentKind::Thread, RegisterOptions::default());
    let handle = bus.handle();
    let baseline = bus.result_table_sizes().ctrl;

    let started = Instant::now();
    let late = handle.answer_with_timeout("x", "sleep_ms", args![300], Duration::from_millis(50));
    assert_eq!(late, None);
    assert!(started.elapsed() < Duration::from_millis(250));
    assert_eq!(bus.awaited_requests(), 0);
    assert_eq!(bus.metrics().answers_timed_out, 1);

    // The first ping queues behind the sleeper, so the late result lands
    // before the sweep counter trips.
    for _ in 0..10 {
        assert_eq!(handle.answer("x", "ping", Args::new()), Some(Value::from("pong")));
    }
    assert_eq!(bus.result_table_sizes().ctrl, baseline);
    assert!(bus.metrics().results_swept >= 1);
    bus.shutdown();
}

#[test]
fn test_poll_round_trips() {
    let bus = bus_with_echo(fast_config(), ComponentKind::Thread, RegisterOptions::default());
    let handle = bus.handle();

    for _ in 0..1000 {
        assert_eq!(handle.poll("x", "ready", Args::new()), Some(Value::Bool(true)));
    }
    // Failures are best-effort misses, not errors
    assert_eq!(handle.poll("x", "fail", Args::new()), None);
    assert_eq!(bus.metrics().polls_completed, 1000);
    assert_eq!(bus.result_table_sizes().poll, 0);
    bus.shutdown();
}

#[test]
fn test_stream_backpressure() {
    let config = BusConfig {
        stream_capacity: 100,
        ..fast_config()
    };
    let bus = bus_with_echo(config, ComponentKind::Thread, RegisterOptions::default().streaming());
    let handle = bus.handle();

    // Holding the instance stalls the stream loop so the queue fills
    let (accepted, rejected) = bus
        .with_instance::<Echo, _>("x", |_| {
            let mut accepted = 0u64;
            let mut rejected = 0u64;
            for i in 0..10_000 {
                if handle.stream("x", "tick", args![i]) {
                    accepted += 1;
                } else {
                    rejected += 1;
                }
            }
            (accepted, rejected)
        })
        .unwrap();

    assert!(accepted >= 100, "accepted {accepted}");
    assert!(accepted <= 101, "accepted {accepted}");
    assert_eq!(accepted + rejected, 10_000);
    assert_eq!(bus.metrics().stream_dropped, rejected);

    let observed = |bus: &Bus| bus.with_instance::<Echo, _>("x", |echo| echo.ticks).unwrap();
    assert!(eventually(Duration::from_secs(5), || observed(&bus) == accepted));

    // Once drained the queue accepts again
    assert!(handle.stream("x", "tick", Args::new()));
    assert!(eventually(Duration::from_secs(5), || observed(&bus) == accepted + 1));
    bus.shutdown();
}

#[test]
fn test_stream_to_component_without_stream_loop() {
    let bus = bus_with_echo(fast_config(), ComponentKind::Thread, RegisterOptions::default());
    assert!(!bus.handle().stream("x", "tick", Args::new()));
    assert_eq!(bus.list()["x"].stream_depth, 0);
    bus.shutdown();
}

#[test]
fn test_chunked_result_reassembled() {
    let config = BusConfig {
        chunk_threshold: 64 * 1024,
        ..fast_config()
    };
    let bus = bus_with_echo(config, ComponentKind::Thread, RegisterOptions::default());
    let len = 3 * 1024 * 1024;

    let value = bus.handle().answer("x", "big", args![len as i64]).unwrap();
    assert_eq!(value, Value::Bytes(noisy_bytes(len)));
    assert_eq!(bus.result_table_sizes().partial, 0);
    bus.shutdown();
}

#[test]
fn test_broadcast_skips_sender() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    for name in ["a", "b", "c"] {
        bus.register::<Echo>(name, ComponentKind::Thread, RegisterOptions::default(), Args::new())
            .unwrap();
    }

    let from_a = bus.handle_as("a");
    let sent = from_a.broadcast("record", args![9]);
    assert_eq!(sent.keys().collect::<Vec<_>>(), vec!["b", "c"]);

    let sent = bus.handle().broadcast_excluding("record", args![10], &["c"]);
    assert_eq!(sent.keys().collect::<Vec<_>>(), vec!["a", "b"]);

    let handle = bus.handle();
    let seen = |name: &str| ints(&handle.answer(name, "seen", Args::new()).unwrap());
    assert_eq!(seen("a"), vec![10]);
    assert_eq!(seen("b"), vec![9, 10]);
    assert_eq!(seen("c"), vec![9]);
    bus.shutdown();
}

#[test]
fn test_answer_async_invokes_callback_once() {
    let bus = bus_with_echo(fast_config(), ComponentKind::Thread, RegisterOptions::default());
    let handle = bus.handle();
    let (tx, rx) = bounded(4);

    let done = tx.clone();
    assert!(handle.answer_async("x", "echo", args!["later"], None, move |value| {
        let _ = done.send(value);
    }));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        Some(Value::from("later"))
    );

    let timed_out = tx.clone();
    assert!(handle.answer_async(
        "x",
        "sleep_ms",
        args![300],
        Some(Duration::from_millis(30)),
        move |value| {
            let _ = timed_out.send(value);
        }
    ));
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), None);

    assert!(!handle.answer_async("ghost", "ping", Args::new(), None, move |value| {
        let _ = tx.send(value);
    }));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(eventually(Duration::from_secs(1), || bus.awaited_requests() == 0));
    bus.shutdown();
}

#[test]
fn test_stop_and_drain_fails_awaited_calls() {
    let bus = bus_with_echo(fast_config(), ComponentKind::Thread, RegisterOptions::default());
    bus.stop("x").unwrap();
    let handle = bus.handle();

    let waiter = {
        let handle = handle.clone();
        std::thread::spawn(move || {
            let started = Instant::now();
            let result = handle.answer_with_timeout("x", "ping", Args::new(), Duration::from_secs(5));
            (result, started.elapsed())
        })
    };
    assert!(eventually(Duration::from_secs(1), || bus.awaited_requests() == 1));
    bus.stop_and_drain("x").unwrap();

    let (result, elapsed) = waiter.join().unwrap();
    assert_eq!(result, None);
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(bus.list()["x"].ctrl_depth, 0);
    bus.shutdown();
}

#[test]
fn test_shared_state_between_components() {
    init_tracing();
    let bus = Bus::new(fast_config()).unwrap();
    bus.register::<Echo>("a", ComponentKind::Thread, RegisterOptions::default(), Args::new())
        .unwrap();

    let shared = bus.shared();
    shared.set("mode", "live").unwrap();
    assert_eq!(shared.increment("fills", 2, 0).unwrap(), Value::Int(2));

    let from_component = bus
        .with_instance::<Echo, _>("a", |echo| echo.bus.shared().get("mode", Value::Nil))
        .unwrap()
        .unwrap();
    assert_eq!(from_component, Value::from("live"));

    for i in 0..5 {
        shared.append("recent", i, Some(3)).unwrap();
    }
    assert_eq!(
        shared.get("recent", Value::Nil).unwrap(),
        Value::List(vec![Value::Int(2), Value::Int(3), Value::Int(4)])
    );
    assert_eq!(shared.keys().unwrap(), vec!["fills", "mode", "recent"]);
    bus.shutdown();
}
