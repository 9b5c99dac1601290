//! Scenario runners used by the `bus-demo` binary

use crate::components::{payload, Controller, Database, Ticker};
use anyhow::{ensure, Context, Result};
use messaging_bus::{args, Args, Bus, BusStats, ComponentInfo, ComponentKind, RegisterOptions, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DATABASE: &str = "database";
pub const CONTROLLER: &str = "controller";
pub const TICKER: &str = "ticker";

/// What a scenario observed, printed as JSON
#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub scenario: String,
    pub elapsed_ms: u64,
    pub results: BTreeMap<String, serde_json::Value>,
    pub components: BTreeMap<String, ComponentInfo>,
    pub metrics: BusStats,
}

impl Report {
    fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.to_string(),
            ..Default::default()
        }
    }

    fn record(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.results.insert(key.to_string(), value.into());
    }

    fn finish(mut self, bus: &Bus, started: Instant) -> Self {
        self.elapsed_ms = started.elapsed().as_millis() as u64;
        self.components = bus.list();
        self.metrics = bus.metrics();
        self
    }
}

/// Register database (process), controller (main) and ticker (thread)
pub fn register_topology(bus: &Bus) -> Result<()> {
    bus.register::<Database>(
        DATABASE,
        ComponentKind::Process,
        RegisterOptions::default().streaming(),
        args!["demo"],
    )
    .context("register database")?;
    bus.register::<Controller>(
        CONTROLLER,
        ComponentKind::Main,
        RegisterOptions::default().streaming(),
        Args::new(),
    )
    .context("register controller")?;
    bus.register::<Ticker>(TICKER, ComponentKind::Thread, RegisterOptions::default(), Args::new())
        .context("register ticker")?;
    Ok(())
}

fn wait_for(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

fn json(value: Option<Value>) -> serde_json::Value {
    value.map(serde_json::Value::from).unwrap_or_default()
}

/// Every verb once across the topology
pub fn basic(bus: &Bus) -> Result<Report> {
    let started = Instant::now();
    let mut report = Report::new("basic");
    let handle = bus.handle();

    let pong = handle.answer(DATABASE, "ping", Args::new());
    ensure!(pong == Some(Value::from("pong")), "database did not answer ping: {:?}", pong);
    report.record("ping", json(pong));

    let polls = (0..100)
        .filter(|_| handle.poll(DATABASE, "ready", Args::new()).is_some())
        .count();
    report.record("polls_answered", polls);

    handle.order(DATABASE, "put", args!["greeting", "hello"]);
    report.record("get", json(handle.answer(DATABASE, "get", args!["greeting"])));
    report.record("query_via_controller", json(handle.answer(CONTROLLER, "query", args!["count"])));
    report.record("database_asks_controller", json(handle.answer(DATABASE, "ask", args![CONTROLLER, "hello"])));

    let fired = handle
        .answer(TICKER, "fire", args![CONTROLLER, 50])
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let observed = wait_for(Duration::from_secs(5), || {
        handle.answer(CONTROLLER, "ticks", Args::new()).and_then(|v| v.as_i64()) == Some(fired)
    });
    report.record("ticks_fired", fired);
    report.record("ticks_observed", observed);

    for _ in 0..3 {
        handle.answer(DATABASE, "bump", args!["database_bumps"]);
    }
    report.record("shared_bumps", json(bus.shared().get("database_bumps", 0).ok()));

    let sent = handle.broadcast("ping", Args::new());
    report.record("broadcast_recipients", sent.len());

    Ok(report.finish(bus, started))
}

/// Sustained answer and poll traffic against the database process
pub fn stress(bus: &Bus, rounds: usize) -> Result<Report> {
    let started = Instant::now();
    let mut report = Report::new("stress");
    let handle = bus.handle();

    let mut answered = 0usize;
    let mut polled = 0usize;
    let mut slowest = Duration::ZERO;
    for i in 0..rounds {
        let call = Instant::now();
        if handle.answer(DATABASE, "echo", args![i as i64]) == Some(Value::Int(i as i64)) {
            answered += 1;
        }
        if handle.poll(DATABASE, "ready", Args::new()).is_some() {
            polled += 1;
        }
        slowest = slowest.max(call.elapsed());
    }
    if answered < rounds {
        warn!(answered, rounds, "Some answers were lost");
    }
    report.record("rounds", rounds);
    report.record("answered", answered);
    report.record("polled", polled);
    report.record("slowest_round_us", slowest.as_micros() as u64);
    report.record("result_tables", serde_json::to_value(bus.result_table_sizes())?);
    Ok(report.finish(bus, started))
}

/// A chunked result from the database process
pub fn big(bus: &Bus, len: usize) -> Result<Report> {
    let started = Instant::now();
    let mut report = Report::new("big");

    let value = bus
        .handle()
        .answer(DATABASE, "big", args![len])
        .context("database returned no payload")?;
    let bytes = value.as_bytes().context("payload is not bytes")?;
    ensure!(bytes.len() == len, "payload length {} != {}", bytes.len(), len);
    let intact = bytes == payload(len).as_slice();
    info!(len, intact, "Large payload received");

    report.record("bytes", len);
    report.record("intact", intact);
    Ok(report.finish(bus, started))
}

/// Steady traffic until the bus shuts down, for signal handling runs
///
/// Prints one JSON line with the database pid before traffic starts.
pub fn serve(bus: &Bus) -> Result<Report> {
    let started = Instant::now();
    let mut report = Report::new("serve");
    let handle = bus.handle();

    let pid = handle
        .answer(DATABASE, "pid", Args::new())
        .and_then(|v| v.as_i64())
        .context("database pid")?;
    println!("{}", serde_json::json!({ "ready": true, "database_pid": pid }));

    let mut rounds = 0u64;
    while !bus.is_shutting_down() {
        handle.answer(CONTROLLER, "query", args!["ping"]);
        handle.stream(DATABASE, "on_tick", args![rounds as i64]);
        rounds += 1;
        thread::sleep(Duration::from_millis(5));
    }
    report.record("rounds", rounds);
    Ok(report.finish(bus, started))
}
