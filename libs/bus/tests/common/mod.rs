//! Shared components and configuration for the bus integration tests

#![allow(dead_code)]

use messaging_bus::{Args, BusConfig, BusHandle, CallError, Component, MethodTable, Value};
use std::thread;
use std::time::{Duration, Instant};

/// Config with short waits so stop/shutdown paths finish quickly
pub fn fast_config() -> BusConfig {
    BusConfig {
        answer_timeout_ms: 2_000,
        poll_timeout_ms: 1_000,
        worker_recv_timeout_ms: 5,
        thread_join_timeout_ms: 1_000,
        cooperative_exit_wait_ms: 200,
        ..BusConfig::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("messaging_bus=debug")
        .with_test_writer()
        .try_init();
}

/// Poll `cond` every few milliseconds until it holds or `within` passes
pub fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// General-purpose test component
///
/// `generation` comes from the construct args so a re-registration is
/// observable through `with_instance` and the `generation` method.
pub struct Echo {
    pub bus: BusHandle,
    pub generation: i64,
    pub seen: Vec<i64>,
    pub ticks: u64,
    pub cleaned: bool,
}

impl Component for Echo {
    const CLASS: &'static str = "Echo";

    fn construct(bus: BusHandle, args: &Args) -> Result<Self, CallError> {
        Ok(Self {
            bus,
            generation: args.get_or(0, 0i64)?,
            seen: Vec::new(),
            ticks: 0,
            cleaned: false,
        })
    }

    fn methods(table: &mut MethodTable<Self>) {
        table
            .add("ping", |_, _| Ok(Value::from("pong")))
            .add("ready", |_, _| Ok(Value::Bool(true)))
            .add("echo", |_, args| {
                Ok(args.value(0).cloned().unwrap_or(Value::Nil))
            })
            .add("generation", |echo, _| Ok(Value::Int(echo.generation)))
            .add("sleep_ms", |_, args| {
                let ms: i64 = args.get(0)?;
                thread::sleep(Duration::from_millis(ms as u64));
                Ok(Value::Int(ms))
            })
            .add("record", |echo, args| {
                echo.seen.push(args.get(0)?);
                Ok(Value::Nil)
            })
            .add("seen", |echo, _| {
                Ok(Value::List(echo.seen.iter().map(|v| Value::Int(*v)).collect()))
            })
            .add("tick", |echo, _| {
                echo.ticks += 1;
                Ok(Value::Nil)
            })
            .add("fail", |_, _| Err(CallError::failed("requested failure")))
            .add("panic", |_, _| panic!("requested panic"))
            .add("relay", |echo, args| {
                let target: String = args.get(0)?;
                let payload = args.value(1).cloned().unwrap_or(Value::Nil);
                Ok(echo
                    .bus
                    .answer(&target, "echo", Args::new().with(payload))
                    .unwrap_or(Value::Nil))
            })
            .add("big", |_, args| {
                let len: i64 = args.get(0)?;
                Ok(Value::Bytes(noisy_bytes(len as usize)))
            });
    }

    fn cleanup(&mut self) {
        self.cleaned = true;
    }
}

/// A second class, used to replace an `Echo` under the same name
pub struct Quiet;

impl Component for Quiet {
    const CLASS: &'static str = "Quiet";

    fn construct(_bus: BusHandle, _args: &Args) -> Result<Self, CallError> {
        Ok(Self)
    }

    fn methods(table: &mut MethodTable<Self>) {
        table.add("ping", |_, _| Ok(Value::from("quiet")));
    }
}

/// Refuses to be built
pub struct Broken;

impl Component for Broken {
    const CLASS: &'static str = "Broken";

    fn construct(_bus: BusHandle, _args: &Args) -> Result<Self, CallError> {
        Err(CallError::failed("no database configured"))
    }

    fn methods(_table: &mut MethodTable<Self>) {}
}

/// Integers of a list result
pub fn ints(value: &Value) -> Vec<i64> {
    value
        .as_list()
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_i64)
        .collect()
}

/// xorshift bytes that zstd cannot shrink much
pub fn noisy_bytes(len: usize) -> Vec<u8> {
    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}
