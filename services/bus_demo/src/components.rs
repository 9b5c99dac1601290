//! Demo components

use messaging_bus::{args, Args, BusHandle, CallError, Catalog, Component, MethodTable, Value};
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;
use tracing::info;

/// Classes the worker program can rebuild
pub fn catalog() -> Catalog {
    Catalog::new()
        .with::<Database>()
        .with::<Controller>()
        .with::<Ticker>()
}

/// Deterministic, poorly compressible bytes for large-result runs
pub fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn shared_failure(e: impl std::fmt::Display) -> CallError {
    CallError::failed(format!("shared state: {}", e))
}

/// Key-value store, normally hosted in its own process
pub struct Database {
    bus: BusHandle,
    table: String,
    rows: BTreeMap<String, Value>,
    ticks: u64,
}

impl Component for Database {
    const CLASS: &'static str = "Database";

    fn construct(bus: BusHandle, args: &Args) -> Result<Self, CallError> {
        Ok(Self {
            bus,
            table: args.get_or(0, "main".to_string())?,
            rows: BTreeMap::new(),
            ticks: 0,
        })
    }

    fn initialize(&mut self) -> Result<(), CallError> {
        info!(table = %self.table, pid = std::process::id(), "Database opened");
        Ok(())
    }

    fn cleanup(&mut self) {
        info!(table = %self.table, rows = self.rows.len(), "Database closed");
    }

    fn methods(table: &mut MethodTable<Self>) {
        table
            .add("ping", |_, _| Ok(Value::from("pong")))
            .add("ready", |_, _| Ok(Value::Bool(true)))
            .add("echo", |_, args| Ok(args.value(0).cloned().unwrap_or_default()))
            .add("pid", |_, _| Ok(Value::from(std::process::id())))
            .add("sleep_ms", |_, args| {
                let ms: u64 = args.get(0)?;
                thread::sleep(Duration::from_millis(ms));
                Ok(Value::Nil)
            })
            .add("big", |_, args| Ok(Value::Bytes(payload(args.get(0)?))))
            .add("put", |db, args| {
                let key: String = args.get(0)?;
                let value = args.value(1).cloned().unwrap_or_default();
                Ok(db.rows.insert(key, value).unwrap_or_default())
            })
            .add("get", |db, args| {
                let key: String = args.get(0)?;
                Ok(db.rows.get(&key).cloned().unwrap_or_default())
            })
            .add("count", |db, _| Ok(Value::from(db.rows.len())))
            .add("bump", |db, args| {
                let key: String = args.get(0)?;
                db.bus.shared().increment(&key, 1, 0).map_err(shared_failure)
            })
            .add("shared_get", |db, args| {
                let key: String = args.get(0)?;
                db.bus.shared().get(&key, Value::Nil).map_err(shared_failure)
            })
            .add("ask", |db, args| {
                let target: String = args.get(0)?;
                let method: String = args.get(1)?;
                Ok(db.bus.answer(&target, &method, Args::new()).unwrap_or_default())
            })
            .add("notify", |db, args| {
                let target: String = args.get(0)?;
                let func: String = args.get(1)?;
                let payload = args.value(2).cloned().unwrap_or_default();
                Ok(Value::Bool(db.bus.stream(&target, &func, args![payload])))
            })
            .add("on_tick", |db, _| {
                db.ticks += 1;
                Ok(Value::Nil)
            })
            .add("ticks", |db, _| Ok(Value::from(db.ticks as i64)));
    }
}

/// UI-side coordinator; runs with the registering program
pub struct Controller {
    bus: BusHandle,
    ticks: u64,
    last_tick: Value,
}

impl Component for Controller {
    const CLASS: &'static str = "Controller";

    fn construct(bus: BusHandle, _args: &Args) -> Result<Self, CallError> {
        Ok(Self {
            bus,
            ticks: 0,
            last_tick: Value::Nil,
        })
    }

    fn methods(table: &mut MethodTable<Self>) {
        table
            .add("hello", |_, _| Ok(Value::from("controller")))
            .add("query", |ctl, args| {
                let method: String = args.get(0)?;
                ctl.bus
                    .answer(crate::DATABASE, &method, Args::new())
                    .ok_or_else(|| CallError::failed(format!("database did not answer {}", method)))
            })
            .add("on_tick", |ctl, args| {
                ctl.ticks += 1;
                ctl.last_tick = args.value(0).cloned().unwrap_or_default();
                Ok(Value::Nil)
            })
            .add("ticks", |ctl, _| Ok(Value::from(ctl.ticks as i64)))
            .add("status", |ctl, _| {
                let mut status = BTreeMap::new();
                status.insert("ticks".to_string(), Value::from(ctl.ticks as i64));
                status.insert("last_tick".to_string(), ctl.last_tick.clone());
                Ok(Value::Map(status))
            });
    }
}

/// Emits stream events on request
pub struct Ticker {
    bus: BusHandle,
}

impl Component for Ticker {
    const CLASS: &'static str = "Ticker";

    fn construct(bus: BusHandle, _args: &Args) -> Result<Self, CallError> {
        Ok(Self { bus })
    }

    fn methods(table: &mut MethodTable<Self>) {
        table.add("fire", |ticker, args| {
            let target: String = args.get(0)?;
            let count: i64 = args.get(1)?;
            let accepted = (0..count)
                .filter(|i| ticker.bus.stream(&target, "on_tick", args![*i]))
                .count();
            Ok(Value::from(accepted))
        });
    }
}
