//! Supervisor
//!
//! Per-component lifecycle:
//!
//! ```text
//! (unregistered) ──register──▶ Registered ──start──▶ Running
//!                                  ▲                   │ stop
//!                                  │ register          ▼
//!                               Stopped ◀────────── Stopping
//! ```
//!
//! Starting bumps the slot's epoch, so a restarted generation ignores stop
//! envelopes left in the preserved queues by the previous one. Stopping
//! joins with bounded waits; a worker that refuses to exit is retired,
//! logged and abandoned.
//!
//! Every function here is called with the slot's `state` lock held.

use crate::bus::BusCore;
use crate::error::{BusError, Result};
use crate::metrics::BusMetrics;
use crate::process::host;
use crate::process::protocol::Bootstrap;
use crate::registry::{ComponentSlot, SlotState, Workers};
use crate::worker::{spawn_loops, LocalSink, LoopContext, WorkerControl};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use types::{ComponentKind, QueueClass, ResultEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Lifecycle {
    Registered = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl Lifecycle {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Lifecycle::Running,
            2 => Lifecycle::Stopping,
            3 => Lifecycle::Stopped,
            _ => Lifecycle::Registered,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Registered => "registered",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start a fresh worker generation, stopping any running one first
pub(crate) fn start_component(
    core: &BusCore,
    slot: &Arc<ComponentSlot>,
    state: &mut SlotState,
) -> Result<()> {
    if state.workers.is_some() {
        debug!(component = %slot.name, "Restarting running component");
        stop_workers(core, slot, state);
    }
    if core.flags.is_shutting_down() {
        return Err(BusError::ShuttingDown);
    }

    let epoch = slot.next_epoch();
    let control = WorkerControl::new(epoch);

    let workers = match slot.kind {
        ComponentKind::Process => {
            let bootstrap = Bootstrap {
                name: slot.name.to_string(),
                class: state.class.clone(),
                args: state.args.clone(),
                stream_enabled: state.stream_enabled,
                epoch,
                config: core.config.clone(),
            };
            let connection = core.processes.spawn(&bootstrap, &core.config)?;
            Workers::Process(host::launch(core, slot, connection, control, state.stream_enabled)?)
        }
        ComponentKind::Main | ComponentKind::Thread => {
            let instance = state
                .instance
                .clone()
                .ok_or_else(|| BusError::not_registered(slot.name.as_ref()))?;
            let ctx = LoopContext::new(
                Arc::clone(&slot.name),
                instance,
                control,
                LocalSink::new(Arc::clone(&core.results)),
                &core.config,
            );
            let threads = spawn_loops(ctx, slot.queues.receivers(), state.stream_enabled)
                .map_err(|e| BusError::spawn_with_source(slot.name.as_ref(), "worker threads", e))?;
            Workers::Threads(threads)
        }
    };

    state.workers = Some(workers);
    slot.set_lifecycle(Lifecycle::Running);
    BusMetrics::incr(&core.metrics.worker_starts);
    info!(
        component = %slot.name,
        kind = %slot.kind,
        class = %state.class,
        epoch,
        stream = state.stream_enabled,
        "Component started"
    );
    Ok(())
}

/// Stop the running generation, leaving the queues in place
///
/// Returns how many workers were abandoned.
pub(crate) fn stop_workers(core: &BusCore, slot: &ComponentSlot, state: &mut SlotState) -> usize {
    let Some(workers) = state.workers.take() else {
        if slot.lifecycle() == Lifecycle::Running {
            slot.set_lifecycle(Lifecycle::Stopped);
        }
        return 0;
    };

    slot.set_lifecycle(Lifecycle::Stopping);
    let epoch = workers.epoch();
    slot.queues.send_stop(epoch, core.config.poll_put_timeout());

    let abandoned = match workers {
        Workers::Threads(threads) => {
            let control = Arc::clone(threads.control());
            let abandoned = threads.join(Instant::now() + core.config.thread_join_timeout());
            control.retire();
            abandoned
        }
        Workers::Process(process) => process.shutdown(&core.processes, &core.config),
    };

    if abandoned > 0 {
        warn!(component = %slot.name, epoch, abandoned, "Workers abandoned after stop");
        BusMetrics::add(&core.metrics.workers_abandoned, abandoned as u64);
    }
    BusMetrics::incr(&core.metrics.worker_stops);
    slot.set_lifecycle(Lifecycle::Stopped);
    info!(component = %slot.name, epoch, "Component stopped");
    abandoned
}

/// Empty the queues, failing drained calls that someone still waits on
pub(crate) fn drain_component(core: &BusCore, slot: &ComponentSlot) -> usize {
    let drained = slot.queues.drain();
    let mut failed = 0;
    for (class, call) in &drained.calls {
        if !core.in_flight.contains_key(&call.id) {
            continue;
        }
        let written = match class {
            QueueClass::Poll => core.results.poll.set(call.id, None),
            _ => core
                .results
                .ingest_ctrl(ResultEnvelope::error(call.id, "component stopped")),
        };
        if written {
            failed += 1;
        }
    }
    if !drained.calls.is_empty() || drained.stream_events > 0 {
        info!(
            component = %slot.name,
            calls = drained.calls.len(),
            failed,
            stream_events = drained.stream_events,
            "Queues drained"
        );
    }
    drained.calls.len() + drained.stream_events
}
