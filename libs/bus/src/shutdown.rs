//! Shutdown
//!
//! Graceful path, run once no matter how many callers race into it:
//!
//! ```text
//! shutting_down ─▶ stop envelopes to every component ─▶ cooperative wait
//!      ─▶ join/escalate each generation ─▶ drain queues, fail awaited calls
//!      ─▶ clear result tables, close queues ─▶ stop checker ─▶ manager down
//!      ─▶ complete
//! ```
//!
//! The emergency path (bus dropped without a graceful shutdown) skips the
//! cooperative parts: retire threads, terminate and kill processes, shut the
//! manager down.
//!
//! Signal handling runs on a dedicated thread with a current-thread tokio
//! runtime; SIGINT and SIGTERM both trigger the graceful path.

use crate::bus::BusCore;
use crate::error::{BusError, Result};
use crate::registry::{ComponentSlot, Workers};
use crate::supervisor;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::thread;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

const SETTLE_POLL: Duration = Duration::from_millis(10);

#[derive(Default)]
pub(crate) struct ShutdownFlags {
    shutting_down: AtomicBool,
    started: AtomicBool,
    complete: AtomicBool,
}

impl ShutdownFlags {
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }
}

/// Upper bound on a graceful shutdown run by another caller
fn completion_budget(core: &BusCore) -> Duration {
    let config = &core.config;
    config.cooperative_exit_wait()
        + config.process_join_timeout()
        + config.terminate_join_timeout()
        + config.kill_join_timeout()
        + config.thread_join_timeout() * 2
}

fn wait_for_completion(core: &BusCore) {
    let deadline = Instant::now() + completion_budget(core);
    while !core.flags.is_complete() {
        if Instant::now() >= deadline {
            warn!("Shutdown in another thread still running, not waiting further");
            return;
        }
        thread::sleep(SETTLE_POLL);
    }
}

fn workers_exited(core: &BusCore, slot: &ComponentSlot) -> bool {
    match slot.state.try_lock_for(core.config.lock_timeout()) {
        Some(mut state) => state.workers.as_mut().map_or(true, |w| !w.is_alive()),
        None => false,
    }
}

pub(crate) fn graceful(core: &BusCore) {
    if core.flags.started.swap(true, Ordering::SeqCst) {
        debug!("Shutdown already in progress");
        wait_for_completion(core);
        return;
    }
    let started = Instant::now();
    core.flags.shutting_down.store(true, Ordering::SeqCst);
    let slots = core.registry.snapshot();
    info!(components = slots.len(), "Graceful shutdown started");

    let stop_wait = core.config.poll_put_timeout();
    for slot in &slots {
        if let Some(state) = slot.state.try_lock_for(core.config.lock_timeout()) {
            if let Some(workers) = &state.workers {
                slot.set_lifecycle(supervisor::Lifecycle::Stopping);
                slot.queues.send_stop(workers.epoch(), stop_wait);
            }
        }
    }

    let deadline = Instant::now() + core.config.cooperative_exit_wait();
    while Instant::now() < deadline && !slots.iter().all(|slot| workers_exited(core, slot)) {
        thread::sleep(SETTLE_POLL);
    }

    let mut abandoned = 0;
    for slot in &slots {
        let mut state = slot.state.lock();
        abandoned += supervisor::stop_workers(core, slot, &mut state);
        supervisor::drain_component(core, slot);
        state.removed = true;
        state.instance = None;
    }

    core.results.clear();
    core.registry.clear();
    if let Some(mut checker) = core.checker.lock().take() {
        checker.stop();
    }
    core.processes.shutdown();
    core.flags.complete.store(true, Ordering::SeqCst);
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        abandoned,
        "Graceful shutdown complete"
    );
}

pub(crate) fn emergency(core: &BusCore) {
    if core.flags.started.swap(true, Ordering::SeqCst) {
        wait_for_completion(core);
        return;
    }
    core.flags.shutting_down.store(true, Ordering::SeqCst);
    warn!("Emergency shutdown");

    for slot in core.registry.clear() {
        let Some(mut state) = slot.state.try_lock_for(core.config.lock_timeout()) else {
            warn!(component = %slot.name, "Component busy, skipped in emergency shutdown");
            continue;
        };
        match state.workers.take() {
            Some(Workers::Threads(threads)) => threads.control().retire(),
            Some(Workers::Process(process)) => process.kill(&core.processes, &core.config),
            None => {}
        }
        state.removed = true;
        state.instance = None;
    }

    let killed = core.processes.kill_all();
    if killed > 0 {
        warn!(killed, "Killed remaining worker processes");
    }
    if let Some(mut checker) = core.checker.lock().take() {
        checker.stop();
    }
    core.processes.shutdown();
    core.flags.complete.store(true, Ordering::SeqCst);
}

/// Run graceful shutdown on SIGINT/SIGTERM, then optionally exit(0)
pub(crate) fn install_signal_handlers(core: Weak<BusCore>, exit_on_signal: bool) -> Result<()> {
    let (ready_tx, ready_rx) = bounded::<std::io::Result<()>>(1);

    thread::Builder::new()
        .name("bus-signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let received = runtime.block_on(async move {
                let mut interrupt = match signal(SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return None;
                    }
                };
                let mut terminate = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return None;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                tokio::select! {
                    _ = interrupt.recv() => Some("SIGINT"),
                    _ = terminate.recv() => Some("SIGTERM"),
                }
            });
            drop(runtime);

            let Some(signal_name) = received else { return };
            info!(signal = signal_name, "Signal received, shutting down");
            match core.upgrade() {
                Some(core) => graceful(&core),
                None => debug!("Bus already dropped"),
            }
            if exit_on_signal {
                std::process::exit(0);
            }
        })
        .map_err(|e| BusError::spawn_with_source("bus-signals", "signal thread", e))?;

    match ready_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Ok(())) => {
            debug!("Signal handlers installed");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Signal handler registration failed");
            Err(BusError::spawn_with_source("bus-signals", "register signals", e))
        }
        Err(_) => Err(BusError::spawn("bus-signals", "signal thread did not start")),
    }
}

