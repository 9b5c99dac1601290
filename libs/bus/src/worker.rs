//! Worker Loops
//!
//! One generation of a component's workers is up to three threads, each the
//! single consumer of one queue:
//!
//! ```text
//! ctrl   ──▶ control loop ──▶ dispatch ──▶ ChunkEncoder ──▶ ResultSink (ctrl)
//! poll   ──▶ poll loop    ──▶ dispatch ──────────────────▶ ResultSink (poll)
//! stream ──▶ stream loop  ──▶ dispatch ──▶ (discarded)
//! ```
//!
//! The same loops drive in-process components (results go straight into the
//! result tables) and components inside a worker process (results go onto
//! the parent socket).
//!
//! A stop envelope only ends the generation whose epoch it carries. Once a
//! generation is retired its loops exit at the next envelope and drop any
//! result they were about to write.

use crate::error::BusError;
use crate::hosted::{CallError, HostedObject};
use crate::queues::QueueReceivers;
use crate::results::ResultTables;
use bus_config::BusConfig;
use codec::ChunkEncoder;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use types::{Args, ControlEnvelope, PollResult, QueueClass, ResultEnvelope, StreamEnvelope, Value};

pub(crate) type SharedInstance = Arc<Mutex<Box<dyn HostedObject>>>;

/// Identity and retirement flag of one worker generation
pub(crate) struct WorkerControl {
    epoch: u64,
    retired: AtomicBool,
}

impl WorkerControl {
    pub fn new(epoch: u64) -> Arc<Self> {
        Arc::new(Self {
            epoch,
            retired: AtomicBool::new(false),
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

/// Where a worker writes its results
pub(crate) trait ResultSink: Send + Sync {
    fn ctrl_result(&self, envelope: ResultEnvelope) -> Result<(), BusError>;

    fn poll_result(&self, result: PollResult) -> Result<(), BusError>;

    /// One stream event left the queue and was handled
    fn stream_consumed(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// Results of in-process workers
pub(crate) struct LocalSink {
    results: Arc<ResultTables>,
}

impl LocalSink {
    pub fn new(results: Arc<ResultTables>) -> Arc<dyn ResultSink> {
        Arc::new(Self { results })
    }
}

impl ResultSink for LocalSink {
    fn ctrl_result(&self, envelope: ResultEnvelope) -> Result<(), BusError> {
        if self.results.ingest_ctrl(envelope) {
            Ok(())
        } else {
            Err(BusError::LockTimeout { what: "ctrl result table" })
        }
    }

    fn poll_result(&self, result: PollResult) -> Result<(), BusError> {
        if self.results.poll.set(result.id, result.result) {
            Ok(())
        } else {
            Err(BusError::LockTimeout { what: "poll result table" })
        }
    }
}

/// Everything a loop needs; cloned once per loop thread
#[derive(Clone)]
pub(crate) struct LoopContext {
    pub name: Arc<str>,
    pub instance: SharedInstance,
    pub control: Arc<WorkerControl>,
    sink: Arc<dyn ResultSink>,
    encoder: ChunkEncoder,
    recv_timeout: Duration,
    max_consecutive_errors: u32,
    error_backoff: Duration,
}

impl LoopContext {
    pub fn new(
        name: Arc<str>,
        instance: SharedInstance,
        control: Arc<WorkerControl>,
        sink: Arc<dyn ResultSink>,
        config: &BusConfig,
    ) -> Self {
        Self {
            name,
            instance,
            control,
            sink,
            encoder: ChunkEncoder::new(config.chunk_threshold),
            recv_timeout: config.worker_recv_timeout(),
            max_consecutive_errors: config.max_consecutive_errors,
            error_backoff: config.error_backoff(),
        }
    }

    fn dispatch(&self, method: &str, args: &Args) -> Result<Value, CallError> {
        let mut instance = self.instance.lock();
        match panic::catch_unwind(AssertUnwindSafe(|| instance.invoke(method, args))) {
            Ok(outcome) => outcome,
            Err(payload) => Err(CallError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    fn cleanup(&self) {
        let mut instance = self.instance.lock();
        if panic::catch_unwind(AssertUnwindSafe(|| instance.cleanup())).is_err() {
            error!(component = %self.name, "cleanup panicked");
        }
    }

    fn write_ctrl(&self, id: types::RequestId, outcome: Result<Value, CallError>) -> Result<(), BusError> {
        let envelopes = match outcome {
            Ok(value) => self
                .encoder
                .encode(id, value)
                .unwrap_or_else(|e| vec![ResultEnvelope::error(id, e.to_string())]),
            Err(e) => vec![ResultEnvelope::error(id, e.to_string())],
        };
        for envelope in envelopes {
            self.sink.ctrl_result(envelope)?;
        }
        Ok(())
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Counts loop-level failures and sleeps once too many happen in a row
struct Backoff<'a> {
    ctx: &'a LoopContext,
    queue: QueueClass,
    consecutive: u32,
}

impl<'a> Backoff<'a> {
    fn new(ctx: &'a LoopContext, queue: QueueClass) -> Self {
        Self {
            ctx,
            queue,
            consecutive: 0,
        }
    }

    fn success(&mut self) {
        self.consecutive = 0;
    }

    fn failure(&mut self) {
        self.consecutive += 1;
        if self.consecutive >= self.ctx.max_consecutive_errors {
            warn!(
                component = %self.ctx.name,
                queue = %self.queue,
                consecutive = self.consecutive,
                backoff_ms = self.ctx.error_backoff.as_millis() as u64,
                "Repeated worker failures, backing off"
            );
            thread::sleep(self.ctx.error_backoff);
            self.consecutive = 0;
        }
    }
}

/// What a loop does with a received envelope
enum Next {
    Continue,
    Exit,
}

fn receive<T>(ctx: &LoopContext, rx: &Receiver<T>, queue: QueueClass) -> Option<Option<T>> {
    if ctx.control.is_retired() {
        return None;
    }
    match rx.recv_timeout(ctx.recv_timeout) {
        Ok(envelope) => Some(Some(envelope)),
        Err(RecvTimeoutError::Timeout) => Some(None),
        Err(RecvTimeoutError::Disconnected) => {
            debug!(component = %ctx.name, queue = %queue, "Queue closed");
            None
        }
    }
}

fn stop_matches(ctx: &LoopContext, epoch: u64, queue: QueueClass) -> bool {
    if epoch == ctx.control.epoch() {
        return true;
    }
    debug!(
        component = %ctx.name,
        queue = %queue,
        stale_epoch = epoch,
        epoch = ctx.control.epoch(),
        "Ignoring stop for another worker generation"
    );
    false
}

pub(crate) fn run_control_loop(ctx: LoopContext, rx: Receiver<ControlEnvelope>) {
    debug!(component = %ctx.name, epoch = ctx.control.epoch(), "Control loop started");
    let mut backoff = Backoff::new(&ctx, QueueClass::Ctrl);

    while let Some(received) = receive(&ctx, &rx, QueueClass::Ctrl) {
        let Some(envelope) = received else { continue };
        let next = match envelope {
            ControlEnvelope::Stop { epoch } => {
                if stop_matches(&ctx, epoch, QueueClass::Ctrl) {
                    ctx.cleanup();
                    Next::Exit
                } else {
                    Next::Continue
                }
            }
            ControlEnvelope::Call(call) => {
                let outcome = ctx.dispatch(&call.method, &call.args);
                let panicked = matches!(outcome, Err(CallError::Panicked(_)));
                if let Err(e) = &outcome {
                    debug!(component = %ctx.name, request_id = %call.id, method = %call.method, error = %e, "Call failed");
                }
                if ctx.control.is_retired() {
                    debug!(component = %ctx.name, request_id = %call.id, "Retired worker dropping result");
                    Next::Exit
                } else if !call.reply {
                    if let Err(e) = &outcome {
                        warn!(component = %ctx.name, request_id = %call.id, method = %call.method, error = %e, "Order failed");
                    }
                    if panicked {
                        backoff.failure();
                    } else {
                        backoff.success();
                    }
                    Next::Continue
                } else {
                    match ctx.write_ctrl(call.id, outcome) {
                        Ok(()) if panicked => {
                            backoff.failure();
                            Next::Continue
                        }
                        Ok(()) => {
                            backoff.success();
                            Next::Continue
                        }
                        Err(e) if e.is_disconnect() => {
                            info!(component = %ctx.name, "Result link closed, control loop exiting");
                            Next::Exit
                        }
                        Err(e) => {
                            error!(component = %ctx.name, request_id = %call.id, error = %e, "Failed to write result");
                            backoff.failure();
                            Next::Continue
                        }
                    }
                }
            }
        };
        if let Next::Exit = next {
            break;
        }
    }
    debug!(component = %ctx.name, epoch = ctx.control.epoch(), "Control loop stopped");
}

pub(crate) fn run_poll_loop(ctx: LoopContext, rx: Receiver<ControlEnvelope>) {
    debug!(component = %ctx.name, epoch = ctx.control.epoch(), "Poll loop started");
    let mut backoff = Backoff::new(&ctx, QueueClass::Poll);

    while let Some(received) = receive(&ctx, &rx, QueueClass::Poll) {
        let Some(envelope) = received else { continue };
        let call = match envelope {
            ControlEnvelope::Stop { epoch } => {
                if stop_matches(&ctx, epoch, QueueClass::Poll) {
                    break;
                }
                continue;
            }
            ControlEnvelope::Call(call) => call,
        };

        let outcome = ctx.dispatch(&call.method, &call.args);
        let panicked = matches!(outcome, Err(CallError::Panicked(_)));
        if ctx.control.is_retired() {
            break;
        }
        let result = PollResult {
            id: call.id,
            result: outcome.ok(),
        };
        match ctx.sink.poll_result(result) {
            Ok(()) if panicked => backoff.failure(),
            Ok(()) => backoff.success(),
            Err(e) if e.is_disconnect() => break,
            Err(e) => {
                error!(component = %ctx.name, request_id = %call.id, error = %e, "Failed to write poll result");
                backoff.failure();
            }
        }
    }
    debug!(component = %ctx.name, epoch = ctx.control.epoch(), "Poll loop stopped");
}

pub(crate) fn run_stream_loop(ctx: LoopContext, rx: Receiver<StreamEnvelope>) {
    debug!(component = %ctx.name, epoch = ctx.control.epoch(), "Stream loop started");
    let mut backoff = Backoff::new(&ctx, QueueClass::Stream);

    while let Some(received) = receive(&ctx, &rx, QueueClass::Stream) {
        let Some(envelope) = received else { continue };
        let event = match envelope {
            StreamEnvelope::Stop { epoch } => {
                if stop_matches(&ctx, epoch, QueueClass::Stream) {
                    break;
                }
                continue;
            }
            StreamEnvelope::Event(event) => event,
        };
        if ctx.control.is_retired() {
            break;
        }
        match ctx.dispatch(&event.func, &event.args) {
            Ok(_) => backoff.success(),
            Err(e @ CallError::Panicked(_)) => {
                error!(component = %ctx.name, func = %event.func, error = %e, "Stream handler panicked");
                backoff.failure();
            }
            Err(e) => {
                warn!(component = %ctx.name, func = %event.func, error = %e, "Stream handler failed");
            }
        }
        if let Err(e) = ctx.sink.stream_consumed() {
            if e.is_disconnect() {
                info!(component = %ctx.name, "Result link closed, stream loop exiting");
                break;
            }
            warn!(component = %ctx.name, error = %e, "Failed to return stream credit");
        }
    }
    debug!(component = %ctx.name, epoch = ctx.control.epoch(), "Stream loop stopped");
}

/// Loop threads of one generation
pub(crate) struct WorkerThreads {
    control: Arc<WorkerControl>,
    handles: Vec<(QueueClass, JoinHandle<()>)>,
}

impl WorkerThreads {
    pub fn control(&self) -> &Arc<WorkerControl> {
        &self.control
    }

    /// Every loop of the generation is still running
    pub fn all_alive(&self) -> bool {
        !self.handles.is_empty() && self.handles.iter().all(|(_, h)| !h.is_finished())
    }

    pub fn stream_alive(&self) -> bool {
        self.handles
            .iter()
            .any(|(class, h)| *class == QueueClass::Stream && !h.is_finished())
    }

    /// Join with a shared deadline; returns how many loops were abandoned
    pub fn join(self, deadline: Instant) -> usize {
        let mut abandoned = 0;
        for (class, handle) in self.handles {
            if !join_until(handle, deadline) {
                warn!(queue = %class, epoch = self.control.epoch(), "Worker loop did not exit in time");
                abandoned += 1;
            }
        }
        abandoned
    }

    /// Block until every loop has exited
    pub fn join_all(self) {
        for (class, handle) in self.handles {
            if handle.join().is_err() {
                error!(queue = %class, "Worker loop panicked");
            }
        }
    }
}

/// Join `handle` if it finishes before `deadline`; otherwise detach it
pub(crate) fn join_until(handle: JoinHandle<()>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
    if handle.join().is_err() {
        error!("Joined thread had panicked");
    }
    true
}

/// Start the control, poll and (optionally) stream loops
pub(crate) fn spawn_loops(
    ctx: LoopContext,
    receivers: QueueReceivers,
    stream_enabled: bool,
) -> io::Result<WorkerThreads> {
    let control = Arc::clone(&ctx.control);
    let mut handles = Vec::with_capacity(3);

    if let Err(e) = spawn_each(&ctx, receivers, stream_enabled, &mut handles) {
        // Loops already running exit at their next receive
        control.retire();
        return Err(e);
    }
    Ok(WorkerThreads { control, handles })
}

fn spawn_each(
    ctx: &LoopContext,
    receivers: QueueReceivers,
    stream_enabled: bool,
    handles: &mut Vec<(QueueClass, JoinHandle<()>)>,
) -> io::Result<()> {
    let QueueReceivers { ctrl, poll, stream } = receivers;

    let c = ctx.clone();
    let handle = thread::Builder::new()
        .name(format!("{}-ctrl", ctx.name))
        .spawn(move || run_control_loop(c, ctrl))?;
    handles.push((QueueClass::Ctrl, handle));

    let c = ctx.clone();
    let handle = thread::Builder::new()
        .name(format!("{}-poll", ctx.name))
        .spawn(move || run_poll_loop(c, poll))?;
    handles.push((QueueClass::Poll, handle));

    if stream_enabled {
        let c = ctx.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-stream", ctx.name))
            .spawn(move || run_stream_loop(c, stream))?;
        handles.push((QueueClass::Stream, handle));
    }
    Ok(())
}
