//! Parent side of a process worker
//!
//! One forwarder thread per queue moves envelopes from the parent-side
//! queue onto the socket in FIFO order; one reader thread takes frames from
//! the worker: results go into the result tables, verbs run against the
//! bus on the worker's behalf, shared-state operations run on the root map.

use super::manager::{ChildConnection, ProcessManager};
use super::protocol::{ChildFrame, Delivery, ParentFrame, ResultFrame, VerbReply, VerbRequest};
use crate::bus::BusCore;
use crate::error::{BusError, Result};
use crate::registry::ComponentSlot;
use crate::results::ResultTables;
use crate::shared_state::SharedState;
use crate::worker::{join_until, WorkerControl};
use bus_config::BusConfig;
use codec::{CodecError, FrameReader, FrameWriter};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use types::{ControlEnvelope, QueueClass, StreamEnvelope};

/// Write half of the socket, shared by forwarders and the reader
pub(crate) struct ParentLink {
    writer: Mutex<FrameWriter<UnixStream>>,
    socket: UnixStream,
    closed: AtomicBool,
}

impl ParentLink {
    fn send(&self, frame: &ParentFrame) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::transport("parent link", CodecError::Closed));
        }
        self.writer.lock().send(frame).map_err(|e| {
            if e.is_disconnect() {
                self.closed.store(true, Ordering::SeqCst);
            }
            BusError::transport("parent link", e)
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// Stream events the worker can still take without overflowing its queue
///
/// The stream forwarder spends one credit per event; the worker hands
/// credit back as its stream loop consumes events. With no credit left the
/// parent-side stream queue fills and `stream` starts returning `false`.
pub(crate) struct StreamCredits {
    available: Mutex<usize>,
    granted: Condvar,
    unlimited: AtomicBool,
}

impl StreamCredits {
    fn new(capacity: usize) -> Self {
        Self {
            available: Mutex::new(capacity),
            granted: Condvar::new(),
            unlimited: AtomicBool::new(false),
        }
    }

    /// Take one credit, waiting up to `timeout` for the worker to return some
    fn acquire(&self, timeout: Duration) -> bool {
        if self.unlimited.load(Ordering::SeqCst) {
            return true;
        }
        let mut available = self.available.lock();
        if *available == 0 {
            self.granted.wait_for(&mut available, timeout);
        }
        if *available > 0 {
            *available -= 1;
            true
        } else {
            self.unlimited.load(Ordering::SeqCst)
        }
    }

    fn grant(&self, consumed: u32) {
        *self.available.lock() += consumed as usize;
        self.granted.notify_all();
    }

    /// Stop gating; used while stopping so queued stops reach the worker
    fn open(&self) {
        self.unlimited.store(true, Ordering::SeqCst);
        self.granted.notify_all();
    }
}

/// Envelope types a forwarder moves across the socket
trait Forwarded: Send + 'static {
    fn stop_epoch(&self) -> Option<u64>;
}

impl Forwarded for ControlEnvelope {
    fn stop_epoch(&self) -> Option<u64> {
        match self {
            ControlEnvelope::Stop { epoch } => Some(*epoch),
            ControlEnvelope::Call(_) => None,
        }
    }
}

impl Forwarded for StreamEnvelope {
    fn stop_epoch(&self) -> Option<u64> {
        match self {
            StreamEnvelope::Stop { epoch } => Some(*epoch),
            StreamEnvelope::Event(_) => None,
        }
    }
}

struct Forwarder<T> {
    name: Arc<str>,
    queue: QueueClass,
    rx: Receiver<T>,
    link: Arc<ParentLink>,
    control: Arc<WorkerControl>,
    recv_timeout: Duration,
    wrap: fn(T) -> Delivery,
    credits: Option<Arc<StreamCredits>>,
}

impl<T: Forwarded> Forwarder<T> {
    /// Wait for room at the worker; `false` once the link is going away
    fn reserve(&self) -> bool {
        let Some(credits) = &self.credits else {
            return true;
        };
        loop {
            if credits.acquire(self.recv_timeout) {
                return true;
            }
            if self.control.is_retired() || self.link.is_closed() {
                return false;
            }
        }
    }

    fn run(self) {
        while !self.control.is_retired() && !self.link.is_closed() {
            let envelope = match self.rx.recv_timeout(self.recv_timeout) {
                Ok(envelope) => envelope,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let stop = match envelope.stop_epoch() {
                Some(epoch) if epoch != self.control.epoch() => {
                    debug!(component = %self.name, queue = %self.queue, stale_epoch = epoch, "Dropping stale stop");
                    continue;
                }
                Some(_) => true,
                None => false,
            };
            if !stop && !self.reserve() {
                break;
            }

            match self.link.send(&ParentFrame::Deliver((self.wrap)(envelope))) {
                Ok(()) if stop => break,
                Ok(()) => {}
                Err(e) if e.is_disconnect() => {
                    debug!(component = %self.name, queue = %self.queue, "Worker link closed");
                    break;
                }
                Err(e) => {
                    error!(component = %self.name, queue = %self.queue, error = %e, "Failed to forward envelope");
                    if stop {
                        break;
                    }
                }
            }
        }
        debug!(component = %self.name, queue = %self.queue, "Forwarder stopped");
    }
}

/// Running process worker, as held by the registry
pub(crate) struct ProcessWorker {
    name: Arc<str>,
    control: Arc<WorkerControl>,
    child: Child,
    link: Arc<ParentLink>,
    credits: Arc<StreamCredits>,
    forwarders: Vec<(QueueClass, JoinHandle<()>)>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessWorker {
    pub fn control(&self) -> &Arc<WorkerControl> {
        &self.control
    }

    /// Child running, link open and every forwarder alive
    pub fn is_alive(&mut self) -> bool {
        !self.link.is_closed()
            && matches!(self.child.try_wait(), Ok(None))
            && self.forwarders.iter().all(|(_, h)| !h.is_finished())
    }

    pub fn stream_alive(&mut self) -> bool {
        self.is_alive()
            && self
                .forwarders
                .iter()
                .any(|(class, _)| *class == QueueClass::Stream)
    }

    /// Join forwarders, reap or escalate the child, then close the link
    ///
    /// Stop envelopes must already be queued. Returns how many workers
    /// (forwarders, the process, the reader) were abandoned.
    pub fn shutdown(mut self, manager: &ProcessManager, config: &BusConfig) -> usize {
        let mut abandoned = 0;
        self.credits.open();
        let deadline = Instant::now() + config.process_join_timeout();
        for (class, handle) in self.forwarders.drain(..) {
            if !join_until(handle, deadline) {
                warn!(component = %self.name, queue = %class, "Forwarder did not exit in time");
                abandoned += 1;
            }
        }

        if !manager.escalate(&self.name, &mut self.child, config) {
            abandoned += 1;
        }

        self.control.retire();
        self.link.close();
        if let Some(reader) = self.reader.take() {
            if !join_until(reader, Instant::now() + config.thread_join_timeout()) {
                warn!(component = %self.name, "Link reader did not exit in time");
                abandoned += 1;
            }
        }
        abandoned
    }

    /// Emergency path: no cooperative wait
    pub fn kill(mut self, manager: &ProcessManager, config: &BusConfig) {
        self.control.retire();
        self.link.close();
        manager.terminate(&self.name, &mut self.child, config);
    }
}

/// Start forwarders and the reader for a freshly connected worker
pub(crate) fn launch(
    core: &BusCore,
    slot: &ComponentSlot,
    connection: ChildConnection,
    control: Arc<WorkerControl>,
    stream_enabled: bool,
) -> Result<ProcessWorker> {
    let ChildConnection {
        mut child,
        stream,
        writer,
    } = connection;
    let name = Arc::clone(&slot.name);

    let link = Arc::new(ParentLink {
        writer: Mutex::new(writer),
        socket: stream,
        closed: AtomicBool::new(false),
    });

    let credits = Arc::new(StreamCredits::new(core.config.stream_capacity));
    let started = start_threads(core, slot, &link, &control, &credits, stream_enabled);
    match started {
        Ok((forwarders, reader)) => Ok(ProcessWorker {
            name,
            control,
            child,
            link,
            credits,
            forwarders,
            reader: Some(reader),
        }),
        Err(e) => {
            control.retire();
            link.close();
            core.processes.terminate(&name, &mut child, &core.config);
            Err(e)
        }
    }
}

type Threads = (Vec<(QueueClass, JoinHandle<()>)>, JoinHandle<()>);

fn start_threads(
    core: &BusCore,
    slot: &ComponentSlot,
    link: &Arc<ParentLink>,
    control: &Arc<WorkerControl>,
    credits: &Arc<StreamCredits>,
    stream_enabled: bool,
) -> Result<Threads> {
    let name = &slot.name;
    let spawn_err =
        |e: std::io::Error| BusError::spawn_with_source(name.as_ref(), "link threads", e);
    let receivers = slot.queues.receivers();
    let links = LinkParts {
        name: Arc::clone(name),
        link: Arc::clone(link),
        control: Arc::clone(control),
        recv_timeout: core.config.worker_recv_timeout(),
    };

    let mut forwarders = Vec::with_capacity(3);
    forwarders.push(links.forwarder(QueueClass::Ctrl, receivers.ctrl, Delivery::Ctrl, None).map_err(spawn_err)?);
    forwarders.push(links.forwarder(QueueClass::Poll, receivers.poll, Delivery::Poll, None).map_err(spawn_err)?);
    if stream_enabled {
        forwarders.push(
            links
                .forwarder(
                    QueueClass::Stream,
                    receivers.stream,
                    Delivery::Stream,
                    Some(Arc::clone(credits)),
                )
                .map_err(spawn_err)?,
        );
    }

    let reader_stream = link
        .socket
        .try_clone()
        .map_err(|e| BusError::spawn_with_source(name.as_ref(), "clone worker link", e))?;
    let reader = LinkReader {
        name: Arc::clone(name),
        frames: FrameReader::new(reader_stream, core.config.max_frame_size),
        link: Arc::clone(link),
        control: Arc::clone(control),
        core: core.self_ref.clone(),
        results: Arc::clone(&core.results),
        shared: core.shared_state(),
        credits: Arc::clone(credits),
    };
    let reader = spawn_named(format!("{}-link", name), move || reader.run()).map_err(spawn_err)?;

    Ok((forwarders, reader))
}

/// What every forwarder of one worker shares
struct LinkParts {
    name: Arc<str>,
    link: Arc<ParentLink>,
    control: Arc<WorkerControl>,
    recv_timeout: Duration,
}

impl LinkParts {
    fn forwarder<T: Forwarded>(
        &self,
        queue: QueueClass,
        rx: Receiver<T>,
        wrap: fn(T) -> Delivery,
        credits: Option<Arc<StreamCredits>>,
    ) -> std::io::Result<(QueueClass, JoinHandle<()>)> {
        let forwarder = Forwarder {
            name: Arc::clone(&self.name),
            queue,
            rx,
            link: Arc::clone(&self.link),
            control: Arc::clone(&self.control),
            recv_timeout: self.recv_timeout,
            wrap,
            credits,
        };
        let handle = spawn_named(format!("{}-fwd-{}", self.name, queue), move || forwarder.run())?;
        Ok((queue, handle))
    }
}

fn spawn_named(name: String, f: impl FnOnce() + Send + 'static) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name).spawn(f)
}

struct LinkReader {
    name: Arc<str>,
    frames: FrameReader<UnixStream>,
    link: Arc<ParentLink>,
    control: Arc<WorkerControl>,
    core: Weak<BusCore>,
    results: Arc<ResultTables>,
    shared: Arc<SharedState>,
    credits: Arc<StreamCredits>,
}

impl LinkReader {
    fn run(mut self) {
        loop {
            let frame = match self.frames.recv::<ChildFrame>() {
                Ok(frame) => frame,
                Err(e) if e.is_disconnect() => {
                    debug!(component = %self.name, "Worker link closed");
                    break;
                }
                Err(e) => {
                    if !self.link.is_closed() {
                        error!(component = %self.name, error = %e, "Worker link read failed");
                    }
                    break;
                }
            };

            match frame {
                ChildFrame::Result(result) => self.ingest(result),
                ChildFrame::Verb { call_id, request } => self.verb(call_id, request),
                ChildFrame::State { call_id, op } => {
                    let reply = self.shared.apply(op);
                    self.reply(ParentFrame::StateReply { call_id, reply });
                }
                ChildFrame::StreamCredit { consumed } => self.credits.grant(consumed),
                ChildFrame::Exiting => info!(component = %self.name, "Worker process exiting"),
                other => warn!(component = %self.name, frame = ?other, "Unexpected frame from worker"),
            }
        }
        self.link.closed.store(true, Ordering::SeqCst);
    }

    fn ingest(&self, result: ResultFrame) {
        // Late writes of a stopped generation are dropped
        if self.control.is_retired() {
            return;
        }
        match result {
            ResultFrame::Ctrl(envelope) => {
                self.results.ingest_ctrl(envelope);
            }
            ResultFrame::Poll(result) => {
                self.results.poll.set(result.id, result.result);
            }
        }
    }

    fn reply(&self, frame: ParentFrame) {
        if let Err(e) = self.link.send(&frame) {
            debug!(component = %self.name, error = %e, "Reply to worker not delivered");
        }
    }

    fn verb(&self, call_id: u64, request: VerbRequest) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        match request {
            VerbRequest::Order { target, method, args } => {
                let id = core.order(&target, &method, args);
                self.reply(ParentFrame::VerbReply { call_id, reply: VerbReply::RequestId(id) });
            }
            VerbRequest::Stream { target, func, args } => {
                let accepted = core.stream(&target, &func, args);
                self.reply(ParentFrame::VerbReply { call_id, reply: VerbReply::Accepted(accepted) });
            }
            VerbRequest::Broadcast { method, args, exclude } => {
                let sent = core.broadcast(&method, args, &exclude);
                self.reply(ParentFrame::VerbReply { call_id, reply: VerbReply::Broadcast(sent) });
            }
            // Blocking verbs must not stall result ingestion
            blocking => {
                let link = Arc::clone(&self.link);
                let spawned = spawn_named(format!("{}-verb", self.name), move || {
                    let value = match blocking {
                        VerbRequest::Answer { target, method, args, timeout_ms } => {
                            core.answer(&target, &method, args, timeout_ms.map(Duration::from_millis))
                        }
                        VerbRequest::Poll { target, method, args, timeout_ms } => {
                            core.poll(&target, &method, args, timeout_ms.map(Duration::from_millis))
                        }
                        _ => None,
                    };
                    let _ = link.send(&ParentFrame::VerbReply { call_id, reply: VerbReply::Value(value) });
                });
                if let Err(e) = spawned {
                    error!(component = %self.name, error = %e, "Failed to run worker verb");
                    self.reply(ParentFrame::VerbReply { call_id, reply: VerbReply::Value(None) });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_credits_gate_until_granted() {
        let credits = Arc::new(StreamCredits::new(2));
        assert!(credits.acquire(Duration::from_millis(1)));
        assert!(credits.acquire(Duration::from_millis(1)));
        assert!(!credits.acquire(Duration::from_millis(5)));

        let waiter = {
            let credits = Arc::clone(&credits);
            thread::spawn(move || credits.acquire(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        credits.grant(1);
        assert!(waiter.join().unwrap());
        assert!(!credits.acquire(Duration::from_millis(5)));

        credits.open();
        for _ in 0..100 {
            assert!(credits.acquire(Duration::ZERO));
        }
    }
}
