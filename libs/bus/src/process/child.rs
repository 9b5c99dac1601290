//! Worker process runtime
//!
//! The worker program calls [`run_from_env`] first thing in `main`. When
//! the process was spawned by a bus it connects back, rebuilds its instance
//! from the catalog, and runs the ordinary worker loops until the parent
//! stops it or goes away:
//!
//! ```rust,ignore
//! fn main() -> anyhow::Result<()> {
//!     if let Some(outcome) = child::run_from_env(&catalog()) {
//!         return Ok(outcome?);
//!     }
//!     // regular program
//! }
//! ```

use super::protocol::{
    Bootstrap, ChildFrame, Delivery, ParentFrame, ResultFrame, VerbReply, VerbRequest,
    CHILD_SOCKET_ENV,
};
use crate::error::{BusError, Result};
use crate::handle::{AnswerCallback, BusHandle};
use crate::hosted::Catalog;
use crate::queues::{QueueTriplet, StreamPush};
use crate::shared_state::{SharedStateError, StateOp};
use crate::worker::{spawn_loops, LoopContext, ResultSink, WorkerControl};
use bus_config::BusConfig;
use codec::{CodecError, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_SIZE};
use crossbeam_channel::{bounded, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use types::{Args, PollResult, RequestId, ResultEnvelope, StreamEnvelope, Value};

/// Socket path handed down by the parent, if this is a worker process
pub fn socket_from_env() -> Option<PathBuf> {
    std::env::var_os(CHILD_SOCKET_ENV).map(PathBuf::from)
}

/// Serve as a worker if spawned by a bus; `None` otherwise
pub fn run_from_env(catalog: &Catalog) -> Option<Result<()>> {
    socket_from_env().map(|path| run(&path, catalog))
}

/// Connect to the parent at `path` and serve until stopped
pub fn run(path: &Path, catalog: &Catalog) -> Result<()> {
    let stream = UnixStream::connect(path)
        .map_err(|e| BusError::spawn_with_source("worker", format!("connect {:?}", path), e))?;
    serve(stream, catalog)
}

/// Serve one component over an already connected stream
pub fn serve(stream: UnixStream, catalog: &Catalog) -> Result<()> {
    let clone = |stream: &UnixStream| {
        stream
            .try_clone()
            .map_err(|e| BusError::spawn_with_source("worker", "clone parent link", e))
    };

    let bootstrap = match FrameReader::new(clone(&stream)?, DEFAULT_MAX_FRAME_SIZE).recv::<ParentFrame>() {
        Ok(ParentFrame::Bootstrap(bootstrap)) => bootstrap,
        Ok(other) => {
            return Err(BusError::spawn(
                "worker",
                format!("expected bootstrap, got {:?}", other),
            ))
        }
        Err(e) => return Err(BusError::transport("await bootstrap", e)),
    };
    let Bootstrap {
        name,
        class,
        args,
        stream_enabled,
        epoch,
        config,
    } = bootstrap;

    let link = Arc::new(ChildLink {
        name: name.clone(),
        writer: Mutex::new(FrameWriter::new(clone(&stream)?, config.max_frame_size)),
        socket: clone(&stream)?,
        pending: DashMap::new(),
        next_call: AtomicU64::new(1),
        closed: AtomicBool::new(false),
        config: config.clone(),
    });

    let built = catalog
        .construct(&name, &class, BusHandle::remote(Arc::clone(&link)), &args)
        .and_then(|mut instance| {
            instance
                .initialize()
                .map(|()| instance)
                .map_err(|e| BusError::construct(&name, e))
        });
    let instance = match built {
        Ok(instance) => instance,
        Err(e) => {
            error!(component = %name, class = %class, error = %e, "Worker construction failed");
            let _ = link.send(&ChildFrame::Failed {
                message: e.to_string(),
            });
            return Err(e);
        }
    };
    link.send(&ChildFrame::Ready)?;
    info!(component = %name, class = %class, epoch, pid = std::process::id(), "Worker process serving");

    let queues = Arc::new(QueueTriplet::new(config.stream_capacity));
    let control = WorkerControl::new(epoch);
    let sink: Arc<dyn ResultSink> = Arc::new(RemoteSink {
        link: Arc::clone(&link),
        consumed: AtomicU32::new(0),
        credit_batch: credit_batch(config.stream_capacity),
    });
    let ctx = LoopContext::new(
        Arc::from(name.as_str()),
        Arc::new(Mutex::new(instance)),
        Arc::clone(&control),
        sink,
        &config,
    );
    let workers = spawn_loops(ctx, queues.receivers(), stream_enabled)
        .map_err(|e| BusError::spawn_with_source(name.as_str(), "worker threads", e))?;

    let reader = ParentReader {
        frames: FrameReader::new(clone(&stream)?, config.max_frame_size),
        queues: Arc::clone(&queues),
        link: Arc::clone(&link),
        epoch,
        stop_wait: config.poll_put_timeout(),
    };
    let reader = thread::Builder::new()
        .name(format!("{}-link", name))
        .spawn(move || reader.run())
        .map_err(|e| BusError::spawn_with_source(name.as_str(), "link reader", e))?;

    workers.join_all();
    info!(component = %name, epoch, "Worker loops finished");
    let _ = link.send(&ChildFrame::Exiting);
    link.close();
    if reader.join().is_err() {
        error!(component = %name, "Link reader panicked");
    }
    Ok(())
}

/// Reads parent frames and feeds the local queues
struct ParentReader {
    frames: FrameReader<UnixStream>,
    queues: Arc<QueueTriplet>,
    link: Arc<ChildLink>,
    epoch: u64,
    stop_wait: Duration,
}

impl ParentReader {
    fn run(mut self) {
        loop {
            let frame = match self.frames.recv::<ParentFrame>() {
                Ok(frame) => frame,
                Err(e) => {
                    if !e.is_disconnect() && !self.link.is_closed() {
                        error!(component = %self.link.name, error = %e, "Parent link read failed");
                    }
                    break;
                }
            };
            match frame {
                ParentFrame::Deliver(Delivery::Ctrl(envelope)) => {
                    self.queues.push_ctrl(envelope);
                }
                ParentFrame::Deliver(Delivery::Poll(envelope)) => {
                    self.queues.push_poll(envelope, self.stop_wait);
                }
                ParentFrame::Deliver(Delivery::Stream(envelope @ StreamEnvelope::Stop { .. })) => {
                    self.queues.push_stream_wait(envelope, self.stop_wait);
                }
                // The parent sends no more events than it holds credit for
                ParentFrame::Deliver(Delivery::Stream(envelope)) => {
                    if self.queues.push_stream(envelope) == StreamPush::Full {
                        warn!(component = %self.link.name, "Worker stream queue full, event dropped");
                    }
                }
                ParentFrame::VerbReply { call_id, reply } => {
                    self.link.complete(call_id, LinkReply::Verb(reply));
                }
                ParentFrame::StateReply { call_id, reply } => {
                    self.link.complete(call_id, LinkReply::State(reply));
                }
                ParentFrame::Bootstrap(_) => {
                    warn!(component = %self.link.name, "Ignoring repeated bootstrap");
                }
            }
        }

        // Parent gone or stop finished: release waiters and let the loops exit
        self.link.closed.store(true, Ordering::SeqCst);
        self.link.pending.clear();
        self.queues.send_stop(self.epoch, self.stop_wait);
        debug!(component = %self.link.name, "Parent link reader stopped");
    }
}

/// Stream events handled before credit goes back to the parent
///
/// Never above the queue capacity, so the parent cannot run out of credit
/// while consumed events sit unreported.
fn credit_batch(stream_capacity: usize) -> u32 {
    (stream_capacity / 4).clamp(1, 64) as u32
}

/// Results of the worker loops go back to the parent
struct RemoteSink {
    link: Arc<ChildLink>,
    consumed: AtomicU32,
    credit_batch: u32,
}

impl ResultSink for RemoteSink {
    fn ctrl_result(&self, envelope: ResultEnvelope) -> Result<()> {
        self.link.send(&ChildFrame::Result(ResultFrame::Ctrl(envelope)))
    }

    fn poll_result(&self, result: PollResult) -> Result<()> {
        self.link.send(&ChildFrame::Result(ResultFrame::Poll(result)))
    }

    fn stream_consumed(&self) -> Result<()> {
        let consumed = self.consumed.fetch_add(1, Ordering::SeqCst) + 1;
        if consumed < self.credit_batch {
            return Ok(());
        }
        self.consumed.fetch_sub(consumed, Ordering::SeqCst);
        self.link.send(&ChildFrame::StreamCredit { consumed })
    }
}

enum LinkReply {
    Verb(VerbReply),
    State(std::result::Result<Value, SharedStateError>),
}

/// Worker end of the socket; carries verbs and shared-state calls upstream
pub struct ChildLink {
    name: String,
    config: BusConfig,
    writer: Mutex<FrameWriter<UnixStream>>,
    socket: UnixStream,
    pending: DashMap<u64, Sender<LinkReply>>,
    next_call: AtomicU64,
    closed: AtomicBool,
}

impl ChildLink {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &ChildFrame) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::transport("worker link", CodecError::Closed));
        }
        self.writer.lock().send(frame).map_err(|e| {
            if e.is_disconnect() {
                self.closed.store(true, Ordering::SeqCst);
            }
            BusError::transport("worker link", e)
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    fn complete(&self, call_id: u64, reply: LinkReply) {
        if let Some((_, waiter)) = self.pending.remove(&call_id) {
            let _ = waiter.send(reply);
        }
    }

    /// Send a request and wait up to `wait` for its reply
    fn call(&self, frame: impl FnOnce(u64) -> ChildFrame, wait: Duration) -> Option<LinkReply> {
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.pending.insert(call_id, tx);
        if let Err(e) = self.send(&frame(call_id)) {
            self.pending.remove(&call_id);
            debug!(component = %self.name, error = %e, "Worker link request not sent");
            return None;
        }
        match rx.recv_timeout(wait) {
            Ok(reply) => Some(reply),
            Err(_) => {
                self.pending.remove(&call_id);
                warn!(component = %self.name, call_id, "No reply from parent");
                None
            }
        }
    }

    fn verb(&self, request: VerbRequest, wait: Duration) -> Option<VerbReply> {
        match self.call(|call_id| ChildFrame::Verb { call_id, request }, wait)? {
            LinkReply::Verb(reply) => Some(reply),
            LinkReply::State(_) => None,
        }
    }

    fn margin(&self) -> Duration {
        self.config.lock_timeout()
    }

    pub(crate) fn order(&self, target: &str, method: &str, args: Args) -> Option<RequestId> {
        let request = VerbRequest::Order {
            target: target.to_string(),
            method: method.to_string(),
            args,
        };
        match self.verb(request, self.margin())? {
            VerbReply::RequestId(id) => id,
            _ => None,
        }
    }

    pub(crate) fn answer(
        &self,
        target: &str,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        let wait = timeout.unwrap_or(self.config.answer_timeout()) + self.margin();
        let request = VerbRequest::Answer {
            target: target.to_string(),
            method: method.to_string(),
            args,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        };
        match self.verb(request, wait)? {
            VerbReply::Value(value) => value,
            _ => None,
        }
    }

    pub(crate) fn answer_async(
        self: Arc<Self>,
        target: &str,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
        callback: AnswerCallback,
    ) -> bool {
        if self.is_closed() {
            return false;
        }
        let (target, method) = (target.to_string(), method.to_string());
        let name = format!("{}-answer", self.name);
        thread::Builder::new()
            .name(name)
            .spawn(move || callback(self.answer(&target, &method, args, timeout)))
            .is_ok()
    }

    pub(crate) fn poll(
        &self,
        target: &str,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        let wait = timeout.unwrap_or(self.config.poll_timeout()) + self.margin();
        let request = VerbRequest::Poll {
            target: target.to_string(),
            method: method.to_string(),
            args,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        };
        match self.verb(request, wait)? {
            VerbReply::Value(value) => value,
            _ => None,
        }
    }

    pub(crate) fn stream(&self, target: &str, func: &str, args: Args) -> bool {
        let request = VerbRequest::Stream {
            target: target.to_string(),
            func: func.to_string(),
            args,
        };
        matches!(self.verb(request, self.margin()), Some(VerbReply::Accepted(true)))
    }

    pub(crate) fn broadcast(
        &self,
        method: &str,
        args: Args,
        exclude: Vec<String>,
    ) -> BTreeMap<String, RequestId> {
        let request = VerbRequest::Broadcast {
            method: method.to_string(),
            args,
            exclude,
        };
        match self.verb(request, self.margin()) {
            Some(VerbReply::Broadcast(sent)) => sent,
            _ => BTreeMap::new(),
        }
    }

    pub(crate) fn state(&self, op: StateOp) -> std::result::Result<Value, SharedStateError> {
        let wait = self.config.shared_state_lock_timeout() + self.margin();
        match self.call(|call_id| ChildFrame::State { call_id, op }, wait) {
            Some(LinkReply::State(reply)) => reply,
            _ => Err(SharedStateError::Unavailable("parent link".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::{CallError, Component, MethodTable};
    use std::time::Instant;

    struct Echo {
        bus: BusHandle,
        prefix: String,
    }

    impl Component for Echo {
        const CLASS: &'static str = "Echo";

        fn construct(bus: BusHandle, args: &Args) -> std::result::Result<Self, CallError> {
            Ok(Self {
                bus,
                prefix: args.get_or(0, String::new())?,
            })
        }

        fn methods(table: &mut MethodTable<Self>) {
            table
                .add("echo", |e, args| {
                    Ok(Value::from(format!("{}{}", e.prefix, args.get::<String>(0)?)))
                })
                .add("bump", |e, _| {
                    e.bus.shared().increment("bumps", 1, 0).map_err(CallError::failed)
                });
        }
    }

    fn bootstrap(epoch: u64) -> Bootstrap {
        Bootstrap {
            name: "echo".into(),
            class: "Echo".into(),
            args: Args::new().with(">"),
            stream_enabled: false,
            epoch,
            config: BusConfig {
                worker_recv_timeout_ms: 5,
                ..Default::default()
            },
        }
    }

    struct Parent {
        writer: FrameWriter<UnixStream>,
        reader: FrameReader<UnixStream>,
    }

    impl Parent {
        fn connect(catalog: Catalog) -> (Self, thread::JoinHandle<Result<()>>) {
            let (parent, child) = UnixStream::pair().unwrap();
            let worker = thread::spawn(move || serve(child, &catalog));
            let parent = Self {
                writer: FrameWriter::new(parent.try_clone().unwrap(), DEFAULT_MAX_FRAME_SIZE),
                reader: FrameReader::new(parent, DEFAULT_MAX_FRAME_SIZE),
            };
            (parent, worker)
        }

        fn send(&mut self, frame: ParentFrame) {
            self.writer.send(&frame).unwrap();
        }

        fn recv(&mut self) -> ChildFrame {
            self.reader.recv().unwrap()
        }
    }

    #[test]
    fn test_serve_runs_calls_and_stops() {
        let (mut parent, worker) = Parent::connect(Catalog::new().with::<Echo>());
        parent.send(ParentFrame::Bootstrap(bootstrap(3)));
        assert_eq!(parent.recv(), ChildFrame::Ready);

        let id = RequestId::new();
        parent.send(ParentFrame::Deliver(Delivery::Ctrl(types::ControlEnvelope::call(
            id,
            "echo",
            Args::new().with("hi"),
        ))));
        assert_eq!(
            parent.recv(),
            ChildFrame::Result(ResultFrame::Ctrl(ResultEnvelope::Ok {
                id,
                value: Value::from(">hi")
            }))
        );

        // A stale stop must not end the worker
        parent.send(ParentFrame::Deliver(Delivery::Ctrl(types::ControlEnvelope::Stop { epoch: 2 })));
        let poll_id = RequestId::new();
        parent.send(ParentFrame::Deliver(Delivery::Poll(types::ControlEnvelope::call(
            poll_id,
            "echo",
            Args::new().with("p"),
        ))));
        assert_eq!(
            parent.recv(),
            ChildFrame::Result(ResultFrame::Poll(PollResult {
                id: poll_id,
                result: Some(Value::from(">p"))
            }))
        );

        for delivery in [
            Delivery::Ctrl(types::ControlEnvelope::Stop { epoch: 3 }),
            Delivery::Poll(types::ControlEnvelope::Stop { epoch: 3 }),
        ] {
            parent.send(ParentFrame::Deliver(delivery));
        }
        assert_eq!(parent.recv(), ChildFrame::Exiting);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_shared_state_is_proxied_to_parent() {
        let (mut parent, worker) = Parent::connect(Catalog::new().with::<Echo>());
        parent.send(ParentFrame::Bootstrap(bootstrap(1)));
        assert_eq!(parent.recv(), ChildFrame::Ready);

        let id = RequestId::new();
        parent.send(ParentFrame::Deliver(Delivery::Ctrl(types::ControlEnvelope::call(
            id,
            "bump",
            Args::new(),
        ))));
        let (call_id, op) = match parent.recv() {
            ChildFrame::State { call_id, op } => (call_id, op),
            other => panic!("expected state request, got {:?}", other),
        };
        assert!(matches!(op, StateOp::Increment { ref key, .. } if key == "bumps"));
        parent.send(ParentFrame::StateReply {
            call_id,
            reply: Ok(Value::Int(41)),
        });
        assert_eq!(
            parent.recv(),
            ChildFrame::Result(ResultFrame::Ctrl(ResultEnvelope::Ok {
                id,
                value: Value::Int(41)
            }))
        );

        // Parent vanishing ends the worker
        drop(parent);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.is_finished() {
            assert!(Instant::now() < deadline, "worker did not exit");
            thread::sleep(Duration::from_millis(5));
        }
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_consumed_stream_events_return_credit() {
        let (mut parent, worker) = Parent::connect(Catalog::new().with::<Echo>());
        let mut boot = bootstrap(5);
        boot.stream_enabled = true;
        boot.config.stream_capacity = 8;
        parent.send(ParentFrame::Bootstrap(boot));
        assert_eq!(parent.recv(), ChildFrame::Ready);

        for _ in 0..5 {
            parent.send(ParentFrame::Deliver(Delivery::Stream(StreamEnvelope::event(
                "echo",
                Args::new().with("s"),
            ))));
        }
        // Batches of capacity / 4; the fifth event stays unreported
        assert_eq!(parent.recv(), ChildFrame::StreamCredit { consumed: 2 });
        assert_eq!(parent.recv(), ChildFrame::StreamCredit { consumed: 2 });
        assert_eq!(credit_batch(1), 1);
        assert_eq!(credit_batch(1000), 64);

        for delivery in [
            Delivery::Ctrl(types::ControlEnvelope::Stop { epoch: 5 }),
            Delivery::Poll(types::ControlEnvelope::Stop { epoch: 5 }),
            Delivery::Stream(StreamEnvelope::Stop { epoch: 5 }),
        ] {
            parent.send(ParentFrame::Deliver(delivery));
        }
        assert_eq!(parent.recv(), ChildFrame::Exiting);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_unknown_class_reports_failed() {
        let (mut parent, worker) = Parent::connect(Catalog::new());
        parent.send(ParentFrame::Bootstrap(bootstrap(1)));
        assert!(matches!(parent.recv(), ChildFrame::Failed { message } if message.contains("Echo")));
        assert!(matches!(
            worker.join().unwrap(),
            Err(BusError::UnknownClass { .. })
        ));
    }
}
