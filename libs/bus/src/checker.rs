//! Response Checker
//!
//! Completes [`crate::BusHandle::answer_async`] calls. One thread owns the
//! map of pending callbacks and, every tick, pops whatever results have
//! landed in the control table or expires whatever passed its deadline.
//! Callbacks run on this thread, outside the pending lock.
//!
//! Each tick also drops chunk buffers that nobody waits for any
//! more and buffers older than twice the answer timeout.

use crate::handle::AnswerCallback;
use crate::metrics::BusMetrics;
use crate::results::ResultTables;
use crate::worker::panic_message;
use bus_config::BusConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use types::{RequestId, ResultEnvelope, Value};

struct Pending {
    deadline: Instant,
    callback: AnswerCallback,
}

type PendingMap = Arc<Mutex<HashMap<RequestId, Pending>>>;

pub(crate) struct ResponseChecker {
    pending: PendingMap,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ResponseChecker {
    pub fn start(
        results: Arc<ResultTables>,
        in_flight: Arc<DashMap<RequestId, Instant>>,
        metrics: Arc<BusMetrics>,
        config: &BusConfig,
    ) -> io::Result<Self> {
        let pending: PendingMap = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));
        let worker = CheckerLoop {
            pending: Arc::clone(&pending),
            stop: Arc::clone(&stop),
            results,
            in_flight,
            metrics,
            tick: config.poll_interval().max(Duration::from_millis(1)),
            partial_max_age: config.result_max_age(),
        };
        let handle = thread::Builder::new()
            .name("bus-response-checker".to_string())
            .spawn(move || worker.run())?;
        Ok(Self {
            pending,
            stop,
            handle: Some(handle),
        })
    }

    pub fn submit(&self, id: RequestId, deadline: Instant, callback: AnswerCallback) {
        self.pending.lock().insert(id, Pending { deadline, callback });
    }

    /// Withdraw a call that was never sent; its callback is dropped unrun
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stop the thread and complete everything still pending with `None`
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Response checker panicked");
            }
        }
        let leftover: Vec<(RequestId, Pending)> = self.pending.lock().drain().collect();
        if !leftover.is_empty() {
            debug!(count = leftover.len(), "Completing pending callbacks at shutdown");
        }
        for (id, pending) in leftover {
            run_callback(id, pending.callback, None);
        }
    }
}

impl Drop for ResponseChecker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

struct CheckerLoop {
    pending: PendingMap,
    stop: Arc<AtomicBool>,
    results: Arc<ResultTables>,
    in_flight: Arc<DashMap<RequestId, Instant>>,
    metrics: Arc<BusMetrics>,
    tick: Duration,
    partial_max_age: Duration,
}

impl CheckerLoop {
    fn run(self) {
        debug!(tick_ms = self.tick.as_millis() as u64, "Response checker started");
        while !self.stop.load(Ordering::SeqCst) {
            thread::sleep(self.tick);
            self.check();
            self.housekeeping();
        }
        debug!("Response checker stopped");
    }

    fn check(&self) {
        let waiting: Vec<(RequestId, Instant)> = self
            .pending
            .lock()
            .iter()
            .map(|(id, p)| (*id, p.deadline))
            .collect();
        if waiting.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut finished = Vec::new();
        for (id, deadline) in waiting {
            if let Some(envelope) = self.results.ctrl.pop(&id) {
                finished.push((id, self.outcome(envelope)));
            } else if now >= deadline {
                warn!(request_id = %id, "Async answer timed out");
                BusMetrics::incr(&self.metrics.answers_timed_out);
                finished.push((id, None));
            }
        }

        for (id, outcome) in finished {
            let Some(pending) = self.pending.lock().remove(&id) else {
                continue;
            };
            self.in_flight.remove(&id);
            run_callback(id, pending.callback, outcome);
        }
    }

    fn outcome(&self, envelope: ResultEnvelope) -> Option<Value> {
        match envelope {
            ResultEnvelope::Ok { value, .. } => {
                BusMetrics::incr(&self.metrics.answers_completed);
                Some(value)
            }
            ResultEnvelope::Error { id, message } => {
                warn!(request_id = %id, error = %message, "Async answer failed");
                BusMetrics::incr(&self.metrics.answers_failed);
                None
            }
            ResultEnvelope::Chunk(chunk) => {
                error!(request_id = %chunk.id, "Unassembled chunk in result table");
                None
            }
        }
    }

    /// Drop chunk buffers whose request nobody awaits any more
    fn housekeeping(&self) {
        if self.results.sizes().partial == 0 {
            return;
        }
        let in_flight = &self.in_flight;
        let abandoned = self.results.discard_partials(|id| in_flight.contains_key(id));
        let stale = self.results.discard_partials_older_than(self.partial_max_age);
        if abandoned + stale > 0 {
            debug!(abandoned, stale, "Discarded partial chunk sets");
        }
    }
}

fn run_callback(id: RequestId, callback: AnswerCallback, outcome: Option<Value>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))) {
        error!(request_id = %id, panic = %panic_message(payload.as_ref()), "Answer callback panicked");
    }
}
