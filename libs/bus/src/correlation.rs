//! Correlation & Timeout
//!
//! Sender side of every verb:
//!
//! ```text
//! answer: id ─▶ in_flight ─▶ ctrl[target] ─▶ wait on ctrl table ─▶ pop ─▶ value
//!                                              │ every poll_interval
//!                                              ├─ shutting down ─▶ None
//!                                              └─ deadline ─────▶ pop late entry, None
//! ```
//!
//! Ids stay in `in_flight` while someone waits on them. Every
//! `sweep_every` answer/poll calls a batch sweep reclaims up to
//! `sweep_batch` result entries per table whose id nobody awaits: results
//! of timed-out calls and of orders.

use crate::bus::BusCore;
use crate::handle::AnswerCallback;
use crate::metrics::BusMetrics;
use crate::queues::StreamPush;
use crate::registry::ComponentSlot;
use crate::results::ResultTable;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use types::{Args, ControlEnvelope, RequestId, ResultEnvelope, StreamEnvelope, Value};

/// Marks `id` as awaited for the guard's lifetime
struct Awaiting<'a> {
    in_flight: &'a DashMap<RequestId, Instant>,
    id: RequestId,
}

impl<'a> Awaiting<'a> {
    fn new(in_flight: &'a DashMap<RequestId, Instant>, id: RequestId) -> Self {
        in_flight.insert(id, Instant::now());
        Self { in_flight, id }
    }
}

impl Drop for Awaiting<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

enum Wait<T> {
    Ready(T),
    TimedOut,
    ShuttingDown,
}

impl BusCore {
    /// Resolve a verb target, refusing during shutdown
    fn target(&self, target: &str, verb: &'static str) -> Option<Arc<ComponentSlot>> {
        if self.flags.is_shutting_down() {
            debug!(target, verb, "Bus shutting down, verb refused");
            return None;
        }
        let slot = self.registry.get(target);
        if slot.is_none() {
            warn!(target, verb, "Target not registered");
        }
        slot
    }

    pub(crate) fn order(&self, target: &str, method: &str, args: Args) -> Option<RequestId> {
        let slot = self.target(target, "order")?;
        let id = RequestId::new();
        if !slot.queues.push_ctrl(ControlEnvelope::order(id, method, args)) {
            warn!(component = target, method, "Control queue closed");
            return None;
        }
        BusMetrics::incr(&self.metrics.requests_sent);
        debug!(component = target, method, request_id = %id, "Order sent");
        Some(id)
    }

    pub(crate) fn answer(
        &self,
        target: &str,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        let timeout = timeout.unwrap_or_else(|| self.config.answer_timeout());
        let slot = self.target(target, "answer")?;
        let id = RequestId::new();
        let _awaiting = Awaiting::new(&self.in_flight, id);

        if !slot.queues.push_ctrl(ControlEnvelope::call(id, method, args)) {
            warn!(component = target, method, "Control queue closed");
            return None;
        }
        BusMetrics::incr(&self.metrics.requests_sent);
        self.count_outgoing();

        match self.await_result(&self.results.ctrl, &id, timeout) {
            Wait::Ready(ResultEnvelope::Ok { value, .. }) => {
                BusMetrics::incr(&self.metrics.answers_completed);
                Some(value)
            }
            Wait::Ready(ResultEnvelope::Error { message, .. }) => {
                warn!(component = target, method, request_id = %id, error = %message, "Answer failed");
                BusMetrics::incr(&self.metrics.answers_failed);
                None
            }
            Wait::Ready(ResultEnvelope::Chunk(_)) => None,
            Wait::TimedOut => {
                warn!(
                    component = target,
                    method,
                    request_id = %id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Answer timed out"
                );
                BusMetrics::incr(&self.metrics.answers_timed_out);
                None
            }
            Wait::ShuttingDown => None,
        }
    }

    pub(crate) fn answer_async(
        &self,
        target: &str,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
        callback: AnswerCallback,
    ) -> bool {
        let timeout = timeout.unwrap_or_else(|| self.config.answer_timeout());
        let Some(slot) = self.target(target, "answer_async") else {
            return false;
        };
        let checker = self.checker.lock();
        let Some(checker) = checker.as_ref() else {
            return false;
        };

        let id = RequestId::new();
        self.in_flight.insert(id, Instant::now());
        checker.submit(id, Instant::now() + timeout, callback);
        if !slot.queues.push_ctrl(ControlEnvelope::call(id, method, args)) {
            checker.cancel(&id);
            self.in_flight.remove(&id);
            warn!(component = target, method, "Control queue closed");
            return false;
        }
        BusMetrics::incr(&self.metrics.requests_sent);
        debug!(component = target, method, request_id = %id, "Async answer sent");
        true
    }

    pub(crate) fn poll(
        &self,
        target: &str,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        let timeout = timeout.unwrap_or_else(|| self.config.poll_timeout());
        let slot = self.target(target, "poll")?;
        let id = RequestId::new();
        let _awaiting = Awaiting::new(&self.in_flight, id);

        let envelope = ControlEnvelope::call(id, method, args);
        if !slot.queues.push_poll(envelope, self.config.poll_put_timeout()) {
            debug!(component = target, method, "Poll put failed");
            BusMetrics::incr(&self.metrics.polls_missed);
            return None;
        }
        BusMetrics::incr(&self.metrics.requests_sent);
        self.count_outgoing();

        match self.await_result(&self.results.poll, &id, timeout) {
            Wait::Ready(Some(value)) => {
                BusMetrics::incr(&self.metrics.polls_completed);
                Some(value)
            }
            Wait::Ready(None) | Wait::TimedOut | Wait::ShuttingDown => {
                BusMetrics::incr(&self.metrics.polls_missed);
                None
            }
        }
    }

    pub(crate) fn stream(&self, target: &str, func: &str, args: Args) -> bool {
        let Some(slot) = self.target(target, "stream") else {
            return false;
        };
        if !slot.stream_enabled() {
            debug!(component = target, func, "Stream not enabled for component");
            return false;
        }
        match slot.queues.push_stream(StreamEnvelope::event(func, args)) {
            StreamPush::Accepted => {
                if slot.mark_stream_overflow(false) {
                    info!(component = target, "Stream queue accepting again");
                }
                BusMetrics::incr(&self.metrics.stream_sent);
                true
            }
            StreamPush::Full => {
                if !slot.mark_stream_overflow(true) {
                    warn!(component = target, func, "Stream queue full, dropping events");
                }
                BusMetrics::incr(&self.metrics.stream_dropped);
                false
            }
            StreamPush::Closed => false,
        }
    }

    pub(crate) fn broadcast(
        &self,
        method: &str,
        args: Args,
        exclude: &[String],
    ) -> BTreeMap<String, RequestId> {
        if self.flags.is_shutting_down() {
            return BTreeMap::new();
        }
        let mut sent = BTreeMap::new();
        for name in self.registry.names() {
            if exclude.contains(&name) {
                continue;
            }
            if let Some(id) = self.order(&name, method, args.clone()) {
                sent.insert(name, id);
            }
        }
        debug!(method, recipients = sent.len(), "Broadcast sent");
        sent
    }

    /// Poll `table` for `id` every poll interval until the deadline
    fn await_result<T>(&self, table: &ResultTable<T>, id: &RequestId, timeout: Duration) -> Wait<T> {
        let deadline = Instant::now() + timeout;
        let interval = self.config.poll_interval();
        loop {
            if let Some(result) = table.pop(id) {
                return Wait::Ready(result);
            }
            if self.flags.is_shutting_down() {
                return Wait::ShuttingDown;
            }
            let now = Instant::now();
            if now >= deadline {
                // Late write racing the deadline
                return table.pop(id).map(Wait::Ready).unwrap_or(Wait::TimedOut);
            }
            thread::sleep(interval.min(deadline - now));
        }
    }

    /// Count one answer/poll; sweep orphaned results every `sweep_every`
    fn count_outgoing(&self) {
        let count = self.outgoing.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.config.sweep_every != 0 {
            return;
        }
        let in_flight = &self.in_flight;
        let batch = self.config.sweep_batch;
        let ctrl = self.results.ctrl.sweep(batch, |id| !in_flight.contains_key(id));
        let poll = self.results.poll.sweep(batch, |id| !in_flight.contains_key(id));
        if ctrl + poll > 0 {
            BusMetrics::add(&self.metrics.results_swept, (ctrl + poll) as u64);
            info!(ctrl, poll, outgoing = count, "Swept orphaned results");
        }
    }
}
