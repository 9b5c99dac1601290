//! Bus-wide counters
//!
//! Relaxed atomics; snapshots are for logs and the demo's report, not for
//! synchronization.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BusMetrics {
    pub requests_sent: AtomicU64,
    pub answers_completed: AtomicU64,
    pub answers_failed: AtomicU64,
    pub answers_timed_out: AtomicU64,
    pub polls_completed: AtomicU64,
    pub polls_missed: AtomicU64,
    pub stream_sent: AtomicU64,
    pub stream_dropped: AtomicU64,
    pub results_swept: AtomicU64,
    pub worker_starts: AtomicU64,
    pub worker_stops: AtomicU64,
    pub workers_abandoned: AtomicU64,
}

/// Point-in-time copy of [`BusMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub requests_sent: u64,
    pub answers_completed: u64,
    pub answers_failed: u64,
    pub answers_timed_out: u64,
    pub polls_completed: u64,
    pub polls_missed: u64,
    pub stream_sent: u64,
    pub stream_dropped: u64,
    pub results_swept: u64,
    pub worker_starts: u64,
    pub worker_stops: u64,
    pub workers_abandoned: u64,
}

impl BusMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BusStats {
            requests_sent: load(&self.requests_sent),
            answers_completed: load(&self.answers_completed),
            answers_failed: load(&self.answers_failed),
            answers_timed_out: load(&self.answers_timed_out),
            polls_completed: load(&self.polls_completed),
            polls_missed: load(&self.polls_missed),
            stream_sent: load(&self.stream_sent),
            stream_dropped: load(&self.stream_dropped),
            results_swept: load(&self.results_swept),
            worker_starts: load(&self.worker_starts),
            worker_stops: load(&self.worker_stops),
            workers_abandoned: load(&self.workers_abandoned),
        }
    }
}
