//! Result Tables
//!
//! Two maps keyed by request id: control results (complete
//! [`ResultEnvelope`]s) and poll results (bare values). Every operation
//! takes the table lock with a bounded wait; a lock that cannot be acquired
//! in time reads as "no result", which callers treat as still pending.
//!
//! Chunked control results are reassembled on ingestion, so readers only
//! ever see whole envelopes.
//!
//! # Lock Ordering
//!
//! `assembler` before `ctrl` entries. Neither is held while calling out.

use codec::{ChunkAssembler, CompressionEngine};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use types::{RequestId, ResultEnvelope, Value};

/// Map from request id to result under a bounded-wait lock
pub(crate) struct ResultTable<T> {
    name: &'static str,
    entries: Mutex<HashMap<RequestId, T>>,
    lock_timeout: Duration,
}

impl<T> ResultTable<T> {
    pub fn new(name: &'static str, lock_timeout: Duration) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// Store a result; `false` if the lock could not be taken
    pub fn set(&self, id: RequestId, value: T) -> bool {
        match self.entries.try_lock_for(self.lock_timeout) {
            Some(mut entries) => {
                entries.insert(id, value);
                true
            }
            None => {
                warn!(table = self.name, request_id = %id, "Result table lock timeout on set");
                false
            }
        }
    }

    pub fn pop(&self, id: &RequestId) -> Option<T> {
        match self.entries.try_lock_for(self.lock_timeout) {
            Some(mut entries) => entries.remove(id),
            None => {
                debug!(table = self.name, request_id = %id, "Result table lock timeout on pop");
                None
            }
        }
    }

    pub fn clear(&self) -> usize {
        self.entries
            .try_lock_for(self.lock_timeout)
            .map(|mut entries| {
                let n = entries.len();
                entries.clear();
                n
            })
            .unwrap_or(0)
    }

    pub fn len(&self) -> Option<usize> {
        self.entries
            .try_lock_for(self.lock_timeout)
            .map(|entries| entries.len())
    }

    /// Pop up to `batch` entries for which `reclaim` holds
    pub fn sweep(&self, batch: usize, reclaim: impl Fn(&RequestId) -> bool) -> usize {
        let Some(mut entries) = self.entries.try_lock_for(self.lock_timeout) else {
            return 0;
        };
        let victims: Vec<RequestId> = entries
            .keys()
            .filter(|id| reclaim(id))
            .take(batch)
            .copied()
            .collect();
        for id in &victims {
            entries.remove(id);
        }
        victims.len()
    }
}

/// Entry counts, for introspection and leak checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultTableSizes {
    pub ctrl: usize,
    pub poll: usize,
    /// Request ids with chunks still being assembled
    pub partial: usize,
}

pub struct ResultTables {
    pub(crate) ctrl: ResultTable<ResultEnvelope>,
    pub(crate) poll: ResultTable<Option<Value>>,
    assembler: Mutex<ChunkAssembler>,
    lock_timeout: Duration,
}

impl ResultTables {
    pub(crate) fn new(lock_timeout: Duration) -> Self {
        Self {
            ctrl: ResultTable::new("ctrl", lock_timeout),
            poll: ResultTable::new("poll", lock_timeout),
            assembler: Mutex::new(ChunkAssembler::new(CompressionEngine::default())),
            lock_timeout,
        }
    }

    /// Record a control result, feeding chunks through reassembly
    ///
    /// `false` when a lock timed out and the envelope was lost.
    pub(crate) fn ingest_ctrl(&self, envelope: ResultEnvelope) -> bool {
        let chunk = match envelope {
            ResultEnvelope::Chunk(chunk) => chunk,
            whole => return self.ctrl.set(whole.id(), whole),
        };

        let id = chunk.id;
        let outcome = match self.assembler.try_lock_for(self.lock_timeout) {
            Some(mut assembler) => assembler.accept(chunk),
            None => {
                warn!(request_id = %id, "Chunk assembler lock timeout, chunk dropped");
                return false;
            }
        };

        match outcome {
            None => true,
            Some(Ok(value)) => {
                debug!(request_id = %id, "Chunked result reassembled");
                self.ctrl.set(id, ResultEnvelope::Ok { id, value })
            }
            Some(Err(e)) => {
                warn!(request_id = %id, error = %e, "Chunked result could not be decoded");
                self.ctrl.set(id, ResultEnvelope::error(id, e.to_string()))
            }
        }
    }

    /// Drop partial chunk sets whose id fails `keep`
    pub(crate) fn discard_partials(&self, keep: impl FnMut(&RequestId) -> bool) -> usize {
        self.assembler
            .try_lock_for(self.lock_timeout)
            .map(|mut assembler| assembler.retain(keep))
            .unwrap_or(0)
    }

    pub(crate) fn discard_partials_older_than(&self, age: Duration) -> usize {
        self.assembler
            .try_lock_for(self.lock_timeout)
            .map(|mut assembler| assembler.discard_older_than(age))
            .unwrap_or(0)
    }

    pub fn sizes(&self) -> ResultTableSizes {
        ResultTableSizes {
            ctrl: self.ctrl.len().unwrap_or(0),
            poll: self.poll.len().unwrap_or(0),
            partial: self
                .assembler
                .try_lock_for(self.lock_timeout)
                .map(|assembler| assembler.pending())
                .unwrap_or(0),
        }
    }

    pub(crate) fn clear(&self) {
        let ctrl = self.ctrl.clear();
        let poll = self.poll.clear();
        if let Some(mut assembler) = self.assembler.try_lock_for(self.lock_timeout) {
            assembler.clear();
        }
        debug!(ctrl, poll, "Result tables cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::ChunkEncoder;

    #[test]
    fn test_set_pop_once() {
        let table = ResultTable::new("test", Duration::from_millis(50));
        let id = RequestId::new();
        assert!(table.set(id, 7u32));
        assert_eq!(table.len(), Some(1));
        assert_eq!(table.pop(&id), Some(7));
        assert_eq!(table.pop(&id), None);
    }

    #[test]
    fn test_lock_timeout_reads_as_absent() {
        let table = ResultTable::new("test", Duration::from_millis(20));
        let id = RequestId::new();
        table.set(id, 1u8);

        let _held = table.entries.lock();
        assert_eq!(table.pop(&id), None);
        assert!(!table.set(RequestId::new(), 2));
        assert_eq!(table.len(), None);
    }

    #[test]
    fn test_sweep_honours_filter_and_batch() {
        let table = ResultTable::new("test", Duration::from_millis(50));
        let awaited = RequestId::new();
        table.set(awaited, 0u8);
        for _ in 0..10 {
            table.set(RequestId::new(), 1u8);
        }

        assert_eq!(table.sweep(4, |id| *id != awaited), 4);
        assert_eq!(table.sweep(100, |id| *id != awaited), 6);
        assert_eq!(table.sweep(100, |id| *id != awaited), 0);
        assert_eq!(table.pop(&awaited), Some(0));
    }

    #[test]
    fn test_chunked_result_lands_whole() {
        let tables = ResultTables::new(Duration::from_millis(100));
        let id = RequestId::new();
        let mut state = 0x9e37_79b9_7f4a_7c15u64;
        let noisy: Vec<u8> = (0..20_000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        let value = Value::Bytes(noisy);
        let envelopes = ChunkEncoder::new(1024).encode(id, value.clone()).unwrap();
        assert!(envelopes.len() > 1);

        let (last, rest) = envelopes.split_last().unwrap();
        for envelope in rest {
            assert!(tables.ingest_ctrl(envelope.clone()));
            assert_eq!(tables.ctrl.pop(&id), None);
        }
        assert_eq!(tables.sizes().partial, 1);
        assert!(tables.ingest_ctrl(last.clone()));
        assert_eq!(tables.ctrl.pop(&id), Some(ResultEnvelope::Ok { id, value }));
        assert_eq!(tables.sizes(), ResultTableSizes::default());
    }

    #[test]
    fn test_abandoned_partials_are_discarded() {
        let tables = ResultTables::new(Duration::from_millis(100));
        let id = RequestId::new();
        tables.ingest_ctrl(ResultEnvelope::Chunk(types::ChunkEnvelope {
            id,
            chunk_index: 0,
            chunk_total: 3,
            bytes: vec![1, 2, 3],
        }));
        assert_eq!(tables.discard_partials(|other| *other != id), 1);
        assert_eq!(tables.sizes().partial, 0);
    }
}
