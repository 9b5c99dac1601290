//! Result chunking
//!
//! A successful result whose encoded payload exceeds the chunk threshold is
//! compressed and sliced into ordered [`ChunkEnvelope`]s. The receiving side
//! feeds them to a [`ChunkAssembler`], which completes the request once every
//! index of the set has arrived.
//!
//! ```text
//! Value ─encode─▶ payload ─(> threshold)─▶ zstd ─▶ [c0][c1]..[cN-1]
//!                    │                                   │
//!                    └─(≤ threshold)─▶ ResultEnvelope::Ok │
//!                                                         ▼
//!                          ChunkAssembler: index-ordered concat ─▶ unzstd ─▶ decode
//! ```

use crate::compression::CompressionEngine;
use crate::error::{CodecError, Result};
use crate::payload::{decode_value, encode_value, encoded_len};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;
use types::{ChunkEnvelope, RequestId, ResultEnvelope, Value};

/// Default chunk threshold and maximum chunk size: 1 MiB
pub const DEFAULT_CHUNK_THRESHOLD: usize = 1024 * 1024;

/// Turns a successful call result into one or more result envelopes
#[derive(Debug, Clone)]
pub struct ChunkEncoder {
    threshold: usize,
    engine: CompressionEngine,
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_THRESHOLD)
    }
}

impl ChunkEncoder {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            engine: CompressionEngine::default(),
        }
    }

    pub fn with_engine(threshold: usize, engine: CompressionEngine) -> Self {
        Self {
            threshold: threshold.max(1),
            engine,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Encode `value` as the result of request `id`
    ///
    /// Payloads at or under the threshold travel as a single `Ok` envelope;
    /// larger ones as `chunk_total` chunks of at most `threshold` bytes.
    pub fn encode(&self, id: RequestId, value: Value) -> Result<Vec<ResultEnvelope>> {
        if encoded_len(&value)? <= self.threshold {
            return Ok(vec![ResultEnvelope::Ok { id, value }]);
        }

        let payload = encode_value(&value)?;
        let compressed = self.engine.compress(&payload)?;
        let parts: Vec<&[u8]> = compressed.chunks(self.threshold).collect();
        let chunk_total = u32::try_from(parts.len())
            .map_err(|_| CodecError::invalid_chunk(id, "too many chunks"))?;

        debug!(
            request_id = %id,
            payload_bytes = payload.len(),
            compressed_bytes = compressed.len(),
            ratio = self.engine.compression_ratio(payload.len(), compressed.len()),
            chunk_total,
            "Chunking oversized result"
        );

        Ok(parts
            .into_iter()
            .enumerate()
            .map(|(index, bytes)| {
                ResultEnvelope::Chunk(ChunkEnvelope {
                    id,
                    chunk_index: index as u32,
                    chunk_total,
                    bytes: bytes.to_vec(),
                })
            })
            .collect())
    }
}

struct PartialResult {
    chunk_total: u32,
    parts: BTreeMap<u32, Vec<u8>>,
    first_seen: Instant,
}

/// Reassembles chunked results, keyed by request id
///
/// Buffers are memory-only. Abandoned ids are dropped with
/// [`ChunkAssembler::discard`] or [`ChunkAssembler::discard_older_than`].
pub struct ChunkAssembler {
    engine: CompressionEngine,
    partial: HashMap<RequestId, PartialResult>,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new(CompressionEngine::default())
    }
}

impl ChunkAssembler {
    pub fn new(engine: CompressionEngine) -> Self {
        Self {
            engine,
            partial: HashMap::new(),
        }
    }

    /// Accept one chunk
    ///
    /// Returns `None` while the set is incomplete, `Some(Ok(value))` once the
    /// last distinct index arrives, `Some(Err(_))` on any inconsistency or
    /// decode failure. Either terminal outcome releases the buffer.
    pub fn accept(&mut self, chunk: ChunkEnvelope) -> Option<Result<Value>> {
        let id = chunk.id;

        if chunk.chunk_total == 0 || chunk.chunk_index >= chunk.chunk_total {
            self.partial.remove(&id);
            return Some(Err(CodecError::invalid_chunk(
                id,
                format!("index {} of {}", chunk.chunk_index, chunk.chunk_total),
            )));
        }

        let entry = self.partial.entry(id).or_insert_with(|| PartialResult {
            chunk_total: chunk.chunk_total,
            parts: BTreeMap::new(),
            first_seen: Instant::now(),
        });

        if entry.chunk_total != chunk.chunk_total {
            let expected = entry.chunk_total;
            self.partial.remove(&id);
            return Some(Err(CodecError::invalid_chunk(
                id,
                format!("total changed from {} to {}", expected, chunk.chunk_total),
            )));
        }

        entry.parts.insert(chunk.chunk_index, chunk.bytes);
        if entry.parts.len() < entry.chunk_total as usize {
            return None;
        }

        let complete = self.partial.remove(&id)?;
        let compressed: Vec<u8> = complete.parts.into_values().flatten().collect();
        Some(
            self.engine
                .decompress(&compressed)
                .and_then(|payload| decode_value(&payload)),
        )
    }

    /// Drop the buffer for `id`, if any
    pub fn discard(&mut self, id: &RequestId) -> bool {
        self.partial.remove(id).is_some()
    }

    /// Drop buffers that started accumulating more than `age` ago
    pub fn discard_older_than(&mut self, age: Duration) -> usize {
        let before = self.partial.len();
        self.partial
            .retain(|_, partial| partial.first_seen.elapsed() <= age);
        before - self.partial.len()
    }

    /// Drop every buffer whose id fails `keep`
    pub fn retain(&mut self, mut keep: impl FnMut(&RequestId) -> bool) -> usize {
        let before = self.partial.len();
        self.partial.retain(|id, _| keep(id));
        before - self.partial.len()
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// xorshift bytes; zstd cannot shrink these much
    fn noisy_bytes(len: usize) -> Vec<u8> {
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

    fn chunks_of(envelopes: Vec<ResultEnvelope>) -> Vec<ChunkEnvelope> {
        envelopes
            .into_iter()
            .map(|env| match env {
                ResultEnvelope::Chunk(chunk) => chunk,
                other => panic!("expected chunk, got {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_small_result_is_single_envelope() {
        let id = RequestId::new();
        let out = ChunkEncoder::new(1024).encode(id, Value::from("pong")).unwrap();
        assert_eq!(
            out,
            vec![ResultEnvelope::Ok {
                id,
                value: Value::from("pong")
            }]
        );
    }

    #[test]
    fn test_large_result_is_chunked_and_reassembled_out_of_order() {
        let id = RequestId::new();
        let value = Value::Bytes(noisy_bytes(200_000));

        let mut chunks = chunks_of(ChunkEncoder::new(16 * 1024).encode(id, value.clone()).unwrap());
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.bytes.len() <= 16 * 1024));
        chunks.reverse();

        let mut assembler = ChunkAssembler::default();
        let last = chunks.pop().unwrap();
        for chunk in chunks {
            assert!(assembler.accept(chunk).is_none());
        }
        assert_eq!(assembler.pending(), 1);
        assert_eq!(assembler.accept(last).unwrap().unwrap(), value);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_duplicate_chunk_does_not_complete_early() {
        let id = RequestId::new();
        let value = Value::Bytes(noisy_bytes(50_000));
        let chunks = chunks_of(ChunkEncoder::new(4096).encode(id, value.clone()).unwrap());
        assert!(chunks.len() >= 2);

        let mut assembler = ChunkAssembler::default();
        assert!(assembler.accept(chunks[0].clone()).is_none());
        assert!(assembler.accept(chunks[0].clone()).is_none());
        let mut result = None;
        for chunk in chunks.into_iter().skip(1) {
            result = assembler.accept(chunk);
        }
        assert_eq!(result.unwrap().unwrap(), value);
    }

    #[test]
    fn test_inconsistent_total_discards_buffer() {
        let id = RequestId::new();
        let mut assembler = ChunkAssembler::default();
        let first = ChunkEnvelope {
            id,
            chunk_index: 0,
            chunk_total: 3,
            bytes: vec![1],
        };
        assert!(assembler.accept(first).is_none());
        let bad = ChunkEnvelope {
            id,
            chunk_index: 1,
            chunk_total: 4,
            bytes: vec![2],
        };
        assert!(matches!(
            assembler.accept(bad),
            Some(Err(CodecError::InvalidChunk { .. }))
        ));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_corrupt_chunk_set_yields_error() {
        let id = RequestId::new();
        let mut assembler = ChunkAssembler::default();
        let only = ChunkEnvelope {
            id,
            chunk_index: 0,
            chunk_total: 1,
            bytes: b"garbage".to_vec(),
        };
        assert!(matches!(assembler.accept(only), Some(Err(_))));
    }

    #[test]
    fn test_discard_abandoned_buffers() {
        let mut assembler = ChunkAssembler::default();
        let keep = RequestId::new();
        let drop_me = RequestId::new();
        for id in [keep, drop_me] {
            assembler.accept(ChunkEnvelope {
                id,
                chunk_index: 0,
                chunk_total: 2,
                bytes: vec![0],
            });
        }
        assert_eq!(assembler.retain(|id| *id == keep), 1);
        assert!(assembler.discard(&keep));
        assert!(!assembler.discard(&keep));
        assert_eq!(assembler.discard_older_than(Duration::ZERO), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_chunk_concatenation_reconstructs_payload(
            data in proptest::collection::vec(any::<u8>(), 0..64 * 1024),
            threshold in 64usize..8192,
        ) {
            let id = RequestId::new();
            let value = Value::Bytes(data);
            let envelopes = ChunkEncoder::new(threshold).encode(id, value.clone()).unwrap();

            let mut assembler = ChunkAssembler::default();
            let mut outcome = None;
            for env in envelopes {
                match env {
                    ResultEnvelope::Ok { value: v, .. } => outcome = Some(v),
                    ResultEnvelope::Chunk(chunk) => {
                        prop_assert!(chunk.bytes.len() <= threshold);
                        if let Some(done) = assembler.accept(chunk) {
                            outcome = Some(done.unwrap());
                        }
                    }
                    ResultEnvelope::Error { .. } => prop_assert!(false, "unexpected error envelope"),
                }
            }
            prop_assert_eq!(outcome, Some(value));
        }
    }
}
