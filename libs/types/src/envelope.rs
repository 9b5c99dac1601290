//! Queue and result envelopes
//!
//! Control and poll queues carry [`ControlEnvelope`]s, the stream queue
//! carries [`StreamEnvelope`]s. Results flow back as [`ResultEnvelope`]
//! (control class, possibly chunked) or [`PollResult`] (poll class, bare
//! scalar).
//!
//! Stop envelopes carry the epoch of the worker generation they target. A
//! queue triplet survives restarts, so a stop left behind by a worker that
//! died before reading it must not terminate the next generation.

use crate::args::Args;
use crate::ids::RequestId;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// A named method invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub id: RequestId,
    pub method: String,
    pub args: Args,
    /// `false` for fire-and-forget orders; no result is written
    pub reply: bool,
}

/// Entry of a control or poll queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlEnvelope {
    Call(CallEnvelope),
    Stop { epoch: u64 },
}

impl ControlEnvelope {
    pub fn call(id: RequestId, method: impl Into<String>, args: Args) -> Self {
        ControlEnvelope::Call(CallEnvelope {
            id,
            method: method.into(),
            args,
            reply: true,
        })
    }

    /// Call whose result nobody collects
    pub fn order(id: RequestId, method: impl Into<String>, args: Args) -> Self {
        ControlEnvelope::Call(CallEnvelope {
            id,
            method: method.into(),
            args,
            reply: false,
        })
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, ControlEnvelope::Stop { .. })
    }
}

/// One-way invocation with no result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub func: String,
    pub args: Args,
}

/// Entry of a stream queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEnvelope {
    Event(StreamEvent),
    Stop { epoch: u64 },
}

impl StreamEnvelope {
    pub fn event(func: impl Into<String>, args: Args) -> Self {
        StreamEnvelope::Event(StreamEvent {
            func: func.into(),
            args,
        })
    }
}

/// Outcome tag of a completed control call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Ok,
    Error,
}

/// One slice of a compressed, serialized result too large for one envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    pub id: RequestId,
    pub chunk_index: u32,
    pub chunk_total: u32,
    pub bytes: Vec<u8>,
}

/// Result of a control-class call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultEnvelope {
    Ok { id: RequestId, value: Value },
    Error { id: RequestId, message: String },
    Chunk(ChunkEnvelope),
}

impl ResultEnvelope {
    pub fn id(&self) -> RequestId {
        match self {
            ResultEnvelope::Ok { id, .. } | ResultEnvelope::Error { id, .. } => *id,
            ResultEnvelope::Chunk(chunk) => chunk.id,
        }
    }

    /// `None` for a partial (chunk) envelope
    pub fn status(&self) -> Option<ResultStatus> {
        match self {
            ResultEnvelope::Ok { .. } => Some(ResultStatus::Ok),
            ResultEnvelope::Error { .. } => Some(ResultStatus::Error),
            ResultEnvelope::Chunk(_) => None,
        }
    }

    pub fn error(id: RequestId, message: impl Into<String>) -> Self {
        ResultEnvelope::Error {
            id,
            message: message.into(),
        }
    }
}

/// Result of a poll-class call: a bare value, `None` on any failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResult {
    pub id: RequestId,
    pub result: Option<Value>,
}
