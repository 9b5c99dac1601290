//! # Message Bus Types
//!
//! Plain data shared by every layer of the message bus:
//!
//! - [`Value`] / [`Args`]: the self-describing payload carried by calls and
//!   results. Method arguments are a positional list plus a named map.
//! - [`RequestId`], [`ComponentKind`], [`QueueClass`]: addressing and
//!   correlation identifiers.
//! - Envelopes: the tagged records placed on the control, poll and stream
//!   queues and written back into the result tables.
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → libs/codec → libs/bus → services/*
//!     ↑            ↓            ↓
//! Pure Data    Encoding     Queues, workers,
//! Envelopes    Chunking     supervision
//! ```
//!
//! This crate has no knowledge of queues, threads or sockets. Everything in
//! it is `serde`-serializable so the same envelope can be handed to an
//! in-process queue or written onto a process worker's socket unchanged.

pub mod args;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod value;

pub use args::Args;
pub use envelope::{
    CallEnvelope, ChunkEnvelope, ControlEnvelope, PollResult, ResultEnvelope, ResultStatus,
    StreamEnvelope, StreamEvent,
};
pub use error::ValueError;
pub use ids::{ComponentKind, QueueClass, RequestId};
pub use value::{FromValue, Value};
