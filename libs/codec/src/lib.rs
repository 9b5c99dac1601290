//! # Message Bus Codec
//!
//! ## Purpose
//!
//! Byte-level rules of the message bus:
//! - **Payload encoding**: version-tagged bincode encoding of a [`types::Value`]
//! - **Compression**: zstd via [`CompressionEngine`]
//! - **Chunking**: oversized results split into ordered chunks and
//!   reassembled by [`ChunkAssembler`]
//! - **Framing**: length-prefixed frames for process worker sockets
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → [codec] → libs/bus
//!     ↑           ↓          ↓
//! Envelopes   Encoding   Queues, result tables,
//! Values      Chunking   worker sockets
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Queues, threads or socket management (belongs in libs/bus)
//! - Envelope definitions (belongs in libs/types)

pub mod chunking;
pub mod compression;
pub mod error;
pub mod frame;
pub mod payload;

pub use chunking::{ChunkAssembler, ChunkEncoder, DEFAULT_CHUNK_THRESHOLD};
pub use compression::{CompressionEngine, CompressionType};
pub use error::{CodecError, Result};
pub use frame::{FrameReader, FrameWriter, DEFAULT_MAX_FRAME_SIZE};
pub use payload::{decode_value, encode_value, encoded_len, PAYLOAD_VERSION};
