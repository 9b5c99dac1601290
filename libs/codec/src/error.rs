//! Codec errors
//!
//! Encoding, chunk reassembly and framing failures. I/O failures keep their
//! source so callers can tell a vanished peer from a malformed frame.

use std::io;
use thiserror::Error;
use types::RequestId;

#[derive(Debug, Error)]
pub enum CodecError {
    /// Value could not be serialized
    #[error("Encode error: {context}: {source}")]
    Encode {
        context: &'static str,
        #[source]
        source: bincode::Error,
    },

    /// Bytes could not be deserialized
    #[error("Decode error: {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: bincode::Error,
    },

    /// Payload header is absent or truncated
    #[error("Payload too short for header: {len} bytes")]
    MissingHeader { len: usize },

    /// Payload was produced by an incompatible encoder
    #[error("Unsupported payload version {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },

    /// Compression or decompression failed
    #[error("Compression error: {codec}: {message}")]
    Compression { codec: &'static str, message: String },

    /// Frame exceeds the configured limit
    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Chunk metadata is inconsistent
    #[error("Invalid chunk for request {id}: {reason}")]
    InvalidChunk { id: RequestId, reason: String },

    /// Peer closed the stream at a frame boundary
    #[error("Stream closed by peer")]
    Closed,

    /// Socket or pipe failure
    #[error("I/O error: {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CodecError>;

impl CodecError {
    pub fn io(context: &'static str, source: io::Error) -> Self {
        Self::Io { context, source }
    }

    pub fn invalid_chunk(id: RequestId, reason: impl Into<String>) -> Self {
        Self::InvalidChunk {
            id,
            reason: reason.into(),
        }
    }

    /// The other end of the transport is gone
    ///
    /// Worker loops exit on these instead of retrying.
    pub fn is_disconnect(&self) -> bool {
        match self {
            CodecError::Closed => true,
            CodecError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}
