//! Version-tagged value encoding
//!
//! ```text
//! ┌────────┬─────────┬──────────────────────┐
//! │ 'M''B' │ version │ bincode(Value)       │
//! │ 2 bytes│ 1 byte  │ variable             │
//! └────────┴─────────┴──────────────────────┘
//! ```

use crate::error::{CodecError, Result};
use types::Value;

/// Payload magic
pub const PAYLOAD_MAGIC: [u8; 2] = *b"MB";

/// Current payload format version
pub const PAYLOAD_VERSION: u8 = 1;

pub const HEADER_LEN: usize = 3;

/// Serialize a value with the versioned header
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let body_len = bincode::serialized_size(value).map_err(|source| CodecError::Encode {
        context: "value size",
        source,
    })? as usize;

    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(&PAYLOAD_MAGIC);
    out.push(PAYLOAD_VERSION);
    bincode::serialize_into(&mut out, value).map_err(|source| CodecError::Encode {
        context: "value body",
        source,
    })?;
    Ok(out)
}

/// Size a value would occupy once encoded, without allocating it
pub fn encoded_len(value: &Value) -> Result<usize> {
    let body = bincode::serialized_size(value).map_err(|source| CodecError::Encode {
        context: "value size",
        source,
    })?;
    Ok(HEADER_LEN + body as usize)
}

/// Parse a payload produced by [`encode_value`]
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    if bytes.len() < HEADER_LEN || bytes[..2] != PAYLOAD_MAGIC {
        return Err(CodecError::MissingHeader { len: bytes.len() });
    }
    if bytes[2] != PAYLOAD_VERSION {
        return Err(CodecError::UnsupportedVersion {
            found: bytes[2],
            expected: PAYLOAD_VERSION,
        });
    }
    bincode::deserialize(&bytes[HEADER_LEN..]).map_err(|source| CodecError::Decode {
        context: "value body",
        source,
    })
}
