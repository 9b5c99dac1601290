//! Length-prefixed frames over a byte stream
//!
//! Wire layout of every frame on a process worker socket:
//!
//! ```text
//! ┌───────────────┬───────────────────────┐
//! │ len: u32 (BE) │ bincode(message)      │
//! └───────────────┴───────────────────────┘
//! ```
//!
//! Blocking I/O. Each end of a worker link is served by dedicated
//! threads, one reader and any number of writers behind a lock.

use crate::error::{CodecError, Result};
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};

/// Default frame ceiling: 64 MiB
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Serializes messages into frames
pub struct FrameWriter<W: Write> {
    inner: W,
    max_frame_size: usize,
    buffer: BytesMut,
    frames_sent: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
            buffer: BytesMut::with_capacity(64 * 1024),
            frames_sent: 0,
        }
    }

    /// Encode and write one frame
    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let body_len = bincode::serialized_size(message).map_err(|source| CodecError::Encode {
            context: "frame size",
            source,
        })? as usize;

        if body_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_size,
            });
        }

        // Reuse buffer so prefix and body go out in one write
        self.buffer.clear();
        self.buffer.reserve(LEN_PREFIX + body_len);
        self.buffer.put_u32(body_len as u32);
        let mut body = self.buffer.split_off(LEN_PREFIX).writer();
        bincode::serialize_into(&mut body, message).map_err(|source| CodecError::Encode {
            context: "frame body",
            source,
        })?;
        self.buffer.unsplit(body.into_inner());

        self.inner
            .write_all(&self.buffer)
            .map_err(|e| CodecError::io("write frame", e))?;
        self.inner
            .flush()
            .map_err(|e| CodecError::io("flush frame", e))?;

        self.frames_sent += 1;
        Ok(())
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

/// Reads frames written by [`FrameWriter`]
pub struct FrameReader<R: Read> {
    inner: R,
    max_frame_size: usize,
    buffer: BytesMut,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
            buffer: BytesMut::new(),
        }
    }

    /// Block until a whole frame arrives
    ///
    /// A clean EOF before the length prefix is [`CodecError::Closed`]; EOF
    /// inside a frame is an I/O error of kind `UnexpectedEof`.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut len_bytes = [0u8; LEN_PREFIX];
        match read_exact_or_eof(&mut self.inner, &mut len_bytes) {
            Ok(true) => {}
            Ok(false) => return Err(CodecError::Closed),
            Err(e) => return Err(CodecError::io("read length prefix", e)),
        }

        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        self.buffer.clear();
        self.buffer.resize(frame_len, 0);
        self.inner
            .read_exact(&mut self.buffer)
            .map_err(|e| CodecError::io("read frame body", e))?;

        bincode::deserialize(&self.buffer).map_err(|source| CodecError::Decode {
            context: "frame body",
            source,
        })
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

/// `Ok(false)` on EOF before the first byte
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use types::{Args, ControlEnvelope, RequestId};

    #[test]
    fn test_frames_in_order() {
        let mut writer = FrameWriter::new(Vec::new(), DEFAULT_MAX_FRAME_SIZE);
        let first = ControlEnvelope::call(RequestId::new(), "ping", Args::new());
        let second = ControlEnvelope::Stop { epoch: 4 };
        writer.send(&first).unwrap();
        writer.send(&second).unwrap();
        assert_eq!(writer.frames_sent(), 2);

        let bytes = writer.get_ref().clone();
        let prefix = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(prefix, bincode::serialized_size(&first).unwrap() as usize);

        let mut reader = FrameReader::new(Cursor::new(bytes), DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(reader.recv::<ControlEnvelope>().unwrap(), first);
        assert_eq!(reader.recv::<ControlEnvelope>().unwrap(), second);
        let end = reader.recv::<ControlEnvelope>().unwrap_err();
        assert!(matches!(end, CodecError::Closed));
        assert!(end.is_disconnect());
    }

    #[test]
    fn test_truncated_frame_is_disconnect() {
        let mut writer = FrameWriter::new(Vec::new(), DEFAULT_MAX_FRAME_SIZE);
        writer.send(&"a fairly long frame body".to_string()).unwrap();
        let mut bytes = writer.get_ref().clone();
        bytes.truncate(bytes.len() - 3);

        let mut reader = FrameReader::new(Cursor::new(bytes), DEFAULT_MAX_FRAME_SIZE);
        let err = reader.recv::<String>().unwrap_err();
        assert!(err.is_disconnect(), "{:?}", err);
    }

    #[test]
    fn test_frame_size_limit() {
        let mut writer = FrameWriter::new(Vec::new(), 8);
        let err = writer.send(&vec![0u8; 64]).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { max: 8, .. }));

        let mut oversized = (1024u32).to_be_bytes().to_vec();
        oversized.extend_from_slice(&[0; 16]);
        let mut reader = FrameReader::new(Cursor::new(oversized), 512);
        assert!(matches!(
            reader.recv::<Vec<u8>>(),
            Err(CodecError::FrameTooLarge { size: 1024, max: 512 })
        ));
    }
}
