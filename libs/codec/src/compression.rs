//! Compression Engine
//!
//! Lossless compression for oversized result payloads. Zstd is the only
//! codec on the chunking path; `None` exists for tests and for links where
//! CPU matters more than bytes.

use crate::error::{CodecError, Result};

/// Default zstd level: fast, still shrinks tabular payloads several-fold
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Ceiling on decompressed size to bound memory on corrupt input
pub const MAX_DECOMPRESSED_SIZE: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Zstd,
}

#[derive(Debug, Clone)]
pub struct CompressionEngine {
    compression_type: CompressionType,
    zstd_level: i32,
}

impl Default for CompressionEngine {
    fn default() -> Self {
        Self::new(CompressionType::Zstd)
    }
}

impl CompressionEngine {
    pub fn new(compression_type: CompressionType) -> Self {
        Self {
            compression_type,
            zstd_level: DEFAULT_ZSTD_LEVEL,
        }
    }

    pub fn with_zstd_level(level: i32) -> Self {
        Self {
            compression_type: CompressionType::Zstd,
            zstd_level: level,
        }
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compression_type
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.compression_type {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Zstd => {
                zstd::bulk::compress(data, self.zstd_level).map_err(|e| CodecError::Compression {
                    codec: "zstd",
                    message: format!("Compression failed: {}", e),
                })
            }
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.compression_type {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Zstd => {
                // Streaming decode: the final size is unknown up front and a
                // bulk decode would reserve the whole ceiling.
                let out = zstd::stream::decode_all(data).map_err(|e| CodecError::Compression {
                    codec: "zstd",
                    message: format!("Decompression failed: {}", e),
                })?;
                if out.len() > MAX_DECOMPRESSED_SIZE {
                    return Err(CodecError::Compression {
                        codec: "zstd",
                        message: format!(
                            "Decompressed size {} exceeds limit {}",
                            out.len(),
                            MAX_DECOMPRESSED_SIZE
                        ),
                    });
                }
                Ok(out)
            }
        }
    }

    /// Compressed / original, for log lines
    pub fn compression_ratio(&self, original_size: usize, compressed_size: usize) -> f64 {
        if original_size == 0 {
            return 1.0;
        }
        compressed_size as f64 / original_size as f64
    }
}
