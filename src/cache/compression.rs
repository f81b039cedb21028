//! Value Compression
//!
//! LZ4 block compression for cached values above a size threshold.
//!
//! Every value written through the coordinator is framed with a one-byte
//! header so reads know whether to decompress:
//!
//! ```text
//! ┌────────┬──────────────────────────────┐
//! │ 0x00   │ raw payload                  │
//! ├────────┼──────────────────────────────┤
//! │ 0x01   │ LZ4 block (size-prepended)   │
//! └────────┴──────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use cachewarden::cache::compression::{CompressionConfig, ValueCodec};
//!
//! let codec = ValueCodec::new(CompressionConfig::default());
//! let payload = vec![b'a'; 4096];
//!
//! let framed = codec.encode(&payload);
//! assert!(framed.len() < payload.len());
//! assert_eq!(codec.decode(&framed).unwrap().as_ref(), payload.as_slice());
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as-is
    None,
    /// LZ4 block compression
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Frame header byte
    fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0x00,
            CompressionAlgorithm::Lz4 => 0x01,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(CompressionAlgorithm::None),
            0x01 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for value compression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Whether compression is attempted at all
    pub enabled: bool,
    /// Values at or below this size are stored raw
    pub threshold_bytes: usize,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 1024,
            level: 4,
        }
    }
}

// =============================================================================
// Value Codec
// =============================================================================

/// Frames values, compressing the ones worth compressing
#[derive(Debug, Clone)]
pub struct ValueCodec {
    config: CompressionConfig,
}

impl ValueCodec {
    /// Create a codec
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Frame `data`, compressing it when it exceeds the threshold and LZ4
    /// actually makes it smaller. Compression failures fall back to raw.
    pub fn encode(&self, data: &[u8]) -> Bytes {
        if self.config.enabled && data.len() > self.config.threshold_bytes {
            match self.lz4_compress(data) {
                Ok(compressed) if compressed.len() < data.len() => {
                    return frame(CompressionAlgorithm::Lz4, &compressed);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Compression failed, storing uncompressed: {}", e);
                }
            }
        }
        frame(CompressionAlgorithm::None, data)
    }

    /// Reverse [`ValueCodec::encode`]
    pub fn decode(&self, framed: &[u8]) -> Result<Bytes> {
        let Some((&tag, payload)) = framed.split_first() else {
            return Ok(Bytes::new());
        };

        match CompressionAlgorithm::from_tag(tag) {
            Some(CompressionAlgorithm::None) => Ok(Bytes::copy_from_slice(payload)),
            Some(CompressionAlgorithm::Lz4) => lz4::block::decompress(payload, None)
                .map(Bytes::from)
                .map_err(|e| Error::DecompressionFailed {
                    algorithm: "LZ4".into(),
                    reason: e.to_string(),
                }),
            None => Err(Error::DecompressionFailed {
                algorithm: "unknown".into(),
                reason: format!("unrecognised frame header 0x{:02x}", tag),
            }),
        }
    }

    /// Algorithm recorded in a framed value
    pub fn algorithm_of(framed: &[u8]) -> Option<CompressionAlgorithm> {
        framed
            .first()
            .and_then(|&tag| CompressionAlgorithm::from_tag(tag))
    }

    fn lz4_compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.config.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

fn frame(algorithm: CompressionAlgorithm, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(algorithm.tag());
    buf.put_slice(payload);
    buf.freeze()
}
