//! Cache Entry
//!
//! Stored value plus its expiry instant, and the fixed-width counter
//! encoding shared by the in-process backend.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// A stored value with its expiry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Raw value
    pub value: Bytes,
    /// Instant after which the entry is no longer live
    pub expires_at: Instant,
}

impl CacheEntry {
    /// Create an entry that expires `ttl` from now
    pub fn new(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    /// An entry is live only while `now < expires_at`
    #[inline]
    pub fn is_live_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    /// Check liveness against the current instant
    #[inline]
    pub fn is_live(&self) -> bool {
        self.is_live_at(Instant::now())
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Size of the stored value in bytes
    pub fn size(&self) -> usize {
        self.value.len()
    }
}

/// Width of an encoded counter
pub const COUNTER_WIDTH: usize = 8;

/// Encode a counter as 8 big-endian bytes
pub fn encode_counter(value: i64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// Decode an 8 byte big-endian counter
pub fn decode_counter(key: &str, raw: &[u8]) -> Result<i64> {
    let bytes: [u8; COUNTER_WIDTH] = raw.try_into().map_err(|_| Error::InvalidValue {
        key: key.to_string(),
        reason: format!("expected {} byte counter, found {} bytes", COUNTER_WIDTH, raw.len()),
    })?;
    Ok(i64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_liveness() {
        let entry = CacheEntry::new(Bytes::from_static(b"v"), Duration::from_secs(60));
        assert!(entry.is_live());
        assert!(!entry.is_live_at(entry.expires_at));
        assert!(entry.remaining() <= Duration::from_secs(60));
    }

    #[test]
    fn test_counter_encoding() {
        let raw = encode_counter(-42);
        assert_eq!(raw.len(), COUNTER_WIDTH);
        assert_eq!(decode_counter("k", &raw).unwrap(), -42);
        assert_eq!(encode_counter(1).as_ref(), &[0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_counter_rejects_wrong_width() {
        let err = decode_counter("k", b"abc").unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));
    }
}
