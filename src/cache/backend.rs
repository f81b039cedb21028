//! Cache Backend Contract
//!
//! Every cache tier implements [`CacheBackend`]. Optional features are
//! exposed through capability traits which callers discover with
//! `as_bulk()`, `as_pattern()` and `as_tagged()` instead of inspecting
//! concrete types.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::scheduler::Detached;

/// Key/value cache contract shared by every backend.
///
/// A `ttl` of [`Duration::ZERO`] means "use the backend's default TTL".
/// Reads of absent or expired keys return [`crate::Error::NotFound`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name used in logs and stats
    fn name(&self) -> &str;

    /// Get the value stored under `key`
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Store `value` under `key` for `ttl`
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check whether `key` holds a live entry
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove every key owned by this backend
    async fn clear(&self) -> Result<()>;

    /// Remaining time-to-live of `key`
    async fn get_ttl(&self, key: &str) -> Result<Duration>;

    /// Store `value` only if `key` is absent. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool>;

    /// Add `delta` to the counter at `key`, starting from zero when absent
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;

    /// Release resources and stop background loops
    async fn close(&self) -> Result<()>;

    /// Liveness probe
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Route the backend's own follow-up work (replication, TTL refresh)
    /// through `executor`. Backends without such work ignore it.
    fn attach_executor(&self, _executor: Arc<dyn Detached>) {}

    /// Entries evicted for capacity since creation. Backends that delegate
    /// eviction to the server report zero.
    fn evictions(&self) -> u64 {
        0
    }

    /// Batched reads and writes, if supported
    fn as_bulk(&self) -> Option<&dyn BulkCache> {
        None
    }

    /// Pattern-based key enumeration and deletion, if supported
    fn as_pattern(&self) -> Option<&dyn PatternCache> {
        None
    }

    /// Tag-indexed writes and invalidation, if supported
    fn as_tagged(&self) -> Option<&dyn TaggedCache> {
        None
    }
}

/// Batched operations
#[async_trait]
pub trait BulkCache: Send + Sync {
    /// Fetch several keys at once. Missing keys are omitted from the result.
    async fn get_multiple(&self, keys: &[String]) -> Result<HashMap<String, Bytes>>;

    /// Store several entries with a shared TTL
    async fn set_multiple(&self, items: HashMap<String, Bytes>, ttl: Duration) -> Result<()>;
}

/// Glob-style key operations (`*` and `?` wildcards)
#[async_trait]
pub trait PatternCache: Send + Sync {
    /// List keys matching `pattern`
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>>;

    /// Delete keys matching `pattern`, returning how many were removed
    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64>;
}

/// Tag-indexed invalidation
#[async_trait]
pub trait TaggedCache: Send + Sync {
    /// Store `value` and register `key` under each tag
    async fn set_with_tags(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
    ) -> Result<()>;

    /// Delete every key registered under `tag` plus the tag index itself
    async fn invalidate_tag(&self, tag: &str) -> Result<u64>;
}

/// Match `key` against a glob pattern supporting `*` and `?`.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();

    let (mut pi, mut ki) = (0usize, 0usize);
    // Position of the last '*' and the key index it was tried against
    let mut backtrack: Option<(usize, usize)> = None;

    while ki < k.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == k[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ki));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ki = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_literal() {
        assert!(glob_match("user:1", "user:1"));
        assert!(!glob_match("user:1", "user:10"));
    }

    #[test]
    fn test_glob_wildcards() {
        assert!(glob_match("user:*", "user:42:profile"));
        assert!(glob_match("*:profile", "user:42:profile"));
        assert!(glob_match("user:?", "user:7"));
        assert!(!glob_match("user:?", "user:77"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
    }
}
