//! In-Process Cache Backend
//!
//! Map-backed cache with per-entry TTL, a capacity bound that evicts the
//! entry closest to expiry, and a periodic sweep of expired entries.
//!
//! Also serves as the fallback tier of the sharded backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::backend::{glob_match, BulkCache, CacheBackend, PatternCache, TaggedCache};
use super::entry::{decode_counter, encode_counter, CacheEntry};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for [`InMemoryCache`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries before eviction kicks in
    pub max_entries: usize,
    /// TTL applied when a caller passes zero
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Interval of the expired-entry sweep (zero disables it)
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Namespace prepended to every key
    pub key_prefix: String,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(10 * 60),
            key_prefix: String::new(),
        }
    }
}

impl MemoryCacheConfig {
    /// Config used for the sharded backend's fallback tier
    pub fn fallback() -> Self {
        Self {
            key_prefix: "fallback:".to_string(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time view of the in-process cache
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryCacheStats {
    pub entries: usize,
    pub tags: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_removed: u64,
}

// =============================================================================
// In-Memory Cache
// =============================================================================

#[derive(Default)]
struct State {
    entries: HashMap<String, CacheEntry>,
    tags: HashMap<String, HashSet<String>>,
}

impl State {
    fn live(&self, key: &str, now: Instant) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|e| e.is_live_at(now))
    }

    /// Remove the entry with the earliest expiry
    fn evict_earliest(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.expires_at)
            .map(|(k, _)| k.clone());

        match victim {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }
}

/// In-process cache backend
pub struct InMemoryCache {
    config: MemoryCacheConfig,
    state: Mutex<State>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_removed: AtomicU64,
    shutdown: CancellationToken,
}

impl InMemoryCache {
    /// Create a cache and, when called inside a tokio runtime, start the
    /// expired-entry sweep.
    pub fn new(config: MemoryCacheConfig) -> Arc<Self> {
        let cache = Arc::new(Self {
            config,
            state: Mutex::new(State::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_removed: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        if !cache.config.cleanup_interval.is_zero()
            && tokio::runtime::Handle::try_current().is_ok()
        {
            tokio::spawn(Self::cleanup_loop(
                Arc::downgrade(&cache),
                cache.config.cleanup_interval,
                cache.shutdown.clone(),
            ));
        }

        cache
    }

    /// Create a cache with default settings
    pub fn with_defaults() -> Arc<Self> {
        Self::new(MemoryCacheConfig::default())
    }

    /// Get the configuration
    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }

    /// Number of stored entries, including ones not yet swept
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of counters
    pub fn stats(&self) -> MemoryCacheStats {
        let state = self.state.lock();
        MemoryCacheStats {
            entries: state.entries.len(),
            tags: state.tags.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
        }
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.is_live_at(now));
        let removed = before - state.entries.len();

        let State { entries, tags } = &mut *state;
        tags.retain(|_, members| {
            members.retain(|k| entries.contains_key(k));
            !members.is_empty()
        });

        self.expired_removed
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn prefixed(&self, key: &str) -> String {
        if self.config.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.config.key_prefix, key)
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.config.key_prefix.as_str())
            .unwrap_or(key)
    }

    fn effective_ttl(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.config.default_ttl
        } else {
            ttl
        }
    }

    fn insert(&self, state: &mut State, key: String, value: Bytes, ttl: Duration) {
        if !state.entries.contains_key(&key)
            && state.entries.len() >= self.config.max_entries
            && state.evict_earliest()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        state.entries.insert(key, CacheEntry::new(value, ttl));
    }

    async fn cleanup_loop(cache: Weak<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(cache) = cache.upgrade() else { break };
                    let removed = cache.purge_expired();
                    if removed > 0 {
                        debug!(removed, "Swept expired cache entries");
                    }
                }
            }
        }
    }
}

impl Drop for InMemoryCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    fn name(&self) -> &str {
        "memory"
    }

    fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let key = self.prefixed(key);
        let state = self.state.lock();
        match state.live(&key, Instant::now()) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(Error::NotFound)
            }
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let key = self.prefixed(key);
        let ttl = self.effective_ttl(ttl);
        let mut state = self.state.lock();
        self.insert(&mut state, key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = self.prefixed(key);
        self.state.lock().entries.remove(&key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = self.prefixed(key);
        Ok(self.state.lock().live(&key, Instant::now()).is_some())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.entries.clear();
        state.tags.clear();
        Ok(())
    }

    async fn get_ttl(&self, key: &str) -> Result<Duration> {
        let key = self.prefixed(key);
        self.state
            .lock()
            .live(&key, Instant::now())
            .map(CacheEntry::remaining)
            .ok_or(Error::NotFound)
    }

    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        let key = self.prefixed(key);
        let ttl = self.effective_ttl(ttl);
        let mut state = self.state.lock();
        if state.live(&key, Instant::now()).is_some() {
            return Ok(false);
        }
        self.insert(&mut state, key, value, ttl);
        Ok(true)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let prefixed = self.prefixed(key);
        let mut state = self.state.lock();

        let current = match state.live(&prefixed, Instant::now()) {
            Some(entry) => decode_counter(key, &entry.value)?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| Error::InvalidValue {
                key: key.to_string(),
                reason: "increment would overflow".to_string(),
            })?;

        self.insert(
            &mut state,
            prefixed,
            encode_counter(next),
            self.config.default_ttl,
        );
        Ok(next)
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let mut state = self.state.lock();
        state.entries.clear();
        state.tags.clear();
        info!(backend = "memory", "In-process cache closed");
        Ok(())
    }

    fn as_bulk(&self) -> Option<&dyn BulkCache> {
        Some(self)
    }

    fn as_pattern(&self) -> Option<&dyn PatternCache> {
        Some(self)
    }

    fn as_tagged(&self) -> Option<&dyn TaggedCache> {
        Some(self)
    }
}

#[async_trait]
impl BulkCache for InMemoryCache {
    async fn get_multiple(&self, keys: &[String]) -> Result<HashMap<String, Bytes>> {
        let now = Instant::now();
        let state = self.state.lock();
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = state.live(&self.prefixed(key), now) {
                found.insert(key.clone(), entry.value.clone());
            }
        }
        self.hits.fetch_add(found.len() as u64, Ordering::Relaxed);
        self.misses
            .fetch_add((keys.len() - found.len()) as u64, Ordering::Relaxed);
        Ok(found)
    }

    async fn set_multiple(&self, items: HashMap<String, Bytes>, ttl: Duration) -> Result<()> {
        let ttl = self.effective_ttl(ttl);
        let mut state = self.state.lock();
        for (key, value) in items {
            self.insert(&mut state, self.prefixed(&key), value, ttl);
        }
        Ok(())
    }
}

#[async_trait]
impl PatternCache for InMemoryCache {
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state
            .entries
            .iter()
            .filter(|(_, e)| e.is_live_at(now))
            .map(|(k, _)| self.strip_prefix(k))
            .filter(|k| glob_match(pattern, k))
            .map(str::to_string)
            .collect())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.entries.len();
        let prefix = self.config.key_prefix.as_str();
        state.entries.retain(|k, _| {
            let bare = k.strip_prefix(prefix).unwrap_or(k);
            !glob_match(pattern, bare)
        });
        Ok((before - state.entries.len()) as u64)
    }
}

#[async_trait]
impl TaggedCache for InMemoryCache {
    async fn set_with_tags(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
    ) -> Result<()> {
        let prefixed = self.prefixed(key);
        let ttl = self.effective_ttl(ttl);
        let mut state = self.state.lock();
        self.insert(&mut state, prefixed.clone(), value, ttl);
        for tag in tags {
            state
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(prefixed.clone());
        }
        Ok(())
    }

    async fn invalidate_tag(&self, tag: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let Some(members) = state.tags.remove(tag) else {
            return Ok(0);
        };
        let mut removed = 0;
        for key in members {
            if state.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache(max_entries: usize) -> Arc<InMemoryCache> {
        InMemoryCache::new(MemoryCacheConfig {
            max_entries,
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_never_written_key_is_not_found() {
        let cache = small_cache(10);
        assert!(matches!(cache.get("missing").await, Err(Error::NotFound)));
        assert!(matches!(cache.get_ttl("missing").await, Err(Error::NotFound)));
        assert!(!cache.exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_get_within_ttl() {
        let cache = small_cache(10);
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Bytes::from_static(b"v"));
        assert!(cache.get_ttl("k").await.unwrap() <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_expired_entry_behaves_as_absent() {
        let cache = small_cache(10);
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(cache.get("k").await, Err(Error::NotFound)));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_zero_ttl_uses_default() {
        let cache = small_cache(10);
        cache
            .set("k", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();
        let ttl = cache.get_ttl("k").await.unwrap();
        assert!(ttl > Duration::from_secs(29 * 60));
    }

    #[tokio::test]
    async fn test_set_nx() {
        let cache = small_cache(10);
        let ttl = Duration::from_secs(60);
        assert!(cache.set_nx("k", Bytes::from_static(b"a"), ttl).await.unwrap());
        assert!(!cache.set_nx("k", Bytes::from_static(b"b"), ttl).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn test_increment_sums_deltas() {
        let cache = small_cache(10);
        assert_eq!(cache.increment("c", 5).await.unwrap(), 5);
        assert_eq!(cache.increment("c", -2).await.unwrap(), 3);
        assert_eq!(cache.increment("c", 10).await.unwrap(), 13);
    }

    #[tokio::test]
    async fn test_increment_rejects_non_counter() {
        let cache = small_cache(10);
        cache
            .set("c", Bytes::from_static(b"text"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(
            cache.increment("c", 1).await,
            Err(Error::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_increment_overflow_leaves_counter_intact() {
        let cache = small_cache(10);
        assert_eq!(cache.increment("n", i64::MAX).await.unwrap(), i64::MAX);
        assert!(matches!(
            cache.increment("n", 1).await,
            Err(Error::InvalidValue { .. })
        ));
        assert_eq!(cache.increment("n", 0).await.unwrap(), i64::MAX);
        assert_eq!(cache.increment("n", -1).await.unwrap(), i64::MAX - 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_earliest_expiry() {
        let cache = small_cache(2);
        cache
            .set("short", Bytes::from_static(b"1"), Duration::from_secs(5))
            .await
            .unwrap();
        cache
            .set("long", Bytes::from_static(b"2"), Duration::from_secs(500))
            .await
            .unwrap();
        cache
            .set("new", Bytes::from_static(b"3"), Duration::from_secs(50))
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert!(!cache.exists("short").await.unwrap());
        assert!(cache.exists("long").await.unwrap());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_prefix_is_transparent() {
        let cache = InMemoryCache::new(MemoryCacheConfig {
            key_prefix: "app:".into(),
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        });
        cache
            .set("user:1", Bytes::from_static(b"x"), Duration::ZERO)
            .await
            .unwrap();
        let keys = cache.keys_matching("user:*").await.unwrap();
        assert_eq!(keys, vec!["user:1".to_string()]);
        assert_eq!(cache.delete_by_pattern("user:*").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tag_invalidation() {
        let cache = small_cache(10);
        let tags = vec!["group".to_string()];
        cache
            .set_with_tags("a", Bytes::from_static(b"1"), Duration::ZERO, &tags)
            .await
            .unwrap();
        cache
            .set_with_tags("b", Bytes::from_static(b"2"), Duration::ZERO, &tags)
            .await
            .unwrap();
        cache
            .set("c", Bytes::from_static(b"3"), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(cache.invalidate_tag("group").await.unwrap(), 2);
        assert!(!cache.exists("a").await.unwrap());
        assert!(cache.exists("c").await.unwrap());
        assert_eq!(cache.invalidate_tag("group").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_operations() {
        let cache = small_cache(10);
        let mut items = HashMap::new();
        items.insert("a".to_string(), Bytes::from_static(b"1"));
        items.insert("b".to_string(), Bytes::from_static(b"2"));
        cache.set_multiple(items, Duration::ZERO).await.unwrap();

        let found = cache
            .get_multiple(&["a".into(), "b".into(), "zz".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["b"], Bytes::from_static(b"2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_loop_sweeps() {
        let cache = InMemoryCache::new(MemoryCacheConfig {
            cleanup_interval: Duration::from_secs(1),
            ..Default::default()
        });
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_millis(500))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        tokio::task::yield_now().await;
        assert!(cache.is_empty());
    }
}
