//! Cache Coordinator
//!
//! Single entry point for application code. Wraps any [`CacheBackend`]
//! (usually a [`ShardedCache`]) and adds metrics, value compression, the
//! asynchronous invalidation queue, read-through population and the warmer
//! lifecycle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::CacheBackend;
use super::compression::{CompressionConfig, ValueCodec};
use super::entry::decode_counter;
use super::invalidation::{
    InvalidationConfig, InvalidationJob, InvalidationQueue, InvalidationStats,
};
use super::metrics::{CacheMetrics, CacheMetricsSnapshot};
use super::sharded::{ShardedCache, ShardedStats};
use super::warmer::{CacheWarmer, DataStore, WarmTarget, WarmerConfig, WarmupStats};
use crate::error::{Error, Result};
use crate::health::{HealthCheckResult, HealthReport};
use crate::scheduler::{Detached, TaskFn, TaskFuture, TokioDetached};

// =============================================================================
// Configuration
// =============================================================================

/// Levels at which `stats()` logs a warning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Hit-rate floor, percent
    pub min_hit_rate: f64,
    /// Rolling average latency ceiling
    #[serde(with = "humantime_serde")]
    pub max_latency: Duration,
    /// Lookups required before the hit-rate alert is evaluated
    pub min_samples: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            min_hit_rate: 80.0,
            max_latency: Duration::from_millis(100),
            min_samples: 100,
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub compression: CompressionConfig,
    pub invalidation: InvalidationConfig,
    pub alerts: AlertThresholds,
    /// Deadline for the synthetic set/get/delete probe
    #[serde(with = "humantime_serde")]
    pub health_check_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            compression: CompressionConfig::default(),
            invalidation: InvalidationConfig::default(),
            alerts: AlertThresholds::default(),
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

/// Aggregated coordinator view
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub backend: String,
    pub running: bool,
    pub metrics: CacheMetricsSnapshot,
    pub invalidation: InvalidationStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharded: Option<ShardedStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmer: Option<WarmupStats>,
    /// Threshold breaches found while building this snapshot
    pub alerts: Vec<String>,
}

// =============================================================================
// Coordinator
// =============================================================================

/// Cache front door
pub struct CacheCoordinator {
    config: CoordinatorConfig,
    backend: Arc<dyn CacheBackend>,
    sharded: Option<Arc<ShardedCache>>,
    codec: ValueCodec,
    metrics: Arc<CacheMetrics>,
    invalidation: InvalidationQueue,
    warmer: RwLock<Option<Arc<CacheWarmer>>>,
    executor: RwLock<Arc<dyn Detached>>,
    running: AtomicBool,
    health_loop_started: AtomicBool,
    /// Backend eviction total already folded into `metrics`
    evictions_seen: AtomicU64,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("backend", &self.backend.name())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl CacheCoordinator {
    /// Wrap `backend`. Starts the invalidation workers, so it must be called
    /// from within a tokio runtime.
    pub fn new(backend: Arc<dyn CacheBackend>, config: CoordinatorConfig) -> Arc<Self> {
        Self::build(backend, None, config)
    }

    /// Wrap a sharded backend, keeping access to its topology and health
    pub fn with_sharded(sharded: Arc<ShardedCache>, config: CoordinatorConfig) -> Arc<Self> {
        let backend: Arc<dyn CacheBackend> = sharded.clone();
        Self::build(backend, Some(sharded), config)
    }

    fn build(
        backend: Arc<dyn CacheBackend>,
        sharded: Option<Arc<ShardedCache>>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let invalidation =
            InvalidationQueue::start(Arc::clone(&backend), config.invalidation.clone());

        info!(
            backend = backend.name(),
            compression = config.compression.enabled,
            threshold = config.compression.threshold_bytes,
            "Cache coordinator created"
        );

        Arc::new(Self {
            codec: ValueCodec::new(config.compression.clone()),
            config,
            backend,
            sharded,
            metrics: Arc::new(CacheMetrics::new()),
            invalidation,
            warmer: RwLock::new(None),
            executor: RwLock::new(Arc::new(TokioDetached)),
            running: AtomicBool::new(false),
            health_loop_started: AtomicBool::new(false),
            evictions_seen: AtomicU64::new(0),
        })
    }

    /// Create a warmer that populates this coordinator and attach it
    pub fn attach_warmer(
        self: &Arc<Self>,
        store: Arc<dyn DataStore>,
        config: WarmerConfig,
    ) -> Arc<CacheWarmer> {
        let weak = Arc::downgrade(self);
        let target: Weak<dyn WarmTarget> = weak;
        let warmer = CacheWarmer::new(target, store, config);
        *self.warmer.write() = Some(Arc::clone(&warmer));
        warmer
    }

    /// Route detached population and replication through `executor`
    pub fn set_executor(&self, executor: Arc<dyn Detached>) {
        self.backend.attach_executor(Arc::clone(&executor));
        *self.executor.write() = executor;
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn warmer(&self) -> Option<Arc<CacheWarmer>> {
        self.warmer.read().clone()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start shard probing and the attached warmer
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning("cache coordinator".into()));
        }

        if let Some(sharded) = &self.sharded {
            if !self.health_loop_started.swap(true, Ordering::AcqRel) {
                sharded.start_health_checks();
            }
        }
        if let Some(warmer) = self.warmer() {
            warmer.start()?;
        }

        info!(backend = self.backend.name(), "Cache coordinator started");
        Ok(())
    }

    /// Stop the warmer and drain the invalidation workers
    pub async fn stop(&self, timeout: Duration) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(warmer) = self.warmer() {
            warmer.stop();
        }
        self.invalidation.shutdown(timeout).await;
        info!("Cache coordinator stopped");
    }

    /// Run one warmer cycle now
    pub async fn warm_now(&self) -> Result<WarmupStats> {
        let warmer = self
            .warmer()
            .ok_or_else(|| Error::Unsupported("no warmer attached".into()))?;
        warmer.run_once().await
    }

    /// Close the underlying backend
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    // =========================================================================
    // Key/value operations
    // =========================================================================

    /// Get and decompress the value under `key`
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let started = Instant::now();
        let result = self.backend.get(key).await;
        self.metrics.record_latency(started.elapsed());

        match result {
            Ok(stored) => {
                self.metrics.record_hit();
                let decoded = self.codec.decode(&stored);
                if decoded.is_err() {
                    self.metrics.record_error();
                }
                decoded
            }
            Err(Error::NotFound) => {
                self.metrics.record_miss();
                Err(Error::NotFound)
            }
            Err(e) => {
                self.metrics.record_error();
                Err(e)
            }
        }
    }

    /// Compress and store `value`
    pub async fn set(&self, key: &str, value: impl AsRef<[u8]>, ttl: Duration) -> Result<()> {
        let encoded = self.encode(value.as_ref());
        let started = Instant::now();
        let result = self.backend.set(key, encoded, ttl).await;
        self.finish_write(started, result)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.backend.delete(key).await;
        self.metrics.record_latency(started.elapsed());
        match result {
            Ok(()) => {
                self.metrics.record_delete();
                Ok(())
            }
            Err(e) => {
                self.metrics.record_error();
                Err(e)
            }
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.timed(self.backend.exists(key)).await
    }

    pub async fn get_ttl(&self, key: &str) -> Result<Duration> {
        self.timed(self.backend.get_ttl(key)).await
    }

    /// Store only if absent. Returns whether the write happened.
    pub async fn set_nx(&self, key: &str, value: impl AsRef<[u8]>, ttl: Duration) -> Result<bool> {
        let encoded = self.encode(value.as_ref());
        let written = self.timed(self.backend.set_nx(key, encoded, ttl)).await?;
        if written {
            self.metrics.record_set();
        }
        Ok(written)
    }

    /// Counters bypass compression; read them back with [`Self::get_counter`]
    pub async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.timed(self.backend.increment(key, delta)).await
    }

    pub async fn get_counter(&self, key: &str) -> Result<i64> {
        let raw = self.timed(self.backend.get(key)).await?;
        decode_counter(key, &raw)
    }

    pub async fn clear(&self) -> Result<()> {
        self.timed(self.backend.clear()).await
    }

    /// Deserialize a JSON value
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self.get(key).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Serialize a value as JSON and store it
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.set(key, raw, ttl).await
    }

    /// Read-through lookup. On a miss `producer` runs, its value is returned
    /// at once and written back in the background.
    pub async fn get_or_set_with<T, F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.get_json::<T>(key).await {
            Ok(value) => return Ok(value),
            Err(Error::NotFound) => {}
            Err(e) => debug!(key = %key, error = %e, "Cached value unusable, recomputing"),
        }

        let value = producer().await?;
        let raw = serde_json::to_vec(&value)?;
        self.persist_detached(key, &raw, ttl);
        Ok(value)
    }

    fn persist_detached(&self, key: &str, raw: &[u8], ttl: Duration) {
        let backend = Arc::clone(&self.backend);
        let metrics = Arc::clone(&self.metrics);
        let encoded = self.encode(raw);
        let key = key.to_string();

        let job: TaskFn = Arc::new(move || -> TaskFuture {
            let backend = Arc::clone(&backend);
            let metrics = Arc::clone(&metrics);
            let encoded = encoded.clone();
            let key = key.clone();
            Box::pin(async move {
                if let Err(e) = backend.set(&key, encoded, ttl).await {
                    metrics.record_error();
                    return Err(e);
                }
                metrics.record_set();
                Ok(())
            })
        });
        self.executor.read().run_detached("cache.populate", job);
    }

    // =========================================================================
    // Capability-backed operations
    // =========================================================================

    /// Store `value` and index it under `tags`. Backends without tag support
    /// store the value untagged.
    pub async fn set_with_tags(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        ttl: Duration,
        tags: &[String],
    ) -> Result<()> {
        let encoded = self.encode(value.as_ref());
        let started = Instant::now();
        let result = match self.backend.as_tagged() {
            Some(tagged) => tagged.set_with_tags(key, encoded, ttl, tags).await,
            None => {
                debug!(backend = self.backend.name(), key = %key, "No tag support, storing untagged");
                self.backend.set(key, encoded, ttl).await
            }
        };
        self.finish_write(started, result)
    }

    /// Fetch several keys. Missing keys are omitted.
    pub async fn get_multiple(&self, keys: &[String]) -> Result<HashMap<String, Bytes>> {
        let started = Instant::now();
        let stored = match self.backend.as_bulk() {
            Some(bulk) => bulk.get_multiple(keys).await,
            None => {
                let mut found = HashMap::with_capacity(keys.len());
                for key in keys {
                    match self.backend.get(key).await {
                        Ok(value) => {
                            found.insert(key.clone(), value);
                        }
                        Err(Error::NotFound) => {}
                        Err(e) => {
                            self.metrics.record_error();
                            debug!(key = %key, error = %e, "Bulk get fell through a failed key");
                        }
                    }
                }
                Ok(found)
            }
        };
        self.metrics.record_latency(started.elapsed());

        let stored = match stored {
            Ok(stored) => stored,
            Err(e) => {
                self.metrics.record_error();
                return Err(e);
            }
        };
        for _ in 0..stored.len() {
            self.metrics.record_hit();
        }
        for _ in stored.len()..keys.len() {
            self.metrics.record_miss();
        }

        stored
            .into_iter()
            .map(|(key, value)| Ok((key, self.codec.decode(&value)?)))
            .collect()
    }

    /// Store several entries with one TTL
    pub async fn set_multiple(&self, items: HashMap<String, Bytes>, ttl: Duration) -> Result<()> {
        let count = items.len();
        let encoded: HashMap<String, Bytes> = items
            .into_iter()
            .map(|(key, value)| {
                let framed = self.encode(&value);
                (key, framed)
            })
            .collect();

        let started = Instant::now();
        let result = match self.backend.as_bulk() {
            Some(bulk) => bulk.set_multiple(encoded, ttl).await,
            None => {
                let mut last_err = None;
                for (key, value) in encoded {
                    if let Err(e) = self.backend.set(&key, value, ttl).await {
                        last_err = Some(e);
                    }
                }
                last_err.map_or(Ok(()), Err)
            }
        };
        self.metrics.record_latency(started.elapsed());

        match result {
            Ok(()) => {
                for _ in 0..count {
                    self.metrics.record_set();
                }
                Ok(())
            }
            Err(e) => {
                self.metrics.record_error();
                Err(e)
            }
        }
    }

    // =========================================================================
    // Asynchronous invalidation
    // =========================================================================

    /// Queue deletion of one key
    pub fn invalidate(&self, key: &str) -> Result<()> {
        self.invalidation.enqueue(InvalidationJob::key(key))
    }

    /// Queue deletion of every key matching `pattern`. Backends without
    /// pattern support are cleared entirely.
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<()> {
        self.invalidation.enqueue(InvalidationJob::pattern(pattern))
    }

    /// Queue deletion of every key tagged `tag`
    pub fn invalidate_tag(&self, tag: &str) -> Result<()> {
        self.invalidation.enqueue(InvalidationJob::tag(tag))
    }

    pub fn invalidation_stats(&self) -> InvalidationStats {
        self.invalidation.stats()
    }

    // =========================================================================
    // Observability
    // =========================================================================

    /// Set, read back and delete a probe key against the backend
    pub async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let key = format!("health_check_{}", Utc::now().timestamp());

        let probe = async {
            self.backend
                .set(&key, Bytes::from_static(b"ok"), Duration::from_secs(60))
                .await?;
            let read = self.backend.get(&key).await?;
            if read.as_ref() != b"ok" {
                return Err(Error::Internal("probe read back a different value".into()));
            }
            self.backend.delete(&key).await
        };

        let result = match tokio::time::timeout(self.config.health_check_timeout, probe).await {
            Ok(Ok(())) => HealthCheckResult::healthy("cache"),
            Ok(Err(e)) => HealthCheckResult::unhealthy("cache", e.to_string()),
            Err(_) => HealthCheckResult::unhealthy("cache", "health probe timed out"),
        };
        result.with_duration(started.elapsed())
    }

    /// Synthetic probe plus shard, invalidation and warmer checks
    pub async fn health_status(&self) -> HealthReport {
        let mut checks = vec![self.health_check().await];

        if let Some(sharded) = &self.sharded {
            checks.push(sharded.health_check());
        }

        let invalidation = self.invalidation.stats();
        checks.push(if invalidation.dropped > 0 {
            HealthCheckResult::degraded(
                "invalidation",
                format!("{} invalidation jobs dropped", invalidation.dropped),
            )
        } else {
            HealthCheckResult::healthy("invalidation")
        });

        if let Some(warmer) = self.warmer() {
            let stats = warmer.stats();
            checks.push(if stats.error_count > 0 {
                HealthCheckResult::degraded(
                    "warmer",
                    format!("{} strategies failed in the last cycle", stats.error_count),
                )
            } else {
                HealthCheckResult::healthy("warmer")
            });
        }

        HealthReport::new(checks)
    }

    /// Aggregate stats. Threshold breaches are logged and listed.
    pub fn stats(&self) -> CoordinatorStats {
        self.sync_evictions();
        let metrics = self.metrics.snapshot();
        let alerts = self.evaluate_alerts(&metrics);

        CoordinatorStats {
            backend: self.backend.name().to_string(),
            running: self.running.load(Ordering::Acquire),
            metrics,
            invalidation: self.invalidation.stats(),
            sharded: self.sharded.as_ref().map(|s| s.stats()),
            warmer: self.warmer().map(|w| w.stats()),
            alerts,
        }
    }

    pub fn reset_metrics(&self) {
        self.sync_evictions();
        self.metrics.reset();
    }

    fn sync_evictions(&self) {
        let total = self.backend.evictions();
        let seen = self.evictions_seen.swap(total, Ordering::AcqRel);
        if total > seen {
            self.metrics.record_evictions(total - seen);
        }
    }

    fn evaluate_alerts(&self, metrics: &CacheMetricsSnapshot) -> Vec<String> {
        let thresholds = &self.config.alerts;
        let mut alerts = Vec::new();

        let lookups = metrics.hits + metrics.misses;
        if lookups >= thresholds.min_samples && metrics.hit_rate < thresholds.min_hit_rate {
            warn!(
                hit_rate = metrics.hit_rate,
                threshold = thresholds.min_hit_rate,
                "Cache hit rate below threshold"
            );
            alerts.push(format!(
                "hit rate {:.1}% below {:.1}%",
                metrics.hit_rate, thresholds.min_hit_rate
            ));
        }

        let latency = Duration::from_micros(metrics.average_latency_us);
        if latency > thresholds.max_latency {
            warn!(
                latency_us = metrics.average_latency_us,
                threshold = ?thresholds.max_latency,
                "Cache latency above threshold"
            );
            alerts.push(format!(
                "average latency {:?} above {:?}",
                latency, thresholds.max_latency
            ));
        }

        alerts
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn encode(&self, raw: &[u8]) -> Bytes {
        let encoded = self.codec.encode(raw);
        // One header byte is always added
        let saved = (raw.len() + 1).saturating_sub(encoded.len());
        if saved > 0 {
            self.metrics.record_bytes_saved(saved as u64);
        }
        encoded
    }

    fn finish_write(&self, started: Instant, result: Result<()>) -> Result<()> {
        self.metrics.record_latency(started.elapsed());
        match result {
            Ok(()) => {
                self.metrics.record_set();
                Ok(())
            }
            Err(e) => {
                self.metrics.record_error();
                Err(e)
            }
        }
    }

    async fn timed<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        let started = Instant::now();
        let result = op.await;
        self.metrics.record_latency(started.elapsed());
        if let Err(e) = &result {
            if !e.is_not_found() {
                self.metrics.record_error();
            }
        }
        result
    }
}

#[async_trait]
impl WarmTarget for CacheCoordinator {
    async fn contains(&self, key: &str) -> bool {
        self.backend.exists(key).await.unwrap_or(false)
    }

    async fn store_json(&self, key: &str, value: &serde_json::Value, ttl: Duration) -> Result<()> {
        self.set_json(key, value, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InMemoryCache;
    use crate::health::HealthStatus;
    use std::sync::atomic::AtomicU32;

    fn coordinator() -> (Arc<InMemoryCache>, Arc<CacheCoordinator>) {
        let cache = InMemoryCache::with_defaults();
        let coordinator = CacheCoordinator::new(cache.clone(), CoordinatorConfig::default());
        (cache, coordinator)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_get_set_records_metrics() {
        let (_, cache) = coordinator();

        assert!(cache.get("missing").await.unwrap_err().is_not_found());
        cache.set("k", b"value", TTL).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Bytes::from_static(b"value"));

        let m = cache.metrics().snapshot();
        assert_eq!(m.hits, 1);
        assert_eq!(m.misses, 1);
        assert_eq!(m.sets, 1);
        assert_eq!(m.total_operations, 3);
        assert!((m.hit_rate - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_large_values_are_compressed_transparently() {
        let (backend, cache) = coordinator();
        let payload = "abcdefgh".repeat(1000);

        cache.set("big", payload.as_bytes(), TTL).await.unwrap();

        let stored = backend.get("big").await.unwrap();
        assert!(stored.len() < payload.len());
        assert_eq!(cache.get("big").await.unwrap(), payload.as_bytes());
        assert!(cache.metrics().snapshot().bytes_saved > 0);

        cache.set("empty", b"", TTL).await.unwrap();
        assert!(cache.get("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evictions_reach_stats() {
        let backend = InMemoryCache::new(crate::cache::MemoryCacheConfig {
            max_entries: 2,
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        });
        let cache = CacheCoordinator::new(backend, CoordinatorConfig::default());

        for i in 0..5 {
            cache.set(&format!("k{}", i), b"v", TTL).await.unwrap();
        }
        assert_eq!(cache.stats().metrics.evictions, 3);
        // Already folded in; a second snapshot must not double count
        assert_eq!(cache.stats().metrics.evictions, 3);

        cache.reset_metrics();
        assert_eq!(cache.stats().metrics.evictions, 0);
        cache.set("k9", b"v", TTL).await.unwrap();
        assert_eq!(cache.stats().metrics.evictions, 1);
    }

    #[tokio::test]
    async fn test_counters_bypass_codec() {
        let (_, cache) = coordinator();
        assert_eq!(cache.increment("hits", 2).await.unwrap(), 2);
        assert_eq!(cache.increment("hits", 3).await.unwrap(), 5);
        assert_eq!(cache.get_counter("hits").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_set_nx() {
        let (_, cache) = coordinator();
        assert!(cache.set_nx("lock", b"a", TTL).await.unwrap());
        assert!(!cache.set_nx("lock", b"b", TTL).await.unwrap());
        assert_eq!(cache.get("lock").await.unwrap(), Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn test_read_through_populates_in_background() {
        let (_, cache) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));

        let producer = {
            let calls = calls.clone();
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(vec![1u32, 2, 3])
            }
        };

        let value: Vec<u32> = cache
            .get_or_set_with("list", TTL, producer.clone())
            .await
            .unwrap();
        assert_eq!(value, vec![1, 2, 3]);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !cache.exists("list").await.unwrap() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let again: Vec<u32> = cache.get_or_set_with("list", TTL, producer).await.unwrap();
        assert_eq!(again, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tags_and_async_invalidation() {
        let (_, cache) = coordinator();
        let tags = vec!["posts".to_string()];
        cache.set_with_tags("post:1", b"a", TTL, &tags).await.unwrap();
        cache.set_with_tags("post:2", b"b", TTL, &tags).await.unwrap();
        cache.set("user:1", b"c", TTL).await.unwrap();

        cache.invalidate_tag("posts").unwrap();
        cache.invalidate_pattern("user:*").unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.invalidation_stats().processed < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(!cache.exists("post:1").await.unwrap());
        assert!(!cache.exists("user:1").await.unwrap());
        assert_eq!(cache.invalidation_stats().keys_removed, 3);
    }

    #[tokio::test]
    async fn test_bulk_operations() {
        let (_, cache) = coordinator();
        let items: HashMap<String, Bytes> = [("a", "1"), ("b", "2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), Bytes::from(v)))
            .collect();
        cache.set_multiple(items, TTL).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let found = cache.get_multiple(&keys).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["b"], Bytes::from_static(b"2"));

        let m = cache.metrics().snapshot();
        assert_eq!(m.hits, 2);
        assert_eq!(m.misses, 1);
    }

    #[tokio::test]
    async fn test_health_check_round_trip() {
        let (backend, cache) = coordinator();
        let check = cache.health_check().await;
        assert_eq!(check.status, HealthStatus::Healthy);
        // Probe key is removed again
        assert!(backend.is_empty());

        let report = cache.health_status().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.check("invalidation").is_some());
    }

    #[tokio::test]
    async fn test_alerts_after_enough_misses() {
        let cache = InMemoryCache::with_defaults();
        let coordinator = CacheCoordinator::new(
            cache,
            CoordinatorConfig {
                alerts: AlertThresholds {
                    min_samples: 5,
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        for i in 0..4 {
            let _ = coordinator.get(&format!("k{}", i)).await;
        }
        assert!(coordinator.stats().alerts.is_empty());

        let _ = coordinator.get("k5").await;
        let stats = coordinator.stats();
        assert_eq!(stats.alerts.len(), 1);
        assert!(stats.alerts[0].contains("hit rate"));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (_, cache) = coordinator();
        assert!(matches!(cache.warm_now().await, Err(Error::Unsupported(_))));

        cache.start().unwrap();
        assert!(matches!(cache.start(), Err(Error::AlreadyRunning(_))));
        assert!(cache.stats().running);

        cache.stop(Duration::from_secs(1)).await;
        assert!(!cache.stats().running);
        assert!(matches!(cache.invalidate("k"), Err(Error::ShuttingDown)));
    }
}
