//! Sharded Cache Backend
//!
//! Routes keys across N backends, mirrors writes onto replica shards,
//! probes shard health and fails over to an in-process fallback tier.
//!
//! # Routing
//!
//! ```text
//!   key ──▶ crc32(key) % N  (consistent)      ┌─────────┐
//!       └─▶ sha256(key)[0] % N  (simple) ───▶ │ shard i │ healthy? ──▶ serve
//!                                             └─────────┘
//!                                                  │ no
//!                                                  ▼
//!                                   probe i+1, i+2, ... (wrapping)
//!                                                  │ none healthy
//!                                                  ▼
//!                                     fallback tier or NoHealthyBackend
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{BulkCache, CacheBackend, PatternCache, TaggedCache};
use super::memory::{InMemoryCache, MemoryCacheConfig};
use super::remote::{RemoteCache, RemoteCacheConfig};
use crate::error::{Error, Result};
use crate::health::{HealthCheckResult, HealthStatus};
use crate::scheduler::{Detached, TaskFn, TaskFuture, TokioDetached};

/// Prefix of keys written by replication
pub const REPLICA_PREFIX: &str = "replica:";

// =============================================================================
// Configuration
// =============================================================================

/// How keys map onto shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// CRC-32 (IEEE) checksum modulo shard count
    Consistent,
    /// First byte of a SHA-256 digest modulo shard count
    Simple,
}

/// Configuration for [`ShardedCache`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardedCacheConfig {
    /// Key routing scheme
    pub routing: RoutingMode,
    /// Total copies of each value (1 disables replication)
    pub replication_factor: usize,
    /// Interval between shard probes (zero disables probing)
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Bound on each liveness probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Minimum time a differing probe result must persist before a shard
    /// flips status. Zero flips on the first differing probe.
    #[serde(with = "humantime_serde")]
    pub health_dwell: Duration,
    /// Route to an in-process tier when no shard is healthy
    pub fallback_enabled: bool,
    /// Settings for the fallback tier
    pub fallback: MemoryCacheConfig,
}

impl Default for ShardedCacheConfig {
    fn default() -> Self {
        Self {
            routing: RoutingMode::Consistent,
            replication_factor: 2,
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            health_dwell: Duration::ZERO,
            fallback_enabled: true,
            fallback: MemoryCacheConfig::fallback(),
        }
    }
}

// =============================================================================
// Shard Health
// =============================================================================

#[derive(Debug, Clone)]
struct ShardHealthEntry {
    healthy: bool,
    /// First time the opposite status was observed, if it has been
    pending_since: Option<Instant>,
}

/// Per-shard health flags. Written by the probe loop and operator
/// overrides, read by every routing decision.
#[derive(Debug)]
pub struct ShardHealthTable {
    entries: RwLock<Vec<ShardHealthEntry>>,
}

impl ShardHealthTable {
    fn new(initial: impl IntoIterator<Item = bool>) -> Self {
        Self {
            entries: RwLock::new(
                initial
                    .into_iter()
                    .map(|healthy| ShardHealthEntry {
                        healthy,
                        pending_since: None,
                    })
                    .collect(),
            ),
        }
    }

    /// Current flag for one shard
    pub fn is_healthy(&self, idx: usize) -> bool {
        self.entries
            .read()
            .get(idx)
            .map(|e| e.healthy)
            .unwrap_or(false)
    }

    /// Copy of every flag
    pub fn snapshot(&self) -> Vec<bool> {
        self.entries.read().iter().map(|e| e.healthy).collect()
    }

    /// Force a status immediately. Returns the previous status.
    fn set(&self, idx: usize, healthy: bool) -> Option<bool> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(idx)?;
        let previous = entry.healthy;
        entry.healthy = healthy;
        entry.pending_since = None;
        Some(previous)
    }

    /// Record a probe result, honouring the dwell time. Returns the new
    /// status when it flipped.
    fn observe(&self, idx: usize, healthy: bool, now: Instant, dwell: Duration) -> Option<bool> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(idx)?;

        if entry.healthy == healthy {
            entry.pending_since = None;
            return None;
        }

        let since = *entry.pending_since.get_or_insert(now);
        if now.duration_since(since) >= dwell {
            entry.healthy = healthy;
            entry.pending_since = None;
            Some(healthy)
        } else {
            None
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Status of one shard
#[derive(Debug, Clone, Serialize)]
pub struct ShardStatus {
    pub index: usize,
    pub healthy: bool,
    /// False when the shard failed to initialize
    pub initialized: bool,
    pub backend: String,
}

/// Topology view of the sharded backend
#[derive(Debug, Clone, Serialize)]
pub struct ShardedStats {
    pub shard_count: usize,
    pub replication_factor: usize,
    pub routing: RoutingMode,
    pub fallback_enabled: bool,
    pub healthy_shards: usize,
    pub shards: Vec<ShardStatus>,
}

// =============================================================================
// Sharded Cache
// =============================================================================

type Shard = Arc<dyn CacheBackend>;

/// Cache backend that partitions keys across shards
pub struct ShardedCache {
    config: ShardedCacheConfig,
    shards: Vec<Option<Shard>>,
    health: ShardHealthTable,
    fallback: Option<Shard>,
    executor: RwLock<Arc<dyn Detached>>,
    shutdown: CancellationToken,
}

impl ShardedCache {
    /// Build from pre-constructed shards. A `None` entry is a shard that
    /// failed to initialize; it stays unhealthy.
    pub fn new(shards: Vec<Option<Shard>>, config: ShardedCacheConfig) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::Config(
                "sharded cache requires at least one shard".into(),
            ));
        }

        let fallback: Option<Shard> = if config.fallback_enabled {
            Some(InMemoryCache::new(config.fallback.clone()))
        } else {
            None
        };

        let health = ShardHealthTable::new(shards.iter().map(Option::is_some));

        info!(
            shards = shards.len(),
            initialized = shards.iter().filter(|s| s.is_some()).count(),
            routing = ?config.routing,
            replication_factor = config.replication_factor,
            "Sharded cache initialized"
        );

        Ok(Self {
            config,
            shards,
            health,
            fallback,
            executor: RwLock::new(Arc::new(TokioDetached)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Connect one remote backend per config. Shards that fail to connect
    /// are logged and marked unhealthy instead of failing construction.
    pub async fn connect(
        shard_configs: Vec<RemoteCacheConfig>,
        config: ShardedCacheConfig,
    ) -> Result<Self> {
        let attempts = join_all(shard_configs.into_iter().map(RemoteCache::connect)).await;

        let shards = attempts
            .into_iter()
            .enumerate()
            .map(|(idx, result)| match result {
                Ok(cache) => Some(Arc::new(cache) as Shard),
                Err(e) => {
                    warn!(shard = idx, error = %e, "Failed to initialize shard");
                    None
                }
            })
            .collect();

        Self::new(shards, config)
    }

    /// Route replication through a different executor (e.g. the scheduler)
    pub fn set_executor(&self, executor: Arc<dyn Detached>) {
        *self.executor.write() = executor;
    }

    /// Get the configuration
    pub fn config(&self) -> &ShardedCacheConfig {
        &self.config
    }

    /// Number of configured shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Direct access to one shard
    pub fn shard(&self, idx: usize) -> Option<&Shard> {
        self.shards.get(idx).and_then(Option::as_ref)
    }

    /// The fallback tier, if enabled
    pub fn fallback(&self) -> Option<&Shard> {
        self.fallback.as_ref()
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Deterministic home shard of `key`, ignoring health
    pub fn shard_index(&self, key: &str) -> usize {
        let n = self.shards.len();
        match self.config.routing {
            RoutingMode::Consistent => crc32fast::hash(key.as_bytes()) as usize % n,
            RoutingMode::Simple => Sha256::digest(key.as_bytes())[0] as usize % n,
        }
    }

    fn usable(&self, idx: usize) -> bool {
        self.shards[idx].is_some() && self.health.is_healthy(idx)
    }

    /// Shard that will serve `key` right now: its home shard if healthy,
    /// otherwise the next healthy shard in wrap-around order.
    pub fn route(&self, key: &str) -> Option<usize> {
        let home = self.shard_index(key);
        let n = self.shards.len();
        (0..n).map(|i| (home + i) % n).find(|&idx| self.usable(idx))
    }

    /// Shards that hold `replica:<key>` copies: the next healthy shards
    /// after the home shard, up to `replication_factor - 1` of them. The
    /// shard currently serving the primary copy is never its own replica.
    pub fn replica_targets(&self, key: &str) -> Vec<usize> {
        let wanted = self.config.replication_factor.saturating_sub(1);
        if wanted == 0 {
            return Vec::new();
        }
        let home = self.shard_index(key);
        let primary = self.route(key);
        let n = self.shards.len();
        (1..n)
            .map(|i| (home + i) % n)
            .filter(|&idx| Some(idx) != primary && self.usable(idx))
            .take(wanted)
            .collect()
    }

    fn resolve(&self, key: &str) -> Result<(Option<usize>, &Shard)> {
        if let Some(idx) = self.route(key) {
            if let Some(shard) = &self.shards[idx] {
                return Ok((Some(idx), shard));
            }
        }
        match &self.fallback {
            Some(fallback) => {
                debug!(key, "No healthy shard, using fallback tier");
                Ok((None, fallback))
            }
            None => Err(Error::NoHealthyBackend),
        }
    }

    fn replicate(&self, key: &str, value: Bytes, ttl: Duration) {
        let targets: Vec<(usize, Shard)> = self
            .replica_targets(key)
            .into_iter()
            .filter_map(|idx| self.shards[idx].clone().map(|s| (idx, s)))
            .collect();
        if targets.is_empty() {
            return;
        }

        let replica_key = format!("{}{}", REPLICA_PREFIX, key);
        let job: TaskFn = Arc::new(move || -> TaskFuture {
            let targets = targets.clone();
            let replica_key = replica_key.clone();
            let value = value.clone();
            Box::pin(async move {
                let mut failures = 0usize;
                for (idx, shard) in &targets {
                    if let Err(e) = shard.set(&replica_key, value.clone(), ttl).await {
                        warn!(shard = idx, key = %replica_key, error = %e, "Replication failed");
                        failures += 1;
                    }
                }
                if failures == targets.len() {
                    return Err(Error::Internal(format!(
                        "replication of {} failed on every target",
                        replica_key
                    )));
                }
                Ok(())
            })
        });

        self.executor.read().run_detached("cache.replicate", job);
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Probe every shard once and apply transitions
    pub async fn check_shard_health(&self) {
        let probes = self.shards.iter().map(|shard| async move {
            match shard {
                None => Err(Error::NoHealthyBackend),
                Some(shard) => tokio::time::timeout(self.config.probe_timeout, shard.ping())
                    .await
                    .unwrap_or(Err(Error::DeadlineExceeded(self.config.probe_timeout))),
            }
        });
        let results = join_all(probes).await;
        let now = Instant::now();

        for (idx, result) in results.into_iter().enumerate() {
            let healthy = result.is_ok();
            match self
                .health
                .observe(idx, healthy, now, self.config.health_dwell)
            {
                Some(true) => info!(shard = idx, "Shard is now healthy"),
                Some(false) => warn!(
                    shard = idx,
                    error = %result.err().map(|e| e.to_string()).unwrap_or_default(),
                    "Shard is now unhealthy"
                ),
                None => {}
            }
        }
    }

    /// Operator override of one shard's status
    pub fn mark_shard_health(&self, idx: usize, healthy: bool) {
        if let Some(previous) = self.health.set(idx, healthy) {
            if previous != healthy {
                info!(shard = idx, healthy, "Shard status overridden");
            }
        }
    }

    /// Per-shard health flags
    pub fn health_status(&self) -> BTreeMap<usize, bool> {
        self.health.snapshot().into_iter().enumerate().collect()
    }

    /// Summarize shard health as a single check
    pub fn health_check(&self) -> HealthCheckResult {
        let total = self.shards.len();
        let healthy = (0..total).filter(|&i| self.usable(i)).count();
        match HealthStatus::from_ratio(healthy, total) {
            HealthStatus::Healthy => HealthCheckResult::healthy("shards"),
            HealthStatus::Degraded => HealthCheckResult::degraded(
                "shards",
                format!("{} of {} shards healthy", healthy, total),
            ),
            HealthStatus::Unhealthy if self.fallback.is_some() => {
                HealthCheckResult::degraded("shards", "all shards down, serving from fallback")
            }
            HealthStatus::Unhealthy => {
                HealthCheckResult::unhealthy("shards", "no healthy shards")
            }
        }
    }

    /// Topology and health summary
    pub fn stats(&self) -> ShardedStats {
        let flags = self.health.snapshot();
        let shards: Vec<ShardStatus> = self
            .shards
            .iter()
            .zip(flags)
            .enumerate()
            .map(|(index, (shard, healthy))| ShardStatus {
                index,
                healthy: healthy && shard.is_some(),
                initialized: shard.is_some(),
                backend: shard
                    .as_ref()
                    .map(|s| s.name().to_string())
                    .unwrap_or_else(|| "uninitialized".to_string()),
            })
            .collect();

        ShardedStats {
            shard_count: self.shards.len(),
            replication_factor: self.config.replication_factor,
            routing: self.config.routing,
            fallback_enabled: self.fallback.is_some(),
            healthy_shards: shards.iter().filter(|s| s.healthy).count(),
            shards,
        }
    }

    /// Start the periodic probe loop
    pub fn start_health_checks(self: &Arc<Self>) {
        if self.config.health_check_interval.is_zero() {
            return;
        }
        tokio::spawn(Self::health_loop(
            Arc::downgrade(self),
            self.config.health_check_interval,
            self.shutdown.clone(),
        ));
    }

    async fn health_loop(cache: Weak<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(cache) = cache.upgrade() else { break };
                    cache.check_shard_health().await;
                }
            }
        }
        debug!("Shard health loop stopped");
    }

    fn healthy_shards(&self) -> impl Iterator<Item = (usize, &Shard)> + '_ {
        self.shards
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.health.is_healthy(*idx))
            .filter_map(|(idx, s)| s.as_ref().map(|s| (idx, s)))
    }
}

#[async_trait]
impl CacheBackend for ShardedCache {
    fn name(&self) -> &str {
        "sharded"
    }

    fn attach_executor(&self, executor: Arc<dyn Detached>) {
        for shard in self.shards.iter().flatten() {
            shard.attach_executor(Arc::clone(&executor));
        }
        self.set_executor(executor);
    }

    fn evictions(&self) -> u64 {
        self.shards
            .iter()
            .flatten()
            .chain(self.fallback.iter())
            .map(|shard| shard.evictions())
            .sum()
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let (idx, shard) = self.resolve(key)?;
        match shard.get(key).await {
            // Failed over away from the home shard: the replica may be here
            Err(Error::NotFound) if idx.is_some() && idx != Some(self.shard_index(key)) => {
                shard.get(&format!("{}{}", REPLICA_PREFIX, key)).await
            }
            other => other,
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let (idx, shard) = self.resolve(key)?;
        shard.set(key, value.clone(), ttl).await?;
        if idx.is_some() && self.config.replication_factor > 1 {
            self.replicate(key, value, ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let replica_key = format!("{}{}", REPLICA_PREFIX, key);
        let timeout = self.config.probe_timeout;
        let mut succeeded = false;
        let mut last_err = None;

        for (idx, shard) in self
            .shards
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
        {
            // The replica copy is removed even when the primary delete fails
            for target in [key, replica_key.as_str()] {
                let result = tokio::time::timeout(timeout, shard.delete(target))
                    .await
                    .unwrap_or(Err(Error::DeadlineExceeded(timeout)));
                match result {
                    Ok(()) => succeeded = true,
                    Err(e) => {
                        warn!(shard = idx, key = target, error = %e, "Failed to delete from shard");
                        last_err = Some(e);
                    }
                }
            }
        }

        if let Some(fallback) = &self.fallback {
            match fallback.delete(key).await {
                Ok(()) => succeeded = true,
                Err(e) => last_err = Some(e),
            }
        }

        match (succeeded, last_err) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(Error::NoHealthyBackend),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let (_, shard) = self.resolve(key)?;
        shard.exists(key).await
    }

    async fn clear(&self) -> Result<()> {
        let mut last_err = None;
        for (idx, shard) in self.healthy_shards() {
            if let Err(e) = shard.clear().await {
                warn!(shard = idx, error = %e, "Failed to clear shard");
                last_err = Some(e);
            }
        }
        if let Some(fallback) = &self.fallback {
            fallback.clear().await?;
        }
        last_err.map_or(Ok(()), Err)
    }

    async fn get_ttl(&self, key: &str) -> Result<Duration> {
        let (_, shard) = self.resolve(key)?;
        shard.get_ttl(key).await
    }

    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        let (_, shard) = self.resolve(key)?;
        shard.set_nx(key, value, ttl).await
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let (_, shard) = self.resolve(key)?;
        shard.increment(key, delta).await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        for shard in self.shards.iter().flatten() {
            if let Err(e) = shard.close().await {
                warn!(backend = shard.name(), error = %e, "Failed to close shard");
            }
        }
        if let Some(fallback) = &self.fallback {
            fallback.close().await?;
        }
        info!("Sharded cache closed");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.route("").is_some() || self.fallback.is_some() {
            Ok(())
        } else {
            Err(Error::NoHealthyBackend)
        }
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
impl BulkCache for ShardedCache {
    async fn get_multiple(&self, keys: &[String]) -> Result<HashMap<String, Bytes>> {
        let mut groups: HashMap<Option<usize>, Vec<String>> = HashMap::new();
        for key in keys {
            let (idx, _) = self.resolve(key)?;
            groups.entry(idx).or_default().push(key.clone());
        }

        let mut found = HashMap::with_capacity(keys.len());
        for (idx, group) in groups {
            let shard = match idx {
                Some(i) => self.shard(i),
                None => self.fallback.as_ref(),
            }
            .ok_or(Error::NoHealthyBackend)?;

            match shard.as_bulk() {
                Some(bulk) => found.extend(bulk.get_multiple(&group).await?),
                None => {
                    for key in group {
                        match shard.get(&key).await {
                            Ok(v) => {
                                found.insert(key, v);
                            }
                            Err(Error::NotFound) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }
        Ok(found)
    }

    async fn set_multiple(&self, items: HashMap<String, Bytes>, ttl: Duration) -> Result<()> {
        for (key, value) in items {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PatternCache for ShardedCache {
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for (_, shard) in self.healthy_shards() {
            if let Some(p) = shard.as_pattern() {
                keys.extend(
                    p.keys_matching(pattern)
                        .await?
                        .into_iter()
                        .filter(|k| !k.starts_with(REPLICA_PREFIX)),
                );
            }
        }
        if let Some(p) = self.fallback.as_ref().and_then(|f| f.as_pattern()) {
            keys.extend(p.keys_matching(pattern).await?);
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        let mut deleted = 0;
        for (idx, shard) in self.healthy_shards() {
            match shard.as_pattern() {
                Some(p) => {
                    let primary = p.delete_by_pattern(pattern).await;
                    let replica_pattern = format!("{}{}", REPLICA_PREFIX, pattern);
                    if let Err(e) = p.delete_by_pattern(&replica_pattern).await {
                        warn!(shard = idx, pattern = %replica_pattern, error = %e, "Failed to delete replica keys");
                    }
                    deleted += primary?;
                }
                None => debug!(shard = idx, "Shard has no pattern support, skipped"),
            }
        }
        if let Some(p) = self.fallback.as_ref().and_then(|f| f.as_pattern()) {
            deleted += p.delete_by_pattern(pattern).await?;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl TaggedCache for ShardedCache {
    async fn set_with_tags(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
    ) -> Result<()> {
        let (idx, shard) = self.resolve(key)?;
        match shard.as_tagged() {
            Some(tagged) => tagged.set_with_tags(key, value.clone(), ttl, tags).await?,
            None => {
                warn!(backend = shard.name(), "Shard has no tag support, writing untagged");
                shard.set(key, value.clone(), ttl).await?;
            }
        }
        if idx.is_some() && self.config.replication_factor > 1 {
            self.replicate(key, value, ttl);
        }
        Ok(())
    }

    async fn invalidate_tag(&self, tag: &str) -> Result<u64> {
        let mut removed = 0;
        for (_, shard) in self.healthy_shards() {
            if let Some(tagged) = shard.as_tagged() {
                removed += tagged.invalidate_tag(tag).await?;
            }
        }
        if let Some(tagged) = self.fallback.as_ref().and_then(|f| f.as_tagged()) {
            removed += tagged.invalidate_tag(tag).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_shard() -> Shard {
        InMemoryCache::new(MemoryCacheConfig {
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        })
    }

    fn cluster(n: usize, config: ShardedCacheConfig) -> ShardedCache {
        let shards = (0..n).map(|_| Some(memory_shard())).collect();
        ShardedCache::new(shards, config).unwrap()
    }

    fn no_fallback() -> ShardedCacheConfig {
        ShardedCacheConfig {
            fallback_enabled: false,
            replication_factor: 1,
            health_check_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_a_shard() {
        assert!(matches!(
            ShardedCache::new(Vec::new(), no_fallback()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_routing_is_deterministic() {
        for routing in [RoutingMode::Consistent, RoutingMode::Simple] {
            let config = ShardedCacheConfig {
                routing,
                ..no_fallback()
            };
            let a = cluster(5, config.clone());
            let b = cluster(5, config);
            for key in ["alpha", "beta", "user:42", ""] {
                assert_eq!(a.shard_index(key), b.shard_index(key));
                assert_eq!(a.shard_index(key), a.shard_index(key));
                assert!(a.shard_index(key) < 5);
            }
        }
    }

    #[tokio::test]
    async fn test_consistent_routing_uses_crc32() {
        let cache = cluster(3, no_fallback());
        let expected = crc32fast::hash(b"w1") as usize % 3;
        assert_eq!(cache.shard_index("w1"), expected);
    }

    #[tokio::test]
    async fn test_failover_to_next_healthy_shard() {
        let cache = cluster(3, no_fallback());
        let home = cache.shard_index("key");
        cache.mark_shard_health(home, false);

        let routed = cache.route("key").unwrap();
        assert_eq!(routed, (home + 1) % 3);

        cache
            .set("key", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(
            cache.shard(routed).unwrap().get("key").await.unwrap(),
            Bytes::from_static(b"v")
        );
    }

    #[tokio::test]
    async fn test_all_unhealthy_without_fallback() {
        let cache = cluster(2, no_fallback());
        cache.mark_shard_health(0, false);
        cache.mark_shard_health(1, false);

        assert!(matches!(
            cache.get("k").await,
            Err(Error::NoHealthyBackend)
        ));
        assert!(matches!(
            cache.set("k", Bytes::new(), Duration::ZERO).await,
            Err(Error::NoHealthyBackend)
        ));
    }

    #[tokio::test]
    async fn test_all_unhealthy_uses_fallback() {
        let cache = cluster(
            2,
            ShardedCacheConfig {
                fallback_enabled: true,
                ..no_fallback()
            },
        );
        cache.mark_shard_health(0, false);
        cache.mark_shard_health(1, false);

        cache
            .set("k", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Bytes::from_static(b"v"));
        assert!(cache.fallback().unwrap().exists("k").await.unwrap());
        assert_eq!(cache.health_check().status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_uninitialized_shard_is_unhealthy() {
        let shards = vec![Some(memory_shard()), None, Some(memory_shard())];
        let cache = ShardedCache::new(shards, no_fallback()).unwrap();

        assert!(!cache.health_status()[&1]);
        let stats = cache.stats();
        assert_eq!(stats.healthy_shards, 2);
        assert!(!stats.shards[1].initialized);

        // Probing cannot revive a shard that never initialized
        cache.check_shard_health().await;
        assert!(!cache.health_status()[&1]);
    }

    #[tokio::test]
    async fn test_probe_restores_overridden_shard() {
        let cache = cluster(2, no_fallback());
        cache.mark_shard_health(0, false);
        cache.check_shard_health().await;
        assert!(cache.health_status()[&0]);
    }

    #[test]
    fn test_health_dwell_delays_flip() {
        let table = ShardHealthTable::new([true]);
        let dwell = Duration::from_secs(10);
        let start = Instant::now();

        assert_eq!(table.observe(0, false, start, dwell), None);
        assert!(table.is_healthy(0));
        assert_eq!(
            table.observe(0, false, start + Duration::from_secs(5), dwell),
            None
        );
        assert_eq!(
            table.observe(0, false, start + Duration::from_secs(10), dwell),
            Some(false)
        );
        assert!(!table.is_healthy(0));

        // One healthy probe is not enough to flip back
        assert_eq!(table.observe(0, true, start + Duration::from_secs(11), dwell), None);
        assert_eq!(table.observe(0, false, start + Duration::from_secs(12), dwell), None);
        assert!(!table.is_healthy(0));
    }

    #[tokio::test]
    async fn test_delete_reaches_every_shard() {
        let cache = cluster(3, no_fallback());
        for idx in 0..3 {
            cache
                .shard(idx)
                .unwrap()
                .set("stale", Bytes::from_static(b"x"), Duration::ZERO)
                .await
                .unwrap();
        }
        cache.delete("stale").await.unwrap();
        for idx in 0..3 {
            assert!(!cache.shard(idx).unwrap().exists("stale").await.unwrap());
        }
    }

    /// In-memory shard that can refuse primary-key deletes and counts
    /// executor attachments
    struct WrappedShard {
        inner: Arc<InMemoryCache>,
        refuse_deletes: bool,
        executors: std::sync::atomic::AtomicUsize,
    }

    impl WrappedShard {
        fn new(inner: Arc<InMemoryCache>, refuse_deletes: bool) -> Arc<Self> {
            Arc::new(Self {
                inner,
                refuse_deletes,
                executors: std::sync::atomic::AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CacheBackend for WrappedShard {
        fn name(&self) -> &str {
            "wrapped"
        }
        async fn get(&self, key: &str) -> Result<Bytes> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            if self.refuse_deletes && !key.starts_with(REPLICA_PREFIX) {
                return Err(Error::Internal("delete refused".into()));
            }
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }
        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
        async fn get_ttl(&self, key: &str) -> Result<Duration> {
            self.inner.get_ttl(key).await
        }
        async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
            self.inner.set_nx(key, value, ttl).await
        }
        async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
            self.inner.increment(key, delta).await
        }
        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
        fn attach_executor(&self, _executor: Arc<dyn Detached>) {
            self.executors
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn bare_memory() -> Arc<InMemoryCache> {
        InMemoryCache::new(MemoryCacheConfig {
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_replica_delete_survives_primary_failure() {
        let inner = bare_memory();
        let rejecting: Shard = WrappedShard::new(Arc::clone(&inner), true);
        let cache = ShardedCache::new(vec![Some(rejecting)], no_fallback()).unwrap();

        let replica_key = format!("{}k", REPLICA_PREFIX);
        inner
            .set("k", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();
        inner
            .set(&replica_key, Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();

        // The replica delete counts as a successful attempt
        cache.delete("k").await.unwrap();
        assert!(!inner.exists(&replica_key).await.unwrap());
        assert!(inner.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_executor_reaches_every_shard() {
        let shards: Vec<Arc<WrappedShard>> =
            (0..3).map(|_| WrappedShard::new(bare_memory(), false)).collect();
        let cache = ShardedCache::new(
            shards.iter().map(|s| Some(Arc::clone(s) as Shard)).collect(),
            no_fallback(),
        )
        .unwrap();

        cache.attach_executor(Arc::new(TokioDetached));
        for shard in &shards {
            assert_eq!(shard.executors.load(std::sync::atomic::Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_replica_targets_skip_home_and_unhealthy() {
        let cache = cluster(
            4,
            ShardedCacheConfig {
                replication_factor: 3,
                ..no_fallback()
            },
        );
        let home = cache.shard_index("k");
        cache.mark_shard_health((home + 1) % 4, false);

        let targets = cache.replica_targets("k");
        assert_eq!(targets, vec![(home + 2) % 4, (home + 3) % 4]);
    }

    #[tokio::test]
    async fn test_replicas_exclude_failed_over_primary() {
        let cache = cluster(
            4,
            ShardedCacheConfig {
                replication_factor: 3,
                ..no_fallback()
            },
        );
        let home = cache.shard_index("k");
        cache.mark_shard_health(home, false);

        let primary = cache.route("k");
        assert_eq!(primary, Some((home + 1) % 4));
        let targets = cache.replica_targets("k");
        assert_eq!(targets, vec![(home + 2) % 4, (home + 3) % 4]);
        assert!(!targets.contains(&((home + 1) % 4)));
    }

    #[tokio::test]
    async fn test_pattern_and_tags_fan_out() {
        let cache = cluster(3, no_fallback());
        let tags = vec!["t".to_string()];
        for key in ["p:1", "p:2", "p:3", "q:1"] {
            cache
                .set_with_tags(key, Bytes::from_static(b"v"), Duration::ZERO, &tags)
                .await
                .unwrap();
        }

        let mut keys = cache.keys_matching("p:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["p:1", "p:2", "p:3"]);
        assert_eq!(cache.delete_by_pattern("p:*").await.unwrap(), 3);
        assert_eq!(cache.invalidate_tag("t").await.unwrap(), 1);
    }
}
