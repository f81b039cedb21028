//! Cache Warmer
//!
//! Periodically pre-populates the cache from a [`DataStore`]. Each
//! [`WarmupStrategy`] names one kind of query; enabled strategies run
//! concurrently under a semaphore, highest priority first, once at start
//! and then on a fixed interval. A failing strategy never aborts the cycle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

// =============================================================================
// Collaborator contracts
// =============================================================================

/// Row returned by the data store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: String,
    pub body: serde_json::Value,
}

impl StoreRecord {
    pub fn new(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }
}

/// Read-only queries the warmer runs against the system of record
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Most frequently accessed items
    async fn frequent_items(&self, limit: usize) -> Result<Vec<StoreRecord>>;

    /// Items belonging to one tier
    async fn items_by_tier(&self, tier: u32, limit: usize) -> Result<Vec<StoreRecord>>;

    /// Results of a search query
    async fn search(&self, term: &str, limit: usize) -> Result<Vec<StoreRecord>>;

    /// Recently active entities
    async fn active_entities(&self, limit: usize) -> Result<Vec<StoreRecord>>;
}

/// Where warmed values go. Implemented by the cache coordinator.
#[async_trait]
pub trait WarmTarget: Send + Sync {
    /// Whether `key` is already cached. Errors count as "not cached".
    async fn contains(&self, key: &str) -> bool;

    /// Serialize `value` and store it under `key`
    async fn store_json(&self, key: &str, value: &serde_json::Value, ttl: Duration) -> Result<()>;
}

// =============================================================================
// Configuration
// =============================================================================

/// Which store query a strategy runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupKind {
    /// `item:{id}` per record
    FrequentItems,
    /// `items:tier:{tier}` holding the tier's records
    ItemsByTier,
    /// `search:{term}` holding the query's results
    PopularQueries,
    /// `entity:{id}` per record
    ActiveEntities,
}

/// Strategy parameters; each kind reads the fields it needs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupParams {
    /// Record limit for frequent items and items by tier. Falls back to the
    /// warmer's batch size.
    pub limit: Option<usize>,
    pub tiers: Vec<u32>,
    pub terms: Vec<String>,
    /// Results cached per search term
    pub results_per_term: usize,
    pub entity_limit: usize,
}

impl Default for WarmupParams {
    fn default() -> Self {
        Self {
            limit: None,
            tiers: (1..=7).collect(),
            terms: [
                "business",
                "technology",
                "education",
                "environment",
                "health",
                "travel",
                "finance",
                "communication",
                "culture",
                "science",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            results_per_term: 20,
            entity_limit: 100,
        }
    }
}

/// Named warmup strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupStrategy {
    pub name: String,
    pub kind: WarmupKind,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Higher runs first
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub params: WarmupParams,
}

fn default_true() -> bool {
    true
}

impl WarmupStrategy {
    pub fn new(name: impl Into<String>, kind: WarmupKind, ttl: Duration, priority: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            ttl,
            priority,
            enabled: true,
            params: WarmupParams::default(),
        }
    }

    pub fn with_params(mut self, params: WarmupParams) -> Self {
        self.params = params;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Warmer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmerConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Default record limit per query
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub strategies: Vec<WarmupStrategy>,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        let hour = Duration::from_secs(3600);
        Self {
            enabled: true,
            interval: hour,
            batch_size: 1000,
            max_concurrency: 5,
            strategies: vec![
                WarmupStrategy::new("frequent-items", WarmupKind::FrequentItems, 2 * hour, 1)
                    .with_params(WarmupParams {
                        limit: Some(1000),
                        ..Default::default()
                    }),
                WarmupStrategy::new("items-by-tier", WarmupKind::ItemsByTier, 2 * hour, 2)
                    .with_params(WarmupParams {
                        limit: Some(500),
                        ..Default::default()
                    }),
                WarmupStrategy::new("popular-queries", WarmupKind::PopularQueries, hour, 3),
                // Off by default: entity snapshots may hold personal data
                WarmupStrategy::new(
                    "active-entities",
                    WarmupKind::ActiveEntities,
                    Duration::from_secs(30 * 60),
                    5,
                )
                .disabled(),
            ],
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Outcome of the most recent warmup cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmupStats {
    pub last_run: Option<DateTime<Utc>>,
    pub total_warmed: u64,
    #[serde(with = "humantime_serde")]
    pub last_duration: Duration,
    /// warmed / (warmed + failed strategies) × 100
    pub success_rate: f64,
    pub error_count: u64,
    /// Items warmed per strategy name; failed strategies record zero
    pub per_strategy: BTreeMap<String, u64>,
    pub cycles: u64,
}

// =============================================================================
// Warmer
// =============================================================================

/// Runs warmup strategies against a [`WarmTarget`]
pub struct CacheWarmer {
    config: WarmerConfig,
    target: Weak<dyn WarmTarget>,
    store: Arc<dyn DataStore>,
    stats: RwLock<WarmupStats>,
    running: AtomicBool,
    shutdown: Mutex<CancellationToken>,
}

impl std::fmt::Debug for CacheWarmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWarmer")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl CacheWarmer {
    /// The warmer does not keep `target` alive; cycles stop once it is gone.
    pub fn new(
        target: Weak<dyn WarmTarget>,
        store: Arc<dyn DataStore>,
        config: WarmerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            target,
            store,
            stats: RwLock::new(WarmupStats::default()),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn config(&self) -> &WarmerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WarmupStats {
        self.stats.read().clone()
    }

    /// Run one cycle immediately, then one every interval
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.config.enabled {
            info!("Cache warming is disabled");
            return Ok(());
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning("cache warmer".into()));
        }

        let token = {
            let mut guard = self.shutdown.lock();
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };

        info!(
            strategies = self.config.strategies.len(),
            interval = ?self.config.interval,
            "Starting cache warmer"
        );
        tokio::spawn(Arc::clone(self).warm_loop(token));
        Ok(())
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.shutdown.lock().cancel();
            info!("Cache warmer stopped");
        }
    }

    async fn warm_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Cache warmup cycle failed");
                        if matches!(e, Error::ShuttingDown) {
                            break;
                        }
                    }
                }
            }
        }
        self.running.store(false, Ordering::Release);
        debug!("Warm loop exited");
    }

    /// Run every enabled strategy once and record the outcome
    pub async fn run_once(&self) -> Result<WarmupStats> {
        let target = self.target.upgrade().ok_or(Error::ShuttingDown)?;
        let started = Instant::now();

        let mut strategies: Vec<&WarmupStrategy> =
            self.config.strategies.iter().filter(|s| s.enabled).collect();
        strategies.sort_by(|a, b| b.priority.cmp(&a.priority));

        info!(strategies = strategies.len(), "Starting cache warmup cycle");

        let semaphore = Semaphore::new(self.config.max_concurrency.max(1));
        let runs = strategies.iter().map(|strategy| {
            let semaphore = &semaphore;
            let target = target.as_ref();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| Error::ShuttingDown)?;
                self.execute(target, strategy).await
            }
        });
        let outcomes = join_all(runs).await;

        let mut total_warmed = 0u64;
        let mut error_count = 0u64;
        let mut per_strategy = BTreeMap::new();
        for (strategy, outcome) in strategies.iter().zip(outcomes) {
            match outcome {
                Ok(count) => {
                    total_warmed += count;
                    per_strategy.insert(strategy.name.clone(), count);
                    debug!(strategy = %strategy.name, count, "Warmup strategy completed");
                }
                Err(e) => {
                    error_count += 1;
                    per_strategy.insert(strategy.name.clone(), 0);
                    error!(strategy = %strategy.name, error = %e, "Warmup strategy failed");
                }
            }
        }

        let attempts = total_warmed + error_count;
        let duration = started.elapsed();
        let snapshot = {
            let mut stats = self.stats.write();
            stats.last_run = Some(Utc::now());
            stats.total_warmed = total_warmed;
            stats.last_duration = duration;
            stats.success_rate = if attempts == 0 {
                0.0
            } else {
                total_warmed as f64 / attempts as f64 * 100.0
            };
            stats.error_count = error_count;
            stats.per_strategy = per_strategy;
            stats.cycles += 1;
            stats.clone()
        };

        info!(
            warmed = total_warmed,
            errors = error_count,
            duration_ms = duration.as_millis() as u64,
            success_rate = snapshot.success_rate,
            "Cache warmup completed"
        );
        Ok(snapshot)
    }

    async fn execute(&self, target: &dyn WarmTarget, strategy: &WarmupStrategy) -> Result<u64> {
        let params = &strategy.params;
        let limit = params.limit.unwrap_or(self.config.batch_size);

        match strategy.kind {
            WarmupKind::FrequentItems => {
                let records = self.store.frequent_items(limit).await?;
                Ok(store_each(target, "item", &records, strategy.ttl).await)
            }
            WarmupKind::ActiveEntities => {
                let records = self.store.active_entities(params.entity_limit).await?;
                Ok(store_each(target, "entity", &records, strategy.ttl).await)
            }
            WarmupKind::ItemsByTier => {
                let per_tier = (limit / params.tiers.len().max(1)).max(1);
                let mut count = 0;
                for &tier in &params.tiers {
                    let key = format!("items:tier:{}", tier);
                    if target.contains(&key).await {
                        continue;
                    }
                    match self.store.items_by_tier(tier, per_tier).await {
                        Ok(records) => {
                            if store_list(target, &key, &records, strategy.ttl).await {
                                count += 1;
                            }
                        }
                        Err(e) => warn!(tier, error = %e, "Tier query failed"),
                    }
                }
                Ok(count)
            }
            WarmupKind::PopularQueries => {
                let mut count = 0;
                for term in &params.terms {
                    let key = format!("search:{}", term);
                    if target.contains(&key).await {
                        continue;
                    }
                    match self.store.search(term, params.results_per_term).await {
                        Ok(records) => {
                            if store_list(target, &key, &records, strategy.ttl).await {
                                count += 1;
                            }
                        }
                        Err(e) => warn!(term = %term, error = %e, "Search query failed"),
                    }
                }
                Ok(count)
            }
        }
    }
}

impl Drop for CacheWarmer {
    fn drop(&mut self) {
        self.shutdown.lock().cancel();
    }
}

/// Store each record under `{prefix}:{id}`, skipping cached ones
async fn store_each(
    target: &dyn WarmTarget,
    prefix: &str,
    records: &[StoreRecord],
    ttl: Duration,
) -> u64 {
    let mut count = 0;
    for record in records {
        let key = format!("{}:{}", prefix, record.id);
        if target.contains(&key).await {
            continue;
        }
        match target.store_json(&key, &record.body, ttl).await {
            Ok(()) => count += 1,
            Err(e) => debug!(key = %key, error = %e, "Failed to store warmed item"),
        }
    }
    count
}

async fn store_list(
    target: &dyn WarmTarget,
    key: &str,
    records: &[StoreRecord],
    ttl: Duration,
) -> bool {
    let bodies = serde_json::Value::Array(records.iter().map(|r| r.body.clone()).collect());
    match target.store_json(key, &bodies, ttl).await {
        Ok(()) => true,
        Err(e) => {
            debug!(key = %key, error = %e, "Failed to store warmed list");
            false
        }
    }
}
