//! Prometheus exposition
//!
//! Gauges are refreshed from the components' read-only snapshots, so the hot
//! paths never touch Prometheus types.

use once_cell::sync::Lazy;
use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::CoordinatorStats;
use crate::error::{Error, Result};
use crate::governor::GovernorMetrics;
use crate::pool::{CircuitState, PoolControllerStats};
use crate::scheduler::SchedulerStatsSnapshot;

static GLOBAL: Lazy<Option<RuntimeMetrics>> = Lazy::new(|| match RuntimeMetrics::new() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        tracing::error!(error = %e, "Failed to register runtime metrics");
        None
    }
});

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Internal(format!("metrics: {}", e))
    }
}

/// Runtime gauges on a private registry
pub struct RuntimeMetrics {
    registry: Registry,

    cache_hits: IntGauge,
    cache_misses: IntGauge,
    cache_errors: IntGauge,
    cache_hit_rate: Gauge,
    cache_latency_us: IntGauge,
    cache_bytes_saved: IntGauge,
    invalidation_queued: IntGauge,
    invalidation_dropped: IntGauge,
    healthy_shards: IntGauge,
    warmed_total: IntGauge,
    warm_success_rate: Gauge,

    tasks_submitted: IntGauge,
    tasks_completed: IntGauge,
    tasks_failed: IntGauge,
    tasks_dropped: IntGauge,
    tasks_queued: IntGauge,
    scheduler_workers: IntGauge,
    scheduler_utilization: Gauge,

    pool_max_open: IntGauge,
    pool_in_use: IntGauge,
    pool_average_usage: Gauge,
    pool_scale_events: IntGauge,
    breaker_state: IntGauge,

    lane_active: IntGaugeVec,
    lane_completed: IntGaugeVec,
    lane_failed: IntGaugeVec,
    process_resident_bytes: IntGauge,
}

impl RuntimeMetrics {
    /// Process-wide instance backing the binary's `/metrics`
    pub fn global() -> Option<&'static RuntimeMetrics> {
        GLOBAL.as_ref()
    }

    pub fn new() -> Result<Self> {
        let metrics = Self::build()?;
        metrics.register_all()?;
        Ok(metrics)
    }

    fn build() -> prometheus::Result<Self> {
        let int = |name: &str, help: &str| {
            IntGauge::with_opts(Opts::new(name, help).namespace("cachewarden"))
        };
        let float = |name: &str, help: &str| {
            Gauge::with_opts(Opts::new(name, help).namespace("cachewarden"))
        };
        let lanes = |name: &str, help: &str| {
            IntGaugeVec::new(Opts::new(name, help).namespace("cachewarden"), &["lane"])
        };

        Ok(Self {
            registry: Registry::new(),
            cache_hits: int("cache_hits", "Cache hits since last reset")?,
            cache_misses: int("cache_misses", "Cache misses since last reset")?,
            cache_errors: int("cache_errors", "Cache backend errors since last reset")?,
            cache_hit_rate: float("cache_hit_rate_percent", "Cache hit rate")?,
            cache_latency_us: int("cache_latency_microseconds", "Rolling average cache latency")?,
            cache_bytes_saved: int("cache_compression_bytes_saved", "Bytes saved by compression")?,
            invalidation_queued: int("invalidation_queued", "Invalidation jobs waiting")?,
            invalidation_dropped: int("invalidation_dropped", "Invalidation jobs dropped")?,
            healthy_shards: int("healthy_shards", "Shards currently healthy")?,
            warmed_total: int("warmer_items_total", "Items stored by the warmer")?,
            warm_success_rate: float("warmer_success_rate_percent", "Warmer success rate")?,
            tasks_submitted: int("tasks_submitted", "Background tasks submitted")?,
            tasks_completed: int("tasks_completed", "Background tasks completed")?,
            tasks_failed: int("tasks_failed", "Background tasks failed or dropped")?,
            tasks_dropped: int("tasks_dropped", "Background tasks dropped at submission")?,
            tasks_queued: int("tasks_queued", "Background tasks waiting")?,
            scheduler_workers: int("scheduler_workers", "Scheduler worker count")?,
            scheduler_utilization: float("scheduler_utilization", "Active over total workers")?,
            pool_max_open: int("pool_max_open", "Connection pool max open")?,
            pool_in_use: int("pool_in_use", "Connections in use")?,
            pool_average_usage: float("pool_average_usage_percent", "Rolling pool usage")?,
            pool_scale_events: int("pool_scale_events", "Pool resize events")?,
            breaker_state: int("circuit_breaker_state", "0 closed, 1 open, 2 half-open")?,
            lane_active: lanes("lane_active", "Governed tasks executing")?,
            lane_completed: lanes("lane_completed", "Governed tasks completed")?,
            lane_failed: lanes("lane_failed", "Governed tasks failed")?,
            process_resident_bytes: int("process_resident_bytes", "Resident memory")?,
        })
    }

    fn register_all(&self) -> Result<()> {
        let ints = [
            &self.cache_hits,
            &self.cache_misses,
            &self.cache_errors,
            &self.cache_latency_us,
            &self.cache_bytes_saved,
            &self.invalidation_queued,
            &self.invalidation_dropped,
            &self.healthy_shards,
            &self.warmed_total,
            &self.tasks_submitted,
            &self.tasks_completed,
            &self.tasks_failed,
            &self.tasks_dropped,
            &self.tasks_queued,
            &self.scheduler_workers,
            &self.pool_max_open,
            &self.pool_in_use,
            &self.pool_scale_events,
            &self.breaker_state,
            &self.process_resident_bytes,
        ];
        for gauge in ints {
            self.registry.register(Box::new(gauge.clone()))?;
        }
        for gauge in [
            &self.cache_hit_rate,
            &self.warm_success_rate,
            &self.scheduler_utilization,
            &self.pool_average_usage,
        ] {
            self.registry.register(Box::new(gauge.clone()))?;
        }
        for vec in [&self.lane_active, &self.lane_completed, &self.lane_failed] {
            self.registry.register(Box::new(vec.clone()))?;
        }
        Ok(())
    }

    pub fn observe_cache(&self, stats: &CoordinatorStats) {
        self.cache_hits.set(stats.metrics.hits as i64);
        self.cache_misses.set(stats.metrics.misses as i64);
        self.cache_errors.set(stats.metrics.errors as i64);
        self.cache_hit_rate.set(stats.metrics.hit_rate);
        self.cache_latency_us.set(stats.metrics.average_latency_us as i64);
        self.cache_bytes_saved.set(stats.metrics.bytes_saved as i64);
        self.invalidation_queued.set(stats.invalidation.queued as i64);
        self.invalidation_dropped.set(stats.invalidation.dropped as i64);
        if let Some(sharded) = &stats.sharded {
            self.healthy_shards.set(sharded.healthy_shards as i64);
        }
        if let Some(warmer) = &stats.warmer {
            self.warmed_total.set(warmer.total_warmed as i64);
            self.warm_success_rate.set(warmer.success_rate);
        }
    }

    pub fn observe_scheduler(&self, stats: &SchedulerStatsSnapshot) {
        self.tasks_submitted.set(stats.submitted as i64);
        self.tasks_completed.set(stats.completed as i64);
        self.tasks_failed.set(stats.failed as i64);
        self.tasks_dropped.set(stats.dropped as i64);
        self.tasks_queued.set(stats.queued as i64);
        self.scheduler_workers.set(stats.total_workers as i64);
        self.scheduler_utilization.set(stats.utilization);
    }

    pub fn observe_pool(&self, stats: &PoolControllerStats) {
        self.pool_max_open.set(stats.current.max_open as i64);
        self.pool_in_use.set(stats.current.in_use as i64);
        self.pool_average_usage.set(stats.average_usage);
        self.pool_scale_events.set(stats.scale_events as i64);
        self.breaker_state.set(match stats.breaker.state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        });
    }

    pub fn observe_governor(&self, metrics: &GovernorMetrics) {
        for lane in &metrics.lanes {
            let label = [lane.lane.as_str()];
            self.lane_active.with_label_values(&label).set(lane.active);
            self.lane_completed
                .with_label_values(&label)
                .set(lane.completed as i64);
            self.lane_failed.with_label_values(&label).set(lane.failed as i64);
        }
        self.process_resident_bytes
            .set(metrics.system.resident_memory as i64);
    }

    /// Text exposition of every registered gauge
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics: {}", e)))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheCoordinator, CoordinatorConfig, InMemoryCache};
    use crate::pool::{ConnectionPoolHandle, PoolController, PoolControllerConfig, PoolGauge};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_observe_and_encode() {
        let metrics = RuntimeMetrics::new().unwrap();

        let coordinator =
            CacheCoordinator::new(InMemoryCache::with_defaults(), CoordinatorConfig::default());
        coordinator.set("a", "1", Duration::from_secs(60)).await.unwrap();
        coordinator.get("a").await.unwrap();
        let _ = coordinator.get("missing").await;
        metrics.observe_cache(&coordinator.stats());

        let gauge = Arc::new(PoolGauge::new(20, 5));
        gauge.set_usage(10, 4);
        let pool: Arc<dyn ConnectionPoolHandle> = gauge;
        let controller = PoolController::new(pool, PoolControllerConfig::default()).unwrap();
        controller.collect();
        metrics.observe_pool(&controller.stats());

        let text = metrics.encode().unwrap();
        assert!(text.contains("cachewarden_cache_hits 1"));
        assert!(text.contains("cachewarden_cache_misses 1"));
        assert!(text.contains("cachewarden_pool_max_open 20"));
        assert!(text.contains("cachewarden_circuit_breaker_state 0"));
    }

    #[test]
    fn test_separate_registries() {
        assert!(RuntimeMetrics::new().is_ok());
        assert!(RuntimeMetrics::new().is_ok());
        assert!(RuntimeMetrics::global().unwrap().encode().is_ok());
    }
}
