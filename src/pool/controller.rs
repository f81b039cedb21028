//! Pool auto-scaling controller
//!
//! Every monitor tick samples the pool, updates the rolling utilization, and
//! resizes `max_open` by one step when the average leaves the
//! [`scale_down_threshold`, `scale_up_threshold`] band. Threshold breaches on
//! usage, wait time and wait count are logged only.
//!
//! [`scale_down_threshold`]: PoolControllerConfig::scale_down_threshold
//! [`scale_up_threshold`]: PoolControllerConfig::scale_up_threshold

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use super::{ConnectionPoolHandle, PoolStats};
use crate::error::{Error, Result};

/// Samples in the rolling utilization average
const ROLLING_WINDOW: usize = 10;

/// Floor for the idle connection limit after a resize
const MIN_IDLE_FLOOR: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolAlertThresholds {
    /// Usage percentage that triggers a warning
    pub high_usage: f64,
    #[serde(with = "humantime_serde")]
    pub long_wait: Duration,
    pub too_many_waits: u64,
}

impl Default for PoolAlertThresholds {
    fn default() -> Self {
        Self {
            high_usage: 90.0,
            long_wait: Duration::from_secs(5),
            too_many_waits: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolControllerConfig {
    /// Limits applied to the pool when the controller is created
    pub initial_max_open: Option<u32>,
    pub initial_max_idle: Option<u32>,
    /// Floor for `max_open`
    pub min_max_open: u32,
    /// Ceiling for `max_open`
    pub max_max_open: u32,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_step: u32,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub stats_retention: Duration,
    /// Upper bound on stored samples and scale events
    pub max_history: usize,
    pub auto_scale: bool,
    pub alerts: PoolAlertThresholds,
    pub breaker: CircuitBreakerConfig,
}

impl Default for PoolControllerConfig {
    fn default() -> Self {
        Self {
            initial_max_open: None,
            initial_max_idle: None,
            min_max_open: 10,
            max_max_open: 100,
            scale_up_threshold: 80.0,
            scale_down_threshold: 30.0,
            scale_step: 5,
            cooldown: Duration::from_secs(120),
            monitor_interval: Duration::from_secs(30),
            stats_retention: Duration::from_secs(24 * 3600),
            max_history: 2880,
            auto_scale: true,
            alerts: PoolAlertThresholds::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl PoolControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_max_open == 0 || self.min_max_open > self.max_max_open {
            return Err(Error::Config(format!(
                "pool bounds must satisfy 0 < min_max_open ({}) <= max_max_open ({})",
                self.min_max_open, self.max_max_open
            )));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(Error::Config(
                "scale_down_threshold must be below scale_up_threshold".to_string(),
            ));
        }
        if self.scale_step == 0 {
            return Err(Error::Config("scale_step must be positive".to_string()));
        }
        if let Some(max_open) = self.initial_max_open {
            if max_open < self.min_max_open || max_open > self.max_max_open {
                return Err(Error::Config(format!(
                    "initial_max_open ({}) must lie within [{}, {}]",
                    max_open, self.min_max_open, self.max_max_open
                )));
            }
        }
        if let (Some(max_idle), Some(max_open)) = (self.initial_max_idle, self.initial_max_open) {
            if max_idle > max_open {
                return Err(Error::Config(format!(
                    "initial_max_idle ({}) exceeds initial_max_open ({})",
                    max_idle, max_open
                )));
            }
        }
        self.breaker.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

/// One resize of the pool
#[derive(Debug, Clone, Serialize)]
pub struct ScaleEvent {
    pub timestamp: DateTime<Utc>,
    pub direction: ScaleDirection,
    pub old_max_open: u32,
    pub new_max_open: u32,
    pub new_max_idle: u32,
    pub reason: &'static str,
    pub usage_percent: f64,
}

/// Pool counters at one monitor tick
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub timestamp: DateTime<Utc>,
    pub stats: PoolStats,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolControllerStats {
    pub current: PoolStats,
    pub peak_usage: f64,
    pub average_usage: f64,
    pub samples: usize,
    pub scale_events: u64,
    pub last_scale_at: Option<DateTime<Utc>>,
    pub auto_scaling: bool,
    pub breaker: CircuitBreakerStats,
}

#[derive(Debug, Default)]
struct Sampling {
    current: PoolStats,
    history: VecDeque<PoolSnapshot>,
    peak_usage: f64,
    average_usage: f64,
    last_scale: Option<Instant>,
    last_scale_at: Option<DateTime<Utc>>,
    scale_events: u64,
}

pub struct PoolController {
    config: PoolControllerConfig,
    pool: Arc<dyn ConnectionPoolHandle>,
    breaker: CircuitBreaker,
    auto_scale: AtomicBool,
    sampling: Mutex<Sampling>,
    scale_history: RwLock<VecDeque<ScaleEvent>>,
    shutdown: Mutex<CancellationToken>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PoolController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolController")
            .field("config", &self.config)
            .field("auto_scale", &self.auto_scale.load(Ordering::Relaxed))
            .finish()
    }
}

impl PoolController {
    pub fn new(pool: Arc<dyn ConnectionPoolHandle>, config: PoolControllerConfig) -> Result<Arc<Self>> {
        config.validate()?;

        if let Some(max_open) = config.initial_max_open {
            pool.set_max_open(max_open);
        }
        if let Some(max_idle) = config.initial_max_idle {
            pool.set_max_idle(max_idle.min(pool.stats().max_open));
        }

        info!(
            min_max_open = config.min_max_open,
            max_max_open = config.max_max_open,
            auto_scale = config.auto_scale,
            "Pool controller initialized"
        );

        Ok(Arc::new(Self {
            breaker: CircuitBreaker::new("connection_pool", config.breaker.clone()),
            auto_scale: AtomicBool::new(config.auto_scale),
            pool,
            config,
            sampling: Mutex::new(Sampling::default()),
            scale_history: RwLock::new(VecDeque::new()),
            shutdown: Mutex::new(CancellationToken::new()),
            monitor: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &PoolControllerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<dyn ConnectionPoolHandle> {
        &self.pool
    }

    /// Start the monitor loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(Error::AlreadyRunning("pool controller".to_string()));
        }

        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();

        let controller = Arc::clone(self);
        *monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.config.monitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        controller.tick();
                    }
                }
            }
            debug!("Pool monitor stopped");
        }));
        info!(interval = ?self.config.monitor_interval, "Pool monitor started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.shutdown.lock().cancel();
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Pool controller stopped");
    }

    /// One monitoring pass: sample, maybe resize, log breaches
    pub fn tick(&self) -> Option<ScaleEvent> {
        self.collect();
        let event = self.check_and_scale();
        self.check_alerts();
        event
    }

    /// Sample the pool into the history and update the rolling average
    pub fn collect(&self) -> PoolSnapshot {
        let stats = self.pool.stats();
        let snapshot = PoolSnapshot {
            timestamp: Utc::now(),
            stats,
            usage_percent: stats.usage_percent(),
        };

        let mut sampling = self.sampling.lock();
        sampling.current = stats;
        sampling.history.push_back(snapshot.clone());
        if snapshot.usage_percent > sampling.peak_usage {
            sampling.peak_usage = snapshot.usage_percent;
        }

        let window = sampling.history.len().min(ROLLING_WINDOW);
        let total: f64 = sampling
            .history
            .iter()
            .rev()
            .take(window)
            .map(|s| s.usage_percent)
            .sum();
        sampling.average_usage = total / window as f64;

        self.prune(&mut sampling.history);
        snapshot
    }

    /// Resize the pool when the rolling average leaves the threshold band
    pub fn check_and_scale(&self) -> Option<ScaleEvent> {
        if !self.auto_scale.load(Ordering::Relaxed) {
            return None;
        }

        let mut sampling = self.sampling.lock();
        if sampling.history.is_empty() {
            return None;
        }
        if sampling
            .last_scale
            .is_some_and(|at| at.elapsed() < self.config.cooldown)
        {
            return None;
        }

        let usage = sampling.average_usage;
        let max_open = sampling.current.max_open;
        let (floor, ceiling) = (self.config.min_max_open, self.config.max_max_open);

        let (direction, target, reason) =
            if usage > self.config.scale_up_threshold && max_open < ceiling {
                (
                    ScaleDirection::Up,
                    max_open.saturating_add(self.config.scale_step),
                    "high_usage",
                )
            } else if usage < self.config.scale_down_threshold && max_open > floor {
                (
                    ScaleDirection::Down,
                    max_open.saturating_sub(self.config.scale_step),
                    "low_usage",
                )
            } else {
                return None;
            };

        let new_max_open = target.clamp(floor, ceiling);
        if new_max_open == max_open {
            return None;
        }
        let new_max_idle = (new_max_open / 3).max(MIN_IDLE_FLOOR).min(new_max_open);

        self.pool.set_max_open(new_max_open);
        self.pool.set_max_idle(new_max_idle);

        let event = ScaleEvent {
            timestamp: Utc::now(),
            direction,
            old_max_open: max_open,
            new_max_open,
            new_max_idle,
            reason,
            usage_percent: usage,
        };

        sampling.current.max_open = new_max_open;
        sampling.last_scale = Some(Instant::now());
        sampling.last_scale_at = Some(event.timestamp);
        sampling.scale_events += 1;
        drop(sampling);

        let mut history = self.scale_history.write();
        history.push_back(event.clone());
        while history.len() > self.config.max_history.max(1) {
            history.pop_front();
        }

        info!(
            direction = ?direction,
            old = max_open,
            new = new_max_open,
            max_idle = new_max_idle,
            usage = format!("{:.1}%", usage),
            "Resized connection pool"
        );
        Some(event)
    }

    /// Log threshold breaches for the latest sample. Returns the breached alerts.
    pub fn check_alerts(&self) -> Vec<&'static str> {
        let stats = self.sampling.lock().current;
        let thresholds = &self.config.alerts;
        let mut breached = Vec::new();

        let usage = stats.usage_percent();
        if stats.max_open > 0 && usage > thresholds.high_usage {
            warn!(
                usage = format!("{:.1}%", usage),
                in_use = stats.in_use,
                max_open = stats.max_open,
                "High connection pool usage"
            );
            breached.push("high_usage");
        }
        if stats.wait_duration > thresholds.long_wait {
            warn!(
                wait = ?stats.wait_duration,
                wait_count = stats.wait_count,
                "Long connection pool wait time"
            );
            breached.push("long_wait");
        }
        if stats.wait_count > thresholds.too_many_waits {
            warn!(wait_count = stats.wait_count, "High connection pool wait count");
            breached.push("too_many_waits");
        }
        breached
    }

    pub fn stats(&self) -> PoolControllerStats {
        let sampling = self.sampling.lock();
        PoolControllerStats {
            current: sampling.current,
            peak_usage: sampling.peak_usage,
            average_usage: sampling.average_usage,
            samples: sampling.history.len(),
            scale_events: sampling.scale_events,
            last_scale_at: sampling.last_scale_at,
            auto_scaling: self.auto_scale.load(Ordering::Relaxed),
            breaker: self.breaker.stats(),
        }
    }

    pub fn history(&self) -> Vec<PoolSnapshot> {
        self.sampling.lock().history.iter().cloned().collect()
    }

    pub fn scale_history(&self) -> Vec<ScaleEvent> {
        self.scale_history.read().iter().cloned().collect()
    }

    pub fn set_auto_scaling(&self, enabled: bool) {
        self.auto_scale.store(enabled, Ordering::Relaxed);
        info!(enabled, "Connection pool auto-scaling toggled");
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn is_circuit_open(&self) -> bool {
        self.breaker.is_open()
    }

    pub fn record_success(&self) {
        self.breaker.record_success();
    }

    pub fn record_failure(&self) {
        self.breaker.record_failure();
    }

    /// Clear samples, scale history and the breaker
    pub fn reset_stats(&self) {
        *self.sampling.lock() = Sampling::default();
        self.scale_history.write().clear();
        self.breaker.reset();
        info!("Connection pool statistics reset");
    }

    fn prune(&self, history: &mut VecDeque<PoolSnapshot>) {
        let retention = chrono::Duration::from_std(self.config.stats_retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(retention);
        if let Some(cutoff) = cutoff {
            while history.front().is_some_and(|s| s.timestamp < cutoff) {
                history.pop_front();
            }
        }
        while history.len() > self.config.max_history.max(1) {
            history.pop_front();
        }
    }
}

impl Drop for PoolController {
    fn drop(&mut self) {
        self.shutdown.lock().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolGauge;
    use proptest::prelude::*;

    fn controller(gauge: &Arc<PoolGauge>, config: PoolControllerConfig) -> Arc<PoolController> {
        let pool: Arc<dyn ConnectionPoolHandle> = gauge.clone();
        PoolController::new(pool, config).unwrap()
    }

    fn fast_config() -> PoolControllerConfig {
        PoolControllerConfig {
            min_max_open: 10,
            max_max_open: 30,
            cooldown: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolControllerConfig::default().validate().is_ok());
        let bad = PoolControllerConfig {
            min_max_open: 50,
            max_max_open: 10,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = PoolControllerConfig {
            scale_down_threshold: 90.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_initial_limits_must_respect_bounds() {
        let gauge = Arc::new(PoolGauge::new(10, 5));
        let pool: Arc<dyn ConnectionPoolHandle> = gauge.clone();
        let oversized = PoolControllerConfig {
            min_max_open: 5,
            max_max_open: 100,
            initial_max_open: Some(500),
            ..Default::default()
        };
        assert_matches::assert_matches!(
            PoolController::new(Arc::clone(&pool), oversized),
            Err(Error::Config(_))
        );
        assert_eq!(gauge.max_open(), 10);

        let undersized = PoolControllerConfig {
            min_max_open: 5,
            max_max_open: 100,
            initial_max_open: Some(2),
            ..Default::default()
        };
        assert!(undersized.validate().is_err());

        let idle_above_open = PoolControllerConfig {
            initial_max_open: Some(20),
            initial_max_idle: Some(30),
            ..Default::default()
        };
        assert!(idle_above_open.validate().is_err());

        let idle_only = PoolControllerConfig {
            initial_max_idle: Some(50),
            ..Default::default()
        };
        PoolController::new(pool, idle_only).unwrap();
        assert_eq!(gauge.max_idle(), 10);

        let breaker_never_closes = PoolControllerConfig {
            breaker: CircuitBreakerConfig {
                max_failures: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(breaker_never_closes.validate().is_err());
    }

    #[tokio::test]
    async fn test_scales_up_on_high_usage() {
        let gauge = Arc::new(PoolGauge::new(20, 5));
        gauge.set_usage(20, 19);
        let ctl = controller(&gauge, fast_config());

        let event = ctl.tick().unwrap();
        assert_eq!(event.direction, ScaleDirection::Up);
        assert_eq!(event.old_max_open, 20);
        assert_eq!(event.new_max_open, 25);
        assert_eq!(gauge.max_open(), 25);
        assert_eq!(gauge.max_idle(), 8);
        assert_eq!(ctl.scale_history().len(), 1);
    }

    #[tokio::test]
    async fn test_scales_down_and_floors_idle() {
        let gauge = Arc::new(PoolGauge::new(15, 5));
        gauge.set_usage(2, 1);
        let ctl = controller(&gauge, fast_config());

        let event = ctl.tick().unwrap();
        assert_eq!(event.direction, ScaleDirection::Down);
        assert_eq!(gauge.max_open(), 10);
        assert_eq!(gauge.max_idle(), 5);

        // Already at the floor
        assert!(ctl.tick().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_rescale() {
        let gauge = Arc::new(PoolGauge::new(20, 5));
        gauge.set_usage(20, 20);
        let ctl = controller(
            &gauge,
            PoolControllerConfig {
                max_max_open: 100,
                ..Default::default()
            },
        );

        assert!(ctl.tick().is_some());
        assert!(ctl.tick().is_none());

        tokio::time::advance(Duration::from_secs(121)).await;
        gauge.set_usage(25, 25);
        assert!(ctl.tick().is_some());
        assert_eq!(gauge.max_open(), 30);
    }

    #[tokio::test]
    async fn test_rolling_average_uses_last_ten() {
        let gauge = Arc::new(PoolGauge::new(100, 10));
        let ctl = controller(
            &gauge,
            PoolControllerConfig {
                auto_scale: false,
                ..Default::default()
            },
        );

        gauge.set_usage(100, 100);
        for _ in 0..5 {
            ctl.collect();
        }
        gauge.set_usage(100, 50);
        for _ in 0..10 {
            ctl.collect();
        }

        let stats = ctl.stats();
        assert_eq!(stats.samples, 15);
        assert!((stats.average_usage - 50.0).abs() < 1e-9);
        assert!((stats.peak_usage - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_auto_scaling_toggle_and_reset() {
        let gauge = Arc::new(PoolGauge::new(20, 5));
        gauge.set_usage(20, 20);
        let ctl = controller(&gauge, fast_config());

        ctl.set_auto_scaling(false);
        assert!(ctl.tick().is_none());
        assert!(!ctl.stats().auto_scaling);

        ctl.set_auto_scaling(true);
        assert!(ctl.tick().is_some());
        ctl.record_failure();

        ctl.reset_stats();
        let stats = ctl.stats();
        assert_eq!(stats.samples, 0);
        assert_eq!(stats.scale_events, 0);
        assert_eq!(stats.breaker.total_failures, 0);
        assert!(ctl.scale_history().is_empty());
    }

    #[test]
    fn test_alerts_only_report() {
        let gauge = Arc::new(PoolGauge::new(10, 5));
        gauge.set_usage(10, 10);
        for _ in 0..150 {
            gauge.record_wait(Duration::from_millis(50));
        }
        let ctl = controller(
            &gauge,
            PoolControllerConfig {
                auto_scale: false,
                ..Default::default()
            },
        );
        ctl.collect();

        let alerts = ctl.check_alerts();
        assert_eq!(alerts, vec!["high_usage", "long_wait", "too_many_waits"]);
        assert_eq!(gauge.max_open(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_loop_ticks() {
        let gauge = Arc::new(PoolGauge::new(20, 5));
        gauge.set_usage(20, 20);
        let ctl = controller(
            &gauge,
            PoolControllerConfig {
                monitor_interval: Duration::from_secs(1),
                ..fast_config()
            },
        );

        ctl.start().unwrap();
        assert!(matches!(ctl.start(), Err(Error::AlreadyRunning(_))));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(ctl.stats().samples >= 1);
        assert_eq!(gauge.max_open(), 25);

        ctl.stop().await;
    }

    proptest! {
        #[test]
        fn prop_resize_stays_within_bounds(
            floor in 1u32..50,
            span in 0u32..100,
            start in 0u32..200,
            in_use_pct in 0u32..=100,
            step in 1u32..40,
        ) {
            let ceiling = floor + span;
            let gauge = Arc::new(PoolGauge::new(start, 0));
            let in_use = start * in_use_pct / 100;
            gauge.set_usage(start, in_use);

            let pool: Arc<dyn ConnectionPoolHandle> = gauge.clone();
            let ctl = PoolController::new(pool, PoolControllerConfig {
                min_max_open: floor,
                max_max_open: ceiling,
                scale_step: step,
                cooldown: Duration::ZERO,
                ..Default::default()
            }).unwrap();

            if let Some(event) = ctl.tick() {
                prop_assert!(event.new_max_open >= floor && event.new_max_open <= ceiling);
                prop_assert!(event.new_max_idle <= event.new_max_open);
                prop_assert_eq!(gauge.max_open(), event.new_max_open);
            }
        }
    }
}
