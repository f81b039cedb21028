//! Connection Pool Control
//!
//! Auto-scaling and failure isolation for an external connection pool that
//! is reached only through [`ConnectionPoolHandle`].

mod circuit_breaker;
mod controller;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use controller::{
    PoolAlertThresholds, PoolController, PoolControllerConfig, PoolControllerStats, PoolSnapshot,
    ScaleDirection, ScaleEvent,
};

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Point-in-time counters reported by a connection pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub max_open: u32,
    pub open: u32,
    pub in_use: u32,
    pub idle: u32,
    /// Cumulative number of callers that had to wait for a connection
    pub wait_count: u64,
    /// Cumulative time spent waiting
    #[serde(with = "humantime_serde")]
    pub wait_duration: Duration,
}

impl PoolStats {
    /// In-use connections as a percentage of the configured maximum
    pub fn usage_percent(&self) -> f64 {
        if self.max_open == 0 {
            return 0.0;
        }
        self.in_use as f64 / self.max_open as f64 * 100.0
    }
}

/// External connection pool the controller and governor observe and resize
pub trait ConnectionPoolHandle: Send + Sync {
    fn stats(&self) -> PoolStats;

    fn set_max_open(&self, max_open: u32);

    fn set_max_idle(&self, max_idle: u32);
}

/// Atomic [`ConnectionPoolHandle`] for pools that report their own counters.
///
/// The pool owner publishes usage through the setters; the controller writes
/// limits back, which the owner reads with [`PoolGauge::max_open`].
#[derive(Debug, Default)]
pub struct PoolGauge {
    max_open: AtomicU32,
    max_idle: AtomicU32,
    open: AtomicU32,
    in_use: AtomicU32,
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
}

impl PoolGauge {
    pub fn new(max_open: u32, max_idle: u32) -> Self {
        Self {
            max_open: AtomicU32::new(max_open),
            max_idle: AtomicU32::new(max_idle.min(max_open)),
            ..Default::default()
        }
    }

    pub fn max_open(&self) -> u32 {
        self.max_open.load(Ordering::Relaxed)
    }

    pub fn max_idle(&self) -> u32 {
        self.max_idle.load(Ordering::Relaxed)
    }

    /// Publish the current connection counts
    pub fn set_usage(&self, open: u32, in_use: u32) {
        self.open.store(open, Ordering::Relaxed);
        self.in_use.store(in_use.min(open), Ordering::Relaxed);
    }

    /// Record one caller that waited `waited` for a connection
    pub fn record_wait(&self, waited: Duration) {
        self.wait_count.fetch_add(1, Ordering::Relaxed);
        self.wait_nanos
            .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl ConnectionPoolHandle for PoolGauge {
    fn stats(&self) -> PoolStats {
        let open = self.open.load(Ordering::Relaxed);
        let in_use = self.in_use.load(Ordering::Relaxed);
        PoolStats {
            max_open: self.max_open(),
            open,
            in_use,
            idle: open.saturating_sub(in_use),
            wait_count: self.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_nanos(self.wait_nanos.load(Ordering::Relaxed)),
        }
    }

    fn set_max_open(&self, max_open: u32) {
        self.max_open.store(max_open, Ordering::Relaxed);
    }

    fn set_max_idle(&self, max_idle: u32) {
        self.max_idle.store(max_idle, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_reports_usage() {
        let gauge = PoolGauge::new(20, 5);
        gauge.set_usage(12, 9);
        gauge.record_wait(Duration::from_millis(40));
        gauge.record_wait(Duration::from_millis(60));

        let stats = gauge.stats();
        assert_eq!(stats.max_open, 20);
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.wait_count, 2);
        assert_eq!(stats.wait_duration, Duration::from_millis(100));
        assert!((stats.usage_percent() - 45.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_usage_with_zero_max() {
        assert_eq!(PoolStats::default().usage_percent(), 0.0);
    }
}
