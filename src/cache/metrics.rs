//! Cache Metrics Collection
//!
//! Operation counters and a bounded latency window for the coordinator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Number of latency samples kept for the rolling average
pub const LATENCY_WINDOW: usize = 100;

/// Coordinator metrics collector
#[derive(Debug)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
    total_ops: AtomicU64,
    bytes_saved: AtomicU64,

    latencies: Mutex<VecDeque<Duration>>,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_ops: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes avoided by compression
    pub fn record_bytes_saved(&self, bytes: u64) {
        self.bytes_saved.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record one operation and its latency
    pub fn record_latency(&self, duration: Duration) {
        self.total_ops.fetch_add(1, Ordering::Relaxed);
        let mut window = self.latencies.lock();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(duration);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit rate as a percentage (0-100)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total * 100.0
        }
    }

    /// Mean latency over the retained window
    pub fn average_latency(&self) -> Duration {
        let window = self.latencies.lock();
        if window.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = window.iter().sum();
        total / window.len() as u32
    }

    /// Error rate as a percentage of all recorded operations
    pub fn error_rate(&self) -> f64 {
        let ops = self.total_ops.load(Ordering::Relaxed);
        if ops == 0 {
            0.0
        } else {
            self.errors.load(Ordering::Relaxed) as f64 / ops as f64 * 100.0
        }
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_operations: self.total_ops.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            error_rate: self.error_rate(),
            average_latency_us: self.average_latency().as_micros() as u64,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.total_ops.store(0, Ordering::Relaxed);
        self.bytes_saved.store(0, Ordering::Relaxed);
        self.latencies.lock().clear();
    }
}

/// Snapshot of cache metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub total_operations: u64,
    pub bytes_saved: u64,
    /// Percentage, 0-100
    pub hit_rate: f64,
    /// Percentage, 0-100
    pub error_rate: f64,
    pub average_latency_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_is_percentage() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_rate(), 0.0);

        for _ in 0..3 {
            metrics.record_hit();
        }
        metrics.record_miss();
        assert!((metrics.hit_rate() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = CacheMetrics::new();
        for _ in 0..LATENCY_WINDOW {
            metrics.record_latency(Duration::from_millis(100));
        }
        for _ in 0..LATENCY_WINDOW {
            metrics.record_latency(Duration::from_millis(10));
        }
        // Old samples have rolled out of the window
        assert_eq!(metrics.average_latency(), Duration::from_millis(10));
        assert_eq!(
            metrics.snapshot().total_operations,
            (LATENCY_WINDOW * 2) as u64
        );
    }

    #[test]
    fn test_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_hit();
        metrics.record_error();
        metrics.record_latency(Duration::from_millis(1));
        metrics.reset();

        let snap = metrics.snapshot();
        assert_eq!(snap.hits, 0);
        assert_eq!(snap.errors, 0);
        assert_eq!(snap.average_latency_us, 0);
    }
}
