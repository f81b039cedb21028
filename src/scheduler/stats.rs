//! Scheduler statistics

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use super::task::Priority;

#[derive(Debug, Default)]
struct Timing {
    min: Option<Duration>,
    max: Duration,
    total: Duration,
    samples: u64,
}

#[derive(Debug)]
struct Breakdown {
    by_priority: HashMap<Priority, u64>,
    reset_at: Instant,
    reset_wall: DateTime<Utc>,
}

/// Counters shared by the dispatcher, the workers and submitters
#[derive(Debug)]
pub struct SchedulerStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    active: AtomicI64,
    timing: RwLock<Timing>,
    // Kinds are open-ended and written by every submitter
    by_kind: DashMap<String, u64>,
    breakdown: RwLock<Breakdown>,
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            active: AtomicI64::new(0),
            timing: RwLock::new(Timing::default()),
            by_kind: DashMap::new(),
            breakdown: RwLock::new(Breakdown {
                by_priority: HashMap::new(),
                reset_at: Instant::now(),
                reset_wall: Utc::now(),
            }),
        }
    }
}

impl SchedulerStats {
    pub(crate) fn record_submitted(&self, kind: &str, priority: Priority) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        *self.by_kind.entry(kind.to_string()).or_default() += 1;
        *self.breakdown.write().by_priority.entry(priority).or_default() += 1;
    }

    /// A task could not be queued. Drops count as failures too.
    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, duration: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.record_timing(duration);
    }

    pub(crate) fn record_failed(&self, duration: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_timing(duration);
    }

    pub(crate) fn task_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_finished(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_timing(&self, duration: Duration) {
        let mut timing = self.timing.write();
        timing.min = Some(timing.min.map_or(duration, |m| m.min(duration)));
        timing.max = timing.max.max(duration);
        timing.total += duration;
        timing.samples += 1;
    }

    /// Tasks executing right now
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Zero every counter except the in-flight gauge
    pub fn reset(&self) {
        self.submitted.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.retried.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        *self.timing.write() = Timing::default();

        self.by_kind.clear();
        let mut breakdown = self.breakdown.write();
        breakdown.by_priority.clear();
        breakdown.reset_at = Instant::now();
        breakdown.reset_wall = Utc::now();
    }

    pub(crate) fn snapshot(&self, queued: usize, workers: WorkerCounts) -> SchedulerStatsSnapshot {
        let timing = self.timing.read();
        let breakdown = self.breakdown.read();

        let completed = self.completed();
        let elapsed = breakdown.reset_at.elapsed().as_secs_f64();
        let active = self.active();

        SchedulerStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed,
            failed: self.failed(),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queued,
            active,
            min_time_ms: timing.min.unwrap_or_default().as_secs_f64() * 1000.0,
            max_time_ms: timing.max.as_secs_f64() * 1000.0,
            average_time_ms: if timing.samples == 0 {
                0.0
            } else {
                timing.total.as_secs_f64() * 1000.0 / timing.samples as f64
            },
            throughput: if elapsed > 0.0 {
                completed as f64 / elapsed
            } else {
                0.0
            },
            total_workers: workers.total,
            min_workers: workers.min,
            max_workers: workers.max,
            utilization: if workers.total == 0 {
                0.0
            } else {
                active as f64 / workers.total as f64
            },
            by_kind: self
                .by_kind
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            by_priority: breakdown
                .by_priority
                .iter()
                .map(|(p, n)| (p.name().to_string(), *n))
                .collect(),
            last_reset: breakdown.reset_wall,
        }
    }
}

/// Worker pool sizing at snapshot time
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WorkerCounts {
    pub total: usize,
    pub min: usize,
    pub max: usize,
}

/// Point-in-time scheduler statistics
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    /// Terminal failures plus dropped submissions
    pub failed: u64,
    pub retried: u64,
    pub dropped: u64,
    pub queued: usize,
    pub active: u64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    pub average_time_ms: f64,
    /// Completed tasks per second since the last reset
    pub throughput: f64,
    pub total_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Active tasks / total workers
    pub utilization: f64,
    pub by_kind: HashMap<String, u64>,
    pub by_priority: HashMap<String, u64>,
    pub last_reset: DateTime<Utc>,
}
