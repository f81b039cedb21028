//! Background Task Scheduler
//!
//! Generic priority worker pool for detached asynchronous work.
//!
//! ```text
//!   submit ──▶ [high 100] ─┐
//!          ──▶ [medium 200] ┼─▶ dispatcher ──▶ idle worker inbox ──▶ execute
//!          ──▶ [low 300] ──┘        ▲               ▲                   │
//!   (lane full) ──▶ [main] ─────────┘    workers re-register            │
//!   (main full) ──▶ Err(QueueFull)       after each task                │
//!                                                                        │
//!             failure with retries left ◀── sleep(backoff) ◀────────────┘
//! ```
//!
//! The dispatcher first waits for a worker to become available and only then
//! takes the highest-priority queued task, so lane order is strict. A monitor
//! grows or shrinks the pool from observed utilization.

mod rate_limit;
mod stats;
mod task;
mod worker;

pub use rate_limit::RateGate;
pub use stats::{SchedulerStats, SchedulerStatsSnapshot};
pub use task::{BackgroundTask, Priority, TaskResult};
pub use worker::{WorkerLifecycle, WorkerState};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use stats::WorkerCounts;

/// Boxed future produced by one task attempt
pub type TaskFuture = BoxFuture<'static, Result<()>>;

/// Re-invocable task handler
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Executor for fire-and-forget work such as replication and read-through
/// population. Failures are logged by the executor, never returned.
pub trait Detached: Send + Sync {
    fn run_detached(&self, kind: &str, job: TaskFn);
}

/// Runs each job once on the ambient tokio runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDetached;

impl Detached for TokioDetached {
    fn run_detached(&self, kind: &str, job: TaskFn) {
        let kind = kind.to_string();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(kind = %kind, "No runtime available, detached job skipped");
            return;
        };
        handle.spawn(async move {
            if let Err(e) = job().await {
                warn!(kind = %kind, error = %e, "Detached job failed");
            }
        });
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Capacity of the overflow main queue
    pub queue_size: usize,
    pub high_capacity: usize,
    pub medium_capacity: usize,
    pub low_capacity: usize,
    /// Deadline for tasks that do not carry their own
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Linear backoff step multiplied by the retry count
    #[serde(with = "humantime_serde")]
    pub retry_backoff_unit: Duration,
    /// Dispatched tasks per second (0 = unlimited)
    pub rate_limit: u32,
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub auto_scale: bool,
    /// Dispatcher sleep when every queue is empty
    #[serde(with = "humantime_serde")]
    pub idle_poll: Duration,
    /// Retries granted to jobs submitted through [`Detached`]
    pub detached_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let max_workers = cpus * 2;

        Self {
            min_workers: (max_workers / 2).max(1),
            max_workers,
            queue_size: max_workers * 10,
            high_capacity: 100,
            medium_capacity: 200,
            low_capacity: 300,
            default_timeout: Duration::from_secs(30),
            retry_backoff_unit: Duration::from_secs(1),
            rate_limit: 100,
            monitor_interval: Duration::from_secs(30),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            auto_scale: true,
            idle_poll: Duration::from_millis(10),
            detached_retries: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 || self.min_workers > self.max_workers {
            return Err(Error::Config(format!(
                "scheduler workers must satisfy 0 < min ({}) <= max ({})",
                self.min_workers, self.max_workers
            )));
        }
        if [
            self.queue_size,
            self.high_capacity,
            self.medium_capacity,
            self.low_capacity,
        ]
        .contains(&0)
        {
            return Err(Error::Config(
                "scheduler queue capacities must be positive".into(),
            ));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(Error::Config(
                "scale_down_threshold must be below scale_up_threshold".into(),
            ));
        }
        if self.idle_poll.is_zero() {
            return Err(Error::Config("idle_poll must be positive".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Shared state
// =============================================================================

struct Lanes {
    high: mpsc::Sender<BackgroundTask>,
    medium: mpsc::Sender<BackgroundTask>,
    low: mpsc::Sender<BackgroundTask>,
    main: mpsc::Sender<BackgroundTask>,
}

impl Lanes {
    fn named(&self) -> [(&'static str, &mpsc::Sender<BackgroundTask>); 4] {
        [
            ("high", &self.high),
            ("medium", &self.medium),
            ("low", &self.low),
            ("main", &self.main),
        ]
    }

    fn depth(&self) -> usize {
        self.named()
            .iter()
            .map(|(_, tx)| tx.max_capacity() - tx.capacity())
            .sum()
    }
}

struct Receivers {
    high: mpsc::Receiver<BackgroundTask>,
    medium: mpsc::Receiver<BackgroundTask>,
    low: mpsc::Receiver<BackgroundTask>,
    main: mpsc::Receiver<BackgroundTask>,
    pool: mpsc::Receiver<mpsc::Sender<BackgroundTask>>,
}

impl Receivers {
    fn try_next(&mut self) -> Option<BackgroundTask> {
        self.high
            .try_recv()
            .or_else(|_| self.medium.try_recv())
            .or_else(|_| self.low.try_recv())
            .or_else(|_| self.main.try_recv())
            .ok()
    }
}

struct WorkerHandle {
    id: usize,
    token: CancellationToken,
    join: JoinHandle<()>,
}

struct Shared {
    config: SchedulerConfig,
    lanes: Lanes,
    stats: SchedulerStats,
    workers: Mutex<Vec<WorkerHandle>>,
    lifecycle: RwLock<BTreeMap<usize, WorkerLifecycle>>,
    next_worker_id: AtomicUsize,
    pool_tx: mpsc::Sender<mpsc::Sender<BackgroundTask>>,
    shutdown: CancellationToken,
    accepting: AtomicBool,
}

impl Shared {
    /// Lane first, main queue on overflow. Gives the task back when both
    /// are full.
    fn try_enqueue(&self, task: BackgroundTask) -> std::result::Result<(), BackgroundTask> {
        let lane = match task.priority {
            Priority::High => &self.lanes.high,
            Priority::Medium => &self.lanes.medium,
            Priority::Low => &self.lanes.low,
        };
        match lane.try_send(task) {
            Ok(()) => Ok(()),
            Err(e) => self.lanes.main.try_send(e.into_inner()).map_err(|e| e.into_inner()),
        }
    }

    fn schedule_retry(self: &Arc<Self>, task: BackgroundTask, delay: Duration) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    shared.stats.record_failed(Duration::ZERO);
                    worker::deliver(&task, None, Duration::ZERO, Some(Error::ShuttingDown.to_string()));
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(task) = shared.try_enqueue(task) {
                        shared.stats.record_dropped();
                        warn!(task_id = %task.id, kind = %task.kind, "Retry dropped, queues full");
                        worker::deliver(&task, None, Duration::ZERO, Some("queue full".into()));
                    }
                }
            }
        });
    }

    fn set_state(&self, id: usize, state: WorkerState) {
        if let Some(entry) = self.lifecycle.write().get_mut(&id) {
            if entry.state != WorkerState::Stopping || state == WorkerState::Stopped {
                entry.state = state;
            }
        }
    }

    fn mark_active(&self, id: usize) {
        if let Some(entry) = self.lifecycle.write().get_mut(&id) {
            if entry.state != WorkerState::Stopping {
                entry.state = WorkerState::Active;
            }
            entry.tasks_run += 1;
            entry.last_active = Some(chrono::Utc::now());
        }
    }

    fn spawn_worker(self: &Arc<Self>) -> usize {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        self.lifecycle.write().insert(id, WorkerLifecycle::new(id));

        let join = tokio::spawn(worker::run(id, Arc::clone(self), token.clone()));
        self.workers.lock().push(WorkerHandle { id, token, join });
        id
    }

    fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    fn worker_counts(&self) -> WorkerCounts {
        WorkerCounts {
            total: self.worker_count(),
            min: self.config.min_workers,
            max: self.config.max_workers,
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Lane occupancy
#[derive(Debug, Clone, Serialize)]
pub struct LaneHealth {
    pub queued: usize,
    pub capacity: usize,
}

/// Queue occupancy summary
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub lanes: BTreeMap<String, LaneHealth>,
    pub total_queued: usize,
    pub total_capacity: usize,
    /// total_queued / total_capacity
    pub saturation: f64,
    pub accepting: bool,
}

/// Priority worker pool with retries, rate limiting and auto-scaling
pub struct TaskScheduler {
    shared: Arc<Shared>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("workers", &self.shared.worker_count())
            .field("queued", &self.shared.lanes.depth())
            .finish()
    }
}

impl TaskScheduler {
    /// Start the scheduler with `min_workers` workers. Must be called from
    /// within a tokio runtime.
    pub fn new(config: SchedulerConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let (high, high_rx) = mpsc::channel(config.high_capacity);
        let (medium, medium_rx) = mpsc::channel(config.medium_capacity);
        let (low, low_rx) = mpsc::channel(config.low_capacity);
        let (main, main_rx) = mpsc::channel(config.queue_size);
        let (pool_tx, pool_rx) = mpsc::channel(config.max_workers * 2);

        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            lanes: Lanes {
                high,
                medium,
                low,
                main,
            },
            stats: SchedulerStats::default(),
            workers: Mutex::new(Vec::new()),
            lifecycle: RwLock::new(BTreeMap::new()),
            next_worker_id: AtomicUsize::new(0),
            pool_tx,
            shutdown: shutdown.clone(),
            accepting: AtomicBool::new(true),
            config,
        });

        for _ in 0..shared.config.min_workers {
            shared.spawn_worker();
        }

        let receivers = Receivers {
            high: high_rx,
            medium: medium_rx,
            low: low_rx,
            main: main_rx,
            pool: pool_rx,
        };
        let gate = RateGate::start(shared.config.rate_limit, shutdown.clone());

        let mut background = vec![tokio::spawn(Self::dispatch_loop(
            Arc::clone(&shared),
            receivers,
            gate,
        ))];
        if shared.config.auto_scale && !shared.config.monitor_interval.is_zero() {
            background.push(tokio::spawn(Self::monitor_loop(Arc::clone(&shared))));
        }

        info!(
            min_workers = shared.config.min_workers,
            max_workers = shared.config.max_workers,
            rate_limit = shared.config.rate_limit,
            "Task scheduler started"
        );

        Ok(Arc::new(Self {
            shared,
            background: Mutex::new(background),
        }))
    }

    /// Queue a task. Never blocks: returns `QueueFull` when both its lane
    /// and the main queue are full.
    pub fn submit(&self, task: BackgroundTask) -> Result<String> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let id = task.id.clone();
        self.shared.stats.record_submitted(&task.kind, task.priority);

        match self.shared.try_enqueue(task) {
            Ok(()) => Ok(id),
            Err(task) => {
                self.shared.stats.record_dropped();
                warn!(task_id = %task.id, kind = %task.kind, priority = %task.priority, "Task dropped, queues full");
                Err(Error::QueueFull(id))
            }
        }
    }

    /// Queue a task and receive its final result
    pub fn submit_with_result(
        &self,
        mut task: BackgroundTask,
    ) -> Result<mpsc::Receiver<TaskResult>> {
        let (tx, rx) = mpsc::channel(1);
        task.result_tx = Some(tx);
        self.submit(task)?;
        Ok(rx)
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        self.shared
            .stats
            .snapshot(self.shared.lanes.depth(), self.shared.worker_counts())
    }

    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }

    pub fn queue_health(&self) -> QueueHealth {
        let lanes: BTreeMap<String, LaneHealth> = self
            .shared
            .lanes
            .named()
            .iter()
            .map(|(name, tx)| {
                (
                    name.to_string(),
                    LaneHealth {
                        queued: tx.max_capacity() - tx.capacity(),
                        capacity: tx.max_capacity(),
                    },
                )
            })
            .collect();

        let total_queued = lanes.values().map(|l| l.queued).sum();
        let total_capacity = lanes.values().map(|l| l.capacity).sum();

        QueueHealth {
            lanes,
            total_queued,
            total_capacity,
            saturation: if total_capacity == 0 {
                0.0
            } else {
                total_queued as f64 / total_capacity as f64
            },
            accepting: self.shared.accepting.load(Ordering::Acquire),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.worker_count()
    }

    /// Lifecycle of every worker that has not been pruned
    pub fn workers(&self) -> Vec<WorkerLifecycle> {
        self.shared.lifecycle.read().values().cloned().collect()
    }

    /// One auto-scaling pass. Returns the worker count delta.
    pub fn rebalance(&self) -> isize {
        Self::rebalance_shared(&self.shared)
    }

    fn rebalance_shared(shared: &Arc<Shared>) -> isize {
        if shared.shutdown.is_cancelled() {
            return 0;
        }
        shared
            .lifecycle
            .write()
            .retain(|_, l| l.state != WorkerState::Stopped);

        let config = &shared.config;
        let total = shared.worker_count();
        let utilization = if total == 0 {
            1.0
        } else {
            shared.stats.active() as f64 / total as f64
        };

        if utilization > config.scale_up_threshold && total < config.max_workers {
            let add = (total / 4).max(1).min(config.max_workers - total);
            for _ in 0..add {
                shared.spawn_worker();
            }
            info!(
                added = add,
                workers = total + add,
                utilization = utilization,
                "Scaled scheduler up"
            );
            return add as isize;
        }

        if utilization < config.scale_down_threshold && total > config.min_workers {
            let remove = (total / 4).max(1).min(total - config.min_workers);
            let retired: Vec<WorkerHandle> = {
                let mut workers = shared.workers.lock();
                let keep = workers.len() - remove;
                workers.drain(keep..).collect()
            };
            for handle in retired {
                shared.set_state(handle.id, WorkerState::Stopping);
                handle.token.cancel();
            }
            info!(
                removed = remove,
                workers = total - remove,
                utilization = utilization,
                "Scaled scheduler down"
            );
            return -(remove as isize);
        }

        0
    }

    /// Stop accepting work, stop dispatch and wait up to `timeout` for
    /// in-flight tasks. Tasks still queued are discarded.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if !self.shared.accepting.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let discarded = self.shared.lanes.depth();
        info!(queued = discarded, "Shutting down task scheduler");
        self.shared.shutdown.cancel();

        let mut joins: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        joins.extend(self.shared.workers.lock().drain(..).map(|w| w.join));

        match tokio::time::timeout(timeout, join_all(joins)).await {
            Ok(_) => {
                info!("Task scheduler stopped");
                Ok(())
            }
            Err(_) => {
                warn!(timeout = ?timeout, "Task scheduler shutdown timed out");
                Err(Error::DeadlineExceeded(timeout))
            }
        }
    }

    async fn dispatch_loop(shared: Arc<Shared>, mut rx: Receivers, gate: Option<RateGate>) {
        let mut pending: Option<BackgroundTask> = None;

        loop {
            let worker = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                worker = rx.pool.recv() => match worker {
                    Some(worker) => worker,
                    None => break,
                },
            };
            if worker.is_closed() {
                continue;
            }

            let task = match pending.take() {
                Some(task) => task,
                None => match Self::next_task(&shared, &mut rx, gate.as_ref()).await {
                    Some(task) => task,
                    None => break,
                },
            };

            // Retired workers close their inbox; keep the task for the next one
            if let Err(e) = worker.try_send(task) {
                pending = Some(e.into_inner());
            }
        }
        debug!("Dispatcher stopped");
    }

    async fn next_task(
        shared: &Shared,
        rx: &mut Receivers,
        gate: Option<&RateGate>,
    ) -> Option<BackgroundTask> {
        if let Some(gate) = gate {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return None,
                acquired = gate.acquire() => acquired.ok()?,
            }
        }

        loop {
            if let Some(task) = rx.try_next() {
                return Some(task);
            }
            tokio::select! {
                _ = shared.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(shared.config.idle_poll) => {}
            }
        }
    }

    async fn monitor_loop(shared: Arc<Shared>) {
        let mut ticker = tokio::time::interval(shared.config.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    Self::rebalance_shared(&shared);
                    debug!(
                        workers = shared.worker_count(),
                        active = shared.stats.active(),
                        queued = shared.lanes.depth(),
                        "Scheduler monitor tick"
                    );
                }
            }
        }
    }
}

impl Detached for TaskScheduler {
    fn run_detached(&self, kind: &str, job: TaskFn) {
        let task = BackgroundTask::from_fn(kind, job)
            .with_priority(Priority::Low)
            .with_max_retries(self.shared.config.detached_retries);
        if let Err(e) = self.submit(task) {
            warn!(kind = %kind, error = %e, "Detached job rejected");
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            min_workers: 1,
            max_workers: 4,
            rate_limit: 0,
            auto_scale: false,
            retry_backoff_unit: Duration::from_millis(1),
            idle_poll: Duration::from_millis(1),
            ..Default::default()
        }
    }

    /// A task that signals `started` and then waits for `release`
    fn blocker(started: Arc<Notify>, release: Arc<Notify>) -> BackgroundTask {
        BackgroundTask::new("blocker", move || {
            let started = started.clone();
            let release = release.clone();
            async move {
                started.notify_one();
                release.notified().await;
                Ok(())
            }
        })
        .with_priority(Priority::High)
    }

    #[test]
    fn test_config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());

        let bad = SchedulerConfig {
            min_workers: 5,
            max_workers: 2,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = SchedulerConfig {
            queue_size: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_successful_task() {
        let scheduler = TaskScheduler::new(test_config()).unwrap();
        let mut rx = scheduler
            .submit_with_result(BackgroundTask::new("ok", || async { Ok(()) }))
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(result.success);
        assert_eq!(result.retries, 0);
        assert_eq!(scheduler.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_always_failing_task_runs_n_plus_one_times() {
        let scheduler = TaskScheduler::new(test_config()).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let task = BackgroundTask::new("flaky", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Internal("boom".into()))
            }
        })
        .with_max_retries(3);

        let mut rx = scheduler.submit_with_result(task).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.retries, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        let stats = scheduler.stats();
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.submitted, 1);
    }

    #[tokio::test]
    async fn test_timeout_and_panic_are_failures() {
        let scheduler = TaskScheduler::new(test_config()).unwrap();

        let slow = BackgroundTask::new("slow", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .with_timeout(Duration::from_millis(20));
        let mut slow_rx = scheduler.submit_with_result(slow).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), slow_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("deadline"));

        let panicky = BackgroundTask::new("panicky", || async {
            let missing: Option<()> = None;
            missing.expect("handler bug");
            Ok(())
        });
        let mut panic_rx = scheduler.submit_with_result(panicky).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), panic_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("panicked"));

        // The worker survives the panic
        let mut ok_rx = scheduler
            .submit_with_result(BackgroundTask::new("ok", || async { Ok(()) }))
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), ok_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_overflow_drops_without_blocking() {
        let scheduler = TaskScheduler::new(SchedulerConfig {
            max_workers: 1,
            queue_size: 1,
            high_capacity: 1,
            medium_capacity: 1,
            low_capacity: 1,
            ..test_config()
        })
        .unwrap();

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        scheduler
            .submit(blocker(started.clone(), release.clone()))
            .unwrap();
        started.notified().await;

        // Worker busy: one medium slot plus one main slot remain
        let outcomes = tokio::time::timeout(Duration::from_secs(1), async {
            (0..10)
                .map(|_| scheduler.submit(BackgroundTask::new("filler", || async { Ok(()) })))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap();

        let accepted = outcomes.iter().filter(|r| r.is_ok()).count();
        let dropped = outcomes
            .iter()
            .filter(|r| matches!(r, Err(Error::QueueFull(_))))
            .count();
        assert_eq!(accepted, 2);
        assert_eq!(dropped, 8);

        let stats = scheduler.stats();
        assert_eq!(stats.dropped, 8);
        assert_eq!(stats.failed, 8);
        assert_eq!(stats.queued, 2);

        release.notify_one();
    }

    #[tokio::test]
    async fn test_higher_priority_dispatched_first() {
        let scheduler = TaskScheduler::new(SchedulerConfig {
            max_workers: 1,
            ..test_config()
        })
        .unwrap();

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        scheduler
            .submit(blocker(started.clone(), release.clone()))
            .unwrap();
        started.notified().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut receivers = Vec::new();
        for priority in [Priority::Low, Priority::Medium, Priority::High] {
            let order = order.clone();
            let task = BackgroundTask::new("ordered", move || {
                let order = order.clone();
                async move {
                    order.lock().push(priority);
                    Ok(())
                }
            })
            .with_priority(priority);
            receivers.push(scheduler.submit_with_result(task).unwrap());
        }

        release.notify_one();
        for mut rx in receivers {
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(
            *order.lock(),
            vec![Priority::High, Priority::Medium, Priority::Low]
        );
        assert_eq!(scheduler.stats().by_priority["low"], 1);
    }

    #[tokio::test]
    async fn test_rebalance_scales_up_then_down() {
        let scheduler = TaskScheduler::new(test_config()).unwrap();
        assert_eq!(scheduler.worker_count(), 1);

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let mut rx = scheduler
            .submit_with_result(blocker(started.clone(), release.clone()))
            .unwrap();
        started.notified().await;

        assert_eq!(scheduler.rebalance(), 1);
        assert_eq!(scheduler.worker_count(), 2);

        release.notify_one();
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(scheduler.rebalance(), -1);
        assert_eq!(scheduler.worker_count(), 1);
        // Never below min
        assert_eq!(scheduler.rebalance(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let scheduler = TaskScheduler::new(test_config()).unwrap();
        scheduler.shutdown(Duration::from_secs(5)).await.unwrap();

        let err = scheduler
            .submit(BackgroundTask::new("late", || async { Ok(()) }))
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
        assert!(!scheduler.queue_health().accepting);
    }

    #[tokio::test]
    async fn test_detached_runs_through_scheduler() {
        let scheduler = TaskScheduler::new(test_config()).unwrap();
        let done = Arc::new(Notify::new());

        let signal = done.clone();
        let job: TaskFn = Arc::new(move || -> TaskFuture {
            let signal = signal.clone();
            Box::pin(async move {
                signal.notify_one();
                Ok(())
            })
        });
        scheduler.run_detached("replicate", job);

        tokio::time::timeout(Duration::from_secs(5), done.notified())
            .await
            .unwrap();
        assert_eq!(scheduler.stats().by_kind["replicate"], 1);
    }
}
