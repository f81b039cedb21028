//! Resource Governor
//!
//! Bounds concurrent work per resource class. Each [`Lane`] owns a fixed
//! worker pool and a semaphore sized at twice its workers by default; callers
//! wait for a slot, so a saturated lane applies backpressure instead of
//! queueing without limit. A monitor samples the connection pool and process
//! statistics on a fixed interval.

mod lane;

pub use lane::LaneMetrics;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::pool::{ConnectionPoolHandle, PoolStats};
use lane::{LaneRunner, Reply};

/// Resource class a task is admitted under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Backing data store calls
    Store,
    /// Outbound network calls
    Network,
    /// Cache operations
    Cache,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Store, Lane::Network, Lane::Cache];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Store => "store",
            Lane::Network => "network",
            Lane::Cache => "cache",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sizing for one lane. Zero values are derived from the CPU count.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    pub workers: usize,
    /// Concurrent admissions (running plus queued); 0 means twice `workers`
    pub slots: usize,
}

impl LaneConfig {
    pub fn new(workers: usize) -> Self {
        Self { workers, slots: 0 }
    }

    fn resolve(&self, per_cpu: usize) -> (usize, usize) {
        let workers = if self.workers == 0 {
            cpu_count() * per_cpu
        } else {
            self.workers
        };
        let slots = if self.slots == 0 {
            workers * 2
        } else {
            self.slots.max(1)
        };
        (workers, slots)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub store: LaneConfig,
    pub network: LaneConfig,
    pub cache: LaneConfig,
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            store: LaneConfig::default(),
            network: LaneConfig::default(),
            cache: LaneConfig::default(),
            monitor_interval: Duration::from_secs(30),
        }
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// One-shot unit of governed work
pub struct GovernedTask {
    pub id: String,
    pub kind: String,
    /// Execution deadline; unbounded when `None`
    pub timeout: Option<Duration>,
    job: BoxFuture<'static, Result<()>>,
    reply: Option<Reply>,
}

impl std::fmt::Debug for GovernedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernedTask")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GovernedTask {
    pub fn new<F>(kind: impl Into<String>, job: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            timeout: None,
            job: job.boxed(),
            reply: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Process and runtime statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemStats {
    pub cpus: usize,
    pub runtime_workers: usize,
    pub alive_tasks: usize,
    /// Resident set size of this process in bytes
    pub resident_memory: u64,
    pub virtual_memory: u64,
    pub total_memory: u64,
    pub sampled_at: Option<DateTime<Utc>>,
}

impl SystemStats {
    /// Sample the current process and runtime
    pub fn sample() -> Self {
        let mut stats = SystemStats {
            cpus: cpu_count(),
            sampled_at: Some(Utc::now()),
            ..Default::default()
        };

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let metrics = handle.metrics();
            stats.runtime_workers = metrics.num_workers();
            stats.alive_tasks = metrics.num_alive_tasks();
        }

        let mut system = sysinfo::System::new();
        system.refresh_memory();
        stats.total_memory = system.total_memory();
        if let Ok(pid) = sysinfo::get_current_pid() {
            if system.refresh_process(pid) {
                if let Some(process) = system.process(pid) {
                    stats.resident_memory = process.memory();
                    stats.virtual_memory = process.virtual_memory();
                }
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernorMetrics {
    pub lanes: Vec<LaneMetrics>,
    pub pool: Option<PoolStats>,
    pub system: SystemStats,
}

pub struct ResourceGovernor {
    config: GovernorConfig,
    store: LaneRunner,
    network: LaneRunner,
    cache: LaneRunner,
    pool: Option<Arc<dyn ConnectionPoolHandle>>,
    pool_stats: RwLock<Option<PoolStats>>,
    system_stats: RwLock<SystemStats>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("config", &self.config)
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ResourceGovernor {
    /// Start the lanes and the monitor. Must be called from within a tokio runtime.
    pub fn new(
        config: GovernorConfig,
        pool: Option<Arc<dyn ConnectionPoolHandle>>,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let (store_workers, store_slots) = config.store.resolve(2);
        let (network_workers, network_slots) = config.network.resolve(4);
        let (cache_workers, cache_slots) = config.cache.resolve(2);

        let governor = Arc::new(Self {
            store: LaneRunner::start(Lane::Store, store_workers, store_slots, &shutdown),
            network: LaneRunner::start(Lane::Network, network_workers, network_slots, &shutdown),
            cache: LaneRunner::start(Lane::Cache, cache_workers, cache_slots, &shutdown),
            pool,
            pool_stats: RwLock::new(None),
            system_stats: RwLock::new(SystemStats::default()),
            shutdown,
            monitor: Mutex::new(None),
            config,
        });

        if !governor.config.monitor_interval.is_zero() {
            let handle = tokio::spawn(Self::monitor_loop(Arc::downgrade(&governor)));
            *governor.monitor.lock() = Some(handle);
        }

        info!(
            store_workers,
            network_workers,
            cache_workers,
            "Resource governor initialized"
        );
        governor
    }

    fn runner(&self, lane: Lane) -> &LaneRunner {
        match lane {
            Lane::Store => &self.store,
            Lane::Network => &self.network,
            Lane::Cache => &self.cache,
        }
    }

    /// Admit a task, waiting for a free slot in its lane
    pub async fn submit(&self, lane: Lane, task: GovernedTask) -> Result<()> {
        self.runner(lane).admit(task, &self.shutdown).await
    }

    /// Admit a task and wait for its outcome
    pub async fn execute(&self, lane: Lane, mut task: GovernedTask) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        task.reply = Some(tx);
        self.submit(lane, task).await?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    pub fn lane_metrics(&self, lane: Lane) -> LaneMetrics {
        self.runner(lane).metrics()
    }

    pub fn metrics(&self) -> GovernorMetrics {
        GovernorMetrics {
            lanes: Lane::ALL.iter().map(|l| self.runner(*l).metrics()).collect(),
            pool: self.pool_stats(),
            system: self.system_stats.read().clone(),
        }
    }

    /// Latest pool sample, read live when no monitor pass has run yet
    pub fn pool_stats(&self) -> Option<PoolStats> {
        let sampled = *self.pool_stats.read();
        sampled.or_else(|| self.pool.as_ref().map(|p| p.stats()))
    }

    /// Fresh process statistics
    pub fn system_stats(&self) -> SystemStats {
        let stats = SystemStats::sample();
        *self.system_stats.write() = stats.clone();
        stats
    }

    pub fn reset_metrics(&self) {
        for lane in Lane::ALL {
            self.runner(lane).reset();
        }
        info!("Resource governor metrics reset");
    }

    /// Stop accepting work, let admitted tasks finish, and wait at most
    /// `timeout` for the lanes and the monitor.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down resource governor");
        self.shutdown.cancel();

        let mut handles = Vec::new();
        for lane in Lane::ALL {
            let runner = self.runner(lane);
            runner.close();
            handles.extend(runner.take_handles());
        }
        if let Some(monitor) = self.monitor.lock().take() {
            handles.push(monitor);
        }

        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(_) => {
                info!("Resource governor shut down");
                Ok(())
            }
            Err(_) => {
                warn!(?timeout, "Resource governor shutdown timed out");
                Err(Error::DeadlineExceeded(timeout))
            }
        }
    }

    fn sample(&self) {
        if let Some(pool) = &self.pool {
            let stats = pool.stats();
            *self.pool_stats.write() = Some(stats);
            info!(
                open = stats.open,
                max_open = stats.max_open,
                in_use = stats.in_use,
                idle = stats.idle,
                wait_count = stats.wait_count,
                wait = ?stats.wait_duration,
                "Connection pool stats"
            );
        }

        let system = self.system_stats();
        let lanes: Vec<String> = Lane::ALL
            .iter()
            .map(|l| {
                let m = self.runner(*l).metrics();
                format!("{}={}/{}", l, m.active, m.total)
            })
            .collect();
        info!(
            lanes = %lanes.join(" "),
            alive_tasks = system.alive_tasks,
            memory_mb = system.resident_memory / 1024 / 1024,
            "Resource governor stats"
        );
    }

    async fn monitor_loop(governor: std::sync::Weak<Self>) {
        let (interval, token) = match governor.upgrade() {
            Some(g) => (g.config.monitor_interval, g.shutdown.clone()),
            None => return,
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(governor) = governor.upgrade() else { break };
                    governor.sample();
                }
            }
        }
        debug!("Resource governor monitor stopped");
    }
}

impl Drop for ResourceGovernor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolGauge;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn small_config(workers: usize) -> GovernorConfig {
        GovernorConfig {
            store: LaneConfig::new(workers),
            network: LaneConfig::new(workers),
            cache: LaneConfig::new(workers),
            monitor_interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_lane_sizing() {
        let (workers, slots) = LaneConfig::new(3).resolve(2);
        assert_eq!((workers, slots), (3, 6));

        let (workers, slots) = LaneConfig { workers: 2, slots: 5 }.resolve(2);
        assert_eq!((workers, slots), (2, 5));

        let (workers, _) = LaneConfig::default().resolve(4);
        assert_eq!(workers, cpu_count() * 4);
    }

    #[tokio::test]
    async fn test_execute_records_metrics() {
        let governor = ResourceGovernor::new(small_config(2), None);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            governor
                .execute(
                    Lane::Cache,
                    GovernedTask::new("incr", async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
                .await
                .unwrap();
        }
        let err = governor
            .execute(Lane::Cache, GovernedTask::new("fail", async { Err(Error::NotFound) }))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let metrics = governor.lane_metrics(Lane::Cache);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(metrics.total, 6);
        assert_eq!(metrics.completed, 5);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.available_slots, metrics.slots);
        assert_eq!(governor.lane_metrics(Lane::Store).total, 0);

        governor.reset_metrics();
        assert_eq!(governor.lane_metrics(Lane::Cache).total, 0);
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let governor = ResourceGovernor::new(small_config(1), None);
        let err = governor
            .execute(
                Lane::Network,
                GovernedTask::new("slow", async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                })
                .with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::DeadlineExceeded(_));
        assert_eq!(governor.lane_metrics(Lane::Network).failed, 1);
    }

    #[tokio::test]
    async fn test_admission_blocks_when_slots_exhausted() {
        let governor = ResourceGovernor::new(
            GovernorConfig {
                store: LaneConfig { workers: 1, slots: 2 },
                ..small_config(1)
            },
            None,
        );
        let release = Arc::new(Notify::new());

        for _ in 0..2 {
            let release = Arc::clone(&release);
            governor
                .submit(
                    Lane::Store,
                    GovernedTask::new("hold", async move {
                        release.notified().await;
                        Ok(())
                    }),
                )
                .await
                .unwrap();
        }
        assert_eq!(governor.lane_metrics(Lane::Store).available_slots, 0);

        let third = governor.submit(Lane::Store, GovernedTask::new("third", async { Ok(()) }));
        let blocked = tokio::time::timeout(Duration::from_millis(50), third).await;
        assert!(blocked.is_err());

        // Unblock both holders; a slot frees and admission proceeds
        release.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        release.notify_one();
        tokio::time::timeout(
            Duration::from_secs(1),
            governor.submit(Lane::Store, GovernedTask::new("fourth", async { Ok(()) })),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_and_drains() {
        let governor = ResourceGovernor::new(small_config(1), None);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let done = Arc::clone(&done);
            governor
                .submit(
                    Lane::Cache,
                    GovernedTask::new("work", async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
                .await
                .unwrap();
        }

        governor.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 2);

        let err = governor
            .submit(Lane::Cache, GovernedTask::new("late", async { Ok(()) }))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ShuttingDown);
    }

    #[tokio::test]
    async fn test_pool_and_system_stats() {
        let gauge = Arc::new(PoolGauge::new(40, 10));
        gauge.set_usage(12, 7);
        let pool: Arc<dyn ConnectionPoolHandle> = gauge;
        let governor = ResourceGovernor::new(small_config(1), Some(pool));

        let stats = governor.pool_stats().unwrap();
        assert_eq!(stats.in_use, 7);
        assert_eq!(stats.max_open, 40);

        let system = governor.system_stats();
        assert!(system.cpus >= 1);
        assert!(system.sampled_at.is_some());

        let metrics = governor.metrics();
        assert_eq!(metrics.lanes.len(), 3);
        assert!(metrics.pool.is_some());
    }
}
