//! One bounded execution lane: a fixed worker pool behind a counting semaphore

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{GovernedTask, Lane};
use crate::error::{Error, Result};

/// Point-in-time view of one lane
#[derive(Debug, Clone, Serialize)]
pub struct LaneMetrics {
    pub lane: Lane,
    pub workers: usize,
    pub slots: usize,
    pub available_slots: usize,
    pub active: i64,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    #[serde(with = "humantime_serde")]
    pub average_latency: Duration,
}

#[derive(Debug, Default)]
struct LaneCounters {
    active: AtomicI64,
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    latency_nanos: AtomicU64,
}

struct Admitted {
    task: GovernedTask,
    // Released when the task finishes
    _permit: OwnedSemaphorePermit,
}

pub(super) struct LaneRunner {
    lane: Lane,
    workers: usize,
    slots: usize,
    permits: Arc<Semaphore>,
    tx: mpsc::Sender<Admitted>,
    counters: Arc<LaneCounters>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl LaneRunner {
    pub(super) fn start(lane: Lane, workers: usize, slots: usize, shutdown: &CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(slots);
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(LaneCounters::default());

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    lane,
                    id,
                    Arc::clone(&rx),
                    Arc::clone(&counters),
                    shutdown.clone(),
                ))
            })
            .collect();

        Self {
            lane,
            workers,
            slots,
            permits: Arc::new(Semaphore::new(slots)),
            tx,
            counters,
            handles: parking_lot::Mutex::new(handles),
        }
    }

    /// Wait for a free slot, then queue the task for a worker
    pub(super) async fn admit(&self, task: GovernedTask, shutdown: &CancellationToken) -> Result<()> {
        if shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(Error::ShuttingDown),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| Error::ShuttingDown)?
            }
        };

        // Each queued task holds a permit, so the channel never exceeds `slots`
        match self.tx.try_send(Admitted { task, _permit: permit }) {
            Ok(()) => {
                self.counters.total.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(admitted)) => {
                Err(Error::QueueFull(format!("{} lane task {}", self.lane, admitted.task.id)))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ShuttingDown),
        }
    }

    pub(super) fn close(&self) {
        self.permits.close();
    }

    pub(super) fn take_handles(&self) -> Vec<JoinHandle<()>> {
        self.handles.lock().drain(..).collect()
    }

    pub(super) fn metrics(&self) -> LaneMetrics {
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let finished = completed + failed;
        let average_latency = if finished == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.counters.latency_nanos.load(Ordering::Relaxed) / finished)
        };

        LaneMetrics {
            lane: self.lane,
            workers: self.workers,
            slots: self.slots,
            available_slots: self.permits.available_permits(),
            active: self.counters.active.load(Ordering::Relaxed),
            total: self.counters.total.load(Ordering::Relaxed),
            completed,
            failed,
            average_latency,
        }
    }

    /// Zero the cumulative counters. In-flight tasks keep `active` accurate.
    pub(super) fn reset(&self) {
        self.counters.total.store(0, Ordering::Relaxed);
        self.counters.completed.store(0, Ordering::Relaxed);
        self.counters.failed.store(0, Ordering::Relaxed);
        self.counters.latency_nanos.store(0, Ordering::Relaxed);
    }
}

async fn worker_loop(
    lane: Lane,
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Admitted>>>,
    counters: Arc<LaneCounters>,
    shutdown: CancellationToken,
) {
    loop {
        // Queued work drains before the shutdown signal is observed
        let admitted = tokio::select! {
            biased;
            next = async { rx.lock().await.recv().await } => match next {
                Some(admitted) => admitted,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        run(lane, id, admitted, &counters).await;
    }
    debug!(lane = %lane, worker = id, "Lane worker stopped");
}

async fn run(lane: Lane, worker: usize, admitted: Admitted, counters: &LaneCounters) {
    let Admitted { task, _permit } = admitted;
    let GovernedTask {
        id,
        kind,
        timeout,
        job,
        reply,
    } = task;

    counters.active.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let outcome = execute(&id, job, timeout).await;
    let elapsed = started.elapsed();
    counters.active.fetch_sub(1, Ordering::Relaxed);
    counters
        .latency_nanos
        .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);

    match &outcome {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(lane = %lane, worker, task_id = %id, kind = %kind, error = %e, "Governed task failed");
        }
    }

    if let Some(reply) = reply {
        // Receiver may have gone away
        let _ = reply.send(outcome);
    }
}

async fn execute(
    id: &str,
    job: BoxFuture<'static, Result<()>>,
    timeout: Option<Duration>,
) -> Result<()> {
    let guarded = std::panic::AssertUnwindSafe(job).catch_unwind();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => return Err(Error::DeadlineExceeded(limit)),
        },
        None => guarded.await,
    };
    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::TaskFailed {
            task_id: id.to_string(),
            reason: "handler panicked".to_string(),
        }),
    }
}

pub(super) type Reply = oneshot::Sender<Result<()>>;
