//! Scheduler workers
//!
//! Each worker owns a one-slot inbox. Before waiting for work it registers
//! the inbox sender with the dispatcher's pool; the dispatcher hands exactly
//! one task to each registration.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::task::{BackgroundTask, TaskResult};
use super::Shared;
use crate::error::Error;

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Active,
    /// Retired; finishing whatever is already in its inbox
    Stopping,
    Stopped,
}

/// Per-worker bookkeeping exposed through the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct WorkerLifecycle {
    pub id: usize,
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
    pub last_active: Option<DateTime<Utc>>,
    pub tasks_run: u64,
}

impl WorkerLifecycle {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            state: WorkerState::Idle,
            started_at: Utc::now(),
            last_active: None,
            tasks_run: 0,
        }
    }
}

pub(super) async fn run(id: usize, shared: Arc<Shared>, token: CancellationToken) {
    let (tx, mut rx) = mpsc::channel::<BackgroundTask>(1);
    debug!(worker = id, "Worker started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            registered = shared.pool_tx.send(tx.clone()) => {
                if registered.is_err() {
                    break;
                }
            }
        }
        shared.set_state(id, WorkerState::Idle);

        let task = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        execute(id, &shared, task).await;
    }

    // A task may have been handed over right before cancellation
    rx.close();
    while let Some(task) = rx.recv().await {
        execute(id, &shared, task).await;
    }

    shared.set_state(id, WorkerState::Stopped);
    debug!(worker = id, "Worker stopped");
}

async fn execute(worker: usize, shared: &Arc<Shared>, mut task: BackgroundTask) {
    shared.stats.task_started();
    shared.mark_active(worker);

    let timeout = task.timeout.unwrap_or(shared.config.default_timeout);
    let handler = Arc::clone(&task.handler);
    let started = Instant::now();

    let attempt = AssertUnwindSafe(async move { handler().await }).catch_unwind();
    let outcome = match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(Error::TaskFailed {
            task_id: task.id.clone(),
            reason: "handler panicked".into(),
        }),
        Err(_) => Err(Error::DeadlineExceeded(timeout)),
    };
    let elapsed = started.elapsed();
    shared.stats.task_finished();

    match outcome {
        Ok(()) => {
            shared.stats.record_completed(elapsed);
            deliver(&task, Some(worker), elapsed, None);
        }
        Err(e) if task.can_retry() => {
            shared.stats.record_retry();
            task.retries += 1;
            let delay = task.backoff(shared.config.retry_backoff_unit);
            debug!(
                task_id = %task.id,
                kind = %task.kind,
                attempt = task.retries,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Task failed, retrying"
            );
            shared.schedule_retry(task, delay);
        }
        Err(e) => {
            shared.stats.record_failed(elapsed);
            warn!(
                task_id = %task.id,
                kind = %task.kind,
                retries = task.retries,
                error = %e,
                "Task failed permanently"
            );
            deliver(&task, Some(worker), elapsed, Some(e.to_string()));
        }
    }
}

/// Hand the final outcome to the optional result channel without waiting
pub(super) fn deliver(
    task: &BackgroundTask,
    worker: Option<usize>,
    duration: std::time::Duration,
    error: Option<String>,
) {
    let Some(tx) = &task.result_tx else { return };
    let result = TaskResult {
        task_id: task.id.clone(),
        success: error.is_none(),
        error,
        duration,
        worker,
        retries: task.retries,
        finished_at: Utc::now(),
    };
    if tx.try_send(result).is_err() {
        debug!(task_id = %task.id, "Result receiver not ready, dropping result");
    }
}
