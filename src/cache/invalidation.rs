//! Asynchronous invalidation queue
//!
//! Producers never wait: jobs go onto a bounded channel with `try_send` and
//! are dropped with a warning when the channel is full. A fixed pool of
//! workers applies them against the backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::CacheBackend;
use crate::error::{Error, Result};
use crate::scheduler::Priority;

/// What an invalidation job targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationKind {
    Key,
    Pattern,
    Tag,
}

/// One queued invalidation
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationJob {
    pub kind: InvalidationKind,
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub priority: Priority,
}

impl InvalidationJob {
    pub fn new(kind: InvalidationKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            created_at: Utc::now(),
            priority: Priority::Medium,
        }
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self::new(InvalidationKind::Key, key)
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::new(InvalidationKind::Pattern, pattern)
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Self::new(InvalidationKind::Tag, tag)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Invalidation queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    pub queue_size: usize,
    pub workers: usize,
    /// Deadline for applying a single job
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            workers: 3,
            job_timeout: Duration::from_secs(30),
        }
    }
}

/// Invalidation counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvalidationStats {
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    /// Keys removed by processed jobs
    pub keys_removed: u64,
    pub queued: usize,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    keys_removed: AtomicU64,
}

/// Bounded invalidation queue with its worker pool
pub struct InvalidationQueue {
    tx: mpsc::Sender<InvalidationJob>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl InvalidationQueue {
    /// Start the worker pool against `backend`
    pub fn start(backend: Arc<dyn CacheBackend>, config: InvalidationConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());
        let shutdown = CancellationToken::new();

        let workers = (0..config.workers.max(1))
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&backend),
                    Arc::clone(&rx),
                    Arc::clone(&counters),
                    config.job_timeout,
                    shutdown.clone(),
                ))
            })
            .collect();

        info!(
            workers = config.workers.max(1),
            queue_size = config.queue_size,
            "Invalidation queue started"
        );

        Self {
            tx,
            counters,
            shutdown,
            workers: parking_lot::Mutex::new(workers),
        }
    }

    /// Queue a job without waiting. A full queue drops the job.
    pub fn enqueue(&self, job: InvalidationJob) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        match self.tx.try_send(job) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = ?job.kind, target = %job.target, "Invalidation queue full, job dropped");
                Err(Error::QueueFull(format!("invalidation of {}", job.target)))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ShuttingDown),
        }
    }

    pub fn stats(&self) -> InvalidationStats {
        InvalidationStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            keys_removed: self.counters.keys_removed.load(Ordering::Relaxed),
            queued: self.tx.max_capacity() - self.tx.capacity(),
        }
    }

    /// Stop accepting jobs and let the workers drain what is already queued,
    /// waiting at most `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!("Invalidation workers did not stop in time");
        }
    }
}

impl Drop for InvalidationQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(
    id: usize,
    backend: Arc<dyn CacheBackend>,
    rx: Arc<Mutex<mpsc::Receiver<InvalidationJob>>>,
    counters: Arc<Counters>,
    job_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = async { rx.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };
        process(id, backend.as_ref(), &job, &counters, job_timeout).await;
    }

    // Drain jobs accepted before shutdown
    loop {
        let next = rx.lock().await.try_recv();
        let Ok(job) = next else { break };
        process(id, backend.as_ref(), &job, &counters, job_timeout).await;
    }
    debug!(worker = id, "Invalidation worker stopped");
}

async fn process(
    id: usize,
    backend: &dyn CacheBackend,
    job: &InvalidationJob,
    counters: &Counters,
    job_timeout: Duration,
) {
    match tokio::time::timeout(job_timeout, apply(backend, job)).await {
        Ok(Ok(removed)) => {
            counters.keys_removed.fetch_add(removed, Ordering::Relaxed);
            counters.processed.fetch_add(1, Ordering::Relaxed);
            debug!(worker = id, kind = ?job.kind, target = %job.target, removed, "Invalidated");
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(worker = id, kind = ?job.kind, target = %job.target, error = %e, "Invalidation failed");
        }
        Err(_) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(worker = id, kind = ?job.kind, target = %job.target, "Invalidation timed out");
        }
    }
}

/// Apply one job. Patterns fall back to clearing the whole backend when it
/// cannot enumerate keys; tags are a no-op without tag support.
pub(crate) async fn apply(backend: &dyn CacheBackend, job: &InvalidationJob) -> Result<u64> {
    match job.kind {
        InvalidationKind::Key => {
            let present = backend.exists(&job.target).await.unwrap_or(false);
            match backend.delete(&job.target).await {
                Ok(()) | Err(Error::NotFound) => Ok(u64::from(present)),
                Err(e) => Err(e),
            }
        }
        InvalidationKind::Pattern => match backend.as_pattern() {
            Some(pattern) => pattern.delete_by_pattern(&job.target).await,
            None => {
                warn!(
                    backend = backend.name(),
                    pattern = %job.target,
                    "Backend cannot match patterns, clearing it instead"
                );
                backend.clear().await.map(|_| 0)
            }
        },
        InvalidationKind::Tag => match backend.as_tagged() {
            Some(tagged) => tagged.invalidate_tag(&job.target).await,
            None => {
                debug!(backend = backend.name(), tag = %job.target, "Backend has no tag index, skipping");
                Ok(0)
            }
        },
    }
}
