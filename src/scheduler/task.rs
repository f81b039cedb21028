//! Background tasks and their results

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{TaskFn, TaskFuture};
use crate::error::Result;

/// Dispatch priority. Higher lanes are always drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Priority {
    pub fn name(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Unit of detached work
pub struct BackgroundTask {
    pub id: String,
    /// Free-form category used for per-kind statistics
    pub kind: String,
    pub(crate) handler: TaskFn,
    pub priority: Priority,
    /// Per-attempt deadline; the scheduler default applies when `None`
    pub timeout: Option<Duration>,
    /// Attempts already retried
    pub retries: u32,
    pub max_retries: u32,
    /// Fixed delay added before every retry
    pub retry_delay: Duration,
    pub created_at: Instant,
    pub(crate) result_tx: Option<mpsc::Sender<TaskResult>>,
}

impl std::fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("retries", &self.retries)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl BackgroundTask {
    /// Create a task from an async closure. The closure is invoked once per
    /// attempt, so it must be callable repeatedly.
    pub fn new<F, Fut>(kind: impl Into<String>, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::from_fn(kind, Arc::new(move || -> TaskFuture { Box::pin(handler()) }))
    }

    /// Create a task from an already boxed handler
    pub fn from_fn(kind: impl Into<String>, handler: TaskFn) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            handler,
            priority: Priority::default(),
            timeout: None,
            retries: 0,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            created_at: Instant::now(),
            result_tx: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Whether another attempt is allowed after a failure
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Delay before the next attempt: fixed delay plus `retries × unit`
    pub fn backoff(&self, unit: Duration) -> Duration {
        self.retry_delay + unit * self.retries
    }
}

/// Outcome of a task's final attempt
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub error: Option<String>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Worker that ran the final attempt, if any ran
    pub worker: Option<usize>,
    pub retries: u32,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_backoff_is_linear() {
        let mut task = BackgroundTask::new("t", || async { Ok(()) })
            .with_retry_delay(Duration::from_millis(5))
            .with_max_retries(3);
        let unit = Duration::from_secs(1);

        assert_eq!(task.backoff(unit), Duration::from_millis(5));
        task.retries = 2;
        assert_eq!(task.backoff(unit), Duration::from_millis(2005));
        assert!(task.can_retry());
        task.retries = 3;
        assert!(!task.can_retry());
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = BackgroundTask::new("t", || async { Ok(()) });
        let b = BackgroundTask::new("t", || async { Ok(()) });
        assert_ne!(a.id, b.id);
        assert_eq!(a.with_id("fixed").id, "fixed");
    }
}
