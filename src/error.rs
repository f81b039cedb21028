//! Error types for cachewarden

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache runtime
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Key is absent or its entry has expired
    #[error("cache key not found")]
    NotFound,

    /// Every shard is unhealthy and no fallback cache is configured
    #[error("no healthy cache backend available")]
    NoHealthyBackend,

    /// Operation is not supported by this backend
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Stored value cannot be interpreted (e.g. a non-counter passed to increment)
    #[error("invalid stored value for key {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    /// Remote backend error
    #[error("remote backend error: {0}")]
    Backend(#[from] redis::RedisError),

    // =========================================================================
    // Scheduling Errors
    // =========================================================================
    /// Bounded queue is full and the item was dropped
    #[error("queue full: {0}")]
    QueueFull(String),

    /// Circuit breaker is open and rejected the call
    #[error("circuit breaker is open")]
    OpenCircuit,

    /// Operation exceeded its deadline
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    /// Component is shutting down and no longer accepts work
    #[error("component is shutting down")]
    ShuttingDown,

    /// Component was started twice
    #[error("{0} is already running")]
    AlreadyRunning(String),

    /// Task handler failed
    #[error("task {task_id} failed: {reason}")]
    TaskFailed { task_id: String, reason: String },

    // =========================================================================
    // Encoding Errors
    // =========================================================================
    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error represents a cache miss
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// Short label used for log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound => "not_found",
            Error::NoHealthyBackend => "no_healthy_backend",
            Error::Unsupported(_) => "unsupported",
            Error::InvalidValue { .. } => "invalid_value",
            Error::Backend(_) => "backend",
            Error::QueueFull(_) => "queue_full",
            Error::OpenCircuit => "open_circuit",
            Error::DeadlineExceeded(_) => "deadline_exceeded",
            Error::ShuttingDown => "shutting_down",
            Error::AlreadyRunning(_) => "already_running",
            Error::TaskFailed { .. } => "task_failed",
            Error::Serialization(_) => "serialization",
            Error::CompressionFailed { .. } => "compression",
            Error::DecompressionFailed { .. } => "decompression",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_not_found_detection() {
        assert!(Error::NotFound.is_not_found());
        assert!(!Error::NoHealthyBackend.is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = Error::DeadlineExceeded(Duration::from_secs(30));
        assert_eq!(err.to_string(), "deadline exceeded after 30s");

        let err = Error::QueueFull("scheduler main queue".into());
        assert_eq!(err.kind(), "queue_full");
        assert!(err.to_string().contains("scheduler main queue"));
    }
}
