//! Circuit breaker guarding calls into the pooled resource
//!
//! Closed until `max_failures` consecutive failures, then open. Once
//! `reset_timeout` has passed since the last failure the breaker reports
//! half-open and lets calls through; the first outcome closes or re-opens it.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub max_failures: u32,
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 10,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_failures == 0 {
            return Err(Error::Config(
                "breaker max_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    /// Calls refused while open
    pub rejected: u64,
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
    rejected: u64,
    times_opened: u64,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            total_failures: 0,
            total_successes: 0,
            rejected: 0,
            times_opened: 0,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, moving open to half-open once the reset timeout elapsed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Admission check. Returns `OpenCircuit` while the breaker is open.
    pub fn allow(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        if inner.state == CircuitState::Open {
            inner.rejected += 1;
            return Err(Error::OpenCircuit);
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            info!(breaker = %self.name, "Circuit breaker closed after successful trial");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.max_failures,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.times_opened += 1;
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                "Circuit breaker opened"
            );
        }
    }

    /// Run `op` through the breaker, recording its outcome
    pub async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.allow()?;
        match op.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            rejected: inner.rejected,
            times_opened: inner.times_opened,
        }
    }

    /// Force the breaker closed and clear its counters
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::closed();
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let expired = inner
            .last_failure
            .map_or(true, |at| at.elapsed() > self.config.reset_timeout);
        if expired {
            inner.state = CircuitState::HalfOpen;
            inner.consecutive_failures = 0;
            info!(breaker = %self.name, "Circuit breaker half-open");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_config_requires_a_failure_budget() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        let zero = CircuitBreakerConfig {
            max_failures: 0,
            ..Default::default()
        };
        assert_matches!(zero.validate(), Err(Error::Config(_)));
    }

    fn breaker(max_failures: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                max_failures,
                reset_timeout: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exactly_max_failures() {
        let cb = breaker(3);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow().is_ok());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_matches!(cb.allow(), Err(Error::OpenCircuit));
        assert_eq!(cb.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let cb = breaker(3);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let cb = breaker(2);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_open());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow().is_ok());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(2);
        cb.record_failure();
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().times_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_records_outcome() {
        let cb = breaker(1);
        let ok: Result<u32> = cb.call(async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32> = cb.call(async { Err(Error::NotFound) }).await;
        assert_matches!(err, Err(Error::NotFound));

        let blocked: Result<u32> = cb.call(async { Ok(1) }).await;
        assert_matches!(blocked, Err(Error::OpenCircuit));

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
