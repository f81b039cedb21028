//! Fixed-rate dispatch gate
//!
//! A token bucket backed by a semaphore. A refill loop adds one permit every
//! `1 / rate` seconds up to the bucket capacity; dispatch consumes one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Token bucket refilled at a fixed rate
#[derive(Debug, Clone)]
pub struct RateGate {
    permits: Arc<Semaphore>,
    capacity: usize,
    shutdown: CancellationToken,
}

impl RateGate {
    /// Create a full bucket admitting `per_second` tasks per second, and
    /// start its refill loop. `None` when the rate is zero (unlimited).
    pub fn start(per_second: u32, shutdown: CancellationToken) -> Option<Self> {
        if per_second == 0 {
            return None;
        }

        let capacity = per_second as usize;
        let gate = Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            shutdown,
        };

        let period = Duration::from_secs(1) / per_second;
        tokio::spawn(gate.clone().refill_loop(period));
        Some(gate)
    }

    /// Wait for a token
    pub async fn acquire(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.permits
            .acquire()
            .await
            .map_err(|_| Error::ShuttingDown)?
            .forget();
        Ok(())
    }

    /// Tokens currently available
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn refill_loop(self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.permits.close();
                    break;
                }
                _ = ticker.tick() => {
                    if self.permits.available_permits() < self.capacity {
                        self.permits.add_permits(1);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_rate_is_unlimited() {
        assert!(RateGate::start(0, CancellationToken::new()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_drains_and_refills() {
        let shutdown = CancellationToken::new();
        let gate = RateGate::start(10, shutdown.clone()).unwrap();

        for _ in 0..10 {
            gate.acquire().await.unwrap();
        }
        assert_eq!(gate.available(), 0);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(gate.available() >= 2);
        assert!(gate.available() <= 10);

        shutdown.cancel();
        assert!(gate.acquire().await.is_err());
    }
}
