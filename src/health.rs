//! Health Reporting
//!
//! Status values and check results shared by the coordinator, the sharded
//! backend and the binary's `/healthz` endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Operational with reduced capacity (e.g. some shards down)
    Degraded,
    /// Not serving
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Check if status is healthy
    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }

    /// Derive a status from how many of `total` members are healthy
    pub fn from_ratio(healthy: usize, total: usize) -> Self {
        if total == 0 || healthy == 0 {
            HealthStatus::Unhealthy
        } else if healthy < total {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of one named check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Check name
    pub name: String,
    /// Status
    pub status: HealthStatus,
    /// Message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Duration of check
    pub duration_ms: u64,
}

impl HealthCheckResult {
    /// Create a healthy result
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            duration_ms: 0,
        }
    }

    /// Create a degraded result
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    /// Create an unhealthy result
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    /// Set duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Aggregated health of the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status among the checks
    pub status: HealthStatus,
    /// Individual check results
    pub checks: Vec<HealthCheckResult>,
    /// Crate version
    pub version: String,
}

impl HealthReport {
    /// Aggregate checks; the overall status is the worst individual one
    pub fn new(checks: Vec<HealthCheckResult>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Find a check by name
    pub fn check(&self, name: &str) -> Option<&HealthCheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(HealthStatus::Degraded.is_operational());
        assert!(!HealthStatus::Unhealthy.is_operational());
    }

    #[test]
    fn test_status_from_ratio() {
        assert_eq!(HealthStatus::from_ratio(3, 3), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_ratio(1, 3), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_ratio(0, 3), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::from_ratio(0, 0), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_report_takes_worst_status() {
        let report = HealthReport::new(vec![
            HealthCheckResult::healthy("cache"),
            HealthCheckResult::degraded("shards", "1 of 3 down"),
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(
            report.check("shards").and_then(|c| c.message.as_deref()),
            Some("1 of 3 down")
        );

        let empty = HealthReport::new(Vec::new());
        assert_eq!(empty.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_serialization() {
        let result = HealthCheckResult::healthy("cache").with_duration(Duration::from_millis(3));
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"healthy\""));
        assert!(!json.contains("message"));

        let back: HealthCheckResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.duration_ms, 3);
    }
}
