//! Runtime configuration
//!
//! [`RuntimeConfig`] gathers every component's settings. All sections are
//! optional in YAML; missing fields take the component defaults and
//! durations use humantime strings (`30s`, `2m`, `1h`).
//!
//! ```yaml
//! cache:
//!   backend: sharded
//!   shards:
//!     - url: redis://cache-0:6379
//!     - url: redis://cache-1:6379
//!   sharded:
//!     replication_factor: 2
//! scheduler:
//!   max_workers: 16
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{
    CacheBackend, CacheCoordinator, CoordinatorConfig, InMemoryCache, MemoryCacheConfig,
    RemoteCache, RemoteCacheConfig, ShardedCache, ShardedCacheConfig, WarmerConfig,
};
use crate::error::{Error, Result};
use crate::governor::GovernorConfig;
use crate::pool::PoolControllerConfig;
use crate::scheduler::SchedulerConfig;

/// Which backend the coordinator fronts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Remote,
    Sharded,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub backend: BackendKind,
    pub memory: MemoryCacheConfig,
    pub remote: RemoteCacheConfig,
    /// One entry per shard for the sharded backend
    pub shards: Vec<RemoteCacheConfig>,
    pub sharded: ShardedCacheConfig,
    pub coordinator: CoordinatorConfig,
}

impl CacheSettings {
    /// Build the configured backend and wrap it in a coordinator
    pub async fn build_coordinator(&self) -> Result<Arc<CacheCoordinator>> {
        let coordinator = match self.backend {
            BackendKind::Memory => {
                let backend: Arc<dyn CacheBackend> = InMemoryCache::new(self.memory.clone());
                CacheCoordinator::new(backend, self.coordinator.clone())
            }
            BackendKind::Remote => {
                let backend: Arc<dyn CacheBackend> =
                    Arc::new(RemoteCache::connect(self.remote.clone()).await?);
                CacheCoordinator::new(backend, self.coordinator.clone())
            }
            BackendKind::Sharded => {
                let sharded =
                    ShardedCache::connect(self.shards.clone(), self.sharded.clone()).await?;
                CacheCoordinator::with_sharded(Arc::new(sharded), self.coordinator.clone())
            }
        };
        info!(backend = ?self.backend, "Cache coordinator built");
        Ok(coordinator)
    }
}

/// Listener addresses of the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub metrics_addr: String,
    pub health_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            metrics_addr: "0.0.0.0:8080".to_string(),
            health_addr: "0.0.0.0:8081".to_string(),
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub cache: CacheSettings,
    pub warmer: WarmerConfig,
    pub scheduler: SchedulerConfig,
    pub pool: PoolControllerConfig,
    pub governor: GovernorConfig,
    pub server: ServerSettings,
}

impl RuntimeConfig {
    /// Load and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&content)?;
        info!(path = %path.display(), "Loaded runtime configuration");
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.backend == BackendKind::Sharded && self.cache.shards.is_empty() {
            return Err(Error::Config(
                "sharded backend requires at least one entry under cache.shards".to_string(),
            ));
        }
        if self.cache.sharded.replication_factor == 0 {
            return Err(Error::Config("replication_factor must be at least 1".to_string()));
        }
        if self.warmer.max_concurrency == 0 {
            return Err(Error::Config("warmer.max_concurrency must be positive".to_string()));
        }
        self.scheduler.validate()?;
        self.pool.validate()?;
        for (name, addr) in [
            ("metrics_addr", &self.server.metrics_addr),
            ("health_addr", &self.server.health_addr),
        ] {
            addr.parse::<SocketAddr>()
                .map_err(|e| Error::Config(format!("invalid {} {:?}: {}", name, addr, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RoutingMode;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RuntimeConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.cache.backend, BackendKind::Memory);
        assert_eq!(config.scheduler.high_capacity, 100);
        assert_eq!(config.pool.scale_step, 5);
        assert_eq!(config.governor.monitor_interval, Duration::from_secs(30));
        assert_eq!(config.warmer.strategies.len(), 4);
    }

    #[test]
    fn test_overrides_and_humantime() {
        let yaml = r#"
cache:
  backend: sharded
  shards:
    - url: redis://a:6379
    - url: redis://b:6379
      key_prefix: app
  sharded:
    routing: simple
    replication_factor: 3
    health_check_interval: 15s
  coordinator:
    compression:
      threshold_bytes: 2048
warmer:
  interval: 30m
  max_concurrency: 2
scheduler:
  max_workers: 12
  default_timeout: 45s
pool:
  min_max_open: 5
  max_max_open: 50
  cooldown: 1m
governor:
  store:
    workers: 3
server:
  metrics_addr: 127.0.0.1:9100
"#;
        let config = RuntimeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cache.shards.len(), 2);
        assert_eq!(config.cache.shards[1].key_prefix, "app");
        assert_eq!(config.cache.sharded.routing, RoutingMode::Simple);
        assert_eq!(config.cache.sharded.replication_factor, 3);
        assert_eq!(config.cache.sharded.health_check_interval, Duration::from_secs(15));
        assert_eq!(config.warmer.interval, Duration::from_secs(1800));
        assert_eq!(config.scheduler.default_timeout, Duration::from_secs(45));
        assert_eq!(config.pool.cooldown, Duration::from_secs(60));
        assert_eq!(config.governor.store.workers, 3);
        assert_eq!(config.server.metrics_addr, "127.0.0.1:9100");
    }

    #[test]
    fn test_rejects_invalid() {
        let err = RuntimeConfig::from_yaml_str("cache:\n  backend: sharded\n").unwrap_err();
        assert_matches!(err, Error::Config(_));

        let err = RuntimeConfig::from_yaml_str("server:\n  health_addr: nowhere\n").unwrap_err();
        assert_matches!(err, Error::Config(_));

        let err = RuntimeConfig::from_yaml_str("scheduler: [1, 2]").unwrap_err();
        assert_matches!(err, Error::Config(_));
    }

    #[test]
    fn test_missing_file() {
        let err = RuntimeConfig::from_yaml_file("/nonexistent/cachewarden.yaml").unwrap_err();
        assert_matches!(err, Error::Config(_));
    }

    #[tokio::test]
    async fn test_build_memory_coordinator() {
        let settings = CacheSettings::default();
        let coordinator = settings.build_coordinator().await.unwrap();
        coordinator
            .set("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(coordinator.get("k").await.unwrap().as_ref(), b"v");
    }
}
