//! cachewarden - Multi-Tier Cache Runtime
//!
//! A cache layer for services backed by a slow data store: a uniform
//! [`CacheBackend`] contract over in-process and Redis tiers, sharding with
//! replica failover, compression and asynchronous invalidation in a
//! coordinator, and a warmer that preloads hot data. Around it sit the
//! runtime pieces the cache leans on: a connection-pool controller with a
//! circuit breaker, a priority background scheduler and a resource governor.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────────────┐      ┌────────────────┐
//!   callers ───▶ │  CacheCoordinator    │◀──── │  CacheWarmer   │◀── DataStore
//!                └──────────┬───────────┘      └────────────────┘
//!                           │ replication / read-through (Detached)
//!                ┌──────────▼───────────┐      ┌────────────────┐
//!                │  ShardedCache        │      │  TaskScheduler │
//!                │  Remote · InMemory   │      └────────────────┘
//!                └──────────────────────┘
//!   PoolController ──▶ ConnectionPoolHandle ◀── ResourceGovernor
//! ```
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use cachewarden::cache::{CacheCoordinator, CoordinatorConfig, InMemoryCache};
//!
//! # tokio_test::block_on(async {
//! let cache = CacheCoordinator::new(InMemoryCache::with_defaults(), CoordinatorConfig::default());
//! cache.set("greeting", "hello", Duration::from_secs(60)).await?;
//! assert_eq!(cache.get("greeting").await?.as_ref(), b"hello");
//! # Ok::<(), cachewarden::Error>(())
//! # }).unwrap();
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Backends, sharding, coordinator, invalidation, warmer
//! - [`scheduler`] - Priority background task scheduler
//! - [`pool`] - Connection pool auto-scaling and circuit breaker
//! - [`governor`] - Bounded execution lanes and process statistics
//! - [`config`] - YAML runtime configuration
//! - [`health`] - Component health reports
//! - [`telemetry`] - Prometheus exposition
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;
pub mod governor;
pub mod health;
pub mod pool;
pub mod scheduler;
pub mod telemetry;

// Re-export commonly used types
pub use cache::{
    CacheBackend, CacheCoordinator, CacheWarmer, DataStore, InMemoryCache, RemoteCache,
    ShardedCache,
};
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use governor::{Lane, ResourceGovernor};
pub use pool::{CircuitBreaker, ConnectionPoolHandle, PoolController};
pub use scheduler::{BackgroundTask, Priority, TaskScheduler};
