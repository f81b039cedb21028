//! Multi-Tier Cache
//!
//! Layered cache built around the [`CacheBackend`] contract.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          Cache Coordinator                               │
//! │     metrics · LZ4 framing · invalidation queue · read-through · warmer    │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                           Sharded Cache                                  │
//! │   crc32/sha256 routing · replica keys · health probes · failover         │
//! ├─────────────────┬─────────────────┬─────────────────┬────────────────────┤
//! │  Remote shard 0 │  Remote shard 1 │  Remote shard N │  In-process        │
//! │  (Redis)        │  (Redis)        │  (Redis)        │  fallback tier     │
//! └─────────────────┴─────────────────┴─────────────────┴────────────────────┘
//! ```
//!
//! Optional backend features (bulk, pattern and tag operations) are reached
//! through capability traits, see [`CacheBackend::as_bulk`].

mod backend;
mod coordinator;
mod entry;
mod invalidation;
mod memory;
mod metrics;
mod remote;
mod sharded;
mod warmer;
pub mod compression;

pub use backend::{BulkCache, CacheBackend, PatternCache, TaggedCache};
pub use compression::{CompressionAlgorithm, CompressionConfig, ValueCodec};
pub use coordinator::{AlertThresholds, CacheCoordinator, CoordinatorConfig, CoordinatorStats};
pub use entry::{decode_counter, encode_counter, CacheEntry, COUNTER_WIDTH};
pub use invalidation::{
    InvalidationConfig, InvalidationJob, InvalidationKind, InvalidationQueue, InvalidationStats,
};
pub use memory::{InMemoryCache, MemoryCacheConfig, MemoryCacheStats};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot, LATENCY_WINDOW};
pub use remote::{RemoteCache, RemoteCacheConfig, RemoteCacheStats};
pub use sharded::{
    RoutingMode, ShardHealthTable, ShardStatus, ShardedCache, ShardedCacheConfig, ShardedStats,
    REPLICA_PREFIX,
};
pub use warmer::{
    CacheWarmer, DataStore, StoreRecord, WarmTarget, WarmerConfig, WarmupKind, WarmupParams,
    WarmupStats, WarmupStrategy,
};
