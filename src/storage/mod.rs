//! Tile storage
//!
//! The blob store contract, its in-memory backend, the decorators that layer
//! caches and tiers over any backend, and the broker that checks blobs
//! against a metadata index.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       StorageBroker                           │
//! │        MetaStore (size, created, expired) + transient cache   │
//! ├──────────────────────────────────────────────────────────────┤
//! │                     dyn BlobStore                             │
//! │  ┌───────────────────┐   ┌──────────────────────────────────┐ │
//! │  │  MemoryBlobStore  │   │        NestedBlobStore           │ │
//! │  │  TileCache (LRU)  │   │  front ──miss──▶ backing         │ │
//! │  │  + LockProvider   │   │  front ◀─populate─┘              │ │
//! │  └─────────┬─────────┘   └──────────────┬───────────────────┘ │
//! │            └────────────┬───────────────┘                     │
//! │                 InMemoryBlobStore / backends                  │
//! │                         │ events                              │
//! │                 BlobStoreListener (quota accounting)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod blob;
mod broker;
mod cache;
mod in_memory;
mod memory;
mod metrics;
mod nested;
mod object;
mod shard;

pub use blob::{BlobStore, BlobStoreListener, ListenerList, ParametersMapping, TileEvent};
pub use broker::{
    InMemoryMetaStore, MetaStore, StorageBroker, TRANSIENT_CACHE_CAPACITY,
    TRANSIENT_MAX_AGE_MILLIS,
};
pub use cache::{TileCache, TileCacheConfig, DEFAULT_CACHE_CAPACITY};
pub use in_memory::{InMemoryBlobStore, InMemoryStoreStats};
pub use memory::MemoryBlobStore;
pub use metrics::{CacheMetrics, CacheStatistics};
pub use nested::NestedBlobStore;
pub use object::{parameters_id, TileKey, TileObject, TileRange};
pub use shard::{Shard, ShardedMap, Weighted};

/// Shards of the tile cache map
pub const TILE_CACHE_SHARDS: usize = 256;
