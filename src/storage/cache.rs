//! Tile Cache
//!
//! Bounded in-process tile cache behind [`MemoryBlobStore`](super::MemoryBlobStore).
//!
//! # Design
//!
//! - ShardedMap keyed by [`TileKey`] for low-contention reads
//! - Least-recently-used eviction driven by a global access tick
//! - Capacity-based eviction with high/low watermarks

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::metrics::{CacheMetrics, CacheStatistics};
use super::object::{TileKey, TileObject, TileRange};
use super::shard::{ShardedMap, Weighted};
use super::TILE_CACHE_SHARDS;

/// Default cache capacity (16 MiB)
pub const DEFAULT_CACHE_CAPACITY: u64 = 16 * 1024 * 1024;

/// Tile cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TileCacheConfig {
    /// Maximum bytes of tile payload held
    pub capacity_bytes: u64,
    /// Fill ratio that triggers eviction
    pub high_watermark: f64,
    /// Fill ratio eviction stops at
    pub low_watermark: f64,
}

impl Default for TileCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_CACHE_CAPACITY,
            high_watermark: 0.90,
            low_watermark: 0.80,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedTile {
    blob: Bytes,
    created: i64,
    last_access: u64,
}

impl Weighted for CachedTile {
    fn weight(&self) -> u64 {
        self.blob.len() as u64
    }
}

/// Bounded tile cache
pub struct TileCache {
    storage: ShardedMap<TileKey, CachedTile, TILE_CACHE_SHARDS>,
    config: TileCacheConfig,
    tick: AtomicU64,
    metrics: CacheMetrics,
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new(TileCacheConfig::default())
    }
}

impl TileCache {
    pub fn new(config: TileCacheConfig) -> Self {
        Self {
            storage: ShardedMap::new(),
            config,
            tick: AtomicU64::new(0),
            metrics: CacheMetrics::new(),
        }
    }

    #[inline]
    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Copy the cached payload into `tile`; `false` on a miss
    pub fn get(&self, tile: &mut TileObject) -> bool {
        let key = tile.key();
        let tick = self.next_tick();
        let mut found = None;
        self.storage.update(&key, |cached| {
            cached.last_access = tick;
            found = Some((cached.blob.clone(), cached.created));
        });

        match found {
            Some((blob, created)) => {
                self.metrics.record_hit();
                tile.set_blob(Some(blob));
                tile.created = created;
                true
            }
            None => {
                self.metrics.record_miss();
                false
            }
        }
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.storage.get(key).is_some()
    }

    /// Cache the payload of `tile`. Tiles without payload or larger than the
    /// whole cache are ignored.
    pub fn put(&self, tile: &TileObject) -> bool {
        let blob = match &tile.blob {
            Some(blob) => blob.clone(),
            None => return false,
        };
        if blob.len() as u64 > self.config.capacity_bytes {
            return false;
        }

        if self.should_evict(blob.len() as u64) {
            self.evict();
        }

        self.storage.insert(
            tile.key(),
            CachedTile {
                blob,
                created: tile.created,
                last_access: self.next_tick(),
            },
        );
        self.metrics.record_insertion();
        true
    }

    /// Drop the exact entry for `key`
    pub fn remove(&self, key: &TileKey) -> bool {
        let removed = self.storage.remove(key).is_some();
        if removed {
            self.metrics.record_invalidations(1);
        }
        removed
    }

    /// Drop every entry matching `predicate`
    pub fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&TileKey) -> bool,
    {
        let removed = self.storage.retain(|k, _| !predicate(k));
        self.metrics.record_invalidations(removed as u64);
        removed
    }

    pub fn remove_layer(&self, layer: &str) -> usize {
        self.remove_where(|k| k.layer_name == layer)
    }

    pub fn remove_range(&self, range: &TileRange) -> usize {
        self.remove_where(|k| range.contains(k))
    }

    pub fn clear(&self) {
        let entries = self.storage.len() as u64;
        self.storage.clear();
        self.metrics.record_invalidations(entries);
    }

    fn should_evict(&self, incoming: u64) -> bool {
        let projected = (self.storage.size_bytes() + incoming) as f64;
        projected / self.config.capacity_bytes as f64 >= self.config.high_watermark
    }

    fn above_low_watermark(&self) -> bool {
        let current = self.storage.size_bytes() as f64;
        current / self.config.capacity_bytes as f64 > self.config.low_watermark
    }

    /// Evict least recently used entries until below the low watermark
    fn evict(&self) {
        let mut candidates: Vec<(TileKey, u64)> = self
            .storage
            .entries()
            .into_iter()
            .map(|(k, v)| (k, v.last_access))
            .collect();
        candidates.sort_by_key(|(_, last_access)| *last_access);

        let mut evicted = 0u64;
        for (key, _) in candidates {
            if !self.above_low_watermark() {
                break;
            }
            if self.storage.remove(&key).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(
                "Evicted {} tiles, cache at {} of {} bytes",
                evicted,
                self.storage.size_bytes(),
                self.config.capacity_bytes
            );
            self.metrics.record_evictions(evicted);
        }
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        self.storage.size_bytes()
    }

    pub fn capacity(&self) -> u64 {
        self.config.capacity_bytes
    }

    pub fn statistics(&self) -> CacheStatistics {
        self.metrics.snapshot(
            self.storage.len() as u64,
            self.storage.size_bytes(),
            self.config.capacity_bytes,
        )
    }

    pub fn reset_statistics(&self) {
        self.metrics.reset();
    }
}
