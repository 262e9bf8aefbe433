//! Tile cache statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated on the cache hot path
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    insertions: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_insertion(&self) {
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Point-in-time copy combined with the cache's current occupancy
    pub fn snapshot(&self, entries: u64, size_bytes: u64, capacity_bytes: u64) -> CacheStatistics {
        CacheStatistics {
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            insertions: self.insertions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries,
            size_bytes,
            capacity_bytes,
            hit_ratio: self.hit_ratio(),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.insertions.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub insertions: u64,
    pub invalidations: u64,
    pub entries: u64,
    pub size_bytes: u64,
    pub capacity_bytes: u64,
    pub hit_ratio: f64,
}

impl CacheStatistics {
    /// Percentage of capacity in use
    pub fn occupancy_percent(&self) -> f64 {
        if self.capacity_bytes == 0 {
            0.0
        } else {
            self.size_bytes as f64 * 100.0 / self.capacity_bytes as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        assert!((metrics.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot() {
        let metrics = CacheMetrics::new();
        metrics.record_insertion();
        metrics.record_evictions(3);
        let stats = metrics.snapshot(10, 512, 1024);
        assert_eq!(stats.insertions, 1);
        assert_eq!(stats.evictions, 3);
        assert_eq!(stats.occupancy_percent(), 50.0);

        metrics.reset();
        assert_eq!(metrics.snapshot(0, 0, 1).evictions, 0);
    }
}
