//! Page Store
//!
//! In-memory quota index: tile sets, pages with their stats, and per tile set
//! usage. Pages are keyed by `(tileSetId, z, y, x)` in a sorted map; ordering
//! for eviction is computed on demand at sweep time.
//!
//! Deleting a layer, gridset or parameter set removes its tile sets, pages
//! and stats in one step. The whole index can be written to and read back
//! from a JSON snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::page::{PageKey, TilePage};
use super::stats::PageStats;
use super::tile_set::TileSet;
use crate::clock::Clock;
use crate::error::Result;
use crate::quota::Quota;

/// Page with its stats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEntry {
    pub page: TilePage,
    pub stats: PageStats,
}

/// Stored bytes and tile count of one tile set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileSetUsage {
    pub used: Quota,
    pub tiles: i64,
}

#[derive(Debug, Default)]
struct PageIndex {
    tile_sets: BTreeMap<String, TileSet>,
    pages: BTreeMap<PageKey, PageEntry>,
    usage: BTreeMap<String, TileSetUsage>,
}

impl PageIndex {
    fn remove_tile_sets<F>(&mut self, mut matches: F) -> usize
    where
        F: FnMut(&TileSet) -> bool,
    {
        let doomed: BTreeSet<String> = self
            .tile_sets
            .values()
            .filter(|ts| matches(ts))
            .map(|ts| ts.id().to_string())
            .collect();
        if doomed.is_empty() {
            return 0;
        }

        let before = self.pages.len();
        self.pages.retain(|key, _| !doomed.contains(&key.tile_set_id));
        for id in &doomed {
            self.tile_sets.remove(id);
            self.usage.remove(id);
        }
        before - self.pages.len()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    tile_sets: Vec<TileSet>,
    pages: Vec<PageEntry>,
    usage: BTreeMap<String, TileSetUsage>,
}

/// Concurrent page and usage index
pub struct PageStore {
    index: RwLock<PageIndex>,
    clock: Arc<dyn Clock>,
}

impl PageStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            index: RwLock::new(PageIndex::default()),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // =========================================================================
    // Tile Sets
    // =========================================================================

    /// Register a tile set; a no-op when already known
    pub fn put_tile_set(&self, tile_set: &TileSet) {
        let mut index = self.index.write();
        if !index.tile_sets.contains_key(tile_set.id()) {
            index
                .tile_sets
                .insert(tile_set.id().to_string(), tile_set.clone());
        }
    }

    pub fn tile_set(&self, id: &str) -> Option<TileSet> {
        self.index.read().tile_sets.get(id).cloned()
    }

    pub fn tile_sets(&self) -> Vec<TileSet> {
        self.index.read().tile_sets.values().cloned().collect()
    }

    pub fn tile_sets_for_layer(&self, layer: &str) -> Vec<TileSet> {
        self.index
            .read()
            .tile_sets
            .values()
            .filter(|ts| ts.layer_name() == layer)
            .cloned()
            .collect()
    }

    /// Layers with at least one registered tile set
    pub fn layer_names(&self) -> BTreeSet<String> {
        self.index
            .read()
            .tile_sets
            .values()
            .map(|ts| ts.layer_name().to_string())
            .collect()
    }

    // =========================================================================
    // Pages
    // =========================================================================

    /// Record `hits` on `page`, creating it if needed
    pub fn add_hits(&self, tile_set: &TileSet, page: &TilePage, hits: u64) -> PageStats {
        let now = self.clock.now_minutes();
        let mut index = self.index.write();
        ensure_tile_set(&mut index, tile_set);
        let entry = index.pages.entry(page.key()).or_insert_with(|| PageEntry {
            page: page.clone(),
            stats: PageStats::new(now),
        });
        let created = entry.page.creation_time_minutes();
        entry.stats.add_hits_and_access_time(hits, now, created);
        entry.stats.clone()
    }

    /// Account `num_tiles` tiles and `bytes` bytes on `page` (negative to
    /// remove), creating the page if needed
    pub fn add_tiles_and_quota(
        &self,
        tile_set: &TileSet,
        page: &TilePage,
        num_tiles: i64,
        tiles_per_page: u64,
        bytes: i128,
    ) -> PageStats {
        let now = self.clock.now_minutes();
        let mut index = self.index.write();
        ensure_tile_set(&mut index, tile_set);

        let usage = index.usage.entry(tile_set.id().to_string()).or_default();
        usage.used.add_bytes(bytes);
        usage.tiles = (usage.tiles + num_tiles).max(0);
        if usage.used.bytes() < 0 {
            usage.used = Quota::zero();
        }

        let entry = index.pages.entry(page.key()).or_insert_with(|| PageEntry {
            page: page.clone(),
            stats: PageStats::new(now),
        });
        entry.stats.add_tiles(num_tiles, tiles_per_page);
        entry.stats.clone()
    }

    /// Zero the fill factor of `page`, storing it if it was never touched
    pub fn set_truncated(&self, tile_set: &TileSet, page: &TilePage) {
        let now = self.clock.now_minutes();
        let mut index = self.index.write();
        ensure_tile_set(&mut index, tile_set);
        index
            .pages
            .entry(page.key())
            .or_insert_with(|| PageEntry {
                page: page.clone(),
                stats: PageStats::new(now),
            })
            .stats
            .set_truncated();
    }

    pub fn page_stats(&self, key: &PageKey) -> Option<PageStats> {
        self.index.read().pages.get(key).map(|e| e.stats.clone())
    }

    pub fn page_count(&self) -> usize {
        self.index.read().pages.len()
    }

    /// Stored pages of a tile set in key order
    pub fn pages_for_tile_set(&self, tile_set_id: &str) -> Vec<PageEntry> {
        let index = self.index.read();
        let start = PageKey {
            tile_set_id: tile_set_id.to_string(),
            z: 0,
            y: 0,
            x: 0,
        };
        index
            .pages
            .range(start..)
            .take_while(|(k, _)| k.tile_set_id == tile_set_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Stored pages of every tile set of a layer
    pub fn pages_for_layer(&self, layer: &str) -> Vec<PageEntry> {
        self.tile_sets_for_layer(layer)
            .iter()
            .flat_map(|ts| self.pages_for_tile_set(ts.id()))
            .collect()
    }

    // =========================================================================
    // Usage
    // =========================================================================

    pub fn usage(&self, tile_set_id: &str) -> TileSetUsage {
        self.index
            .read()
            .usage
            .get(tile_set_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn used_quota_by_layer(&self, layer: &str) -> Quota {
        let index = self.index.read();
        let mut total = Quota::zero();
        for ts in index.tile_sets.values().filter(|ts| ts.layer_name() == layer) {
            if let Some(usage) = index.usage.get(ts.id()) {
                total.add(&usage.used);
            }
        }
        total
    }

    pub fn globally_used_quota(&self) -> Quota {
        let index = self.index.read();
        let mut total = Quota::zero();
        for usage in index.usage.values() {
            total.add(&usage.used);
        }
        total
    }

    // =========================================================================
    // Cascading Deletes
    // =========================================================================

    /// Drop every tile set, page and usage record of `layer`
    pub fn delete_layer(&self, layer: &str) -> usize {
        let removed = self
            .index
            .write()
            .remove_tile_sets(|ts| ts.layer_name() == layer);
        debug!("Deleted {} pages of layer {}", removed, layer);
        removed
    }

    pub fn delete_gridset(&self, layer: &str, gridset: &str) -> usize {
        let removed = self
            .index
            .write()
            .remove_tile_sets(|ts| ts.layer_name() == layer && ts.gridset_id() == gridset);
        debug!(
            "Deleted {} pages of layer {} in gridset {}",
            removed, layer, gridset
        );
        removed
    }

    pub fn delete_parameters(&self, layer: &str, parameters_id: &str) -> usize {
        let removed = self.index.write().remove_tile_sets(|ts| {
            ts.layer_name() == layer && ts.parameters_id() == Some(parameters_id)
        });
        debug!(
            "Deleted {} pages of layer {} with parameters {}",
            removed, layer, parameters_id
        );
        removed
    }

    /// Move every tile set of `old` under `new`, carrying pages and usage
    pub fn rename_layer(&self, old: &str, new: &str) {
        let mut index = self.index.write();
        let moved: Vec<TileSet> = index
            .tile_sets
            .values()
            .filter(|ts| ts.layer_name() == old)
            .cloned()
            .collect();

        for ts in moved {
            let renamed = ts.renamed(new);
            index.tile_sets.remove(ts.id());
            if let Some(usage) = index.usage.remove(ts.id()) {
                index.usage.insert(renamed.id().to_string(), usage);
            }

            let keys: Vec<PageKey> = index
                .pages
                .keys()
                .filter(|k| k.tile_set_id == ts.id())
                .cloned()
                .collect();
            for key in keys {
                if let Some(entry) = index.pages.remove(&key) {
                    let page = entry.page.with_tile_set_id(renamed.id());
                    index.pages.insert(
                        page.key(),
                        PageEntry {
                            page,
                            stats: entry.stats,
                        },
                    );
                }
            }
            index.tile_sets.insert(renamed.id().to_string(), renamed);
        }
        debug!("Renamed layer {} to {}", old, new);
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Write the index to `path` as JSON
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let index = self.index.read();
            Snapshot {
                tile_sets: index.tile_sets.values().cloned().collect(),
                pages: index.pages.values().cloned().collect(),
                usage: index.usage.clone(),
            }
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;
        std::fs::write(path, json)?;
        info!(
            "Saved quota snapshot with {} pages to {}",
            snapshot.pages.len(),
            path.display()
        );
        Ok(())
    }

    /// Read an index previously written by [`save_snapshot`](Self::save_snapshot)
    pub fn load_snapshot(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;

        let mut index = PageIndex::default();
        for ts in snapshot.tile_sets {
            index.tile_sets.insert(ts.id().to_string(), ts);
        }
        for entry in snapshot.pages {
            index.pages.insert(entry.page.key(), entry);
        }
        index.usage = snapshot.usage;
        info!(
            "Loaded quota snapshot with {} pages from {}",
            index.pages.len(),
            path.display()
        );

        Ok(Self {
            index: RwLock::new(index),
            clock,
        })
    }
}

fn ensure_tile_set(index: &mut PageIndex, tile_set: &TileSet) {
    if !index.tile_sets.contains_key(tile_set.id()) {
        index
            .tile_sets
            .insert(tile_set.id().to_string(), tile_set.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::quota::StorageUnit;

    fn store() -> (Arc<ManualClock>, PageStore) {
        let clock = Arc::new(ManualClock::at_minutes(1_000));
        let store = PageStore::new(clock.clone());
        (clock, store)
    }

    fn ts(layer: &str, gridset: &str, params: Option<&str>) -> TileSet {
        TileSet::new(layer, gridset, "image/png", params.map(String::from))
    }

    #[test]
    fn test_add_tiles_tracks_usage_and_fill() {
        let (_clock, store) = store();
        let set = ts("roads", "EPSG:4326", None);
        let page = TilePage::new(set.id(), 0, 0, 3, 1_000);

        let stats = store.add_tiles_and_quota(&set, &page, 2, 4, 8192);
        assert_eq!(stats.fill_factor(), 0.5);
        assert_eq!(store.usage(set.id()).tiles, 2);
        assert_eq!(store.used_quota_by_layer("roads"), Quota::new(8.0, StorageUnit::KiB));

        store.add_tiles_and_quota(&set, &page, -2, 4, -8192);
        assert_eq!(store.page_stats(&page.key()).unwrap().fill_factor(), 0.0);
        assert_eq!(store.globally_used_quota(), Quota::zero());
    }

    #[test]
    fn test_add_hits_uses_clock() {
        let (clock, store) = store();
        let set = ts("roads", "EPSG:4326", None);
        let page = TilePage::new(set.id(), 1, 1, 2, 1_000);
        store.add_tiles_and_quota(&set, &page, 1, 1, 10);

        clock.advance_minutes(5);
        let stats = store.add_hits(&set, &page, 3);
        assert_eq!(stats.last_access_minutes(), 1_005);
        assert_eq!(stats.num_hits(), 3);
    }

    #[test]
    fn test_pages_for_layer() {
        let (_clock, store) = store();
        let a = ts("roads", "EPSG:4326", None);
        let b = ts("roads", "EPSG:900913", None);
        let c = ts("rivers", "EPSG:4326", None);
        for set in [&a, &b, &c] {
            store.add_tiles_and_quota(set, &TilePage::new(set.id(), 0, 0, 0, 0), 1, 1, 1);
            store.add_tiles_and_quota(set, &TilePage::new(set.id(), 1, 0, 0, 0), 1, 1, 1);
        }
        assert_eq!(store.pages_for_layer("roads").len(), 4);
        assert_eq!(store.pages_for_tile_set(c.id()).len(), 2);
        assert_eq!(
            store.layer_names().into_iter().collect::<Vec<_>>(),
            vec!["rivers".to_string(), "roads".to_string()]
        );
    }

    #[test]
    fn test_cascading_deletes() {
        let (_clock, store) = store();
        let plain = ts("roads", "EPSG:4326", None);
        let styled = ts("roads", "EPSG:4326", Some("night"));
        let other_grid = ts("roads", "EPSG:900913", None);
        for set in [&plain, &styled, &other_grid] {
            store.add_tiles_and_quota(set, &TilePage::new(set.id(), 0, 0, 0, 0), 1, 1, 100);
        }

        assert_eq!(store.delete_parameters("roads", "night"), 1);
        assert!(store.tile_set(styled.id()).is_none());
        assert_eq!(store.delete_gridset("roads", "EPSG:900913"), 1);
        assert_eq!(store.used_quota_by_layer("roads").bytes(), 100);
        assert_eq!(store.delete_layer("roads"), 1);
        assert_eq!(store.page_count(), 0);
        assert!(store.tile_sets().is_empty());
    }

    #[test]
    fn test_rename_layer_moves_pages() {
        let (_clock, store) = store();
        let set = ts("old", "EPSG:4326", None);
        let page = TilePage::new(set.id(), 3, 4, 5, 0);
        store.add_tiles_and_quota(&set, &page, 1, 2, 512);

        store.rename_layer("old", "new");
        let renamed = set.renamed("new");
        assert!(store.tile_set(set.id()).is_none());
        assert_eq!(store.used_quota_by_layer("new").bytes(), 512);
        let pages = store.pages_for_tile_set(renamed.id());
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page.page_x(), 3);
        assert_eq!(pages[0].stats.fill_factor(), 0.5);
    }

    #[test]
    fn test_set_truncated_materializes_page() {
        let (_clock, store) = store();
        let set = ts("roads", "EPSG:4326", None);
        let page = TilePage::new(set.id(), 9, 9, 9, 0);
        store.set_truncated(&set, &page);
        assert!(store.page_stats(&page.key()).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        let (clock, store) = store();
        let set = ts("roads", "EPSG:4326", Some("p"));
        let page = TilePage::new(set.id(), 1, 2, 3, 1_000);
        store.add_tiles_and_quota(&set, &page, 3, 9, 3 * 4096);
        store.add_hits(&set, &page, 7);
        store.save_snapshot(&path).unwrap();

        let loaded = PageStore::load_snapshot(&path, clock).unwrap();
        assert_eq!(loaded.tile_sets(), vec![set.clone()]);
        let before = store.page_stats(&page.key()).unwrap();
        let after = loaded.page_stats(&page.key()).unwrap();
        assert_eq!(after.fill_factor(), before.fill_factor());
        assert_eq!(after.num_hits(), 7);
        assert!((after.frequency_of_use() - before.frequency_of_use()).abs() < 1e-9);
        assert_eq!(loaded.usage(set.id()), store.usage(set.id()));
    }
}
