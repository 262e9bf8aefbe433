//! Page Sweeper
//!
//! Orders the pages of a set of tile sets with an expiration policy and
//! truncates them one page at a time until an estimated amount of space has
//! been freed.
//!
//! Pages never touched since startup have no stats; they are synthesized
//! with zero stats so cold regions sort ahead of anything accessed. Stored
//! pages whose fill factor is already zero are not candidates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::ExpirationPolicy;
use super::truncator::TileBreeder;
use crate::error::{Error, Result};
use crate::lock::LockProvider;
use crate::paging::{PageEntry, PageKey, PageStats, PageStore, TilePageCalculator, TileSet};
use crate::quota::Quota;
use crate::storage::TileRange;

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepOutcome {
    pub pages_truncated: usize,
    pub estimated_freed: Quota,
}

impl SweepOutcome {
    pub fn merge(&mut self, other: &SweepOutcome) {
        self.pages_truncated += other.pages_truncated;
        self.estimated_freed.add(&other.estimated_freed);
    }
}

/// Truncates pages in policy order
pub struct PageSweeper {
    calculator: Arc<TilePageCalculator>,
    store: Arc<PageStore>,
    breeder: Arc<dyn TileBreeder>,
    locks: Arc<dyn LockProvider>,
}

impl PageSweeper {
    pub fn new(
        calculator: Arc<TilePageCalculator>,
        store: Arc<PageStore>,
        breeder: Arc<dyn TileBreeder>,
        locks: Arc<dyn LockProvider>,
    ) -> Self {
        Self {
            calculator,
            store,
            breeder,
            locks,
        }
    }

    /// Stored pages plus synthesized cold pages of `tile_set`
    fn candidates(&self, tile_set: &TileSet) -> Vec<PageEntry> {
        let stored: HashMap<PageKey, PageEntry> = self
            .store
            .pages_for_tile_set(tile_set.id())
            .into_iter()
            .map(|e| (e.page.key(), e))
            .collect();

        let all_pages = match self.calculator.pages_of(tile_set, 0) {
            Ok(pages) => pages,
            Err(e) => {
                warn!(
                    "No page pyramid for {}, sweeping stored pages only: {}",
                    tile_set, e
                );
                return stored.into_values().filter(|e| !e.stats.is_empty()).collect();
            }
        };

        let mut candidates = Vec::with_capacity(all_pages.len());
        for page in all_pages {
            match stored.get(&page.key()) {
                Some(entry) if entry.stats.is_empty() => {}
                Some(entry) => candidates.push(entry.clone()),
                None => candidates.push(PageEntry {
                    page,
                    stats: PageStats::new(0),
                }),
            }
        }
        candidates
    }

    /// Average stored bytes per tile of a tile set
    fn average_tile_size(&self, tile_set: &TileSet) -> f64 {
        let usage = self.store.usage(tile_set.id());
        if usage.tiles <= 0 {
            0.0
        } else {
            usage.used.bytes() as f64 / usage.tiles as f64
        }
    }

    /// Truncate pages of `tile_sets` in `policy` order until `deficit` is
    /// covered by the estimated freed space or candidates run out.
    pub async fn sweep(
        &self,
        tile_sets: &[TileSet],
        policy: &dyn ExpirationPolicy,
        deficit: &Quota,
        cancel: &CancellationToken,
    ) -> Result<SweepOutcome> {
        let by_id: HashMap<&str, &TileSet> = tile_sets.iter().map(|ts| (ts.id(), ts)).collect();
        let mut candidates: Vec<PageEntry> =
            tile_sets.iter().flat_map(|ts| self.candidates(ts)).collect();
        policy.sort(&mut candidates);
        debug!(
            "Sweeping {} candidate pages with {} to free {}",
            candidates.len(),
            policy.name(),
            deficit
        );

        let mut outcome = SweepOutcome::default();
        let mut visited: HashSet<PageKey> = HashSet::new();

        for entry in candidates {
            if cancel.is_cancelled() {
                info!("Sweep cancelled after {} pages", outcome.pages_truncated);
                return Err(Error::Cancelled(format!(
                    "sweep interrupted after {} pages",
                    outcome.pages_truncated
                )));
            }
            if outcome.estimated_freed >= *deficit {
                break;
            }

            let key = entry.page.key();
            if !visited.insert(key.clone()) {
                continue;
            }
            let tile_set = match by_id.get(key.tile_set_id.as_str()) {
                Some(ts) => *ts,
                None => continue,
            };

            if let Some(freed) = self.truncate_page(tile_set, &entry).await {
                outcome.pages_truncated += 1;
                outcome.estimated_freed.add_bytes(freed);
            }
        }

        info!(
            "Sweep truncated {} pages, estimated {} freed",
            outcome.pages_truncated, outcome.estimated_freed
        );
        Ok(outcome)
    }

    /// Truncate one page under its lock; `None` when the page was skipped
    async fn truncate_page(&self, tile_set: &TileSet, entry: &PageEntry) -> Option<i128> {
        let page = &entry.page;
        let lock_key = format!("page:{}", page.key());
        let mut lock = match self.locks.acquire(&lock_key).await {
            Ok(lock) => lock,
            Err(e) => {
                warn!("Skipping {}: {}", page, e);
                return None;
            }
        };

        let result = self.truncate_locked(tile_set, entry).await;
        if let Err(e) = lock.release() {
            warn!("Failed to release {}: {}", lock_key, e);
        }

        match result {
            Ok(freed) => Some(freed),
            Err(e) => {
                warn!("Truncating {} failed: {}", page, e);
                None
            }
        }
    }

    async fn truncate_locked(&self, tile_set: &TileSet, entry: &PageEntry) -> Result<i128> {
        let page = &entry.page;
        let coverage = self.calculator.to_grid_coverage(tile_set, page)?;
        let tiles_per_page = self.calculator.tiles_per_page(tile_set, page.zoom_level())?;
        let estimate = entry.stats.fill_factor()
            * tiles_per_page as f64
            * self.average_tile_size(tile_set);

        let range = TileRange::for_page(tile_set, coverage);
        self.breeder.truncate(&range).await?;
        self.store.set_truncated(tile_set, page);
        debug!("Truncated {}, estimated {} bytes", page, estimate as i128);
        Ok(estimate.ceil() as i128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::expiration::{LfuPolicy, LruPolicy};
    use crate::lock::ShardedLockProvider;
    use crate::paging::StaticCoverageProvider;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingBreeder {
        ranges: Mutex<Vec<TileRange>>,
    }

    #[async_trait]
    impl TileBreeder for RecordingBreeder {
        async fn truncate(&self, range: &TileRange) -> Result<bool> {
            self.ranges.lock().push(range.clone());
            Ok(true)
        }
    }

    struct Fixture {
        store: Arc<PageStore>,
        calculator: Arc<TilePageCalculator>,
        breeder: Arc<RecordingBreeder>,
        sweeper: PageSweeper,
        tile_set: TileSet,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(StaticCoverageProvider::new());
        // One 2x2 level of single-tile pages
        provider.add_layer("roads", "g", &["image/png"], vec![[0, 0, 1, 1, 0]]);
        let calculator = Arc::new(TilePageCalculator::new(provider));
        let store = Arc::new(PageStore::new(Arc::new(ManualClock::at_minutes(100))));
        let breeder = Arc::new(RecordingBreeder::default());
        let sweeper = PageSweeper::new(
            calculator.clone(),
            store.clone(),
            breeder.clone(),
            Arc::new(ShardedLockProvider::new()),
        );
        Fixture {
            store,
            calculator,
            breeder,
            sweeper,
            tile_set: TileSet::new("roads", "g", "image/png", None),
        }
    }

    fn store_tile(f: &Fixture, x: i64, y: i64, bytes: i128) {
        let page = f.calculator.page_for_tile(&f.tile_set, [x, y, 0], 100).unwrap();
        f.store.add_tiles_and_quota(&f.tile_set, &page, 1, 1, bytes);
    }

    #[tokio::test]
    async fn test_cold_pages_swept_first() {
        let f = fixture();
        store_tile(&f, 0, 0, 1000);
        let page = f.calculator.page_for_tile(&f.tile_set, [0, 0, 0], 100).unwrap();
        f.store.add_hits(&f.tile_set, &page, 10);

        let outcome = f
            .sweeper
            .sweep(
                &[f.tile_set.clone()],
                &LruPolicy,
                &Quota::from_bytes(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Three cold pages free nothing, the stored one covers the deficit
        assert_eq!(outcome.pages_truncated, 4);
        assert_eq!(outcome.estimated_freed.bytes(), 1000);
        let ranges = f.breeder.ranges.lock();
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[3].bounds(0), Some([0, 0, 0, 0]));
    }

    #[tokio::test]
    async fn test_stops_when_deficit_covered() {
        let f = fixture();
        store_tile(&f, 0, 0, 500);
        store_tile(&f, 1, 0, 500);
        store_tile(&f, 0, 1, 500);
        store_tile(&f, 1, 1, 500);

        let outcome = f
            .sweeper
            .sweep(
                &[f.tile_set.clone()],
                &LfuPolicy,
                &Quota::from_bytes(600),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.pages_truncated, 2);
        assert_eq!(outcome.estimated_freed.bytes(), 1000);
    }

    #[tokio::test]
    async fn test_truncated_pages_not_selected_again() {
        let f = fixture();
        store_tile(&f, 0, 0, 100);

        let all = [f.tile_set.clone()];
        let deficit = Quota::from_bytes(i64::MAX as i128);
        let token = CancellationToken::new();
        let first = f.sweeper.sweep(&all, &LruPolicy, &deficit, &token).await.unwrap();
        assert_eq!(first.pages_truncated, 4);

        let second = f.sweeper.sweep(&all, &LruPolicy, &deficit, &token).await.unwrap();
        assert_eq!(second.pages_truncated, 0);
        assert_eq!(f.breeder.ranges.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_fails() {
        let f = fixture();
        store_tile(&f, 0, 0, 100);
        let token = CancellationToken::new();
        token.cancel();

        let result = f
            .sweeper
            .sweep(&[f.tile_set.clone()], &LruPolicy, &Quota::from_bytes(1), &token)
            .await;
        assert_matches!(result, Err(Error::Cancelled(_)));
        assert!(f.breeder.ranges.lock().is_empty());
    }
}
