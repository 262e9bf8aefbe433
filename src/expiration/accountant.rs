//! Quota Accountant
//!
//! Follows blob store changes to keep per-page fill factors and per-tile-set
//! usage current, and runs expiration sweeps when a layer, or the set of
//! layers under the global quota, uses more than allowed.
//!
//! ```text
//! BlobStore ──events──▶ QuotaAccountant ──▶ PageStore (fill, usage)
//!                              │
//!                     excess > 0 ? ──▶ PageSweeper ──▶ TileBreeder
//! ```
//!
//! Stored sizes are rounded up to whole disk blocks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::cleaner::{PageSweeper, SweepOutcome};
use super::policy::{ExpirationPolicy, PolicyRegistry};
use super::truncator::TileBreeder;
use crate::config::DiskQuotaConfig;
use crate::error::Result;
use crate::lock::LockProvider;
use crate::paging::{PageStats, PageStore, TilePageCalculator, TileSet};
use crate::quota::{LayerQuota, Quota};
use crate::storage::{BlobStoreListener, TileEvent};

/// Usage tracker and quota enforcer
pub struct QuotaAccountant {
    config: DiskQuotaConfig,
    registry: PolicyRegistry,
    store: Arc<PageStore>,
    calculator: Arc<TilePageCalculator>,
    sweeper: PageSweeper,
    layer_quotas: RwLock<BTreeMap<String, LayerQuota>>,
}

impl QuotaAccountant {
    /// Build an accountant; fails when `config` does not validate against
    /// `registry`
    pub fn new(
        config: DiskQuotaConfig,
        registry: PolicyRegistry,
        store: Arc<PageStore>,
        calculator: Arc<TilePageCalculator>,
        breeder: Arc<dyn TileBreeder>,
        locks: Arc<dyn LockProvider>,
    ) -> Result<Self> {
        config.validate(&registry)?;
        let layer_quotas = config
            .layer_quotas
            .iter()
            .map(|q| (q.layer.clone(), q.clone()))
            .collect();
        let sweeper = PageSweeper::new(calculator.clone(), store.clone(), breeder, locks);

        Ok(Self {
            config,
            registry,
            store,
            calculator,
            sweeper,
            layer_quotas: RwLock::new(layer_quotas),
        })
    }

    pub fn config(&self) -> &DiskQuotaConfig {
        &self.config
    }

    pub fn page_store(&self) -> &Arc<PageStore> {
        &self.store
    }

    /// Bytes a blob of `size` bytes occupies on disk
    pub fn rounded_size(&self, size: u64) -> i128 {
        let block = self.config.block_size() as i128;
        let size = size as i128;
        (size + block - 1) / block * block
    }

    // =========================================================================
    // Access Tracking
    // =========================================================================

    /// Record `hits` on the tile at `tile_index`
    pub fn record_hits(&self, tile_set: &TileSet, tile_index: [i64; 3], hits: u64) -> Result<PageStats> {
        let now = self.store.clock().now_minutes();
        let page = self.calculator.page_for_tile(tile_set, tile_index, now)?;
        Ok(self.store.add_hits(tile_set, &page, hits))
    }

    fn account(&self, event: &TileEvent, num_tiles: i64, bytes: i128) {
        let tile_set = TileSet::new(
            event.layer_name.as_str(),
            event.gridset_id.as_str(),
            event.blob_format.as_str(),
            event.parameters_id.clone(),
        );
        let now = self.store.clock().now_minutes();
        let page = match self
            .calculator
            .page_for_tile(&tile_set, [event.x, event.y, event.z], now)
        {
            Ok(page) => page,
            Err(e) => {
                warn!("Not accounting tile {},{},{} of {}: {}", event.x, event.y, event.z, tile_set, e);
                return;
            }
        };
        let tiles_per_page = match self.calculator.tiles_per_page(&tile_set, page.zoom_level()) {
            Ok(n) => n,
            Err(e) => {
                warn!("Not accounting tile in {}: {}", page, e);
                return;
            }
        };
        self.store
            .add_tiles_and_quota(&tile_set, &page, num_tiles, tiles_per_page, bytes);
    }

    // =========================================================================
    // Usage
    // =========================================================================

    pub fn used_quota(&self, layer: &str) -> Quota {
        self.store.used_quota_by_layer(layer)
    }

    pub fn globally_used_quota(&self) -> Quota {
        self.store.globally_used_quota()
    }

    /// Configured limit of `layer`, `None` when it falls under the global quota
    pub fn allowed_quota(&self, layer: &str) -> Option<Quota> {
        self.layer_quotas.read().get(layer).and_then(|q| q.quota)
    }

    /// Layer quota with its current usage
    pub fn layer_quota(&self, layer: &str) -> Option<LayerQuota> {
        let mut quota = self.layer_quotas.read().get(layer).cloned()?;
        quota.used_quota = self.used_quota(layer);
        Some(quota)
    }

    /// Usage beyond the layer's own quota; non-positive when within it
    pub fn excess(&self, layer: &str) -> Option<Quota> {
        self.layer_quota(layer).map(|q| q.excess())
    }

    /// Layers with a quota of their own that are currently over it
    pub fn layers_over_quota(&self) -> Vec<String> {
        let layers: Vec<String> = self.layer_quotas.read().keys().cloned().collect();
        layers
            .into_iter()
            .filter(|l| self.excess(l).map_or(false, |e| e.is_positive()))
            .collect()
    }

    /// Known layers without a quota of their own
    fn global_layers(&self) -> BTreeSet<String> {
        let quotas = self.layer_quotas.read();
        self.store
            .layer_names()
            .into_iter()
            .filter(|l| !quotas.contains_key(l))
            .collect()
    }

    /// Usage of the layers under the global quota beyond it
    pub fn global_excess(&self) -> Quota {
        let mut used = Quota::zero();
        for layer in self.global_layers() {
            used.add(&self.used_quota(&layer));
        }
        used.difference(&self.config.global_quota)
    }

    fn policy_for(&self, layer: &str) -> Result<Arc<dyn ExpirationPolicy>> {
        let name = self
            .layer_quotas
            .read()
            .get(layer)
            .and_then(|q| q.expiration_policy_name.clone())
            .unwrap_or_else(|| self.config.global_expiration_policy_name.clone());
        self.registry.get(&name)
    }

    // =========================================================================
    // Enforcement
    // =========================================================================

    /// Sweep `layer` until it is within its quota or nothing is left to
    /// truncate. Layers without a quota are left alone.
    #[instrument(skip(self, cancel))]
    pub async fn enforce(&self, layer: &str, cancel: &CancellationToken) -> Result<SweepOutcome> {
        let mut total = SweepOutcome::default();
        if self.allowed_quota(layer).is_none() {
            return Ok(total);
        }
        let policy = self.policy_for(layer)?;

        loop {
            let excess = match self.excess(layer) {
                Some(excess) if excess.is_positive() => excess,
                _ => break,
            };
            info!("Layer {} exceeds its quota by {}", layer, excess);
            let tile_sets = self.store.tile_sets_for_layer(layer);
            let outcome = self
                .sweeper
                .sweep(&tile_sets, policy.as_ref(), &excess, cancel)
                .await?;
            total.merge(&outcome);
            if outcome.pages_truncated == 0 {
                warn!(
                    "Layer {} still {} over quota with no pages left to truncate",
                    layer, excess
                );
                break;
            }
        }
        Ok(total)
    }

    /// Sweep every layer without its own quota until they fit the global one
    #[instrument(skip(self, cancel))]
    pub async fn enforce_global(&self, cancel: &CancellationToken) -> Result<SweepOutcome> {
        let policy = self.registry.get(&self.config.global_expiration_policy_name)?;
        let mut total = SweepOutcome::default();

        loop {
            let excess = self.global_excess();
            if !excess.is_positive() {
                break;
            }
            info!("Global quota exceeded by {}", excess);
            let tile_sets: Vec<TileSet> = self
                .global_layers()
                .iter()
                .flat_map(|l| self.store.tile_sets_for_layer(l))
                .collect();
            let outcome = self
                .sweeper
                .sweep(&tile_sets, policy.as_ref(), &excess, cancel)
                .await?;
            total.merge(&outcome);
            if outcome.pages_truncated == 0 {
                warn!("Global quota still exceeded by {} with no pages left to truncate", excess);
                break;
            }
        }
        Ok(total)
    }
}

impl BlobStoreListener for QuotaAccountant {
    fn tile_stored(&self, event: &TileEvent) {
        self.account(event, 1, self.rounded_size(event.blob_size));
    }

    fn tile_deleted(&self, event: &TileEvent) {
        self.account(event, -1, -self.rounded_size(event.blob_size));
    }

    fn tile_updated(&self, event: &TileEvent, old_size: u64) {
        let delta = self.rounded_size(event.blob_size) - self.rounded_size(old_size);
        self.account(event, 0, delta);
    }

    fn layer_deleted(&self, layer: &str) {
        let pages = self.store.delete_layer(layer);
        self.calculator.invalidate(layer);
        debug!("Layer {} deleted, dropped {} pages", layer, pages);
    }

    fn layer_renamed(&self, old_layer: &str, new_layer: &str) {
        self.store.rename_layer(old_layer, new_layer);
        self.calculator.invalidate(old_layer);
        let mut quotas = self.layer_quotas.write();
        if let Some(mut quota) = quotas.remove(old_layer) {
            quota.layer = new_layer.to_string();
            quotas.insert(new_layer.to_string(), quota);
        }
        debug!("Layer {} renamed to {}", old_layer, new_layer);
    }

    fn gridset_deleted(&self, layer: &str, gridset_id: &str) {
        self.store.delete_gridset(layer, gridset_id);
    }

    fn parameters_deleted(&self, layer: &str, parameters_id: &str) {
        self.store.delete_parameters(layer, parameters_id);
    }
}
