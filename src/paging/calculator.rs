//! Tile page calculator
//!
//! Resolves tile sets to page pyramids. One pyramid is built per
//! (layer, gridset) from the coverages an external [`GridCoverageProvider`]
//! reports, and cached until the layer is invalidated.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::page::TilePage;
use super::pyramid::PagePyramid;
use super::tile_set::TileSet;
use crate::error::{Error, Result};

/// Source of per-layer gridset coverages
pub trait GridCoverageProvider: Send + Sync {
    /// Every known layer
    fn layer_names(&self) -> Vec<String>;

    /// Gridsets a layer is published in
    fn gridsets(&self, layer: &str) -> Result<Vec<String>>;

    /// Blob formats a layer is published in
    fn formats(&self, layer: &str) -> Result<Vec<String>>;

    /// Per-zoom `[minX, minY, maxX, maxY, z]` coverages of a layer in a gridset
    fn coverages(&self, layer: &str, gridset: &str) -> Result<Vec<[i64; 5]>>;
}

#[derive(Debug, Clone, Default)]
struct LayerCoverage {
    formats: Vec<String>,
    gridsets: BTreeMap<String, Vec<[i64; 5]>>,
}

/// Coverage provider backed by a fixed table
#[derive(Debug, Default)]
pub struct StaticCoverageProvider {
    layers: RwLock<BTreeMap<String, LayerCoverage>>,
}

impl StaticCoverageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `layer` in `gridset` with the given coverages and formats
    pub fn add_layer(
        &self,
        layer: &str,
        gridset: &str,
        formats: &[&str],
        coverages: Vec<[i64; 5]>,
    ) {
        let mut layers = self.layers.write();
        let entry = layers.entry(layer.to_string()).or_default();
        for format in formats {
            if !entry.formats.iter().any(|f| f == format) {
                entry.formats.push(format.to_string());
            }
        }
        entry.gridsets.insert(gridset.to_string(), coverages);
    }

    pub fn remove_layer(&self, layer: &str) {
        self.layers.write().remove(layer);
    }

    fn layer(&self, layer: &str) -> Result<LayerCoverage> {
        self.layers
            .read()
            .get(layer)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("layer {}", layer)))
    }
}

impl GridCoverageProvider for StaticCoverageProvider {
    fn layer_names(&self) -> Vec<String> {
        self.layers.read().keys().cloned().collect()
    }

    fn gridsets(&self, layer: &str) -> Result<Vec<String>> {
        Ok(self.layer(layer)?.gridsets.keys().cloned().collect())
    }

    fn formats(&self, layer: &str) -> Result<Vec<String>> {
        Ok(self.layer(layer)?.formats)
    }

    fn coverages(&self, layer: &str, gridset: &str) -> Result<Vec<[i64; 5]>> {
        self.layer(layer)?
            .gridsets
            .remove(gridset)
            .ok_or_else(|| Error::NotFound(format!("gridset {} of layer {}", gridset, layer)))
    }
}

/// Maps tiles of a tile set onto pages
pub struct TilePageCalculator {
    provider: Arc<dyn GridCoverageProvider>,
    pyramids: RwLock<HashMap<(String, String), Arc<PagePyramid>>>,
}

impl TilePageCalculator {
    pub fn new(provider: Arc<dyn GridCoverageProvider>) -> Self {
        Self {
            provider,
            pyramids: RwLock::new(HashMap::new()),
        }
    }

    /// Pyramid for a layer in a gridset, built on first use
    pub fn pyramid(&self, layer: &str, gridset: &str) -> Result<Arc<PagePyramid>> {
        let key = (layer.to_string(), gridset.to_string());
        if let Some(pyramid) = self.pyramids.read().get(&key) {
            return Ok(Arc::clone(pyramid));
        }

        let coverages = self.provider.coverages(layer, gridset)?;
        let pyramid = Arc::new(PagePyramid::new(&coverages)?);
        debug!(
            "Built page pyramid for {}/{}: zoom {}..={}, {} pages",
            layer,
            gridset,
            pyramid.zoom_start(),
            pyramid.zoom_stop(),
            pyramid.page_count()
        );
        Ok(Arc::clone(
            self.pyramids.write().entry(key).or_insert(pyramid),
        ))
    }

    fn pyramid_for(&self, tile_set: &TileSet) -> Result<Arc<PagePyramid>> {
        self.pyramid(tile_set.layer_name(), tile_set.gridset_id())
    }

    /// Page holding tile `[x, y, z]`, stamped with `now_minutes` as creation time
    pub fn page_for_tile(
        &self,
        tile_set: &TileSet,
        tile_index: [i64; 3],
        now_minutes: i64,
    ) -> Result<TilePage> {
        let [x, y, z] = tile_index;
        let z = u32::try_from(z)
            .map_err(|_| Error::InvalidArgument(format!("invalid zoom level {}", z)))?;
        let [page_x, page_y, page_z] = self.pyramid_for(tile_set)?.page_index_for_tile(x, y, z)?;
        Ok(TilePage::new(tile_set.id(), page_x, page_y, page_z, now_minutes))
    }

    /// Tile slots in one page at zoom level `z`
    pub fn tiles_per_page(&self, tile_set: &TileSet, z: u32) -> Result<u64> {
        self.pyramid_for(tile_set)?.tiles_per_page(z)
    }

    /// Tile range `[minX, minY, maxX, maxY, z]` covered by `page`
    pub fn to_grid_coverage(&self, tile_set: &TileSet, page: &TilePage) -> Result<[i64; 5]> {
        self.pyramid_for(tile_set)?
            .to_grid_coverage(page.page_x(), page.page_y(), page.zoom_level())
    }

    /// Every page of a tile set, stamped with `now_minutes`
    pub fn pages_of(&self, tile_set: &TileSet, now_minutes: i64) -> Result<Vec<TilePage>> {
        let pyramid = self.pyramid_for(tile_set)?;
        Ok(pyramid
            .page_indices()
            .map(|[x, y, z]| TilePage::new(tile_set.id(), x, y, z, now_minutes))
            .collect())
    }

    pub fn layer_names(&self) -> BTreeSet<String> {
        self.provider.layer_names().into_iter().collect()
    }

    /// Tile sets of `layer`: every gridset × format, for the default
    /// parameters plus each of `parameter_ids`
    pub fn tile_sets_for(
        &self,
        layer: &str,
        parameter_ids: &[String],
    ) -> Result<BTreeSet<TileSet>> {
        let gridsets = self.provider.gridsets(layer)?;
        let formats = self.provider.formats(layer)?;
        let params: Vec<Option<String>> = std::iter::once(None)
            .chain(parameter_ids.iter().cloned().map(Some))
            .collect();

        let mut tile_sets = BTreeSet::new();
        for gridset in &gridsets {
            for format in &formats {
                for p in &params {
                    tile_sets.insert(TileSet::new(layer, gridset.clone(), format.clone(), p.clone()));
                }
            }
        }
        Ok(tile_sets)
    }

    /// Forget cached pyramids of `layer`
    pub fn invalidate(&self, layer: &str) {
        self.pyramids.write().retain(|(l, _), _| l != layer);
    }
}
