//! Tile objects, keys and ranges

use std::collections::BTreeMap;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::paging::TileSet;

/// Identity of one cached tile
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub layer_name: String,
    pub gridset_id: String,
    pub blob_format: String,
    pub parameters_id: Option<String>,
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}/{}",
            self.layer_name,
            self.gridset_id,
            self.blob_format,
            self.parameters_id.as_deref().unwrap_or("default"),
            self.z,
            self.x,
            self.y
        )
    }
}

/// Stable id of a parameter set: hex SHA-256 of the percent-encoded `k=v`
/// pairs in key order, joined by `&`. Empty parameters have no id.
pub fn parameters_id(parameters: &BTreeMap<String, String>) -> Option<String> {
    if parameters.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    for (i, (k, v)) in parameters.iter().enumerate() {
        if i > 0 {
            hasher.update(b"&");
        }
        hasher.update(urlencoding::encode(k).as_bytes());
        hasher.update(b"=");
        hasher.update(urlencoding::encode(v).as_bytes());
    }
    Some(format!("{:x}", hasher.finalize()))
}

/// A single tile in flight: key, payload and bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct TileObject {
    pub layer_name: String,
    pub xyz: [i64; 3],
    pub gridset_id: String,
    pub blob_format: String,
    pub parameters: BTreeMap<String, String>,
    pub parameters_id: Option<String>,
    pub blob: Option<Bytes>,
    pub blob_size: u64,
    /// Creation time, milliseconds since the Unix epoch
    pub created: i64,
}

impl TileObject {
    /// Tile without payload, used for lookups
    pub fn new(
        layer_name: impl Into<String>,
        xyz: [i64; 3],
        gridset_id: impl Into<String>,
        blob_format: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        let parameters_id = parameters_id(&parameters);
        Self {
            layer_name: layer_name.into(),
            xyz,
            gridset_id: gridset_id.into(),
            blob_format: blob_format.into(),
            parameters,
            parameters_id,
            blob: None,
            blob_size: 0,
            created: 0,
        }
    }

    /// Attach a payload
    pub fn with_blob(mut self, blob: Bytes) -> Self {
        self.set_blob(Some(blob));
        self
    }

    pub fn with_created(mut self, created: i64) -> Self {
        self.created = created;
        self
    }

    pub fn set_blob(&mut self, blob: Option<Bytes>) {
        self.blob_size = blob.as_ref().map_or(0, |b| b.len() as u64);
        self.blob = blob;
    }

    #[inline]
    pub fn x(&self) -> i64 {
        self.xyz[0]
    }

    #[inline]
    pub fn y(&self) -> i64 {
        self.xyz[1]
    }

    #[inline]
    pub fn z(&self) -> i64 {
        self.xyz[2]
    }

    pub fn has_parameters(&self) -> bool {
        !self.parameters.is_empty()
    }

    pub fn key(&self) -> TileKey {
        TileKey {
            layer_name: self.layer_name.clone(),
            gridset_id: self.gridset_id.clone(),
            blob_format: self.blob_format.clone(),
            parameters_id: self.parameters_id.clone(),
            x: self.xyz[0],
            y: self.xyz[1],
            z: self.xyz[2],
        }
    }

    pub fn tile_set(&self) -> TileSet {
        TileSet::new(
            self.layer_name.clone(),
            self.gridset_id.clone(),
            self.blob_format.clone(),
            self.parameters_id.clone(),
        )
    }
}

impl std::fmt::Display for TileObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TileObject[{}]", self.key())
    }
}

/// Declarative set of tiles: one layer, gridset, format and parameter set,
/// a zoom span and per-zoom bounds
#[derive(Debug, Clone, PartialEq)]
pub struct TileRange {
    pub layer_name: String,
    pub gridset_id: String,
    pub blob_format: String,
    pub parameters_id: Option<String>,
    pub zoom_start: u32,
    pub zoom_stop: u32,
    /// Inclusive `[minX, minY, maxX, maxY]` per zoom level
    bounds: BTreeMap<u32, [i64; 4]>,
}

impl TileRange {
    /// Build from `[minX, minY, maxX, maxY, z]` bounds. Zoom levels inside
    /// the span without bounds are unbounded.
    pub fn new(
        layer_name: impl Into<String>,
        gridset_id: impl Into<String>,
        blob_format: impl Into<String>,
        parameters_id: Option<String>,
        zoom_start: u32,
        zoom_stop: u32,
        range_bounds: &[[i64; 5]],
    ) -> Self {
        let bounds = range_bounds
            .iter()
            .filter(|b| b[4] >= 0)
            .map(|b| (b[4] as u32, [b[0], b[1], b[2], b[3]]))
            .collect();
        Self {
            layer_name: layer_name.into(),
            gridset_id: gridset_id.into(),
            blob_format: blob_format.into(),
            parameters_id,
            zoom_start,
            zoom_stop,
            bounds,
        }
    }

    /// Range of the tiles in one page coverage of a tile set
    pub fn for_page(tile_set: &TileSet, coverage: [i64; 5]) -> Self {
        let z = coverage[4].max(0) as u32;
        Self::new(
            tile_set.layer_name(),
            tile_set.gridset_id(),
            tile_set.blob_format(),
            tile_set.parameters_id().map(String::from),
            z,
            z,
            &[coverage],
        )
    }

    pub fn bounds(&self, z: u32) -> Option<[i64; 4]> {
        self.bounds.get(&z).copied()
    }

    /// Whether `key` falls inside this range
    pub fn contains(&self, key: &TileKey) -> bool {
        if key.layer_name != self.layer_name
            || key.gridset_id != self.gridset_id
            || key.blob_format != self.blob_format
            || key.parameters_id != self.parameters_id
        {
            return false;
        }
        if key.z < self.zoom_start as i64 || key.z > self.zoom_stop as i64 {
            return false;
        }
        match self.bounds.get(&(key.z as u32)) {
            Some([min_x, min_y, max_x, max_y]) => {
                key.x >= *min_x && key.x <= *max_x && key.y >= *min_y && key.y <= *max_y
            }
            None => true,
        }
    }
}

impl std::fmt::Display for TileRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TileRange[{}/{}/{} zoom {}..={}]",
            self.layer_name, self.gridset_id, self.blob_format, self.zoom_start, self.zoom_stop
        )
    }
}
