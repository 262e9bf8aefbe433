//! Tile pages

use serde::{Deserialize, Serialize};

/// Primary key of a page.
///
/// Field order gives the derived `Ord` tile set first, then zoom, row and
/// column, so a sorted map walks each tile set level by level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageKey {
    pub tile_set_id: String,
    pub z: u32,
    pub y: u32,
    pub x: u32,
}

impl std::fmt::Display for PageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{},{},{}", self.tile_set_id, self.x, self.y, self.z)
    }
}

/// Rectangular block of tiles at one zoom level of a tile set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilePage {
    tile_set_id: String,
    page_x: u32,
    page_y: u32,
    zoom_level: u32,
    creation_time_minutes: i64,
}

impl TilePage {
    pub fn new(
        tile_set_id: impl Into<String>,
        page_x: u32,
        page_y: u32,
        zoom_level: u32,
        creation_time_minutes: i64,
    ) -> Self {
        Self {
            tile_set_id: tile_set_id.into(),
            page_x,
            page_y,
            zoom_level,
            creation_time_minutes,
        }
    }

    #[inline]
    pub fn tile_set_id(&self) -> &str {
        &self.tile_set_id
    }

    #[inline]
    pub fn page_x(&self) -> u32 {
        self.page_x
    }

    #[inline]
    pub fn page_y(&self) -> u32 {
        self.page_y
    }

    #[inline]
    pub fn zoom_level(&self) -> u32 {
        self.zoom_level
    }

    #[inline]
    pub fn creation_time_minutes(&self) -> i64 {
        self.creation_time_minutes
    }

    pub fn key(&self) -> PageKey {
        PageKey {
            tile_set_id: self.tile_set_id.clone(),
            z: self.zoom_level,
            y: self.page_y,
            x: self.page_x,
        }
    }

    /// Same page re-homed under another tile set id
    pub(crate) fn with_tile_set_id(&self, tile_set_id: &str) -> Self {
        Self {
            tile_set_id: tile_set_id.to_string(),
            ..self.clone()
        }
    }
}

impl std::fmt::Display for TilePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TilePage[{}@{},{},{}]",
            self.tile_set_id, self.page_x, self.page_y, self.zoom_level
        )
    }
}
