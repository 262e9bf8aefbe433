//! Page Pyramid
//!
//! Splits every zoom level of a gridset coverage into pages. The number of
//! tiles per page along an axis grows with the axis length:
//!
//! ```text
//! tiles_per_page(n) = 1                          n == 1
//!                   = ceil(n / log_1.1(n))       otherwise
//! pages(n)          = ceil(n / tiles_per_page(n))
//! ```
//!
//! Low zoom levels end up with single-tile pages, deep levels with large
//! pages, and the page count per level stays small.

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::{Error, Result};

/// Logarithm base for the tiles-per-page curve
pub const PAGE_LOG_BASE: f64 = 1.1;

/// Number of tiles per page along an axis `tiles` long
pub fn tiles_per_page_axis(tiles: i64) -> u32 {
    if tiles <= 1 {
        return 1;
    }
    let n = tiles as f64;
    let log = n.ln() / PAGE_LOG_BASE.ln();
    (n / log).ceil().max(1.0) as u32
}

/// Page layout of one zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLevelInfo {
    pub pages_x: u32,
    pub pages_y: u32,
    pub tiles_per_page_x: u32,
    pub tiles_per_page_y: u32,
    pub coverage_min_x: i64,
    pub coverage_min_y: i64,
    pub coverage_max_x: i64,
    pub coverage_max_y: i64,
}

impl PageLevelInfo {
    fn from_coverage(coverage: &[i64; 5]) -> Self {
        let [min_x, min_y, max_x, max_y, _] = *coverage;
        let tiles_wide = 1 + max_x - min_x;
        let tiles_high = 1 + max_y - min_y;
        let tiles_per_page_x = tiles_per_page_axis(tiles_wide);
        let tiles_per_page_y = tiles_per_page_axis(tiles_high);

        Self {
            pages_x: ceil_div(tiles_wide, tiles_per_page_x),
            pages_y: ceil_div(tiles_high, tiles_per_page_y),
            tiles_per_page_x,
            tiles_per_page_y,
            coverage_min_x: min_x,
            coverage_min_y: min_y,
            coverage_max_x: max_x,
            coverage_max_y: max_y,
        }
    }

    /// Tiles in one full page
    #[inline]
    pub fn tiles_per_page(&self) -> u64 {
        self.tiles_per_page_x as u64 * self.tiles_per_page_y as u64
    }

    /// Pages on this level
    #[inline]
    pub fn page_count(&self) -> u64 {
        self.pages_x as u64 * self.pages_y as u64
    }

    fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.coverage_min_x
            && x <= self.coverage_max_x
            && y >= self.coverage_min_y
            && y <= self.coverage_max_y
    }
}

impl std::fmt::Display for PageLevelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pages: {} x {} ({}), tiles: {} x {} ({})",
            self.pages_x,
            self.pages_y,
            self.page_count(),
            self.tiles_per_page_x,
            self.tiles_per_page_y,
            self.tiles_per_page()
        )
    }
}

fn ceil_div(tiles: i64, per_page: u32) -> u32 {
    let per_page = per_page as i64;
    ((tiles + per_page - 1) / per_page) as u32
}

/// Per-zoom page layout of one gridset coverage
#[derive(Debug, Clone)]
pub struct PagePyramid {
    levels: BTreeMap<u32, PageLevelInfo>,
    zoom_start: u32,
    zoom_stop: u32,
}

impl PagePyramid {
    /// Build a pyramid from `[minX, minY, maxX, maxY, z]` coverages
    pub fn new(coverages: &[[i64; 5]]) -> Result<Self> {
        if coverages.is_empty() {
            return Err(Error::InvalidArgument(
                "page pyramid needs at least one coverage".to_string(),
            ));
        }

        let mut levels = BTreeMap::new();
        for coverage in coverages {
            let [min_x, min_y, max_x, max_y, z] = *coverage;
            if z < 0 || z > u32::MAX as i64 {
                return Err(Error::InvalidArgument(format!("invalid zoom level {}", z)));
            }
            if max_x < min_x || max_y < min_y {
                return Err(Error::InvalidArgument(format!(
                    "empty coverage {:?} at zoom level {}",
                    coverage, z
                )));
            }
            let info = PageLevelInfo::from_coverage(coverage);
            trace!("Zoom level {}: {}", z, info);
            levels.insert(z as u32, info);
        }

        let zoom_start = *levels.keys().next().unwrap_or(&0);
        let zoom_stop = *levels.keys().next_back().unwrap_or(&0);
        Ok(Self {
            levels,
            zoom_start,
            zoom_stop,
        })
    }

    #[inline]
    pub fn zoom_start(&self) -> u32 {
        self.zoom_start
    }

    #[inline]
    pub fn zoom_stop(&self) -> u32 {
        self.zoom_stop
    }

    /// Zoom levels with a coverage, ascending
    pub fn zoom_levels(&self) -> impl Iterator<Item = u32> + '_ {
        self.levels.keys().copied()
    }

    /// Page layout of zoom level `z`
    pub fn page_info(&self, z: u32) -> Result<&PageLevelInfo> {
        self.levels.get(&z).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "zoom level {} outside [{}, {}] or without coverage",
                z, self.zoom_start, self.zoom_stop
            ))
        })
    }

    pub fn tiles_per_page_x(&self, z: u32) -> Result<u32> {
        Ok(self.page_info(z)?.tiles_per_page_x)
    }

    pub fn tiles_per_page_y(&self, z: u32) -> Result<u32> {
        Ok(self.page_info(z)?.tiles_per_page_y)
    }

    pub fn pages_per_level_x(&self, z: u32) -> Result<u32> {
        Ok(self.page_info(z)?.pages_x)
    }

    pub fn pages_per_level_y(&self, z: u32) -> Result<u32> {
        Ok(self.page_info(z)?.pages_y)
    }

    pub fn tiles_per_page(&self, z: u32) -> Result<u64> {
        Ok(self.page_info(z)?.tiles_per_page())
    }

    /// Page `[pageX, pageY, z]` holding tile `(x, y, z)`
    pub fn page_index_for_tile(&self, x: i64, y: i64, z: u32) -> Result<[u32; 3]> {
        let info = self.page_info(z)?;
        if !info.contains(x, y) {
            return Err(Error::InvalidArgument(format!(
                "tile ({}, {}, {}) outside coverage [{}, {}, {}, {}]",
                x, y, z, info.coverage_min_x, info.coverage_min_y, info.coverage_max_x,
                info.coverage_max_y
            )));
        }
        let page_x = (x - info.coverage_min_x) / info.tiles_per_page_x as i64;
        let page_y = (y - info.coverage_min_y) / info.tiles_per_page_y as i64;
        Ok([page_x as u32, page_y as u32, z])
    }

    /// Like [`page_index_for_tile`](Self::page_index_for_tile), writing into
    /// a caller buffer which must hold exactly three elements
    pub fn page_index_for_tile_into(
        &self,
        x: i64,
        y: i64,
        z: u32,
        target: &mut [u32],
    ) -> Result<()> {
        if target.len() != 3 {
            return Err(Error::InvalidArgument(format!(
                "page index target must have length 3, got {}",
                target.len()
            )));
        }
        target.copy_from_slice(&self.page_index_for_tile(x, y, z)?);
        Ok(())
    }

    /// Tile range `[minX, minY, maxX, maxY, z]` covered by a page.
    ///
    /// The last page of a row or column may reach past the level coverage.
    pub fn to_grid_coverage(&self, page_x: u32, page_y: u32, z: u32) -> Result<[i64; 5]> {
        let info = self.page_info(z)?;
        if page_x >= info.pages_x || page_y >= info.pages_y {
            return Err(Error::InvalidArgument(format!(
                "page ({}, {}) outside {} x {} pages at zoom level {}",
                page_x, page_y, info.pages_x, info.pages_y, z
            )));
        }
        let min_x = info.coverage_min_x + page_x as i64 * info.tiles_per_page_x as i64;
        let min_y = info.coverage_min_y + page_y as i64 * info.tiles_per_page_y as i64;
        let max_x = min_x + info.tiles_per_page_x as i64 - 1;
        let max_y = min_y + info.tiles_per_page_y as i64 - 1;
        Ok([min_x, min_y, max_x, max_y, z as i64])
    }

    /// Every page index of every level, zoom ascending
    pub fn page_indices(&self) -> impl Iterator<Item = [u32; 3]> + '_ {
        self.levels.iter().flat_map(|(&z, info)| {
            (0..info.pages_y).flat_map(move |y| (0..info.pages_x).map(move |x| [x, y, z]))
        })
    }

    /// Total number of pages across all levels
    pub fn page_count(&self) -> u64 {
        self.levels.values().map(PageLevelInfo::page_count).sum()
    }
}
