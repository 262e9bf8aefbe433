//! Page-based tile accounting
//!
//! Tiles of a tile set are grouped into pages per zoom level; usage is tracked
//! per page instead of per tile.
//!
//! ```text
//! GridCoverageProvider ─▶ TilePageCalculator ─▶ PagePyramid
//!                                │
//!                                ▼
//!                   PageStore (TileSet, TilePage, PageStats, usage)
//! ```

mod calculator;
mod page;
mod pyramid;
mod stats;
mod store;
mod tile_set;

pub use calculator::{GridCoverageProvider, StaticCoverageProvider, TilePageCalculator};
pub use page::{PageKey, TilePage};
pub use pyramid::{tiles_per_page_axis, PageLevelInfo, PagePyramid, PAGE_LOG_BASE};
pub use stats::{PageStats, FILL_SCALE};
pub use store::{PageEntry, PageStore, TileSetUsage};
pub use tile_set::TileSet;
