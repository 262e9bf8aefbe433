//! Page usage statistics
//!
//! Fill factor is held in fixed point, [`FILL_SCALE`] units per 1.0, so that
//! many small `add_tiles` updates do not drift. Frequency of use is an
//! exponentially smoothed hits-per-minute estimate.

use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// Fixed-point units per 1.0 of fill factor
pub const FILL_SCALE: i64 = 10_000_000;

/// Usage accounting for one page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageStats {
    fill_units: i64,
    frequency_of_use: f64,
    last_access_minutes: i64,
    num_hits: u64,
}

impl PageStats {
    /// Fresh stats last accessed at `now_minutes`
    pub fn new(now_minutes: i64) -> Self {
        Self {
            fill_units: 0,
            frequency_of_use: 0.0,
            last_access_minutes: now_minutes,
            num_hits: 0,
        }
    }

    /// Fresh stats stamped with the current time of `clock`
    pub fn now(clock: &dyn Clock) -> Self {
        Self::new(clock.now_minutes())
    }

    /// Fraction of the page's tile slots that are cached, in `[0, 1]`
    #[inline]
    pub fn fill_factor(&self) -> f64 {
        self.fill_units as f64 / FILL_SCALE as f64
    }

    #[inline]
    pub fn frequency_of_use(&self) -> f64 {
        self.frequency_of_use
    }

    #[inline]
    pub fn last_access_minutes(&self) -> i64 {
        self.last_access_minutes
    }

    /// Total hits recorded
    #[inline]
    pub fn num_hits(&self) -> u64 {
        self.num_hits
    }

    pub fn is_empty(&self) -> bool {
        self.fill_units == 0
    }

    /// Record `num_hits` hits observed at `now_minutes`.
    ///
    /// Times before the page's creation are moved up to it. Hits are scaled
    /// by the inverse fill factor so a sparse page is not penalised for
    /// holding few tiles.
    pub fn add_hits_and_access_time(
        &mut self,
        num_hits: u64,
        now_minutes: i64,
        page_creation_minutes: i64,
    ) {
        let now = now_minutes.max(page_creation_minutes);
        if self.fill_units <= 0 {
            // Hits may be reported before the tiles that caused them
            self.fill_units = 1;
        }

        let hits_factor = num_hits as f64 / self.fill_factor();
        let diff = now.saturating_sub(self.last_access_minutes).max(0);

        self.frequency_of_use = if diff == 0 {
            self.frequency_of_use + hits_factor
        } else {
            (self.frequency_of_use + hits_factor / diff as f64) / 2.0
        };
        self.num_hits = self.num_hits.saturating_add(num_hits);
        self.last_access_minutes = now;
    }

    /// Account `num_tiles` tiles added (or removed, when negative) out of
    /// `max_tiles` slots.
    ///
    /// The delta is rounded toward positive infinity at fixed-point precision,
    /// then the result is clamped to `[0, 1]`.
    pub fn add_tiles(&mut self, num_tiles: i64, max_tiles: u64) {
        if max_tiles == 0 {
            return;
        }
        if self.fill_units >= FILL_SCALE && num_tiles >= 0 {
            return;
        }
        if self.fill_units <= 0 && num_tiles <= 0 {
            return;
        }

        let numerator = num_tiles as i128 * FILL_SCALE as i128;
        let denominator = max_tiles as i128;
        let mut delta = numerator / denominator;
        if numerator % denominator != 0 && numerator > 0 {
            delta += 1;
        }

        let updated = (self.fill_units as i128 + delta).clamp(0, FILL_SCALE as i128);
        self.fill_units = updated as i64;
    }

    /// Mark every tile of the page as gone
    pub fn set_truncated(&mut self) {
        self.fill_units = 0;
    }

    /// Overwrite the fill factor, clamped to `[0, 1]`
    pub fn set_fill_factor(&mut self, fill_factor: f64) {
        let units = (fill_factor * FILL_SCALE as f64).round() as i64;
        self.fill_units = units.clamp(0, FILL_SCALE);
    }
}

impl std::fmt::Display for PageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PageStats[fillFactor: {:.7}, frequencyOfUse: {:.4}, lastAccess: {}m]",
            self.fill_factor(),
            self.frequency_of_use,
            self.last_access_minutes
        )
    }
}
