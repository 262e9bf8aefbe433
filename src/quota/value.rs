//! Byte-size quota values with auto-normalizing units

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::unit::StorageUnit;

/// A byte-size amount.
///
/// Stored as an exact byte count. `units` is the unit the value is reported
/// in; constructors keep the caller's unit, arithmetic renormalizes it to the
/// best fit so `value()` stays human-scale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(from = "QuotaRepr", into = "QuotaRepr")]
pub struct Quota {
    bytes: i128,
    units: StorageUnit,
}

#[derive(Serialize, Deserialize)]
struct QuotaRepr {
    value: f64,
    units: StorageUnit,
}

impl From<QuotaRepr> for Quota {
    fn from(repr: QuotaRepr) -> Self {
        Quota::new(repr.value, repr.units)
    }
}

impl From<Quota> for QuotaRepr {
    fn from(quota: Quota) -> Self {
        QuotaRepr {
            value: quota.value(),
            units: quota.units,
        }
    }
}

impl Default for Quota {
    fn default() -> Self {
        Self::zero()
    }
}

impl Quota {
    /// `value` expressed in `units`
    pub fn new(value: f64, units: StorageUnit) -> Self {
        Self {
            bytes: units.to_bytes(value),
            units,
        }
    }

    /// Exact byte count, reported in its best-fit unit
    pub fn from_bytes(bytes: i128) -> Self {
        Self {
            bytes,
            units: StorageUnit::best_fit(bytes),
        }
    }

    pub fn zero() -> Self {
        Self {
            bytes: 0,
            units: StorageUnit::B,
        }
    }

    /// Quota large enough to never be exceeded in practice
    pub fn unlimited() -> Self {
        Self::from_bytes(i64::MAX as i128)
    }

    #[inline]
    pub fn bytes(&self) -> i128 {
        self.bytes
    }

    #[inline]
    pub fn units(&self) -> StorageUnit {
        self.units
    }

    /// Amount expressed in [`Quota::units`]
    pub fn value(&self) -> f64 {
        self.bytes as f64 / self.units.bytes() as f64
    }

    pub fn is_positive(&self) -> bool {
        self.bytes > 0
    }

    fn renormalize(&mut self) {
        self.units = StorageUnit::best_fit(self.bytes);
    }

    pub fn add_bytes(&mut self, bytes: i128) {
        self.bytes += bytes;
        self.renormalize();
    }

    pub fn add_value(&mut self, value: f64, units: StorageUnit) {
        self.add_bytes(units.to_bytes(value));
    }

    pub fn add(&mut self, other: &Quota) {
        self.add_bytes(other.bytes);
    }

    pub fn subtract_bytes(&mut self, bytes: i128) {
        self.bytes -= bytes;
        self.renormalize();
    }

    pub fn subtract_value(&mut self, value: f64, units: StorageUnit) {
        self.subtract_bytes(units.to_bytes(value));
    }

    pub fn subtract(&mut self, other: &Quota) {
        self.subtract_bytes(other.bytes);
    }

    /// `self - other`, renormalized
    pub fn difference(&self, other: &Quota) -> Quota {
        Quota::from_bytes(self.bytes - other.bytes)
    }

    /// The smaller of the two amounts
    pub fn min(self, other: Quota) -> Quota {
        if other.bytes < self.bytes {
            other
        } else {
            self
        }
    }

    /// Friendly representation such as `1.5 GiB` or `0.75 MiB`
    pub fn to_nice_string(&self) -> String {
        let unit = StorageUnit::best_fit(self.bytes);
        let value = self.bytes as f64 / unit.bytes() as f64;
        let mut text = format!("{:.2}", value);
        if text.ends_with('0') {
            text.pop();
        }
        format!("{} {}", text, unit)
    }
}

impl PartialEq for Quota {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Quota {}

impl PartialOrd for Quota {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quota {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl std::fmt::Display for Quota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_nice_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_crosses_unit_boundaries() {
        let mut quota = Quota::new(512.0, StorageUnit::GiB);

        quota.add(&Quota::new(1024.0, StorageUnit::MiB));
        assert_eq!(quota.units(), StorageUnit::GiB);
        assert_eq!(quota.value(), 513.0);

        quota.add(&Quota::new(512.0, StorageUnit::GiB));
        assert_eq!(quota.units(), StorageUnit::TiB);
        assert!((quota.value() - 1.000976).abs() < 1e-6);
    }

    #[test]
    fn test_subtract_renormalizes_down() {
        let mut quota = Quota::new(1.0, StorageUnit::GiB);
        quota.subtract_value(1023.5, StorageUnit::MiB);
        assert_eq!(quota.units(), StorageUnit::KiB);
        assert_eq!(quota.value(), 512.0);
    }

    #[test]
    fn test_difference_can_be_negative() {
        let used = Quota::new(100.0, StorageUnit::MiB);
        let limit = Quota::new(1.0, StorageUnit::GiB);

        let excess = used.difference(&limit);
        assert!(!excess.is_positive());
        assert_eq!(excess.bytes(), -924 * StorageUnit::MiB.bytes());
        assert_eq!(excess.units(), StorageUnit::MiB);
        assert_eq!(excess.value(), -924.0);
    }

    #[test]
    fn test_constructor_keeps_units() {
        let quota = Quota::new(2048.0, StorageUnit::MiB);
        assert_eq!(quota.units(), StorageUnit::MiB);
        assert_eq!(quota, Quota::new(2.0, StorageUnit::GiB));
    }

    #[test]
    fn test_ordering_and_min() {
        let small = Quota::new(1.0, StorageUnit::MiB);
        let large = Quota::new(1.0, StorageUnit::GiB);
        assert!(small < large);
        assert_eq!(large.min(small), small);
        assert_eq!(small.min(large), small);
    }

    #[test]
    fn test_nice_string() {
        assert_eq!(Quota::new(1.5, StorageUnit::GiB).to_nice_string(), "1.5 GiB");
        assert_eq!(Quota::from_bytes(1536 * 1024).to_nice_string(), "1.5 MiB");
        assert_eq!(Quota::new(0.75, StorageUnit::MiB).to_nice_string(), "768.0 KiB");
        assert_eq!(Quota::zero().to_nice_string(), "0.0 B");
    }

    #[test]
    fn test_serde_roundtrip_keeps_units() {
        let quota = Quota::new(3.0, StorageUnit::GiB);
        let json = serde_json::to_string(&quota).unwrap();
        assert_eq!(json, r#"{"value":3.0,"units":"GiB"}"#);
        let back: Quota = serde_json::from_str(&json).unwrap();
        assert_eq!(back.units(), StorageUnit::GiB);
        assert_eq!(back, quota);
    }
}
