//! Binary storage units

use serde::{Deserialize, Serialize};

/// Storage unit, powers of 1024 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StorageUnit {
    B,
    KiB,
    MiB,
    GiB,
    TiB,
    PiB,
}

impl StorageUnit {
    /// All units in ascending order
    pub const ALL: [StorageUnit; 6] = [
        StorageUnit::B,
        StorageUnit::KiB,
        StorageUnit::MiB,
        StorageUnit::GiB,
        StorageUnit::TiB,
        StorageUnit::PiB,
    ];

    /// Number of bytes in one unit
    pub const fn bytes(self) -> i128 {
        1i128 << (10 * self as u32)
    }

    /// Convert `value` of this unit into whole bytes, rounding half away from zero
    pub fn to_bytes(self, value: f64) -> i128 {
        if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
            return (value as i128) * self.bytes();
        }
        (value * self.bytes() as f64).round() as i128
    }

    /// Convert `value` expressed in this unit into `target` units
    pub fn convert_to(self, value: f64, target: StorageUnit) -> f64 {
        if self == target {
            return value;
        }
        value * (self.bytes() as f64 / target.bytes() as f64)
    }

    /// Largest unit in which `bytes` is at least one whole unit
    pub fn best_fit(bytes: i128) -> StorageUnit {
        let magnitude = bytes.abs();
        Self::ALL
            .iter()
            .rev()
            .copied()
            .find(|unit| magnitude >= unit.bytes())
            .unwrap_or(StorageUnit::B)
    }

    /// Human readable unit label
    pub fn nice_name(self) -> &'static str {
        match self {
            StorageUnit::B => "B",
            StorageUnit::KiB => "KiB",
            StorageUnit::MiB => "MiB",
            StorageUnit::GiB => "GiB",
            StorageUnit::TiB => "TiB",
            StorageUnit::PiB => "PiB",
        }
    }
}

impl std::fmt::Display for StorageUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.nice_name())
    }
}

impl std::str::FromStr for StorageUnit {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|unit| unit.nice_name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| crate::error::Error::InvalidArgument(format!("Unknown storage unit: {}", s)))
    }
}
