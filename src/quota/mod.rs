//! Quota values
//!
//! Byte-size amounts with auto-normalizing binary units, and the per-layer
//! binding of an allowed quota to a running used quota.

mod layer;
mod unit;
mod value;

pub use layer::LayerQuota;
pub use unit::StorageUnit;
pub use value::Quota;
