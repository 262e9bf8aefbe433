//! Quota accounting and expiration
//!
//! ```text
//! ┌────────────────┐  poll   ┌─────────────────┐  sweep  ┌─────────────┐
//! │  QuotaMonitor  │ ──────▶ │ QuotaAccountant │ ──────▶ │ PageSweeper │
//! │ (interval,     │         │ (BlobStore      │         │ (policy     │
//! │  semaphore)    │         │  listener)      │         │  order)     │
//! └────────────────┘         └─────────────────┘         └──────┬──────┘
//!                                                               │ range
//!                                                        ┌──────▼──────┐
//!                                                        │ TileBreeder │
//!                                                        └─────────────┘
//! ```

mod accountant;
mod cleaner;
mod monitor;
mod policy;
mod truncator;

pub use accountant::QuotaAccountant;
pub use cleaner::{PageSweeper, SweepOutcome};
pub use monitor::QuotaMonitor;
pub use policy::{ExpirationPolicy, LfuPolicy, LruPolicy, PolicyRegistry, LFU, LRU};
pub use truncator::{BlobStoreTruncator, TileBreeder};
