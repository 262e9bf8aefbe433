//! TileQuota - Tile Cache Storage Core
//!
//! Storage and disk-quota core for a map tile cache. Tiles are grouped into
//! pages per zoom level, usage is tracked per page, and expiration sweeps
//! truncate whole pages in LRU or LFU order when a quota is exceeded.
//!
//! # Architecture
//!
//! ```text
//!             StorageBroker (metadata + blob consistency)
//!                          │
//!        MemoryBlobStore / NestedBlobStore / backends ── LockProvider
//!                          │ events
//!                   QuotaAccountant ◀── QuotaMonitor
//!                          │
//!        PageStore + TilePageCalculator (PagePyramid, PageStats)
//!                          │
//!              ExpirationPolicy (LRU, LFU) ──▶ TileBreeder
//! ```
//!
//! # Modules
//!
//! - [`clock`] - Injectable time source
//! - [`config`] - Disk quota configuration
//! - [`error`] - Error types
//! - [`expiration`] - Policies, sweeps, quota accounting and the monitor
//! - [`lock`] - In-process, cross-process and no-op named locks
//! - [`logging`] - Tracing subscriber setup
//! - [`paging`] - Page pyramid, page stats and the page store
//! - [`quota`] - Byte quantities and layer quotas
//! - [`storage`] - Blob store contract, decorators and the storage broker

pub mod clock;
pub mod config;
pub mod error;
pub mod expiration;
pub mod lock;
pub mod logging;
pub mod paging;
pub mod quota;
pub mod storage;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DiskQuotaConfig, TimeUnit};
pub use error::{Error, Result};
pub use expiration::{PolicyRegistry, QuotaAccountant, QuotaMonitor};
pub use lock::{FileLockProvider, Lock, LockProvider, NoOpLockProvider, ShardedLockProvider};
pub use paging::{PagePyramid, PageStats, PageStore, TilePage, TilePageCalculator, TileSet};
pub use quota::{LayerQuota, Quota, StorageUnit};
pub use storage::{
    BlobStore, MemoryBlobStore, NestedBlobStore, StorageBroker, TileObject, TileRange,
};
