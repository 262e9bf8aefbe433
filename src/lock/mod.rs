//! Named Exclusive Locks
//!
//! Serializes regeneration of the same tile (or truncation of the same page)
//! across tasks and, with the file-backed provider, across processes.
//!
//! # Providers
//!
//! ```text
//! ┌────────────────────┬──────────────────────────────────────────────┐
//! │ ShardedLockProvider│ key hashed onto N tokio mutexes (in-process) │
//! │ FileLockProvider   │ in-process shard + OS advisory lock on file  │
//! │ NoOpLockProvider   │ always succeeds, never excludes              │
//! └────────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! A [`Lock`] is released exactly once; `release` is idempotent and dropping
//! an unreleased lock releases it.

mod file;
mod memory;
mod noop;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use file::{FileLock, FileLockProvider};
pub use memory::{MemoryLock, ShardedLockProvider};
pub use noop::{NoOpLock, NoOpLockProvider};

/// Default number of in-process lock shards
pub const DEFAULT_LOCK_SHARDS: usize = 1024;

/// Default wait between OS lock attempts
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Default bound on an OS lock wait
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Acquires named exclusive locks
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Block until the lock for `key` is held by the caller
    async fn acquire(&self, key: &str) -> Result<Box<dyn Lock>>;
}

/// Handle on a held lock
pub trait Lock: Send {
    /// Key the lock was acquired for
    fn key(&self) -> &str;

    /// Release the lock. Calling it again is a no-op.
    fn release(&mut self) -> Result<()>;
}

/// Lock provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockConfig {
    /// Number of in-process mutex shards
    pub shard_count: usize,
    /// Root directory; lock files live in `<root>/lockfiles`
    pub root: PathBuf,
    /// Wait between OS lock attempts
    #[serde(with = "duration_millis")]
    pub retry_backoff: Duration,
    /// Give up waiting for the OS lock after this long
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_LOCK_SHARDS,
            root: std::env::temp_dir().join("tilequota"),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LockConfig::default();
        assert_eq!(config.shard_count, 1024);
        assert!(config.shard_count.is_power_of_two());
        assert_eq!(config.retry_backoff, Duration::from_millis(20));
        assert_eq!(config.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_config_from_yaml() {
        let config: LockConfig =
            serde_yaml::from_str("shardCount: 16\nroot: /var/cache/tiles\ntimeout: 500\n").unwrap();
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.root, PathBuf::from("/var/cache/tiles"));
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.retry_backoff, DEFAULT_RETRY_BACKOFF);
    }
}
