//! In-process sharded lock provider
//!
//! Keys hash onto a fixed set of mutexes. Distinct keys may share a shard and
//! then exclude each other; that only costs throughput.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use super::{Lock, LockProvider, DEFAULT_LOCK_SHARDS};
use crate::error::{Error, Result};

/// Lock provider backed by N tokio mutexes
pub struct ShardedLockProvider {
    shards: Vec<Arc<Mutex<()>>>,
}

impl Default for ShardedLockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedLockProvider {
    /// Create a provider with [`DEFAULT_LOCK_SHARDS`] shards
    pub fn new() -> Self {
        Self {
            shards: (0..DEFAULT_LOCK_SHARDS)
                .map(|_| Arc::new(Mutex::new(())))
                .collect(),
        }
    }

    /// Create a provider with `shard_count` shards
    pub fn with_shards(shard_count: usize) -> Result<Self> {
        if shard_count == 0 {
            return Err(Error::Config(
                "lock shard count shall be a positive integer".to_string(),
            ));
        }
        Ok(Self {
            shards: (0..shard_count).map(|_| Arc::new(Mutex::new(()))).collect(),
        })
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index for `key`
    #[inline]
    pub fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Wait for the shard owning `key`
    pub async fn lock(&self, key: &str) -> MemoryLock {
        let shard = Arc::clone(&self.shards[self.shard_index(key)]);
        let guard = shard.lock_owned().await;
        trace!("Memory lock acquired for key {}", key);
        MemoryLock {
            key: key.to_string(),
            guard: Some(guard),
        }
    }
}

#[async_trait]
impl LockProvider for ShardedLockProvider {
    async fn acquire(&self, key: &str) -> Result<Box<dyn Lock>> {
        Ok(Box::new(self.lock(key).await))
    }
}

/// Held in-process lock
#[derive(Debug)]
pub struct MemoryLock {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl MemoryLock {
    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

impl Lock for MemoryLock {
    fn key(&self) -> &str {
        &self.key
    }

    fn release(&mut self) -> Result<()> {
        if self.guard.take().is_some() {
            trace!("Memory lock released for key {}", self.key);
        }
        Ok(())
    }
}
