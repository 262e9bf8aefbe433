//! Cross-process lock provider
//!
//! Each key maps to `<root>/lockfiles/<sha256(key)>.lck`. Acquisition takes the
//! in-process shard first, then polls an exclusive advisory lock on the file.
//! Guards are held in acquisition order and released in reverse.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::memory::{MemoryLock, ShardedLockProvider};
use super::{Lock, LockConfig, LockProvider};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

/// Lock provider combining an in-process shard with an OS file lock
pub struct FileLockProvider {
    lock_dir: PathBuf,
    memory: ShardedLockProvider,
    retry_backoff: Duration,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl FileLockProvider {
    /// Create a provider, creating the lock directory if needed
    pub fn new(config: &LockConfig) -> Result<Self> {
        if config.retry_backoff.is_zero() {
            return Err(Error::Config("lock retry backoff must be positive".to_string()));
        }
        let lock_dir = config.root.join("lockfiles");
        std::fs::create_dir_all(&lock_dir)?;
        debug!("File lock provider using {}", lock_dir.display());

        Ok(Self {
            lock_dir,
            memory: ShardedLockProvider::with_shards(config.shard_count)?,
            retry_backoff: config.retry_backoff,
            timeout: config.timeout,
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
        })
    }

    /// Measure the timeout against `clock`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Abort pending acquisitions when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Lock file path for `key`
    pub fn lock_file_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.lock_dir.join(format!("{:x}.lck", digest))
    }

    /// Acquire the lock for `key`
    pub async fn lock(&self, key: &str) -> Result<FileLock> {
        let memory = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(Error::LockInterrupted { key: key.to_string() });
            }
            guard = self.memory.lock(key) => guard,
        };

        // Dropping `memory` on any early return releases the shard
        let path = self.lock_file_path(key);
        let started = self.clock.now_millis();
        let timeout_ms = self.timeout.as_millis() as i64;
        let mut attempts = 0u64;

        loop {
            attempts += 1;
            if let Some(file) = try_lock_file(&path)? {
                trace!(
                    "File lock acquired for key {} after {} attempt(s)",
                    key,
                    attempts
                );
                return Ok(FileLock {
                    key: key.to_string(),
                    file: Some(LockFile { path, file }),
                    memory: Some(memory),
                });
            }

            let waited = self.clock.now_millis().saturating_sub(started);
            if waited >= timeout_ms {
                warn!(
                    "Gave up waiting for file lock on key {} after {} ms",
                    key, waited
                );
                return Err(Error::LockTimeout {
                    key: key.to_string(),
                    waited: Duration::from_millis(waited.max(0) as u64),
                });
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Lock wait on key {} interrupted", key);
                    return Err(Error::LockInterrupted { key: key.to_string() });
                }
                _ = tokio::time::sleep(self.retry_backoff) => {}
            }
        }
    }
}

#[async_trait]
impl LockProvider for FileLockProvider {
    async fn acquire(&self, key: &str) -> Result<Box<dyn Lock>> {
        Ok(Box::new(self.lock(key).await?))
    }
}

/// One attempt at the OS lock. `Ok(None)` means someone else holds it.
fn try_lock_file(path: &Path) -> Result<Option<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            // The previous holder may have deleted the path between our open
            // and our lock; that inode no longer excludes anyone.
            if refers_to(&file, path) {
                Ok(Some(file))
            } else {
                let _ = FileExt::unlock(&file);
                Ok(None)
            }
        }
        Err(e) => contended_or_failed(e, path),
    }
}

/// Contention means retry later; any other lock error is returned as is
fn contended_or_failed(e: io::Error, path: &Path) -> Result<Option<File>> {
    if is_contended(&e) {
        return Ok(None);
    }
    warn!("Lock attempt on {} failed: {}", path.display(), e);
    Err(Error::Io(e))
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(unix)]
fn refers_to(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn refers_to(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// OS half of a [`FileLock`]
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Unlock, close and delete the file.
    ///
    /// On unix the path is unlinked while the lock is still held: a waiter
    /// that opened the old inode then fails the `refers_to` check instead of
    /// entering alongside a holder of a freshly created file.
    #[cfg(unix)]
    fn release(self, key: &str) -> Result<()> {
        remove_lock_file(&self.path, key);
        let unlocked = FileExt::unlock(&self.file);
        drop(self.file);
        Self::report(unlocked, key)
    }

    #[cfg(not(unix))]
    fn release(self, key: &str) -> Result<()> {
        let unlocked = FileExt::unlock(&self.file);
        drop(self.file);
        remove_lock_file(&self.path, key);
        Self::report(unlocked, key)
    }

    /// An unlock failure means the lock was already gone; it is logged only
    fn report(unlocked: io::Result<()>, key: &str) -> Result<()> {
        if let Err(e) = unlocked {
            warn!("Lock on key {} was no longer valid at release: {}", key, e);
        }
        Ok(())
    }
}

/// Best effort; a leftover file only costs a stale inode
fn remove_lock_file(path: &Path, key: &str) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!(
            "Could not delete lock file {} for key {}: {}",
            path.display(),
            key,
            e
        ),
    }
}

/// Held cross-process lock
#[derive(Debug)]
pub struct FileLock {
    key: String,
    // Declared before `memory` so drop order matches release order
    file: Option<LockFile>,
    memory: Option<MemoryLock>,
}

impl FileLock {
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Lock for FileLock {
    fn key(&self) -> &str {
        &self.key
    }

    fn release(&mut self) -> Result<()> {
        let released = match self.file.take() {
            Some(file) => file.release(&self.key),
            None => Ok(()),
        };
        if let Some(mut memory) = self.memory.take() {
            memory.release()?;
            trace!("File lock released for key {}", self.key);
        }
        released
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.file.is_some() || self.memory.is_some() {
            if let Err(e) = self.release() {
                warn!("Releasing lock on key {} during drop failed: {}", self.key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn config(root: &Path, timeout: Duration) -> LockConfig {
        LockConfig {
            shard_count: 16,
            root: root.to_path_buf(),
            retry_backoff: Duration::from_millis(5),
            timeout,
        }
    }

    #[test]
    fn test_non_contention_lock_errors_propagate() {
        let path = Path::new("/var/cache/tiles/k.lock");
        let busy = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(contended_or_failed(busy, path).unwrap().is_none());

        let no_locks = io::Error::new(io::ErrorKind::Other, "no locks available");
        assert_matches!(contended_or_failed(no_locks, path), Err(Error::Io(_)));
    }

    #[test]
    fn test_invalid_lock_at_release_is_not_an_error() {
        let gone = io::Error::new(io::ErrorKind::Other, "bad file descriptor");
        assert!(LockFile::report(Err(gone), "k").is_ok());
        assert!(LockFile::report(Ok(()), "k").is_ok());
    }

    #[test]
    fn test_lock_file_name_is_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileLockProvider::new(&config(dir.path(), Duration::from_secs(1))).unwrap();
        let path = provider.lock_file_path("layer:1:2:3");

        assert_eq!(path.parent(), Some(provider.lock_dir()));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(".lck"));
        assert_eq!(name.len(), 64 + 4);
        assert_ne!(path, provider.lock_file_path("layer:1:2:4"));
    }

    #[tokio::test]
    async fn test_lock_file_removed_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileLockProvider::new(&config(dir.path(), Duration::from_secs(1))).unwrap();
        let path = provider.lock_file_path("k");

        let mut lock = provider.acquire("k").await.unwrap();
        assert!(path.exists());
        lock.release().unwrap();
        assert!(!path.exists());

        // Second release is harmless
        lock.release().unwrap();
    }

    #[tokio::test]
    async fn test_timeout_releases_memory_lock() {
        let dir = tempfile::tempdir().unwrap();
        let holder = FileLockProvider::new(&config(dir.path(), Duration::from_secs(5))).unwrap();
        let waiter =
            FileLockProvider::new(&config(dir.path(), Duration::from_millis(60))).unwrap();

        let mut held = holder.lock("k").await.unwrap();
        let err = waiter.lock("k").await.err().unwrap();
        assert_matches!(err, Error::LockTimeout { ref key, .. } if key == "k");
        assert!(err.is_lock_failure());

        // The waiter's in-process shard was released on the failure path
        let shard = tokio::time::timeout(Duration::from_secs(1), waiter.memory.lock("k"))
            .await
            .expect("memory lock leaked");
        drop(shard);

        held.release().unwrap();
        let mut lock = waiter.lock("k").await.unwrap();
        lock.release().unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let dir = tempfile::tempdir().unwrap();
        let holder = FileLockProvider::new(&config(dir.path(), Duration::from_secs(5))).unwrap();
        let token = CancellationToken::new();
        let waiter = FileLockProvider::new(&config(dir.path(), Duration::from_secs(30)))
            .unwrap()
            .with_cancellation(token.clone());

        let _held = holder.lock("k").await.unwrap();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                token.cancel();
            })
        };

        let err = waiter.lock("k").await.err().unwrap();
        assert_matches!(err, Error::LockInterrupted { .. });
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileLockProvider::new(&config(dir.path(), Duration::from_secs(1))).unwrap();
        let path = provider.lock_file_path("k");
        {
            let lock = provider.lock("k").await.unwrap();
            assert!(lock.is_held());
        }
        assert!(!path.exists());
        let mut again = provider.lock("k").await.unwrap();
        again.release().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_holders_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        // Two providers on one directory behave like two processes
        let providers = [
            Arc::new(FileLockProvider::new(&config(dir.path(), Duration::from_secs(20))).unwrap()),
            Arc::new(FileLockProvider::new(&config(dir.path(), Duration::from_secs(20))).unwrap()),
        ];
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let provider = Arc::clone(&providers[i % 2]);
                let inside = Arc::clone(&inside);
                let entered = Arc::clone(&entered);
                tokio::spawn(async move {
                    for _ in 0..5 {
                        let mut lock = provider.acquire("shared").await.unwrap();
                        assert!(!inside.swap(true, Ordering::SeqCst), "overlapping holders");
                        entered.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.store(false, Ordering::SeqCst);
                        lock.release().unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 30);
        assert!(!providers[0].lock_file_path("shared").exists());
    }
}
