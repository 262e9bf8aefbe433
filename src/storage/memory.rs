//! Cache-aside blob store
//!
//! Wraps any [`BlobStore`] with a bounded [`TileCache`]. Reads are served from
//! the cache when possible and populate it on a backing hit; writes go to the
//! backing store only and drop any cached copy, so the cache refills lazily
//! with the new payload on the next read.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::blob::{BlobStore, BlobStoreListener, ParametersMapping};
use super::cache::{TileCache, TileCacheConfig};
use super::metrics::CacheStatistics;
use super::object::{TileKey, TileObject, TileRange};
use crate::error::Result;
use crate::lock::LockProvider;

/// Blob store with an in-process cache in front
pub struct MemoryBlobStore {
    store: Arc<dyn BlobStore>,
    cache: TileCache,
    locks: Option<Arc<dyn LockProvider>>,
}

impl MemoryBlobStore {
    pub fn new(store: Arc<dyn BlobStore>, config: TileCacheConfig) -> Self {
        Self {
            store,
            cache: TileCache::new(config),
            locks: None,
        }
    }

    /// Serialize cache population per tile through `locks`
    pub fn with_lock_provider(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn cache_statistics(&self) -> CacheStatistics {
        self.cache.statistics()
    }

    async fn load(&self, tile: &mut TileObject) -> Result<bool> {
        let found = self.store.get(tile).await?;
        if found {
            trace!("{} found in backing store, caching", tile);
            self.cache.put(tile);
        }
        Ok(found)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, tile: &mut TileObject) -> Result<bool> {
        if self.cache.get(tile) {
            return Ok(true);
        }

        let locks = match &self.locks {
            Some(locks) => locks,
            None => return self.load(tile).await,
        };

        let key = format!("tile-cache:{}", tile.key());
        let mut lock = match locks.acquire(&key).await {
            Ok(lock) => lock,
            Err(e) => {
                warn!("Loading {} without lock: {}", tile, e);
                return self.load(tile).await;
            }
        };

        // Another task may have populated the entry while we waited
        let found = if self.cache.get(tile) {
            Ok(true)
        } else {
            self.load(tile).await
        };
        if let Err(e) = lock.release() {
            warn!("Failed to release {}: {}", key, e);
        }
        found
    }

    async fn put(&self, tile: &TileObject) -> Result<()> {
        self.store.put(tile).await?;
        self.cache.remove(&tile.key());
        Ok(())
    }

    // Invalidation runs again once the backing store has finished, so a read
    // that missed in between cannot leave the removed tile cached.

    async fn delete(&self, tile: &TileObject) -> Result<bool> {
        let key = tile.key();
        self.cache.remove(&key);
        let deleted = self.store.delete(tile).await;
        self.cache.remove(&key);
        deleted
    }

    async fn delete_range(&self, range: &TileRange) -> Result<bool> {
        self.cache.remove_range(range);
        let deleted = self.store.delete_range(range).await;
        let removed = self.cache.remove_range(range);
        debug!("Invalidated {} cached tiles for {}", removed, range);
        deleted
    }

    async fn delete_layer(&self, layer: &str) -> Result<bool> {
        self.cache.remove_layer(layer);
        let deleted = self.store.delete_layer(layer).await;
        self.cache.remove_layer(layer);
        deleted
    }

    async fn delete_by_gridset_id(&self, layer: &str, gridset_id: &str) -> Result<bool> {
        let matches = |k: &TileKey| k.layer_name == layer && k.gridset_id == gridset_id;
        self.cache.remove_where(matches);
        let deleted = self.store.delete_by_gridset_id(layer, gridset_id).await;
        self.cache.remove_where(matches);
        deleted
    }

    async fn delete_by_parameters_id(&self, layer: &str, parameters_id: &str) -> Result<bool> {
        let matches = |k: &TileKey| {
            k.layer_name == layer && k.parameters_id.as_deref() == Some(parameters_id)
        };
        self.cache.remove_where(matches);
        let deleted = self
            .store
            .delete_by_parameters_id(layer, parameters_id)
            .await;
        self.cache.remove_where(matches);
        deleted
    }

    async fn rename(&self, old_layer: &str, new_layer: &str) -> Result<bool> {
        self.cache.remove_layer(old_layer);
        let renamed = self.store.rename(old_layer, new_layer).await;
        self.cache.remove_layer(old_layer);
        renamed
    }

    async fn layer_exists(&self, layer: &str) -> Result<bool> {
        self.store.layer_exists(layer).await
    }

    async fn get_parameters_mapping(&self, layer: &str) -> Result<ParametersMapping> {
        self.store.get_parameters_mapping(layer).await
    }

    async fn get_layer_metadata(&self, layer: &str, key: &str) -> Result<Option<String>> {
        self.store.get_layer_metadata(layer, key).await
    }

    async fn put_layer_metadata(&self, layer: &str, key: &str, value: &str) -> Result<()> {
        self.store.put_layer_metadata(layer, key, value).await
    }

    fn add_listener(&self, listener: Arc<dyn BlobStoreListener>) {
        self.store.add_listener(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn BlobStoreListener>) -> bool {
        self.store.remove_listener(listener)
    }

    /// Empties the cache; the backing store is untouched
    async fn clear(&self) -> Result<()> {
        debug!("Flushing tile cache of {} entries", self.cache.len());
        self.cache.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ShardedLockProvider;
    use crate::storage::InMemoryBlobStore;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use tokio::sync::Notify;

    fn tile(gridset: &str, params: &[(&str, &str)]) -> TileObject {
        let params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TileObject::new("topp:states", [1, 2, 3], gridset, "image/png", params)
    }

    fn memory_store() -> (Arc<InMemoryBlobStore>, MemoryBlobStore) {
        let backing = Arc::new(InMemoryBlobStore::new());
        let store = MemoryBlobStore::new(backing.clone(), TileCacheConfig::default());
        (backing, store)
    }

    #[tokio::test]
    async fn test_put_does_not_populate_cache() {
        let (backing, store) = memory_store();
        let t = tile("EPSG:4326", &[]).with_blob(Bytes::from_static(b"png"));
        store.put(&t).await.unwrap();
        assert!(store.cache().is_empty());
        assert_eq!(backing.len(), 1);

        let mut probe = tile("EPSG:4326", &[]);
        assert!(store.get(&mut probe).await.unwrap());
        assert_eq!(store.cache().len(), 1);
        assert_eq!(probe.blob.as_deref(), Some(&b"png"[..]));

        // Second read is a cache hit
        let mut again = tile("EPSG:4326", &[]);
        assert!(store.get(&mut again).await.unwrap());
        let stats = store.cache_statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(backing.stats().reads, 1);
    }

    #[tokio::test]
    async fn test_miss_everywhere() {
        let (_backing, store) = memory_store();
        let mut probe = tile("EPSG:4326", &[]);
        assert!(!store.get(&mut probe).await.unwrap());
        assert!(store.cache().is_empty());
    }

    #[tokio::test]
    async fn test_delete_invalidates_exact_entry() {
        let (_backing, store) = memory_store();
        let variants = [
            tile("EPSG:4326", &[]),
            tile("EPSG:900913", &[]),
            tile("EPSG:4326", &[("STYLES", "night")]),
        ];
        for v in &variants {
            store
                .put(&v.clone().with_blob(Bytes::from_static(b"x")))
                .await
                .unwrap();
            let mut probe = v.clone();
            assert!(store.get(&mut probe).await.unwrap());
        }
        assert_eq!(store.cache().len(), 3);

        assert!(store.delete(&variants[0]).await.unwrap());
        assert!(!store.cache().contains(&variants[0].key()));
        assert!(store.cache().contains(&variants[1].key()));
        assert!(store.cache().contains(&variants[2].key()));
    }

    #[tokio::test]
    async fn test_clear_keeps_backing_store() {
        let (backing, store) = memory_store();
        let t = tile("EPSG:4326", &[]).with_blob(Bytes::from_static(b"x"));
        store.put(&t).await.unwrap();
        let mut probe = tile("EPSG:4326", &[]);
        store.get(&mut probe).await.unwrap();

        store.clear().await.unwrap();
        assert!(store.cache().is_empty());
        assert_eq!(backing.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_locked_population_loads_once() {
        let backing = Arc::new(InMemoryBlobStore::new());
        let store = Arc::new(
            MemoryBlobStore::new(backing.clone(), TileCacheConfig::default())
                .with_lock_provider(Arc::new(ShardedLockProvider::new())),
        );
        backing
            .put(&tile("EPSG:4326", &[]).with_blob(Bytes::from_static(b"x")))
            .await
            .unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut probe = tile("EPSG:4326", &[]);
                    store.get(&mut probe).await.unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(backing.stats().reads, 1);
    }

    #[tokio::test]
    async fn test_overwrite_is_visible_after_cached_read() {
        let (backing, store) = memory_store();
        store
            .put(&tile("EPSG:4326", &[]).with_blob(Bytes::from_static(b"v1")))
            .await
            .unwrap();
        let mut first = tile("EPSG:4326", &[]);
        assert!(store.get(&mut first).await.unwrap());
        assert_eq!(first.blob.as_deref(), Some(&b"v1"[..]));

        store
            .put(&tile("EPSG:4326", &[]).with_blob(Bytes::from_static(b"version2")))
            .await
            .unwrap();
        assert!(store.cache().is_empty());

        let mut second = tile("EPSG:4326", &[]);
        assert!(store.get(&mut second).await.unwrap());
        assert_eq!(second.blob.as_deref(), Some(&b"version2"[..]));
        assert_eq!(backing.len(), 1);
    }

    /// Backing store whose `delete` waits until released
    #[derive(Default)]
    struct GatedDeleteStore {
        inner: InMemoryBlobStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl BlobStore for GatedDeleteStore {
        async fn get(&self, tile: &mut TileObject) -> Result<bool> {
            self.inner.get(tile).await
        }
        async fn put(&self, tile: &TileObject) -> Result<()> {
            self.inner.put(tile).await
        }
        async fn delete(&self, tile: &TileObject) -> Result<bool> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.delete(tile).await
        }
        async fn delete_range(&self, range: &TileRange) -> Result<bool> {
            self.inner.delete_range(range).await
        }
        async fn delete_layer(&self, layer: &str) -> Result<bool> {
            self.inner.delete_layer(layer).await
        }
        async fn delete_by_gridset_id(&self, layer: &str, gridset_id: &str) -> Result<bool> {
            self.inner.delete_by_gridset_id(layer, gridset_id).await
        }
        async fn delete_by_parameters_id(&self, layer: &str, parameters_id: &str) -> Result<bool> {
            self.inner.delete_by_parameters_id(layer, parameters_id).await
        }
        async fn rename(&self, old_layer: &str, new_layer: &str) -> Result<bool> {
            self.inner.rename(old_layer, new_layer).await
        }
        async fn layer_exists(&self, layer: &str) -> Result<bool> {
            self.inner.layer_exists(layer).await
        }
        async fn get_parameters_mapping(&self, layer: &str) -> Result<ParametersMapping> {
            self.inner.get_parameters_mapping(layer).await
        }
        async fn get_layer_metadata(&self, layer: &str, key: &str) -> Result<Option<String>> {
            self.inner.get_layer_metadata(layer, key).await
        }
        async fn put_layer_metadata(&self, layer: &str, key: &str, value: &str) -> Result<()> {
            self.inner.put_layer_metadata(layer, key, value).await
        }
        fn add_listener(&self, listener: Arc<dyn BlobStoreListener>) {
            self.inner.add_listener(listener)
        }
        fn remove_listener(&self, listener: &Arc<dyn BlobStoreListener>) -> bool {
            self.inner.remove_listener(listener)
        }
        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn test_read_during_delete_does_not_resurrect_tile() {
        let backing = Arc::new(GatedDeleteStore::default());
        let store = Arc::new(MemoryBlobStore::new(
            backing.clone(),
            TileCacheConfig::default(),
        ));
        store
            .put(&tile("EPSG:4326", &[]).with_blob(Bytes::from_static(b"x")))
            .await
            .unwrap();

        let deleting = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.delete(&tile("EPSG:4326", &[])).await })
        };
        backing.entered.notified().await;

        // The backing tile is still there, so this read caches it again
        let mut during = tile("EPSG:4326", &[]);
        assert!(store.get(&mut during).await.unwrap());
        assert_eq!(store.cache().len(), 1);

        backing.release.notify_one();
        assert!(deleting.await.unwrap().unwrap());

        let mut after = tile("EPSG:4326", &[]);
        assert!(!store.get(&mut after).await.unwrap());
        assert!(store.cache().is_empty());
    }
}
