//! Storage broker
//!
//! Serves tile reads and writes from a metadata index plus a blob store and
//! keeps the two consistent.
//!
//! ```text
//!          get                         put
//!           │                           │
//!    ┌──────▼──────┐             ┌──────▼──────┐
//!    │  MetaStore  │ miss→false  │  BlobStore  │ 1. payload
//!    └──────┬──────┘             └──────┬──────┘
//!     size>0│                           │ ok
//!    ┌──────▼──────┐             ┌──────▼──────┐
//!    │  BlobStore  │ len check   │  MetaStore  │ 2. record
//!    └─────────────┘             └─────────────┘  (fail → undo 1)
//! ```
//!
//! Without a metastore the broker runs blob-only: reads and writes go
//! straight to the blob store and parameterized tiles are refused.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::blob::{BlobStore, BlobStoreListener};
use super::object::{TileKey, TileObject, TileRange};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

/// Transient tiles kept at most
pub const TRANSIENT_CACHE_CAPACITY: usize = 100;

/// Age after which a transient tile is discarded, in milliseconds
pub const TRANSIENT_MAX_AGE_MILLIS: i64 = 1000;

/// Metadata index consulted before touching blobs
#[async_trait]
pub trait MetaStore: Send + Sync {
    fn enabled(&self) -> bool;

    /// Fill `blob_size` and `created` of `tile`; `Ok(false)` when no live
    /// record exists
    async fn get(&self, tile: &mut TileObject) -> Result<bool>;

    async fn put(&self, tile: &TileObject) -> Result<()>;

    async fn delete(&self, tile: &TileObject) -> Result<bool>;

    async fn delete_layer(&self, layer: &str) -> Result<bool>;

    async fn delete_range(&self, range: &TileRange) -> Result<bool>;

    async fn rename(&self, old_layer: &str, new_layer: &str) -> Result<bool>;

    /// Mark every record in `range` expired without removing it
    async fn expire(&self, range: &TileRange) -> Result<bool>;
}

#[derive(Debug, Clone, Copy)]
struct TileMeta {
    blob_size: u64,
    created: i64,
    expired: bool,
}

/// DashMap-backed metadata index
#[derive(Default)]
pub struct InMemoryMetaStore {
    records: DashMap<TileKey, TileMeta>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn remove_where<F>(&self, predicate: F) -> bool
    where
        F: Fn(&TileKey) -> bool,
    {
        let before = self.records.len();
        self.records.retain(|k, _| !predicate(k));
        self.records.len() < before
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    fn enabled(&self) -> bool {
        true
    }

    async fn get(&self, tile: &mut TileObject) -> Result<bool> {
        match self.records.get(&tile.key()) {
            Some(meta) if !meta.expired => {
                tile.blob_size = meta.blob_size;
                tile.created = meta.created;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn put(&self, tile: &TileObject) -> Result<()> {
        self.records.insert(
            tile.key(),
            TileMeta {
                blob_size: tile.blob_size,
                created: tile.created,
                expired: false,
            },
        );
        Ok(())
    }

    async fn delete(&self, tile: &TileObject) -> Result<bool> {
        Ok(self.records.remove(&tile.key()).is_some())
    }

    async fn delete_layer(&self, layer: &str) -> Result<bool> {
        Ok(self.remove_where(|k| k.layer_name == layer))
    }

    async fn delete_range(&self, range: &TileRange) -> Result<bool> {
        Ok(self.remove_where(|k| range.contains(k)))
    }

    async fn rename(&self, old_layer: &str, new_layer: &str) -> Result<bool> {
        let moved: Vec<TileKey> = self
            .records
            .iter()
            .filter(|e| e.key().layer_name == old_layer)
            .map(|e| e.key().clone())
            .collect();
        for key in &moved {
            if let Some((mut key, meta)) = self.records.remove(key) {
                key.layer_name = new_layer.to_string();
                self.records.insert(key, meta);
            }
        }
        Ok(!moved.is_empty())
    }

    async fn expire(&self, range: &TileRange) -> Result<bool> {
        let mut expired = false;
        for mut entry in self.records.iter_mut() {
            if range.contains(entry.key()) {
                entry.value_mut().expired = true;
                expired = true;
            }
        }
        Ok(expired)
    }
}

/// Short-lived tiles handed between a producer and the next request,
/// evicted oldest first
struct TransientCache {
    entries: HashMap<TileKey, (Bytes, i64)>,
    order: VecDeque<TileKey>,
}

impl TransientCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn put(&mut self, key: TileKey, blob: Bytes, now: i64) {
        if self.entries.insert(key.clone(), (blob, now)).is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key);
        while self.order.len() > TRANSIENT_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn take(&mut self, key: &TileKey, now: i64) -> Option<Bytes> {
        let (blob, stored) = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        (now - stored <= TRANSIENT_MAX_AGE_MILLIS).then_some(blob)
    }
}

/// Metadata-checked front door to the blob store
pub struct StorageBroker {
    blobs: Arc<dyn BlobStore>,
    meta: Option<Arc<dyn MetaStore>>,
    transient: Mutex<TransientCache>,
    clock: Arc<dyn Clock>,
}

impl StorageBroker {
    /// Blob-only broker
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            meta: None,
            transient: Mutex::new(TransientCache::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_metastore(mut self, meta: Arc<dyn MetaStore>) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    fn metastore(&self) -> Option<&Arc<dyn MetaStore>> {
        self.meta.as_ref().filter(|m| m.enabled())
    }

    pub fn is_blob_only(&self) -> bool {
        self.metastore().is_none()
    }

    /// Load `tile`; `Ok(false)` on a miss. A blob that is missing or whose
    /// length differs from the recorded size is a storage error.
    pub async fn get(&self, tile: &mut TileObject) -> Result<bool> {
        let meta = match self.metastore() {
            Some(meta) => meta,
            None => {
                if tile.has_parameters() {
                    debug!("Blob-only mode refuses parameterized tile {}", tile);
                    return Ok(false);
                }
                return self.blobs.get(tile).await;
            }
        };

        if !meta.get(tile).await? {
            return Ok(false);
        }
        let recorded = tile.blob_size;
        if recorded == 0 {
            return Ok(false);
        }

        if !self.blobs.get(tile).await? {
            warn!("Metadata for {} present but blob missing", tile);
            return Err(Error::Storage(format!(
                "blob for {} missing, metadata records {} bytes",
                tile, recorded
            )));
        }
        if tile.blob_size != recorded {
            warn!(
                "Blob size mismatch for {}: metadata {} actual {}",
                tile, recorded, tile.blob_size
            );
            return Err(Error::Storage(format!(
                "blob for {} is {} bytes, metadata records {}",
                tile, tile.blob_size, recorded
            )));
        }
        Ok(true)
    }

    /// Store `tile`, blob first and metadata second. When the metadata write
    /// fails the blob is removed again.
    pub async fn put(&self, tile: &TileObject) -> Result<bool> {
        if tile.blob.is_none() {
            return Err(Error::InvalidArgument(format!("{} has no blob", tile)));
        }

        let meta = match self.metastore() {
            Some(meta) => meta,
            None => {
                if tile.has_parameters() {
                    debug!("Blob-only mode refuses parameterized tile {}", tile);
                    return Ok(false);
                }
                self.blobs.put(tile).await?;
                return Ok(true);
            }
        };

        self.blobs.put(tile).await?;
        if let Err(e) = meta.put(tile).await {
            warn!("Metadata write for {} failed, removing blob: {}", tile, e);
            if let Err(undo) = self.blobs.delete(tile).await {
                warn!("Could not remove orphaned blob {}: {}", tile, undo);
            }
            return Err(e);
        }
        Ok(true)
    }

    pub async fn delete(&self, tile: &TileObject) -> Result<bool> {
        let meta = match self.metastore() {
            Some(meta) => meta.delete(tile).await?,
            None => false,
        };
        let blob = self.blobs.delete(tile).await?;
        Ok(meta || blob)
    }

    pub async fn delete_layer(&self, layer: &str) -> Result<bool> {
        info!("Deleting layer {}", layer);
        let meta = match self.metastore() {
            Some(meta) => meta.delete_layer(layer).await?,
            None => false,
        };
        let blob = self.blobs.delete_layer(layer).await?;
        Ok(meta || blob)
    }

    pub async fn delete_range(&self, range: &TileRange) -> Result<bool> {
        let meta = match self.metastore() {
            Some(meta) => meta.delete_range(range).await?,
            None => false,
        };
        let blob = self.blobs.delete_range(range).await?;
        Ok(meta || blob)
    }

    pub async fn delete_by_gridset_id(&self, layer: &str, gridset_id: &str) -> Result<bool> {
        self.blobs.delete_by_gridset_id(layer, gridset_id).await
    }

    pub async fn delete_by_parameters_id(&self, layer: &str, parameters_id: &str) -> Result<bool> {
        self.blobs.delete_by_parameters_id(layer, parameters_id).await
    }

    pub async fn rename(&self, old_layer: &str, new_layer: &str) -> Result<bool> {
        info!("Renaming layer {} to {}", old_layer, new_layer);
        let meta = match self.metastore() {
            Some(meta) => meta.rename(old_layer, new_layer).await?,
            None => false,
        };
        let blob = self.blobs.rename(old_layer, new_layer).await?;
        Ok(meta || blob)
    }

    /// Mark tiles in `range` stale. Blob-only brokers have nothing to mark.
    pub async fn expire(&self, range: &TileRange) -> Result<bool> {
        match self.metastore() {
            Some(meta) => meta.expire(range).await,
            None => Ok(false),
        }
    }

    pub async fn get_layer_metadata(&self, layer: &str, key: &str) -> Result<Option<String>> {
        self.blobs.get_layer_metadata(layer, key).await
    }

    pub async fn put_layer_metadata(&self, layer: &str, key: &str, value: &str) -> Result<()> {
        self.blobs.put_layer_metadata(layer, key, value).await
    }

    pub fn add_listener(&self, listener: Arc<dyn BlobStoreListener>) {
        self.blobs.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn BlobStoreListener>) -> bool {
        self.blobs.remove_listener(listener)
    }

    /// Take a transient copy of `tile`; each entry is handed out once
    pub fn get_transient(&self, tile: &mut TileObject) -> bool {
        let now = self.clock.now_millis();
        let blob = self.transient.lock().take(&tile.key(), now);
        let found = blob.is_some();
        tile.set_blob(blob);
        found
    }

    pub fn put_transient(&self, tile: &TileObject) {
        if let Some(blob) = &tile.blob {
            let now = self.clock.now_millis();
            self.transient.lock().put(tile.key(), blob.clone(), now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::InMemoryBlobStore;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    fn tile(x: i64) -> TileObject {
        TileObject::new("roads", [x, 0, 4], "EPSG:4326", "image/png", BTreeMap::new())
    }

    fn styled(x: i64) -> TileObject {
        let mut params = BTreeMap::new();
        params.insert("STYLES".to_string(), "night".to_string());
        TileObject::new("roads", [x, 0, 4], "EPSG:4326", "image/png", params)
    }

    fn broker() -> (Arc<InMemoryBlobStore>, Arc<InMemoryMetaStore>, StorageBroker) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let meta = Arc::new(InMemoryMetaStore::new());
        let broker = StorageBroker::new(blobs.clone()).with_metastore(meta.clone());
        (blobs, meta, broker)
    }

    struct FailingMetaStore;

    #[async_trait]
    impl MetaStore for FailingMetaStore {
        fn enabled(&self) -> bool {
            true
        }
        async fn get(&self, _tile: &mut TileObject) -> Result<bool> {
            Ok(false)
        }
        async fn put(&self, _tile: &TileObject) -> Result<()> {
            Err(Error::Storage("index offline".into()))
        }
        async fn delete(&self, _tile: &TileObject) -> Result<bool> {
            Ok(false)
        }
        async fn delete_layer(&self, _layer: &str) -> Result<bool> {
            Ok(false)
        }
        async fn delete_range(&self, _range: &TileRange) -> Result<bool> {
            Ok(false)
        }
        async fn rename(&self, _old: &str, _new: &str) -> Result<bool> {
            Ok(false)
        }
        async fn expire(&self, _range: &TileRange) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (blobs, meta, broker) = broker();
        assert!(broker
            .put(&tile(1).with_blob(Bytes::from_static(b"tile")))
            .await
            .unwrap());
        assert_eq!(blobs.len(), 1);
        assert_eq!(meta.len(), 1);

        let mut probe = tile(1);
        assert!(broker.get(&mut probe).await.unwrap());
        assert_eq!(probe.blob.as_deref(), Some(&b"tile"[..]));

        let mut missing = tile(2);
        assert!(!broker.get(&mut missing).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_blob_is_storage_error() {
        let (blobs, _meta, broker) = broker();
        let t = tile(1).with_blob(Bytes::from_static(b"tile"));
        broker.put(&t).await.unwrap();
        blobs.delete(&t).await.unwrap();

        let mut probe = tile(1);
        assert_matches!(broker.get(&mut probe).await, Err(Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_size_mismatch_is_storage_error() {
        let (blobs, _meta, broker) = broker();
        broker
            .put(&tile(1).with_blob(Bytes::from_static(b"tile")))
            .await
            .unwrap();
        // Backend rewritten behind the index
        blobs
            .put(&tile(1).with_blob(Bytes::from_static(b"corrupted")))
            .await
            .unwrap();

        let mut probe = tile(1);
        assert_matches!(broker.get(&mut probe).await, Err(Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_failed_metadata_write_removes_blob() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let broker = StorageBroker::new(blobs.clone()).with_metastore(Arc::new(FailingMetaStore));

        let result = broker
            .put(&tile(1).with_blob(Bytes::from_static(b"tile")))
            .await;
        assert_matches!(result, Err(Error::Storage(_)));
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_put_without_blob_rejected() {
        let (_blobs, _meta, broker) = broker();
        assert_matches!(broker.put(&tile(1)).await, Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_blob_only_refuses_parameters() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let broker = StorageBroker::new(blobs.clone());
        assert!(broker.is_blob_only());

        assert!(!broker
            .put(&styled(1).with_blob(Bytes::from_static(b"x")))
            .await
            .unwrap());
        assert!(blobs.is_empty());

        assert!(broker
            .put(&tile(1).with_blob(Bytes::from_static(b"x")))
            .await
            .unwrap());
        let mut probe = tile(1);
        assert!(broker.get(&mut probe).await.unwrap());
        let mut probe = styled(1);
        assert!(!broker.get(&mut probe).await.unwrap());
    }

    #[tokio::test]
    async fn test_expire_hides_tile() {
        let (blobs, _meta, broker) = broker();
        broker
            .put(&tile(1).with_blob(Bytes::from_static(b"x")))
            .await
            .unwrap();

        let range = TileRange::new("roads", "EPSG:4326", "image/png", None, 4, 4, &[]);
        assert!(broker.expire(&range).await.unwrap());

        let mut probe = tile(1);
        assert!(!broker.get(&mut probe).await.unwrap());
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn test_rename_and_delete_layer_reach_both() {
        let (blobs, meta, broker) = broker();
        broker
            .put(&tile(1).with_blob(Bytes::from_static(b"x")))
            .await
            .unwrap();

        assert!(broker.rename("roads", "streets").await.unwrap());
        let mut moved = tile(1);
        moved.layer_name = "streets".into();
        assert!(broker.get(&mut moved).await.unwrap());

        assert!(broker.delete_layer("streets").await.unwrap());
        assert!(blobs.is_empty());
        assert!(meta.is_empty());
    }

    #[tokio::test]
    async fn test_delete_range_reaches_both() {
        let (blobs, meta, broker) = broker();
        for x in 0..4 {
            broker
                .put(&tile(x).with_blob(Bytes::from_static(b"x")))
                .await
                .unwrap();
        }
        let range = TileRange::new("roads", "EPSG:4326", "image/png", None, 4, 4, &[[0, 0, 1, 0, 4]]);
        assert!(broker.delete_range(&range).await.unwrap());
        assert_eq!(blobs.len(), 2);
        assert_eq!(meta.len(), 2);
    }

    #[tokio::test]
    async fn test_layer_metadata_forwarded() {
        let (blobs, _meta, broker) = broker();
        broker.put_layer_metadata("roads", "k", "v").await.unwrap();
        assert_eq!(
            blobs.get_layer_metadata("roads", "k").await.unwrap().as_deref(),
            Some("v")
        );
    }

    #[test]
    fn test_transient_handed_out_once() {
        let clock = Arc::new(ManualClock::new(0));
        let broker = StorageBroker::new(Arc::new(InMemoryBlobStore::new())).with_clock(clock.clone());

        broker.put_transient(&tile(1).with_blob(Bytes::from_static(b"meta")));
        let mut probe = tile(1);
        assert!(broker.get_transient(&mut probe));
        assert_eq!(probe.blob_size, 4);
        let mut again = tile(1);
        assert!(!broker.get_transient(&mut again));

        broker.put_transient(&tile(2).with_blob(Bytes::from_static(b"meta")));
        clock.set_millis(TRANSIENT_MAX_AGE_MILLIS + 1);
        let mut stale = tile(2);
        assert!(!broker.get_transient(&mut stale));
    }

    #[test]
    fn test_transient_capacity() {
        let broker = StorageBroker::new(Arc::new(InMemoryBlobStore::new()))
            .with_clock(Arc::new(ManualClock::new(0)));
        for x in 0..(TRANSIENT_CACHE_CAPACITY as i64 + 1) {
            broker.put_transient(&tile(x).with_blob(Bytes::from_static(b"m")));
        }
        let mut oldest = tile(0);
        assert!(!broker.get_transient(&mut oldest));
        let mut newest = tile(TRANSIENT_CACHE_CAPACITY as i64);
        assert!(broker.get_transient(&mut newest));
    }
}
