//! Blob store contract and change notifications

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::object::{TileObject, TileRange};
use crate::error::Result;

/// Parameter sets of a layer by parameters id
pub type ParametersMapping = BTreeMap<String, BTreeMap<String, String>>;

/// Storage contract every tile backend implements
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fill `tile.blob` when stored; `Ok(false)` on a miss
    async fn get(&self, tile: &mut TileObject) -> Result<bool>;

    async fn put(&self, tile: &TileObject) -> Result<()>;

    async fn delete(&self, tile: &TileObject) -> Result<bool>;

    async fn delete_range(&self, range: &TileRange) -> Result<bool>;

    async fn delete_layer(&self, layer: &str) -> Result<bool>;

    async fn delete_by_gridset_id(&self, layer: &str, gridset_id: &str) -> Result<bool>;

    async fn delete_by_parameters_id(&self, layer: &str, parameters_id: &str) -> Result<bool>;

    async fn rename(&self, old_layer: &str, new_layer: &str) -> Result<bool>;

    async fn layer_exists(&self, layer: &str) -> Result<bool>;

    async fn get_parameters_mapping(&self, layer: &str) -> Result<ParametersMapping>;

    async fn get_layer_metadata(&self, layer: &str, key: &str) -> Result<Option<String>>;

    async fn put_layer_metadata(&self, layer: &str, key: &str, value: &str) -> Result<()>;

    fn add_listener(&self, listener: Arc<dyn BlobStoreListener>);

    fn remove_listener(&self, listener: &Arc<dyn BlobStoreListener>) -> bool;

    async fn clear(&self) -> Result<()>;
}

/// A tile change reported by a blob store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileEvent {
    pub layer_name: String,
    pub gridset_id: String,
    pub blob_format: String,
    pub parameters_id: Option<String>,
    pub x: i64,
    pub y: i64,
    pub z: i64,
    pub blob_size: u64,
}

impl TileEvent {
    pub fn for_tile(tile: &TileObject, blob_size: u64) -> Self {
        Self {
            layer_name: tile.layer_name.clone(),
            gridset_id: tile.gridset_id.clone(),
            blob_format: tile.blob_format.clone(),
            parameters_id: tile.parameters_id.clone(),
            x: tile.x(),
            y: tile.y(),
            z: tile.z(),
            blob_size,
        }
    }
}

/// Observer of blob store changes
pub trait BlobStoreListener: Send + Sync {
    fn tile_stored(&self, event: &TileEvent);

    fn tile_deleted(&self, event: &TileEvent);

    fn tile_updated(&self, event: &TileEvent, old_size: u64);

    fn layer_deleted(&self, layer: &str);

    fn layer_renamed(&self, old_layer: &str, new_layer: &str);

    fn gridset_deleted(&self, layer: &str, gridset_id: &str);

    fn parameters_deleted(&self, layer: &str, parameters_id: &str);
}

/// Registered listeners of one store
#[derive(Default)]
pub struct ListenerList {
    listeners: RwLock<Vec<Arc<dyn BlobStoreListener>>>,
}

impl ListenerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn BlobStoreListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove by identity; `false` when not registered
    pub fn remove(&self, listener: &Arc<dyn BlobStoreListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Notify every listener. The list is snapshotted first so callbacks may
    /// register or remove listeners.
    pub fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn BlobStoreListener),
    {
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        stored: AtomicUsize,
    }

    impl BlobStoreListener for Counting {
        fn tile_stored(&self, _event: &TileEvent) {
            self.stored.fetch_add(1, Ordering::SeqCst);
        }
        fn tile_deleted(&self, _event: &TileEvent) {}
        fn tile_updated(&self, _event: &TileEvent, _old_size: u64) {}
        fn layer_deleted(&self, _layer: &str) {}
        fn layer_renamed(&self, _old_layer: &str, _new_layer: &str) {}
        fn gridset_deleted(&self, _layer: &str, _gridset_id: &str) {}
        fn parameters_deleted(&self, _layer: &str, _parameters_id: &str) {}
    }

    #[test]
    fn test_add_notify_remove() {
        let list = ListenerList::new();
        let counting = Arc::new(Counting::default());
        let listener: Arc<dyn BlobStoreListener> = counting.clone();
        list.add(listener.clone());
        assert_eq!(list.len(), 1);

        let tile = TileObject::new("l", [0, 0, 0], "g", "png", Default::default());
        list.notify(|l| l.tile_stored(&TileEvent::for_tile(&tile, 10)));
        assert_eq!(counting.stored.load(Ordering::SeqCst), 1);

        assert!(list.remove(&listener));
        assert!(!list.remove(&listener));
        assert!(list.is_empty());
    }
}
