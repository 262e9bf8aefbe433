//! In-memory blob store
//!
//! Complete [`BlobStore`] backed by DashMap. Emits listener events for every
//! change, so it can stand in for a disk or object-storage backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use super::blob::{BlobStore, BlobStoreListener, ListenerList, ParametersMapping, TileEvent};
use super::object::{TileKey, TileObject, TileRange};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredTile {
    blob: Bytes,
    created: i64,
}

/// Operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryStoreStats {
    pub object_count: u64,
    pub total_bytes: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// DashMap-backed blob store
#[derive(Default)]
pub struct InMemoryBlobStore {
    tiles: DashMap<TileKey, StoredTile>,
    metadata: DashMap<(String, String), String>,
    parameters: DashMap<String, ParametersMapping>,
    listeners: ListenerList,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> InMemoryStoreStats {
        InMemoryStoreStats {
            object_count: self.tiles.len() as u64,
            total_bytes: self.tiles.iter().map(|e| e.blob.len() as u64).sum(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Remove every tile matching `predicate`, one `tile_deleted` event each
    fn remove_tiles<F>(&self, predicate: F) -> usize
    where
        F: Fn(&TileKey) -> bool,
    {
        let doomed: Vec<TileKey> = self
            .tiles
            .iter()
            .filter(|e| predicate(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in doomed {
            if let Some((key, stored)) = self.tiles.remove(&key) {
                removed += 1;
                let event = event_for_key(&key, stored.blob.len() as u64);
                self.listeners.notify(|l| l.tile_deleted(&event));
            }
        }
        self.deletes.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Remove matching tiles without per-tile events
    fn drop_tiles<F>(&self, predicate: F) -> usize
    where
        F: Fn(&TileKey) -> bool,
    {
        let before = self.tiles.len();
        self.tiles.retain(|k, _| !predicate(k));
        let removed = before.saturating_sub(self.tiles.len());
        self.deletes.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn register_parameters(&self, tile: &TileObject) {
        if let Some(id) = &tile.parameters_id {
            self.parameters
                .entry(tile.layer_name.clone())
                .or_default()
                .entry(id.clone())
                .or_insert_with(|| tile.parameters.clone());
        }
    }
}

fn event_for_key(key: &TileKey, blob_size: u64) -> TileEvent {
    TileEvent {
        layer_name: key.layer_name.clone(),
        gridset_id: key.gridset_id.clone(),
        blob_format: key.blob_format.clone(),
        parameters_id: key.parameters_id.clone(),
        x: key.x,
        y: key.y,
        z: key.z,
        blob_size,
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, tile: &mut TileObject) -> Result<bool> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.tiles.get(&tile.key()) {
            Some(stored) => {
                tile.set_blob(Some(stored.blob.clone()));
                tile.created = stored.created;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn put(&self, tile: &TileObject) -> Result<()> {
        let blob = tile
            .blob
            .clone()
            .ok_or_else(|| Error::InvalidArgument(format!("{} has no blob", tile)))?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.register_parameters(tile);

        let size = blob.len() as u64;
        let old = self.tiles.insert(
            tile.key(),
            StoredTile {
                blob,
                created: tile.created,
            },
        );

        let event = TileEvent::for_tile(tile, size);
        match old {
            Some(previous) => {
                let old_size = previous.blob.len() as u64;
                self.listeners.notify(|l| l.tile_updated(&event, old_size));
            }
            None => self.listeners.notify(|l| l.tile_stored(&event)),
        }
        Ok(())
    }

    async fn delete(&self, tile: &TileObject) -> Result<bool> {
        match self.tiles.remove(&tile.key()) {
            Some((_, stored)) => {
                self.deletes.fetch_add(1, Ordering::Relaxed);
                let event = TileEvent::for_tile(tile, stored.blob.len() as u64);
                self.listeners.notify(|l| l.tile_deleted(&event));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_range(&self, range: &TileRange) -> Result<bool> {
        let removed = self.remove_tiles(|k| range.contains(k));
        debug!("Deleted {} tiles in {}", removed, range);
        Ok(removed > 0)
    }

    async fn delete_layer(&self, layer: &str) -> Result<bool> {
        let removed = self.drop_tiles(|k| k.layer_name == layer);
        self.metadata.retain(|(l, _), _| l != layer);
        self.parameters.remove(layer);
        self.listeners.notify(|l| l.layer_deleted(layer));
        Ok(removed > 0)
    }

    async fn delete_by_gridset_id(&self, layer: &str, gridset_id: &str) -> Result<bool> {
        let removed = self.drop_tiles(|k| k.layer_name == layer && k.gridset_id == gridset_id);
        self.listeners.notify(|l| l.gridset_deleted(layer, gridset_id));
        Ok(removed > 0)
    }

    async fn delete_by_parameters_id(&self, layer: &str, parameters_id: &str) -> Result<bool> {
        let removed = self.drop_tiles(|k| {
            k.layer_name == layer && k.parameters_id.as_deref() == Some(parameters_id)
        });
        if let Some(mut mapping) = self.parameters.get_mut(layer) {
            mapping.remove(parameters_id);
        }
        self.listeners
            .notify(|l| l.parameters_deleted(layer, parameters_id));
        Ok(removed > 0)
    }

    async fn rename(&self, old_layer: &str, new_layer: &str) -> Result<bool> {
        if self.layer_exists(new_layer).await? {
            return Err(Error::Storage(format!(
                "cannot rename {} to {}: target layer exists",
                old_layer, new_layer
            )));
        }

        let moved: Vec<TileKey> = self
            .tiles
            .iter()
            .filter(|e| e.key().layer_name == old_layer)
            .map(|e| e.key().clone())
            .collect();
        if moved.is_empty() && !self.parameters.contains_key(old_layer) {
            return Ok(false);
        }

        for key in moved {
            if let Some((mut key, stored)) = self.tiles.remove(&key) {
                key.layer_name = new_layer.to_string();
                self.tiles.insert(key, stored);
            }
        }
        let metadata: Vec<((String, String), String)> = self
            .metadata
            .iter()
            .filter(|e| e.key().0 == old_layer)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for ((_, key), value) in metadata {
            self.metadata.remove(&(old_layer.to_string(), key.clone()));
            self.metadata.insert((new_layer.to_string(), key), value);
        }
        if let Some((_, mapping)) = self.parameters.remove(old_layer) {
            self.parameters.insert(new_layer.to_string(), mapping);
        }

        self.listeners
            .notify(|l| l.layer_renamed(old_layer, new_layer));
        Ok(true)
    }

    async fn layer_exists(&self, layer: &str) -> Result<bool> {
        Ok(self.tiles.iter().any(|e| e.key().layer_name == layer)
            || self.metadata.iter().any(|e| e.key().0 == layer))
    }

    async fn get_parameters_mapping(&self, layer: &str) -> Result<ParametersMapping> {
        Ok(self
            .parameters
            .get(layer)
            .map(|m| m.clone())
            .unwrap_or_else(BTreeMap::new))
    }

    async fn get_layer_metadata(&self, layer: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .metadata
            .get(&(layer.to_string(), key.to_string()))
            .map(|v| v.clone()))
    }

    async fn put_layer_metadata(&self, layer: &str, key: &str, value: &str) -> Result<()> {
        self.metadata
            .insert((layer.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn BlobStoreListener>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn BlobStoreListener>) -> bool {
        self.listeners.remove(listener)
    }

    async fn clear(&self) -> Result<()> {
        self.tiles.clear();
        self.metadata.clear();
        self.parameters.clear();
        Ok(())
    }
}
