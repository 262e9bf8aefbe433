//! Two-tier blob store
//!
//! A fast front store over an authoritative backing store. Reads fall through
//! to the backing store and repopulate the front; writes and deletes go to
//! both, front first. Parameter mappings and listeners belong to the backing
//! store alone.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::blob::{BlobStore, BlobStoreListener, ParametersMapping};
use super::object::{TileObject, TileRange};
use crate::error::Result;

/// Front store layered over a backing store
pub struct NestedBlobStore {
    front: Arc<dyn BlobStore>,
    backing: Arc<dyn BlobStore>,
}

impl NestedBlobStore {
    pub fn new(front: Arc<dyn BlobStore>, backing: Arc<dyn BlobStore>) -> Self {
        Self { front, backing }
    }

    pub fn front(&self) -> &Arc<dyn BlobStore> {
        &self.front
    }

    pub fn backing(&self) -> &Arc<dyn BlobStore> {
        &self.backing
    }
}

#[async_trait]
impl BlobStore for NestedBlobStore {
    async fn get(&self, tile: &mut TileObject) -> Result<bool> {
        if self.front.get(tile).await? {
            return Ok(true);
        }
        if !self.backing.get(tile).await? {
            return Ok(false);
        }
        if let Err(e) = self.front.put(tile).await {
            warn!("Could not populate front store with {}: {}", tile, e);
        }
        Ok(true)
    }

    async fn put(&self, tile: &TileObject) -> Result<()> {
        self.front.put(tile).await?;
        self.backing.put(tile).await
    }

    async fn delete(&self, tile: &TileObject) -> Result<bool> {
        let front = self.front.delete(tile).await?;
        let backing = self.backing.delete(tile).await?;
        Ok(front || backing)
    }

    async fn delete_range(&self, range: &TileRange) -> Result<bool> {
        let front = self.front.delete_range(range).await?;
        let backing = self.backing.delete_range(range).await?;
        Ok(front || backing)
    }

    async fn delete_layer(&self, layer: &str) -> Result<bool> {
        let front = self.front.delete_layer(layer).await?;
        let backing = self.backing.delete_layer(layer).await?;
        Ok(front || backing)
    }

    async fn delete_by_gridset_id(&self, layer: &str, gridset_id: &str) -> Result<bool> {
        let front = self.front.delete_by_gridset_id(layer, gridset_id).await?;
        let backing = self.backing.delete_by_gridset_id(layer, gridset_id).await?;
        Ok(front || backing)
    }

    async fn delete_by_parameters_id(&self, layer: &str, parameters_id: &str) -> Result<bool> {
        let front = self
            .front
            .delete_by_parameters_id(layer, parameters_id)
            .await?;
        let backing = self
            .backing
            .delete_by_parameters_id(layer, parameters_id)
            .await?;
        Ok(front || backing)
    }

    async fn rename(&self, old_layer: &str, new_layer: &str) -> Result<bool> {
        let front = self.front.rename(old_layer, new_layer).await?;
        let backing = self.backing.rename(old_layer, new_layer).await?;
        Ok(front || backing)
    }

    async fn layer_exists(&self, layer: &str) -> Result<bool> {
        Ok(self.front.layer_exists(layer).await? || self.backing.layer_exists(layer).await?)
    }

    async fn get_parameters_mapping(&self, layer: &str) -> Result<ParametersMapping> {
        self.backing.get_parameters_mapping(layer).await
    }

    async fn get_layer_metadata(&self, layer: &str, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.front.get_layer_metadata(layer, key).await? {
            return Ok(Some(value));
        }
        let value = self.backing.get_layer_metadata(layer, key).await?;
        if let Some(value) = &value {
            if let Err(e) = self.front.put_layer_metadata(layer, key, value).await {
                warn!(
                    "Could not populate front store metadata {}/{}: {}",
                    layer, key, e
                );
            }
        }
        Ok(value)
    }

    async fn put_layer_metadata(&self, layer: &str, key: &str, value: &str) -> Result<()> {
        self.front.put_layer_metadata(layer, key, value).await?;
        self.backing.put_layer_metadata(layer, key, value).await
    }

    fn add_listener(&self, listener: Arc<dyn BlobStoreListener>) {
        self.backing.add_listener(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn BlobStoreListener>) -> bool {
        self.backing.remove_listener(listener)
    }

    async fn clear(&self) -> Result<()> {
        debug!("Clearing front and backing stores");
        self.front.clear().await?;
        self.backing.clear().await
    }
}
