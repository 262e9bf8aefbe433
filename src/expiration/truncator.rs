//! Truncation executors

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::storage::{BlobStore, TileRange};

/// Deletes the tiles of a range on behalf of a sweep
#[async_trait]
pub trait TileBreeder: Send + Sync {
    /// `Ok(true)` when anything was removed
    async fn truncate(&self, range: &TileRange) -> Result<bool>;
}

/// Truncates by range deletion on a blob store
pub struct BlobStoreTruncator {
    store: Arc<dyn BlobStore>,
}

impl BlobStoreTruncator {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TileBreeder for BlobStoreTruncator {
    async fn truncate(&self, range: &TileRange) -> Result<bool> {
        debug!("Truncating {}", range);
        self.store.delete_range(range).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryBlobStore, TileObject};
    use bytes::Bytes;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_truncates_range_only() {
        let store = Arc::new(InMemoryBlobStore::new());
        for x in 0..4 {
            let tile = TileObject::new("layer", [x, 0, 2], "g", "image/png", BTreeMap::new())
                .with_blob(Bytes::from_static(b"t"));
            store.put(&tile).await.unwrap();
        }

        let truncator = BlobStoreTruncator::new(store.clone());
        let range = TileRange::new("layer", "g", "image/png", None, 2, 2, &[[0, 0, 1, 0, 2]]);
        assert!(truncator.truncate(&range).await.unwrap());
        assert_eq!(store.len(), 2);
        assert!(!truncator.truncate(&range).await.unwrap());
    }
}
