use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{AnyStorage, AwarenessStorage, BlobStorage, DocStorage, StorageType, SyncStorage};
use crate::error::{Error, Result};

/// The storages of one peer, at most one per [`StorageType`].
#[derive(Debug, Clone, Default)]
pub struct SpaceStorage {
    storages: HashMap<StorageType, AnyStorage>,
}

impl SpaceStorage {
    /// Later storages replace earlier ones of the same type.
    pub fn new(storages: impl IntoIterator<Item = AnyStorage>) -> Self {
        Self {
            storages: storages
                .into_iter()
                .map(|s| (s.storage_type(), s))
                .collect(),
        }
    }

    pub fn get(&self, storage_type: StorageType) -> Option<&AnyStorage> {
        self.storages.get(&storage_type)
    }

    pub fn storages(&self) -> impl Iterator<Item = &AnyStorage> {
        self.storages.values()
    }

    pub fn try_doc(&self) -> Option<Arc<dyn DocStorage>> {
        match self.storages.get(&StorageType::Doc) {
            Some(AnyStorage::Doc(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn try_blob(&self) -> Option<Arc<dyn BlobStorage>> {
        match self.storages.get(&StorageType::Blob) {
            Some(AnyStorage::Blob(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn try_sync(&self) -> Option<Arc<dyn SyncStorage>> {
        match self.storages.get(&StorageType::Sync) {
            Some(AnyStorage::Sync(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn try_awareness(&self) -> Option<Arc<dyn AwarenessStorage>> {
        match self.storages.get(&StorageType::Awareness) {
            Some(AnyStorage::Awareness(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn doc(&self) -> Result<Arc<dyn DocStorage>> {
        self.try_doc()
            .ok_or_else(|| Error::StorageNotFound(StorageType::Doc.to_string()))
    }

    pub fn blob(&self) -> Result<Arc<dyn BlobStorage>> {
        self.try_blob()
            .ok_or_else(|| Error::StorageNotFound(StorageType::Blob.to_string()))
    }

    pub fn sync(&self) -> Result<Arc<dyn SyncStorage>> {
        self.try_sync()
            .ok_or_else(|| Error::StorageNotFound(StorageType::Sync.to_string()))
    }

    pub fn awareness(&self) -> Result<Arc<dyn AwarenessStorage>> {
        self.try_awareness()
            .ok_or_else(|| Error::StorageNotFound(StorageType::Awareness.to_string()))
    }

    pub fn connect(&self) {
        for storage in self.storages.values() {
            storage.connection().connect();
        }
    }

    pub fn disconnect(&self) {
        for storage in self.storages.values() {
            storage.connection().disconnect();
        }
    }

    pub async fn wait_for_connected(&self, signal: Option<&CancellationToken>) -> Result<()> {
        for storage in self.storages.values() {
            storage.connection().wait_for_connected(signal).await?;
        }
        Ok(())
    }
}
