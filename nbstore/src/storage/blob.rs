use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Storage, Timestamp};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRecord {
    pub key: String,
    pub data: Vec<u8>,
    pub mime: String,
    pub created_at: Timestamp,
}

impl BlobRecord {
    pub fn new(key: impl Into<String>, data: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data,
            mime: mime.into(),
            created_at: super::now_millis(),
        }
    }
}

/// Blob metadata without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedBlobRecord {
    pub key: String,
    pub mime: String,
    pub size: u64,
    pub created_at: Timestamp,
}

#[async_trait]
pub trait BlobStorage: Storage {
    async fn get_blob(&self, key: &str) -> Result<Option<BlobRecord>>;

    async fn set_blob(&self, blob: BlobRecord) -> Result<()>;

    /// Soft delete keeps the bytes until [`BlobStorage::release_blobs`];
    /// `permanently` removes them at once.
    async fn delete_blob(&self, key: &str, permanently: bool) -> Result<()>;

    /// Purge soft-deleted blobs past the retention period.
    async fn release_blobs(&self) -> Result<()>;

    async fn list_blobs(&self) -> Result<Vec<ListedBlobRecord>>;
}
