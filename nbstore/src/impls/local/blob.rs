use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rocksdb::{IteratorMode, WriteBatch};

use super::schema::{BlobMeta, CF_BLOBS, CF_BLOB_META};
use super::{connect_current, LocalConnection, LocalHandle};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::storage::{
    now_millis, BlobRecord, BlobStorage, ListedBlobRecord, Storage, StorageOptions, StorageType,
    StoreContext,
};

/// Blob storage in the local database. Payloads and metadata live in separate
/// column families so listing never touches payload bytes.
pub struct LocalBlobStorage {
    options: StorageOptions,
    connection: LocalConnection,
    retention: Duration,
}

impl LocalBlobStorage {
    pub fn new(options: StorageOptions, ctx: &StoreContext) -> Self {
        let connection = connect_current(&options, ctx, super::schema::CURRENT.version);
        Self {
            options,
            connection,
            retention: ctx.config.blob_retention,
        }
    }

    fn handle(&self) -> Result<Arc<LocalHandle>> {
        self.connection.require_inner()
    }

    fn read_meta(handle: &LocalHandle, key: &str) -> Result<Option<BlobMeta>> {
        let db = handle.db();
        db.raw()
            .get_cf(db.cf(CF_BLOB_META)?, key.as_bytes())?
            .map(|bytes| BlobMeta::decode(&bytes))
            .transpose()
    }
}

impl Storage for LocalBlobStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Blob
    }

    fn options(&self) -> &StorageOptions {
        &self.options
    }

    fn connection(&self) -> &dyn Connection {
        &self.connection
    }
}

#[async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn get_blob(&self, key: &str) -> Result<Option<BlobRecord>> {
        let handle = self.handle()?;
        let Some(meta) = Self::read_meta(&handle, key)? else {
            return Ok(None);
        };
        // soft-deleted blobs are gone for readers
        if meta.deleted_at.is_some() {
            return Ok(None);
        }

        let db = handle.db();
        let Some(compressed) = db.raw().get_cf(db.cf(CF_BLOBS)?, key.as_bytes())? else {
            log::warn!("Blob {key} has metadata but no payload");
            return Ok(None);
        };
        let data = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| Error::Compression(e.to_string()))?;

        Ok(Some(BlobRecord {
            key: key.to_string(),
            data,
            mime: meta.mime,
            created_at: meta.created_at,
        }))
    }

    async fn set_blob(&self, blob: BlobRecord) -> Result<()> {
        let handle = self.handle()?;
        let db = handle.db();
        let meta = BlobMeta {
            mime: blob.mime,
            size: blob.data.len() as u64,
            created_at: if blob.created_at == 0 { now_millis() } else { blob.created_at },
            deleted_at: None,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(db.cf(CF_BLOBS)?, blob.key.as_bytes(), lz4_flex::compress_prepend_size(&blob.data));
        batch.put_cf(db.cf(CF_BLOB_META)?, blob.key.as_bytes(), meta.encode()?);
        // serialized with soft delete and release, which read before writing
        let _writes = db.lock_writes();
        db.write(batch)
    }

    async fn delete_blob(&self, key: &str, permanently: bool) -> Result<()> {
        let handle = self.handle()?;
        let db = handle.db();
        let mut batch = WriteBatch::default();
        let _writes = db.lock_writes();

        if permanently {
            batch.delete_cf(db.cf(CF_BLOBS)?, key.as_bytes());
            batch.delete_cf(db.cf(CF_BLOB_META)?, key.as_bytes());
            return db.write(batch);
        }

        let Some(mut meta) = Self::read_meta(&handle, key)? else {
            return Ok(());
        };
        if meta.deleted_at.is_some() {
            return Ok(());
        }
        meta.deleted_at = Some(now_millis());
        batch.put_cf(db.cf(CF_BLOB_META)?, key.as_bytes(), meta.encode()?);
        db.write(batch)
    }

    async fn release_blobs(&self) -> Result<()> {
        let handle = self.handle()?;
        let db = handle.db();
        let blobs = db.cf(CF_BLOBS)?;
        let metas = db.cf(CF_BLOB_META)?;
        let retention = self.retention.as_millis() as u64;
        let now = now_millis();

        let _writes = db.lock_writes();
        let mut batch = WriteBatch::default();
        let mut released = 0usize;
        for item in db.raw().iterator_cf(metas, IteratorMode::Start) {
            let (key, value) = item?;
            let meta = BlobMeta::decode(&value)?;
            if meta
                .deleted_at
                .is_some_and(|deleted_at| now.saturating_sub(deleted_at) >= retention)
            {
                batch.delete_cf(blobs, &key);
                batch.delete_cf(metas, &key);
                released += 1;
            }
        }
        db.write(batch)?;
        if released > 0 {
            log::info!("Released {released} soft-deleted blobs");
        }
        Ok(())
    }

    async fn list_blobs(&self) -> Result<Vec<ListedBlobRecord>> {
        let handle = self.handle()?;
        let db = handle.db();
        let mut listed = Vec::new();
        for item in db.raw().iterator_cf(db.cf(CF_BLOB_META)?, IteratorMode::Start) {
            let (key, value) = item?;
            let meta = BlobMeta::decode(&value)?;
            if meta.deleted_at.is_some() {
                continue;
            }
            listed.push(ListedBlobRecord {
                key: String::from_utf8_lossy(&key).into_owned(),
                mime: meta.mime,
                size: meta.size,
                created_at: meta.created_at,
            });
        }
        Ok(listed)
    }
}
