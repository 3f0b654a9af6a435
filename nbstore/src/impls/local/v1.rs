//! Read access to the pre-snapshot database layout.
//!
//! The old layout kept every update of a document in one value and blobs
//! without metadata. Nothing writes it anymore: writes fail with `ReadOnly` and it
//! reports no clocks, so old data is served on request but never drives sync.

use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::IteratorMode;
use serde::{Deserialize, Serialize};

use super::schema::{CF_LEGACY_BLOBS, CF_LEGACY_DOCS};
use super::{connect_legacy, LocalConnection, LocalHandle};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event::Subscription;
use crate::storage::{
    squash_updates, BlobRecord, BlobStorage, DocClock, DocClocks, DocRecord,
    DocStorage, DocUpdate, DocUpdateListener, ListedBlobRecord, Storage, StorageOptions,
    StorageType, StoreContext, Timestamp, UpdateMerger,
};

const LEGACY_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LegacyUpdate {
    pub timestamp: Timestamp,
    pub update: Vec<u8>,
}

fn read_updates(handle: &LocalHandle, doc_id: &str) -> Result<Vec<LegacyUpdate>> {
    let db = handle.db();
    match db.raw().get_cf(db.cf(CF_LEGACY_DOCS)?, doc_id.as_bytes())? {
        Some(bytes) => {
            let (updates, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
            Ok(updates)
        }
        None => Ok(Vec::new()),
    }
}

pub struct LocalV1DocStorage {
    options: StorageOptions,
    connection: LocalConnection,
    merger: Arc<dyn UpdateMerger>,
}

impl LocalV1DocStorage {
    pub fn new(options: StorageOptions, ctx: &StoreContext) -> Self {
        let connection = connect_legacy(&options, ctx);
        Self {
            options,
            connection,
            merger: ctx.merger.clone(),
        }
    }

    fn handle(&self) -> Result<Arc<LocalHandle>> {
        self.connection.require_inner()
    }
}

impl Storage for LocalV1DocStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Doc
    }

    fn options(&self) -> &StorageOptions {
        &self.options
    }

    fn connection(&self) -> &dyn Connection {
        &self.connection
    }
}

#[async_trait]
impl DocStorage for LocalV1DocStorage {
    fn merger(&self) -> &dyn UpdateMerger {
        self.merger.as_ref()
    }

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>> {
        let handle = self.handle()?;
        let updates = read_updates(&handle, doc_id)?;
        if updates.is_empty() {
            return Ok(None);
        }

        let records: Vec<DocRecord> = updates
            .into_iter()
            .map(|u| DocRecord {
                doc_id: doc_id.to_string(),
                bin: u.update,
                timestamp: u.timestamp,
                editor: None,
            })
            .collect();
        let refs: Vec<&DocRecord> = records.iter().collect();
        squash_updates(self.merger(), &refs).map(Some)
    }

    async fn set_doc_snapshot(&self, _snapshot: DocRecord, _prev: Option<&DocRecord>) -> Result<bool> {
        Ok(false)
    }

    async fn get_doc_updates(&self, _doc_id: &str) -> Result<Vec<DocRecord>> {
        Ok(Vec::new())
    }

    async fn mark_updates_merged(&self, _doc_id: &str, _updates: &[DocRecord]) -> Result<usize> {
        Ok(0)
    }

    async fn push_doc_update(&self, update: DocUpdate, _origin: Option<&str>) -> Result<DocClock> {
        Err(Error::ReadOnly(format!("legacy doc storage cannot store {}", update.doc_id)))
    }

    async fn get_doc_timestamp(&self, _doc_id: &str) -> Result<Option<DocClock>> {
        Ok(None)
    }

    async fn get_doc_timestamps(&self, _after: Option<Timestamp>) -> Result<DocClocks> {
        Ok(DocClocks::new())
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<()> {
        let handle = self.handle()?;
        let db = handle.db();
        db.raw().delete_cf(db.cf(CF_LEGACY_DOCS)?, doc_id.as_bytes())?;
        Ok(())
    }

    fn subscribe_doc_update(&self, _listener: DocUpdateListener) -> Subscription {
        Subscription::empty()
    }
}

pub struct LocalV1BlobStorage {
    options: StorageOptions,
    connection: LocalConnection,
}

impl LocalV1BlobStorage {
    pub fn new(options: StorageOptions, ctx: &StoreContext) -> Self {
        let connection = connect_legacy(&options, ctx);
        Self { options, connection }
    }

    fn handle(&self) -> Result<Arc<LocalHandle>> {
        self.connection.require_inner()
    }
}

impl Storage for LocalV1BlobStorage {
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
impl BlobStorage for LocalV1BlobStorage {
    async fn get_blob(&self, key: &str) -> Result<Option<BlobRecord>> {
        let handle = self.handle()?;
        let db = handle.db();
        Ok(db
            .raw()
            .get_cf(db.cf(CF_LEGACY_BLOBS)?, key.as_bytes())?
            .map(|data| BlobRecord {
                key: key.to_string(),
                data,
                mime: LEGACY_MIME.to_string(),
                created_at: 0,
            }))
    }

    async fn set_blob(&self, blob: BlobRecord) -> Result<()> {
        Err(Error::ReadOnly(format!("legacy blob storage cannot store {}", blob.key)))
    }

    async fn delete_blob(&self, key: &str, permanently: bool) -> Result<()> {
        if permanently {
            let handle = self.handle()?;
            let db = handle.db();
            db.raw().delete_cf(db.cf(CF_LEGACY_BLOBS)?, key.as_bytes())?;
        }
        Ok(())
    }

    async fn release_blobs(&self) -> Result<()> {
        Ok(())
    }

    async fn list_blobs(&self) -> Result<Vec<ListedBlobRecord>> {
        let handle = self.handle()?;
        let db = handle.db();
        let mut listed = Vec::new();
        for item in db.raw().iterator_cf(db.cf(CF_LEGACY_BLOBS)?, IteratorMode::Start) {
            let (key, value) = item?;
            listed.push(ListedBlobRecord {
                key: String::from_utf8_lossy(&key).into_owned(),
                mime: LEGACY_MIME.to_string(),
                size: value.len() as u64,
                created_at: 0,
            });
        }
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::merge_fixtures::{append_text, doc_with_text, text_of};
    use crate::storage::SpaceType;

    fn seed_doc(handle: &LocalHandle, doc_id: &str, updates: &[LegacyUpdate]) {
        let db = handle.db();
        let bytes = bincode::serde::encode_to_vec(updates, bincode::config::standard()).unwrap();
        db.raw().put_cf(db.cf(CF_LEGACY_DOCS).unwrap(), doc_id, bytes).unwrap();
    }

    fn seed_blob(handle: &LocalHandle, key: &str, data: &[u8]) {
        let db = handle.db();
        db.raw().put_cf(db.cf(CF_LEGACY_BLOBS).unwrap(), key, data).unwrap();
    }

    fn opts() -> StorageOptions {
        StorageOptions::new("local", SpaceType::Workspace, "old")
    }

    #[tokio::test]
    async fn test_reads_legacy_doc_and_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StoreContext::new(StoreConfig::for_testing(dir.path()));
        let storage = LocalV1DocStorage::new(opts(), &ctx);
        storage.connection().connect();
        storage.connection().wait_for_connected(None).await.unwrap();

        let (doc, first) = doc_with_text("old");
        let second = append_text(&doc, " data");
        seed_doc(
            &storage.handle().unwrap(),
            "d",
            &[
                LegacyUpdate { timestamp: 1, update: first },
                LegacyUpdate { timestamp: 2, update: second },
            ],
        );

        let record = storage.get_doc("d").await.unwrap().unwrap();
        assert_eq!(text_of(&record.bin), "old data");
        assert_eq!(record.timestamp, 2);

        let (_, bin) = doc_with_text("new");
        let err = storage.push_doc_update(DocUpdate::new("d", bin), None).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
        let again = storage.get_doc("d").await.unwrap().unwrap();
        assert_eq!(text_of(&again.bin), "old data");

        assert!(storage.get_doc_timestamps(None).await.unwrap().is_empty());

        storage.delete_doc("d").await.unwrap();
        assert!(storage.get_doc("d").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_legacy_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StoreContext::new(StoreConfig::for_testing(dir.path()));
        let storage = LocalV1BlobStorage::new(opts(), &ctx);
        storage.connection().connect();
        storage.connection().wait_for_connected(None).await.unwrap();
        seed_blob(&storage.handle().unwrap(), "k", b"bytes");

        let err = storage.set_blob(BlobRecord::new("other", vec![1], "x/y")).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
        let listed = storage.list_blobs().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 5);

        storage.delete_blob("k", false).await.unwrap();
        assert!(storage.get_blob("k").await.unwrap().is_some());
        storage.delete_blob("k", true).await.unwrap();
        assert!(storage.get_blob("k").await.unwrap().is_none());
    }
}
