use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{IteratorMode, WriteBatch};

use super::schema::{
    self, StoredRecord, CF_CLOCKS, CF_SNAPSHOTS, CF_UPDATES,
};
use super::{connect_current, LocalConnection, LocalDb, LocalHandle, TabMessage};
use crate::connection::Connection;
use crate::error::Result;
use crate::event::Subscription;
use crate::storage::{
    DocClock, DocClocks, DocRecord, DocStorage, DocUpdate, DocUpdateEvent, DocUpdateListener,
    Storage, StorageOptions, StorageType, StoreContext, Timestamp, UpdateMerger,
};

/// Doc storage in the local database.
pub struct LocalDocStorage {
    options: StorageOptions,
    connection: LocalConnection,
    merger: Arc<dyn UpdateMerger>,
}

impl LocalDocStorage {
    pub fn new(options: StorageOptions, ctx: &StoreContext) -> Self {
        Self::with_version(options, ctx, schema::CURRENT.version)
    }

    /// Open the database at an older schema version.
    pub fn with_version(options: StorageOptions, ctx: &StoreContext, version: u32) -> Self {
        let connection = connect_current(&options, ctx, version);
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

fn read_clock(db: &LocalDb, doc_id: &str) -> Result<Option<Timestamp>> {
    match db.raw().get_cf(db.cf(CF_CLOCKS)?, doc_id.as_bytes())? {
        Some(value) => Ok(Some(schema::unstamp(&value)?.0)),
        None => Ok(None),
    }
}

impl Storage for LocalDocStorage {
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
impl DocStorage for LocalDocStorage {
    fn merger(&self) -> &dyn UpdateMerger {
        self.merger.as_ref()
    }

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>> {
        let handle = self.handle()?;
        let db = handle.db();
        let Some(value) = db.raw().get_cf(db.cf(CF_SNAPSHOTS)?, doc_id.as_bytes())? else {
            return Ok(None);
        };
        let (timestamp, payload) = schema::unstamp(&value)?;
        let record = StoredRecord::decode(payload)?;
        Ok(Some(DocRecord {
            doc_id: doc_id.to_string(),
            bin: record.payload()?,
            timestamp,
            editor: record.editor,
        }))
    }

    async fn set_doc_snapshot(&self, snapshot: DocRecord, _prev: Option<&DocRecord>) -> Result<bool> {
        let handle = self.handle()?;
        let db = handle.db();
        let snapshots = db.cf(CF_SNAPSHOTS)?;

        let _writes = db.lock_writes();
        if let Some(current) = db.raw().get_cf(snapshots, snapshot.doc_id.as_bytes())? {
            let (current_ts, _) = schema::unstamp(&current)?;
            if current_ts >= snapshot.timestamp {
                return Ok(false);
            }
        }

        let value = StoredRecord::new(&snapshot.bin, snapshot.editor.clone()).encode()?;
        let mut batch = WriteBatch::default();
        batch.merge_cf(snapshots, snapshot.doc_id.as_bytes(), schema::stamp(snapshot.timestamp, &value));
        batch.merge_cf(
            db.cf(CF_CLOCKS)?,
            snapshot.doc_id.as_bytes(),
            snapshot.timestamp.to_be_bytes(),
        );
        db.write(batch)?;
        db.observe_timestamp(snapshot.timestamp);
        Ok(true)
    }

    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocRecord>> {
        let handle = self.handle()?;
        let db = handle.db();
        db.scan_prefix(CF_UPDATES, &schema::update_prefix(doc_id)?)?
            .into_iter()
            .map(|(key, value)| {
                let (_, timestamp) = schema::parse_update_key(&key)?;
                let record = StoredRecord::decode(&value)?;
                Ok(DocRecord {
                    doc_id: doc_id.to_string(),
                    bin: record.payload()?,
                    timestamp,
                    editor: record.editor,
                })
            })
            .collect()
    }

    async fn mark_updates_merged(&self, doc_id: &str, updates: &[DocRecord]) -> Result<usize> {
        let handle = self.handle()?;
        let db = handle.db();
        let cf = db.cf(CF_UPDATES)?;

        let mut batch = WriteBatch::default();
        for update in updates {
            batch.delete_cf(cf, schema::update_key(doc_id, update.timestamp)?);
        }
        db.write(batch)?;
        Ok(updates.len())
    }

    async fn push_doc_update(&self, update: DocUpdate, origin: Option<&str>) -> Result<DocClock> {
        let handle = self.handle()?;
        let db = handle.db();

        let record = {
            let _writes = db.lock_writes();
            let stored = read_clock(db, &update.doc_id)?;
            let timestamp = match (update.timestamp, stored) {
                (Some(ts), Some(stored)) if ts <= stored => {
                    log::debug!("Ignoring stale update for {} ({ts} <= {stored})", update.doc_id);
                    return Ok(DocClock::new(update.doc_id, stored));
                }
                (Some(ts), _) => {
                    db.observe_timestamp(ts);
                    ts
                }
                (None, _) => db.next_timestamp(),
            };

            let value = StoredRecord::new(&update.bin, update.editor.clone()).encode()?;
            let mut batch = WriteBatch::default();
            batch.put_cf(db.cf(CF_UPDATES)?, schema::update_key(&update.doc_id, timestamp)?, value);
            batch.merge_cf(db.cf(CF_CLOCKS)?, update.doc_id.as_bytes(), timestamp.to_be_bytes());
            db.write(batch)?;

            DocRecord {
                doc_id: update.doc_id,
                bin: update.bin,
                timestamp,
                editor: update.editor,
            }
        };

        let clock = DocClock::new(record.doc_id.clone(), record.timestamp);
        let event = DocUpdateEvent {
            update: record,
            origin: origin.map(String::from),
        };
        self.connection.connector().doc_updates().emit(&event);
        handle.post(&TabMessage::DocUpdate(event));
        Ok(clock)
    }

    async fn get_doc_timestamp(&self, doc_id: &str) -> Result<Option<DocClock>> {
        let handle = self.handle()?;
        Ok(read_clock(handle.db(), doc_id)?.map(|ts| DocClock::new(doc_id, ts)))
    }

    async fn get_doc_timestamps(&self, after: Option<Timestamp>) -> Result<DocClocks> {
        let handle = self.handle()?;
        let db = handle.db();
        let mut clocks = DocClocks::new();
        for item in db.raw().iterator_cf(db.cf(CF_CLOCKS)?, IteratorMode::Start) {
            let (key, value) = item?;
            let (timestamp, _) = schema::unstamp(&value)?;
            if after.is_some_and(|after| timestamp <= after) {
                continue;
            }
            clocks.insert(String::from_utf8_lossy(&key).into_owned(), timestamp);
        }
        Ok(clocks)
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<()> {
        let handle = self.handle()?;
        let db = handle.db();

        let _writes = db.lock_writes();
        let updates = db.cf(CF_UPDATES)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(db.cf(CF_SNAPSHOTS)?, doc_id.as_bytes());
        batch.delete_cf(db.cf(CF_CLOCKS)?, doc_id.as_bytes());
        for (key, _) in db.scan_prefix(CF_UPDATES, &schema::update_prefix(doc_id)?)? {
            batch.delete_cf(updates, key);
        }
        db.write(batch)
    }

    fn subscribe_doc_update(&self, listener: DocUpdateListener) -> Subscription {
        self.connection
            .connector()
            .doc_updates()
            .subscribe(move |event| listener(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::error::Error;
    use crate::storage::merge_fixtures::{append_text, doc_with_text, text_of};
    use crate::storage::{SpaceType, YrsMerger};
    use parking_lot::Mutex;

    async fn storage(dir: &tempfile::TempDir) -> (LocalDocStorage, StoreContext) {
        let ctx = StoreContext::new(StoreConfig::for_testing(dir.path()));
        let storage = LocalDocStorage::new(StorageOptions::new("local", SpaceType::Workspace, "ws"), &ctx);
        storage.connection().connect();
        storage.connection().wait_for_connected(None).await.unwrap();
        (storage, ctx)
    }

    #[tokio::test]
    async fn test_push_then_get_doc_merges() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _ctx) = storage(&dir).await;

        let (doc, first) = doc_with_text("hello");
        let second = append_text(&doc, " world");

        let c1 = storage.push_doc_update(DocUpdate::new("d", first), None).await.unwrap();
        let c2 = storage.push_doc_update(DocUpdate::new("d", second), None).await.unwrap();
        assert!(c2.timestamp > c1.timestamp);

        let merged = storage.get_doc("d").await.unwrap().unwrap();
        assert_eq!(merged.timestamp, c2.timestamp);
        assert_eq!(text_of(&merged.bin), "hello world");

        // updates were folded into the snapshot
        assert!(storage.get_doc_updates("d").await.unwrap().is_empty());
        let snapshot = storage.get_doc_snapshot("d").await.unwrap().unwrap();
        assert_eq!(snapshot.timestamp, c2.timestamp);
    }

    #[tokio::test]
    async fn test_doc_id_with_nul_cannot_reach_another_doc() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _ctx) = storage(&dir).await;
        let (_, bin) = doc_with_text("mine");
        storage.push_doc_update(DocUpdate::new("a", bin.clone()), None).await.unwrap();

        let err = storage.push_doc_update(DocUpdate::new("a\0b", bin), None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidId(_)));
        assert!(matches!(storage.get_doc_updates("a\0").await, Err(Error::InvalidId(_))));

        assert_eq!(storage.get_doc_updates("a").await.unwrap().len(), 1);
        assert_eq!(text_of(&storage.get_doc("a").await.unwrap().unwrap().bin), "mine");
    }

    #[tokio::test]
    async fn test_stale_timestamped_push_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _ctx) = storage(&dir).await;
        let (_, bin) = doc_with_text("x");

        let clock = storage
            .push_doc_update(DocUpdate::new("d", bin.clone()).with_timestamp(100), None)
            .await
            .unwrap();
        assert_eq!(clock.timestamp, 100);

        let stale = storage
            .push_doc_update(DocUpdate::new("d", bin).with_timestamp(100), None)
            .await
            .unwrap();
        assert_eq!(stale.timestamp, 100);
        assert_eq!(storage.get_doc_updates("d").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_lww() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _ctx) = storage(&dir).await;
        let (_, bin) = doc_with_text("a");
        let record = |ts| DocRecord {
            doc_id: "d".into(),
            bin: bin.clone(),
            timestamp: ts,
            editor: None,
        };

        assert!(storage.set_doc_snapshot(record(10), None).await.unwrap());
        assert!(!storage.set_doc_snapshot(record(10), None).await.unwrap());
        assert!(!storage.set_doc_snapshot(record(5), None).await.unwrap());
        assert!(storage.set_doc_snapshot(record(11), None).await.unwrap());
        assert_eq!(storage.get_doc_snapshot("d").await.unwrap().unwrap().timestamp, 11);
    }

    #[tokio::test]
    async fn test_diff_against_state_vector() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _ctx) = storage(&dir).await;

        let (doc, first) = doc_with_text("abc");
        let second = append_text(&doc, "def");
        storage.push_doc_update(DocUpdate::new("d", first.clone()), None).await.unwrap();
        storage.push_doc_update(DocUpdate::new("d", second), None).await.unwrap();

        let sv = YrsMerger.state_vector(&first).unwrap();
        let diff = storage.get_doc_diff("d", Some(&sv)).await.unwrap().unwrap();
        let rebuilt = YrsMerger.merge_updates(&[&first, &diff.missing]).unwrap();
        assert_eq!(text_of(&rebuilt), "abcdef");

        assert!(storage.get_doc_diff("missing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timestamps_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _ctx) = storage(&dir).await;
        let (_, bin) = doc_with_text("a");

        storage.push_doc_update(DocUpdate::new("a", bin.clone()).with_timestamp(10), None).await.unwrap();
        storage.push_doc_update(DocUpdate::new("b", bin).with_timestamp(20), None).await.unwrap();

        let all = storage.get_doc_timestamps(None).await.unwrap();
        assert_eq!(all.len(), 2);
        let after = storage.get_doc_timestamps(Some(10)).await.unwrap();
        assert_eq!(after.keys().collect::<Vec<_>>(), vec!["b"]);

        storage.delete_doc("a").await.unwrap();
        assert!(storage.get_doc_timestamp("a").await.unwrap().is_none());
        assert!(storage.get_doc("a").await.unwrap().is_none());
        assert_eq!(storage.get_doc_timestamp("b").await.unwrap().unwrap().timestamp, 20);
    }

    #[tokio::test]
    async fn test_subscribers_see_pushes_with_origin() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _ctx) = storage(&dir).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = storage.subscribe_doc_update(Box::new(move |event| {
            seen_clone.lock().push((event.update.doc_id.clone(), event.origin.clone()));
        }));

        let (_, bin) = doc_with_text("a");
        storage.push_doc_update(DocUpdate::new("d", bin), Some("editor-1")).await.unwrap();
        assert_eq!(*seen.lock(), vec![("d".to_string(), Some("editor-1".to_string()))]);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StoreContext::new(StoreConfig::for_testing(dir.path()));
        let storage = LocalDocStorage::new(StorageOptions::new("local", SpaceType::Workspace, "ws"), &ctx);
        assert_eq!(
            storage.get_doc("d").await.err(),
            Some(crate::error::Error::NotConnected)
        );
    }
}
