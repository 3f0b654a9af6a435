use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{IteratorMode, WriteBatch};

use super::schema::{self, CF_PEER_PULLED_REMOTE_CLOCKS, CF_PEER_PUSHED_CLOCKS, CF_PEER_REMOTE_CLOCKS};
use super::{connect_current, LocalConnection, LocalHandle};
use crate::connection::Connection;
use crate::error::Result;
use crate::storage::{
    ClockKind, DocClock, DocClocks, Storage, StorageOptions, StorageType, StoreContext, SyncStorage,
};

fn column_family(kind: ClockKind) -> &'static str {
    match kind {
        ClockKind::Remote => CF_PEER_REMOTE_CLOCKS,
        ClockKind::PulledRemote => CF_PEER_PULLED_REMOTE_CLOCKS,
        ClockKind::Pushed => CF_PEER_PUSHED_CLOCKS,
    }
}

/// Sync clocks in the local database.
pub struct LocalSyncStorage {
    options: StorageOptions,
    connection: LocalConnection,
}

impl LocalSyncStorage {
    pub fn new(options: StorageOptions, ctx: &StoreContext) -> Self {
        let connection = connect_current(&options, ctx, schema::CURRENT.version);
        Self { options, connection }
    }

    fn handle(&self) -> Result<Arc<LocalHandle>> {
        self.connection.require_inner()
    }
}

impl Storage for LocalSyncStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Sync
    }

    fn options(&self) -> &StorageOptions {
        &self.options
    }

    fn connection(&self) -> &dyn Connection {
        &self.connection
    }
}

#[async_trait]
impl SyncStorage for LocalSyncStorage {
    async fn get_peer_clocks(&self, kind: ClockKind, peer: &str) -> Result<DocClocks> {
        let handle = self.handle()?;
        let prefix = schema::peer_key(peer, "")?;
        let mut clocks = DocClocks::new();
        for (key, value) in handle.db().scan_prefix(column_family(kind), &prefix)? {
            let doc_id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            clocks.insert(doc_id, schema::unstamp(&value)?.0);
        }
        Ok(clocks)
    }

    async fn get_peer_clock(&self, kind: ClockKind, peer: &str, doc_id: &str) -> Result<Option<DocClock>> {
        let handle = self.handle()?;
        let db = handle.db();
        let cf = db.cf(column_family(kind))?;
        match db.raw().get_cf(cf, schema::peer_key(peer, doc_id)?)? {
            Some(value) => Ok(Some(DocClock::new(doc_id, schema::unstamp(&value)?.0))),
            None => Ok(None),
        }
    }

    async fn set_peer_clock(&self, kind: ClockKind, peer: &str, clock: DocClock) -> Result<()> {
        let handle = self.handle()?;
        let db = handle.db();
        let cf = db.cf(column_family(kind))?;
        // the merge operator drops values that are not newer
        db.raw()
            .merge_cf(cf, schema::peer_key(peer, &clock.doc_id)?, clock.timestamp.to_be_bytes())?;
        Ok(())
    }

    async fn clear_clocks(&self) -> Result<()> {
        let handle = self.handle()?;
        let db = handle.db();
        let mut batch = WriteBatch::default();
        for kind in ClockKind::ALL {
            let cf = db.cf(column_family(kind))?;
            for item in db.raw().iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete_cf(cf, key);
            }
        }
        db.write(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::SpaceType;

    async fn storage(dir: &tempfile::TempDir) -> LocalSyncStorage {
        let ctx = StoreContext::new(StoreConfig::for_testing(dir.path()));
        let storage = LocalSyncStorage::new(StorageOptions::new("local", SpaceType::Workspace, "ws"), &ctx);
        storage.connection().connect();
        storage.connection().wait_for_connected(None).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_clocks_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;

        storage.set_peer_remote_clock("cloud", DocClock::new("d", 10)).await.unwrap();
        storage.set_peer_remote_clock("cloud", DocClock::new("d", 5)).await.unwrap();
        assert_eq!(
            storage.get_peer_remote_clock("cloud", "d").await.unwrap(),
            Some(DocClock::new("d", 10))
        );

        storage.set_peer_remote_clock("cloud", DocClock::new("d", 11)).await.unwrap();
        assert_eq!(storage.get_peer_remote_clocks("cloud").await.unwrap()["d"], 11);
    }

    #[tokio::test]
    async fn test_tables_and_peers_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;

        storage.set_peer_pushed_clock("a", DocClock::new("d", 1)).await.unwrap();
        storage.set_peer_pulled_remote_clock("a", DocClock::new("d", 2)).await.unwrap();
        storage.set_peer_pushed_clock("ab", DocClock::new("e", 3)).await.unwrap();

        let pushed_a = storage.get_peer_pushed_clocks("a").await.unwrap();
        assert_eq!(pushed_a.len(), 1);
        assert_eq!(pushed_a["d"], 1);
        assert_eq!(storage.get_peer_pulled_remote_clocks("a").await.unwrap()["d"], 2);
        assert!(storage.get_peer_remote_clocks("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_clocks() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        storage.set_peer_pushed_clock("a", DocClock::new("d", 1)).await.unwrap();
        storage.set_peer_remote_clock("b", DocClock::new("d", 1)).await.unwrap();

        storage.clear_clocks().await.unwrap();
        assert!(storage.get_peer_pushed_clocks("a").await.unwrap().is_empty());
        assert!(storage.get_peer_remote_clock("b", "d").await.unwrap().is_none());
    }
}
