//! Local backend across tabs and restarts.

mod common;

use common::{append_text, doc_with_text, init_logger, text_of};
use nbstore::impls::local::{LocalBlobStorage, LocalDocStorage, LocalSyncStorage};
use nbstore::storage::ClockKind;
use nbstore::{
    BlobRecord, BlobStorage, Connection, ConnectionStatus, DocClock, DocStorage, DocUpdate, DocUpdateEvent, Error,
    SpaceType, Storage, StorageOptions, StoreConfig, StoreContext, SyncStorage,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

fn options() -> StorageOptions {
    StorageOptions::new("local", SpaceType::Workspace, "ws")
}

async fn connect(storage: &dyn Storage) {
    storage.connection().connect();
    timeout(Duration::from_secs(2), storage.connection().wait_for_connected(None))
        .await
        .expect("connect timed out")
        .unwrap();
}

#[tokio::test]
async fn test_updates_reach_other_tabs() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let tab_a = StoreContext::new(StoreConfig::for_testing(dir.path()));
    let tab_b = tab_a.sibling();

    let doc_a = LocalDocStorage::new(options(), &tab_a);
    let doc_b = LocalDocStorage::new(options(), &tab_b);
    connect(&doc_a).await;
    connect(&doc_b).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = doc_b.subscribe_doc_update(Box::new(move |event: &DocUpdateEvent| {
        let _ = tx.send(event.clone());
    }));

    let (doc, update) = doc_with_text("from a");
    let clock = doc_a
        .push_doc_update(DocUpdate::new("page", update), Some("tab-a"))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.update.doc_id, "page");
    assert_eq!(event.update.timestamp, clock.timestamp);
    assert_eq!(event.origin.as_deref(), Some("tab-a"));

    // Both tabs lease the same database.
    doc_b
        .push_doc_update(DocUpdate::new("page", append_text(&doc, " and b")), None)
        .await
        .unwrap();
    let merged = doc_a.get_doc("page").await.unwrap().unwrap();
    assert_eq!(text_of(&merged.bin), "from a and b");
}

#[tokio::test]
async fn test_newer_version_takes_over_from_older_tab() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let old_tab = StoreContext::new(StoreConfig::for_testing(dir.path()));
    let new_tab = old_tab.sibling();

    let old = LocalDocStorage::with_version(options(), &old_tab, 1);
    connect(&old).await;
    let (_doc, update) = doc_with_text("written by v1");
    old.push_doc_update(DocUpdate::new("page", update), None).await.unwrap();

    let new = LocalDocStorage::new(options(), &new_tab);
    connect(&new).await;

    assert_eq!(old.connection().status(), ConnectionStatus::Closed);
    assert_eq!(old.connection().last_error(), Some(Error::VersionChange));
    assert!(matches!(old.get_doc("page").await, Err(Error::NotConnected)));

    let migrated = new.get_doc("page").await.unwrap().unwrap();
    assert_eq!(text_of(&migrated.bin), "written by v1");
}

#[tokio::test]
async fn test_older_version_is_blocked_while_newer_is_open() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let new_tab = StoreContext::new(StoreConfig::for_testing(dir.path()));
    let old_tab = new_tab.sibling();

    let new = LocalDocStorage::new(options(), &new_tab);
    connect(&new).await;

    let old = LocalDocStorage::with_version(options(), &old_tab, 1);
    old.connection().connect();
    timeout(Duration::from_secs(2), async {
        while old.connection().last_error() != Some(Error::Blocked) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("older tab was never blocked");
    assert_ne!(old.connection().status(), ConnectionStatus::Connected);
    old.connection().disconnect();

    assert_eq!(new.connection().status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_data_survives_restart() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let clock;
    {
        let ctx = StoreContext::new(StoreConfig::for_testing(dir.path()));
        let doc = LocalDocStorage::new(options(), &ctx);
        let blob = LocalBlobStorage::new(options(), &ctx);
        let sync = LocalSyncStorage::new(options(), &ctx);
        connect(&doc).await;
        connect(&blob).await;
        connect(&sync).await;

        let (_doc, update) = doc_with_text("persisted");
        clock = doc.push_doc_update(DocUpdate::new("page", update), None).await.unwrap();
        blob.set_blob(BlobRecord::new("avatar", vec![7; 64], "image/png")).await.unwrap();
        sync.set_peer_clock(ClockKind::Pushed, "cloud", clock.clone()).await.unwrap();

        doc.connection().disconnect();
        blob.connection().disconnect();
        sync.connection().disconnect();
    }

    let ctx = StoreContext::new(StoreConfig::for_testing(dir.path()));
    let doc = LocalDocStorage::new(options(), &ctx);
    let blob = LocalBlobStorage::new(options(), &ctx);
    let sync = LocalSyncStorage::new(options(), &ctx);
    connect(&doc).await;
    connect(&blob).await;
    connect(&sync).await;

    let record = doc.get_doc("page").await.unwrap().unwrap();
    assert_eq!(text_of(&record.bin), "persisted");
    assert_eq!(record.timestamp, clock.timestamp);

    let stored = blob.get_blob("avatar").await.unwrap().unwrap();
    assert_eq!(stored.data, vec![7; 64]);
    let listed = blob.list_blobs().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].size, 64);

    let pushed = sync.get_peer_pushed_clock("cloud", "page").await.unwrap();
    assert_eq!(pushed, Some(DocClock::new("page", clock.timestamp)));
}

#[tokio::test]
async fn test_soft_deleted_blob_is_released_after_retention() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let ctx = StoreContext::new(StoreConfig::for_testing(dir.path()));
    let blob = LocalBlobStorage::new(options(), &ctx);
    connect(&blob).await;

    blob.set_blob(BlobRecord::new("a", b"one".to_vec(), "text/plain")).await.unwrap();
    blob.set_blob(BlobRecord::new("b", b"two".to_vec(), "text/plain")).await.unwrap();
    blob.delete_blob("a", false).await.unwrap();

    assert!(blob.get_blob("a").await.unwrap().is_none());
    let keys: Vec<String> = blob.list_blobs().await.unwrap().into_iter().map(|b| b.key).collect();
    assert_eq!(keys, vec!["b".to_string()]);

    blob.release_blobs().await.unwrap();
    blob.set_blob(BlobRecord::new("a", b"again".to_vec(), "text/plain")).await.unwrap();
    assert_eq!(blob.get_blob("a").await.unwrap().unwrap().data, b"again".to_vec());
}
