//! Replication between the local peer's storages and its remotes.
//!
//! ```text
//!            ┌── DocSync ────────── remote doc storages
//! local ─────┼── BlobSync ───────── remote blob storages
//!            └── AwarenessSync ──── remote awareness storages
//! ```

mod awareness;
mod blob;
mod doc;

pub use awareness::AwarenessSync;
pub use blob::BlobSync;
pub use doc::{DocSync, DocSyncDocState, DocSyncPeer, DocSyncState, SYNC_ORIGIN_PREFIX};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::storage::SpaceStorage;

/// The three sync façades for one local peer. A façade is absent when the
/// local peer lacks the storage it needs.
pub struct StoreSync {
    pub doc: Option<Arc<DocSync>>,
    pub blob: Option<Arc<BlobSync>>,
    pub awareness: Option<Arc<AwarenessSync>>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StoreSync {
    pub fn new(local: &SpaceStorage, remotes: &[SpaceStorage], config: &StoreConfig) -> Self {
        let doc = match (local.try_doc(), local.try_sync()) {
            (Some(doc), Some(clocks)) => {
                let peers = remotes
                    .iter()
                    .filter_map(|remote| {
                        remote.try_doc().map(|storage| DocSyncPeer {
                            peer: storage.options().peer.clone(),
                            remote: storage,
                        })
                    })
                    .collect();
                Some(Arc::new(DocSync::new(doc, clocks, peers, config)))
            }
            _ => None,
        };

        let blob = local.try_blob().map(|blob| {
            let remotes = remotes
                .iter()
                .filter_map(|remote| remote.try_blob().map(|b| (b.options().peer.clone(), b)))
                .collect();
            Arc::new(BlobSync::new(blob, remotes))
        });

        let awareness = local.try_awareness().map(|awareness| {
            let remotes = remotes.iter().filter_map(SpaceStorage::try_awareness).collect();
            Arc::new(AwarenessSync::new(awareness, remotes))
        });

        Self {
            doc,
            blob,
            awareness,
            token: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Start background doc replication. Does nothing without a doc sync or
    /// when already started.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.token.is_cancelled() {
            return;
        }
        if let Some(doc) = &self.doc {
            *task = Some(doc.start(self.token.child_token()));
        }
    }

    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Doc sync task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for StoreSync {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
