use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BroadcastChannelConnection, BroadcastChannelConnector};
use crate::channel::BroadcastChannel;
use crate::connection::{Connection, ConnectionStatus, StatusListener};
use crate::error::Result;
use crate::event::{Emitter, Subscription};
use crate::storage::{
    AwarenessRecord, AwarenessStorage, AwarenessUpdateListener, CollectHandler, Storage,
    StorageOptions, StorageType, StoreContext,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ChannelMessage {
    Update {
        doc_id: String,
        bin: Vec<u8>,
        origin: Option<String>,
    },
    Collect {
        doc_id: String,
        collect_id: String,
    },
}

impl ChannelMessage {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let (message, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(message)
    }

    fn post(&self, channel: &BroadcastChannel) {
        match self.encode() {
            Ok(bytes) => {
                channel.post(bytes);
            }
            Err(e) => log::warn!("Failed to encode awareness message: {e}"),
        }
    }
}

#[derive(Debug, Clone)]
struct LocalUpdate {
    record: AwarenessRecord,
    origin: Option<String>,
}

/// Awareness shared between the tabs of one device.
pub struct BroadcastChannelAwarenessStorage {
    options: StorageOptions,
    connection: Arc<BroadcastChannelConnection>,
    local: Emitter<LocalUpdate>,
}

impl BroadcastChannelAwarenessStorage {
    pub fn new(options: StorageOptions, ctx: &StoreContext) -> Self {
        let connection = ctx
            .pool
            .share(BroadcastChannelConnector::new(&ctx.channels, &options));
        Self {
            options,
            connection: Arc::new(connection),
            local: Emitter::new(),
        }
    }
}

impl Storage for BroadcastChannelAwarenessStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Awareness
    }

    fn options(&self) -> &StorageOptions {
        &self.options
    }

    fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }
}

/// One document's subscription to the tab channel currently open.
struct ChannelRoom {
    doc_id: String,
    collect_id: String,
    on_update: Arc<AwarenessUpdateListener>,
    on_collect: CollectHandler,
    attached: Mutex<Option<(Weak<BroadcastChannel>, Subscription)>>,
}

impl ChannelRoom {
    /// Listen on `channel` and ask the other tabs for their state. Attaching
    /// twice to the same channel does nothing.
    fn attach(&self, channel: &Arc<BroadcastChannel>) {
        let mut attached = self.attached.lock();
        if attached
            .as_ref()
            .is_some_and(|(current, _)| Weak::ptr_eq(current, &Arc::downgrade(channel)))
        {
            return;
        }

        let own_collect = self.collect_id.clone();
        let watched = self.doc_id.clone();
        let on_update = self.on_update.clone();
        let on_collect = self.on_collect.clone();
        let weak = Arc::downgrade(channel);
        let listener = channel.on_message(move |bytes| {
            let message = match ChannelMessage::decode(bytes) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("Dropping malformed awareness message: {e}");
                    return;
                }
            };
            match message {
                ChannelMessage::Update { doc_id, bin, origin } if doc_id == watched => {
                    on_update(&AwarenessRecord { doc_id, bin }, origin.as_deref());
                }
                ChannelMessage::Collect { doc_id, collect_id } if doc_id == watched && collect_id != own_collect => {
                    let pending = on_collect();
                    let weak = weak.clone();
                    tokio::spawn(async move {
                        let Some(record) = pending.await else {
                            return;
                        };
                        if let Some(channel) = weak.upgrade() {
                            ChannelMessage::Update {
                                doc_id: record.doc_id,
                                bin: record.bin,
                                origin: None,
                            }
                            .post(&channel);
                        }
                    });
                }
                _ => {}
            }
        });
        *attached = Some((Arc::downgrade(channel), listener));
        drop(attached);

        ChannelMessage::Collect {
            doc_id: self.doc_id.clone(),
            collect_id: self.collect_id.clone(),
        }
        .post(channel);
    }

    fn detach(&self) {
        self.attached.lock().take();
    }
}

#[async_trait]
impl AwarenessStorage for BroadcastChannelAwarenessStorage {
    async fn update(&self, record: AwarenessRecord, origin: Option<&str>) -> Result<()> {
        let channel = self.connection.require_inner()?;
        self.local.emit(&LocalUpdate {
            record: record.clone(),
            origin: origin.map(String::from),
        });
        ChannelMessage::Update {
            doc_id: record.doc_id,
            bin: record.bin,
            origin: origin.map(String::from),
        }
        .post(&channel);
        Ok(())
    }

    fn subscribe_update(
        &self,
        doc_id: &str,
        on_update: AwarenessUpdateListener,
        on_collect: CollectHandler,
    ) -> Subscription {
        let on_update = Arc::new(on_update);

        let local_doc = doc_id.to_string();
        let local_listener = on_update.clone();
        let local = self.local.subscribe(move |update| {
            if update.record.doc_id == local_doc {
                local_listener(&update.record, update.origin.as_deref());
            }
        });

        let room = Arc::new(ChannelRoom {
            doc_id: doc_id.to_string(),
            collect_id: Uuid::new_v4().to_string(),
            on_update,
            on_collect,
            attached: Mutex::new(None),
        });

        // Follow the channel across connects and reconnects
        let weak_room = Arc::downgrade(&room);
        let weak_connection = Arc::downgrade(&self.connection);
        let listener: StatusListener = Box::new(move |status, _| {
            let Some(room) = weak_room.upgrade() else {
                return;
            };
            if status == ConnectionStatus::Connected {
                if let Some(channel) = weak_connection.upgrade().and_then(|c| c.inner()) {
                    room.attach(&channel);
                }
            } else {
                room.detach();
            }
        });
        let status = self.connection.on_status_changed(listener);

        match self.connection.inner() {
            Some(channel) => room.attach(&channel),
            None => log::debug!(
                "Awareness of {doc_id} waits for {} to connect",
                self.connection.share_id()
            ),
        }

        Subscription::new(move || {
            drop(status);
            drop(local);
            room.detach();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::SpaceType;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    async fn tab(ctx: &StoreContext) -> BroadcastChannelAwarenessStorage {
        let storage =
            BroadcastChannelAwarenessStorage::new(StorageOptions::new("local", SpaceType::Workspace, "ws"), ctx);
        storage.connection().connect();
        storage.connection().wait_for_connected(None).await.unwrap();
        storage
    }

    fn record(doc: &str, bin: &[u8]) -> AwarenessRecord {
        AwarenessRecord {
            doc_id: doc.into(),
            bin: bin.to_vec(),
        }
    }

    fn listener() -> (AwarenessUpdateListener, mpsc::UnboundedReceiver<(AwarenessRecord, Option<String>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: AwarenessUpdateListener = Box::new(move |record, origin| {
            let _ = tx.send((record.clone(), origin.map(String::from)));
        });
        (listener, rx)
    }

    fn no_state() -> CollectHandler {
        Arc::new(|| Box::pin(async { None }))
    }

    #[tokio::test]
    async fn test_update_reaches_local_and_other_tab() {
        let dir = tempfile::tempdir().unwrap();
        let ctx_a = StoreContext::new(StoreConfig::for_testing(dir.path()));
        let ctx_b = ctx_a.sibling();
        let a = tab(&ctx_a).await;
        let b = tab(&ctx_b).await;

        let (on_a, mut rx_a) = listener();
        let (on_b, mut rx_b) = listener();
        let _sa = a.subscribe_update("doc", on_a, no_state());
        let _sb = b.subscribe_update("doc", on_b, no_state());

        a.update(record("doc", b"cursor"), Some("tab-a")).await.unwrap();

        let (got, origin) = timeout(Duration::from_secs(1), rx_b.recv()).await.unwrap().unwrap();
        assert_eq!(got.bin, b"cursor");
        assert_eq!(origin.as_deref(), Some("tab-a"));
        let (local, _) = timeout(Duration::from_secs(1), rx_a.recv()).await.unwrap().unwrap();
        assert_eq!(local.bin, b"cursor");
    }

    #[tokio::test]
    async fn test_other_docs_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let ctx_a = StoreContext::new(StoreConfig::for_testing(dir.path()));
        let ctx_b = ctx_a.sibling();
        let a = tab(&ctx_a).await;
        let b = tab(&ctx_b).await;

        let (on_b, mut rx_b) = listener();
        let _sb = b.subscribe_update("doc", on_b, no_state());
        a.update(record("other", b"x"), None).await.unwrap();

        assert!(timeout(Duration::from_millis(50), rx_b.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_new_subscriber_collects_existing_state() {
        let dir = tempfile::tempdir().unwrap();
        let ctx_a = StoreContext::new(StoreConfig::for_testing(dir.path()));
        let ctx_b = ctx_a.sibling();
        let a = tab(&ctx_a).await;
        let b = tab(&ctx_b).await;

        let (on_a, _rx_a) = listener();
        let state_of_a: CollectHandler = Arc::new(|| Box::pin(async { Some(record("doc", b"a-state")) }));
        let _sa = a.subscribe_update("doc", on_a, state_of_a);

        // b joins later and hears a's state through the collect round trip
        let (on_b, mut rx_b) = listener();
        let _sb = b.subscribe_update("doc", on_b, no_state());

        let (got, _) = timeout(Duration::from_secs(1), rx_b.recv()).await.unwrap().unwrap();
        assert_eq!(got.bin, b"a-state");
    }

    #[tokio::test]
    async fn test_subscription_made_before_connect_hears_other_tabs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx_a = StoreContext::new(StoreConfig::for_testing(dir.path()));
        let ctx_b = ctx_a.sibling();
        let a = tab(&ctx_a).await;
        let b = BroadcastChannelAwarenessStorage::new(StorageOptions::new("local", SpaceType::Workspace, "ws"), &ctx_b);

        let (on_b, mut rx_b) = listener();
        let _sb = b.subscribe_update("doc", on_b, no_state());
        b.connection().connect();
        b.connection().wait_for_connected(None).await.unwrap();

        a.update(record("doc", b"late"), None).await.unwrap();
        let (got, _) = timeout(Duration::from_secs(1), rx_b.recv()).await.unwrap().unwrap();
        assert_eq!(got.bin, b"late");
    }
}
