use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::protocol::{
    decode_bin, encode_bin, AwarenessRoom, AwarenessUpdate, Empty, JoinAwareness, BROADCAST_AWARENESS_UPDATE,
    COLLECT_AWARENESS, JOIN_AWARENESS, LEAVE_AWARENESS, LOAD_AWARENESSES, UPDATE_AWARENESS,
};
use super::socket::{SocketClient, SocketConnection};
use super::{require_server, share_socket};
use crate::connection::{Connection, ConnectionStatus, StatusListener};
use crate::error::Result;
use crate::event::Subscription;
use crate::storage::{
    AwarenessRecord, AwarenessStorage, AwarenessUpdateListener, CollectHandler, SpaceType, Storage,
    StorageOptions, StorageType, StoreContext,
};

/// Presence relayed through the server, one awareness room per document.
pub struct CloudAwarenessStorage {
    options: StorageOptions,
    socket: Arc<SocketConnection>,
    client_version: String,
}

impl CloudAwarenessStorage {
    pub fn new(options: StorageOptions, ctx: &StoreContext) -> Result<Self> {
        let server = require_server(&options)?;
        let socket = share_socket(ctx, server);
        Ok(Self {
            options,
            socket: Arc::new(socket),
            client_version: ctx.config.client_version.clone(),
        })
    }
}

impl Storage for CloudAwarenessStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Awareness
    }

    fn options(&self) -> &StorageOptions {
        &self.options
    }

    fn connection(&self) -> &dyn Connection {
        self.socket.as_ref()
    }
}

/// One document's awareness subscription on the current socket.
struct AwarenessRoomState {
    room: AwarenessRoom,
    client_version: String,
    on_update: Arc<AwarenessUpdateListener>,
    on_collect: CollectHandler,
    /// Event listeners on the socket they were registered with
    attached: Mutex<Option<(Weak<SocketClient>, Vec<Subscription>)>>,
}

impl AwarenessRoomState {
    fn attach(&self, client: &Arc<SocketClient>) {
        let room = self.room.clone();
        let on_update = self.on_update.clone();
        let updates = client.on_event(BROADCAST_AWARENESS_UPDATE, move |data| {
            let message: AwarenessUpdate = match serde_json::from_value(data.clone()) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("Dropping malformed awareness broadcast: {e}");
                    return;
                }
            };
            if !same_room(&room, message.space_type, &message.space_id, &message.doc_id) {
                return;
            }
            match decode_bin(&message.awareness_update) {
                Ok(bin) => on_update(
                    &AwarenessRecord {
                        doc_id: message.doc_id,
                        bin,
                    },
                    None,
                ),
                Err(e) => log::warn!("Dropping awareness broadcast for {}: {e}", message.doc_id),
            }
        });

        let room = self.room.clone();
        let on_collect = self.on_collect.clone();
        let weak = Arc::downgrade(client);
        let collects = client.on_event(COLLECT_AWARENESS, move |data| {
            let request: AwarenessRoom = match serde_json::from_value(data.clone()) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!("Dropping malformed collect request: {e}");
                    return;
                }
            };
            if !same_room(&room, request.space_type, &request.space_id, &request.doc_id) {
                return;
            }
            let pending = on_collect();
            let weak = weak.clone();
            let room = room.clone();
            tokio::spawn(async move {
                let Some(record) = pending.await else {
                    return;
                };
                let Some(client) = weak.upgrade() else {
                    return;
                };
                let update = AwarenessUpdate {
                    space_type: room.space_type,
                    space_id: room.space_id,
                    doc_id: record.doc_id,
                    awareness_update: encode_bin(&record.bin),
                };
                if let Err(e) = client.emit(UPDATE_AWARENESS, &update) {
                    log::debug!("Could not answer awareness collect: {e}");
                }
            });
        });

        *self.attached.lock() = Some((Arc::downgrade(client), vec![updates, collects]));

        let join = JoinAwareness {
            space_type: self.room.space_type,
            space_id: self.room.space_id.clone(),
            doc_id: self.room.doc_id.clone(),
            client_version: self.client_version.clone(),
        };
        let load = self.room.clone();
        let client = client.clone();
        tokio::spawn(async move {
            match client.request::<_, Empty>(JOIN_AWARENESS, &join).await {
                Ok(_) => {
                    if let Err(e) = client.emit(LOAD_AWARENESSES, &load) {
                        log::debug!("Could not load awarenesses of {}: {e}", load.doc_id);
                    }
                }
                Err(e) => log::warn!("Joining awareness of {} failed: {e}", join.doc_id),
            }
        });
    }

    fn detach(&self) {
        let Some((client, subscriptions)) = self.attached.lock().take() else {
            return;
        };
        drop(subscriptions);
        if let Some(client) = client.upgrade() {
            if let Err(e) = client.emit(LEAVE_AWARENESS, &self.room) {
                log::debug!("Could not leave awareness of {}: {e}", self.room.doc_id);
            }
        }
    }
}

fn same_room(room: &AwarenessRoom, space_type: SpaceType, space_id: &str, doc_id: &str) -> bool {
    room.space_type == space_type && room.space_id == space_id && room.doc_id == doc_id
}

#[async_trait]
impl AwarenessStorage for CloudAwarenessStorage {
    async fn update(&self, record: AwarenessRecord, _origin: Option<&str>) -> Result<()> {
        let client = self.socket.require_inner()?;
        client.emit(
            UPDATE_AWARENESS,
            &AwarenessUpdate {
                space_type: self.options.space_type,
                space_id: self.options.id.clone(),
                doc_id: record.doc_id,
                awareness_update: encode_bin(&record.bin),
            },
        )
    }

    fn subscribe_update(
        &self,
        doc_id: &str,
        on_update: AwarenessUpdateListener,
        on_collect: CollectHandler,
    ) -> Subscription {
        let state = Arc::new(AwarenessRoomState {
            room: AwarenessRoom {
                space_type: self.options.space_type,
                space_id: self.options.id.clone(),
                doc_id: doc_id.to_string(),
            },
            client_version: self.client_version.clone(),
            on_update: Arc::new(on_update),
            on_collect,
            attached: Mutex::new(None),
        });

        // Re-join after every reconnect
        let weak_state = Arc::downgrade(&state);
        let weak_socket = Arc::downgrade(&self.socket);
        let listener: StatusListener = Box::new(move |status, _| {
            let Some(state) = weak_state.upgrade() else {
                return;
            };
            if status == ConnectionStatus::Connected {
                if let Some(client) = weak_socket.upgrade().and_then(|s| s.inner()) {
                    state.attach(&client);
                }
            } else {
                state.attached.lock().take();
            }
        });
        let status = self.socket.on_status_changed(listener);

        if let Some(client) = self.socket.inner() {
            state.attach(&client);
        }

        Subscription::new(move || {
            drop(status);
            state.detach();
        })
    }
}
