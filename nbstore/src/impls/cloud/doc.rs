use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    decode_bin, encode_bin, BroadcastDocUpdate, Data, DeleteDoc, Empty, JoinSpace, LeaveSpace, LoadDoc,
    LoadDocResponse, LoadDocTimestamps, LoadDocTimestampsResponse, PushDocUpdate, PushDocUpdateResponse,
    BROADCAST_DOC_UPDATE, DELETE_DOC, JOIN, LEAVE, LOAD_DOC, LOAD_DOC_TIMESTAMPS, PUSH_DOC_UPDATE,
};
use super::socket::{SocketClient, SocketConnection};
use super::{require_server, share_socket};
use crate::connection::{Connection, ConnectionStatus, StatusListener};
use crate::error::{Error, Result};
use crate::event::{Emitter, Subscription};
use crate::storage::{
    DocClock, DocClocks, DocDiff, DocRecord, DocStorage, DocUpdate, DocUpdateEvent, DocUpdateListener,
    Storage, StorageOptions, StorageType, StoreContext, Timestamp, UpdateMerger,
};

/// The socket as seen by one space: joins the space room whenever the
/// socket comes up and leaves it on disconnect.
pub struct CloudDocConnection {
    socket: Arc<SocketConnection>,
    options: StorageOptions,
    client_version: String,
    updates: Arc<Emitter<DocUpdateEvent>>,
    status_sub: Mutex<Option<Subscription>>,
    joined: Arc<Mutex<Option<JoinedSocket>>>,
}

/// The socket client the space was joined on, with its broadcast listener.
type JoinedSocket = (Weak<SocketClient>, Subscription);

impl CloudDocConnection {
    fn new(socket: SocketConnection, options: StorageOptions, client_version: String) -> Self {
        Self {
            socket: Arc::new(socket),
            options,
            client_version,
            updates: Arc::new(Emitter::new()),
            status_sub: Mutex::new(None),
            joined: Arc::new(Mutex::new(None)),
        }
    }

    pub fn socket(&self) -> &SocketConnection {
        &self.socket
    }

    fn client(&self) -> Result<Arc<SocketClient>> {
        self.socket.require_inner()
    }

    fn space(&self) -> SpaceRoom {
        SpaceRoom {
            socket: Arc::downgrade(&self.socket),
            options: self.options.clone(),
            client_version: self.client_version.clone(),
            updates: self.updates.clone(),
            joined: self.joined.clone(),
        }
    }
}

/// Everything the status listener needs, without keeping the socket alive.
#[derive(Clone)]
struct SpaceRoom {
    socket: Weak<SocketConnection>,
    options: StorageOptions,
    client_version: String,
    updates: Arc<Emitter<DocUpdateEvent>>,
    joined: Arc<Mutex<Option<JoinedSocket>>>,
}

impl SpaceRoom {
    /// Join the space on the current socket client, once per client.
    fn on_connected(&self) {
        let Some(socket) = self.socket.upgrade() else {
            return;
        };
        let Some(client) = socket.inner() else {
            return;
        };
        let mut joined = self.joined.lock();
        if joined
            .as_ref()
            .is_some_and(|(current, _)| Weak::ptr_eq(current, &Arc::downgrade(&client)))
        {
            return;
        }

        let options = self.options.clone();
        let updates = self.updates.clone();
        let listener = client.on_event(BROADCAST_DOC_UPDATE, move |data| {
            let message: BroadcastDocUpdate = match serde_json::from_value(data.clone()) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("Dropping malformed doc broadcast: {e}");
                    return;
                }
            };
            if message.space_type != options.space_type || message.space_id != options.id {
                return;
            }
            let bin = match decode_bin(&message.update) {
                Ok(bin) => bin,
                Err(e) => {
                    log::warn!("Dropping doc broadcast for {}: {e}", message.doc_id);
                    return;
                }
            };
            updates.emit(&DocUpdateEvent {
                update: DocRecord {
                    doc_id: message.doc_id,
                    bin,
                    timestamp: message.timestamp,
                    editor: message.editor,
                },
                origin: None,
            });
        });
        *joined = Some((Arc::downgrade(&client), listener));
        drop(joined);

        let join = JoinSpace {
            space_type: self.options.space_type,
            space_id: self.options.id.clone(),
            client_version: self.client_version.clone(),
        };
        let weak = self.socket.clone();
        tokio::spawn(async move {
            let result = client.request::<_, Empty>(JOIN, &join).await;
            let Some(socket) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(_) => log::info!("Joined {} {}", join.space_type, join.space_id),
                Err(Error::Remote(message)) => {
                    log::error!("Server refused to join {} {}: {message}", join.space_type, join.space_id);
                    socket.close_with_error(Error::Remote(message));
                }
                Err(e) => {
                    log::warn!("Joining {} {} failed: {e}", join.space_type, join.space_id);
                    socket.fail(e);
                }
            }
        });
    }
}

#[async_trait]
impl Connection for CloudDocConnection {
    fn status(&self) -> ConnectionStatus {
        self.socket.status()
    }

    fn last_error(&self) -> Option<Error> {
        self.socket.last_error()
    }

    fn connect(&self) {
        let first = {
            let mut status_sub = self.status_sub.lock();
            if status_sub.is_none() {
                let room = self.space();
                let listener: StatusListener = Box::new(move |status, _| {
                    if status == ConnectionStatus::Connected {
                        room.on_connected();
                    }
                });
                *status_sub = Some(self.socket.on_status_changed(listener));
                true
            } else {
                false
            }
        };

        // Another storage may have brought the socket up already
        let already_connected = first && self.socket.status() == ConnectionStatus::Connected;
        self.socket.connect();
        if already_connected {
            self.space().on_connected();
        }
    }

    fn disconnect(&self) {
        self.status_sub.lock().take();
        if let Some(client) = self.socket.inner() {
            let leave = LeaveSpace {
                space_type: self.options.space_type,
                space_id: self.options.id.clone(),
            };
            if let Err(e) = client.emit(LEAVE, &leave) {
                log::debug!("Could not leave {}: {e}", self.options.id);
            }
        }
        self.joined.lock().take();
        self.socket.disconnect();
    }

    async fn wait_for_connected(&self, signal: Option<&CancellationToken>) -> Result<()> {
        self.socket.wait_for_connected(signal).await
    }

    fn on_status_changed(&self, listener: StatusListener) -> Subscription {
        self.socket.on_status_changed(listener)
    }
}

impl Drop for CloudDocConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Documents stored on the server.
///
/// The server owns snapshot compaction, so the snapshot hooks do nothing.
pub struct CloudDocStorage {
    options: StorageOptions,
    connection: CloudDocConnection,
    merger: Arc<dyn UpdateMerger>,
}

impl CloudDocStorage {
    pub fn new(options: StorageOptions, ctx: &StoreContext) -> Result<Self> {
        let server = require_server(&options)?;
        let socket = share_socket(ctx, server);
        let connection = CloudDocConnection::new(socket, options.clone(), ctx.config.client_version.clone());
        Ok(Self {
            options,
            connection,
            merger: ctx.merger.clone(),
        })
    }

    fn load_doc(&self, doc_id: &str, state_vector: Option<&[u8]>) -> LoadDoc {
        LoadDoc {
            space_type: self.options.space_type,
            space_id: self.options.id.clone(),
            doc_id: doc_id.to_string(),
            state_vector: state_vector.map(encode_bin),
        }
    }

    async fn request_doc(&self, doc_id: &str, state_vector: Option<&[u8]>) -> Result<LoadDocResponse> {
        let client = self.connection.client()?;
        let response: Data<LoadDocResponse> = client.request(LOAD_DOC, &self.load_doc(doc_id, state_vector)).await?;
        Ok(response.data)
    }
}

impl Storage for CloudDocStorage {
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
impl DocStorage for CloudDocStorage {
    fn merger(&self) -> &dyn UpdateMerger {
        self.merger.as_ref()
    }

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>> {
        let response = self.request_doc(doc_id, None).await?;
        Ok(Some(DocRecord {
            doc_id: doc_id.to_string(),
            bin: decode_bin(&response.missing)?,
            timestamp: response.timestamp,
            editor: None,
        }))
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
        let client = self.connection.client()?;
        let push = PushDocUpdate {
            space_type: self.options.space_type,
            space_id: self.options.id.clone(),
            doc_id: update.doc_id.clone(),
            updates: encode_bin(&update.bin),
        };
        let response: Data<PushDocUpdateResponse> = client.request(PUSH_DOC_UPDATE, &push).await?;
        Ok(DocClock::new(update.doc_id, response.data.timestamp))
    }

    /// Loads the whole document; the protocol has no cheaper way to ask.
    async fn get_doc_timestamp(&self, doc_id: &str) -> Result<Option<DocClock>> {
        let response = self.request_doc(doc_id, None).await?;
        Ok(Some(DocClock::new(doc_id, response.timestamp)))
    }

    async fn get_doc_timestamps(&self, after: Option<Timestamp>) -> Result<DocClocks> {
        let client = self.connection.client()?;
        let load = LoadDocTimestamps {
            space_type: self.options.space_type,
            space_id: self.options.id.clone(),
            timestamp: after,
        };
        let response: Data<LoadDocTimestampsResponse> = client.request(LOAD_DOC_TIMESTAMPS, &load).await?;
        Ok(response.data)
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<()> {
        let client = self.connection.client()?;
        client.emit(
            DELETE_DOC,
            &DeleteDoc {
                space_type: self.options.space_type,
                space_id: self.options.id.clone(),
                doc_id: doc_id.to_string(),
            },
        )
    }

    fn subscribe_doc_update(&self, listener: DocUpdateListener) -> Subscription {
        self.connection.updates.subscribe(move |event| listener(event))
    }

    async fn get_doc_diff(&self, doc_id: &str, state_vector: Option<&[u8]>) -> Result<Option<DocDiff>> {
        let response = self.request_doc(doc_id, state_vector).await?;
        Ok(Some(DocDiff {
            doc_id: doc_id.to_string(),
            missing: decode_bin(&response.missing)?,
            state: decode_bin(&response.state)?,
            timestamp: response.timestamp,
        }))
    }
}
