//! Shared fixtures: an in-memory `space:*` socket server and helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use nbstore::impls::cloud::protocol::{
    self, decode_bin, encode_bin, AwarenessRoom, AwarenessUpdate, BlobKey, BroadcastDocUpdate, DeleteDoc, Frame,
    LoadDoc, LoadDocTimestamps, PushDocUpdate, SetBlob, SpaceBlobs,
};
use nbstore::storage::{UpdateMerger, YrsMerger};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[derive(Default)]
struct StoredDoc {
    updates: Vec<Vec<u8>>,
    timestamp: u64,
}

struct StoredBlob {
    data: Vec<u8>,
    mime: String,
    created_at: u64,
    deleted: bool,
}

#[derive(Default)]
struct ServerState {
    docs: HashMap<(String, String), StoredDoc>,
    blobs: HashMap<(String, String), StoredBlob>,
    clients: HashMap<u64, mpsc::UnboundedSender<String>>,
    /// Awareness rooms each client joined, as `space/doc`.
    rooms: HashMap<u64, Vec<String>>,
    events: Vec<String>,
}

/// A minimal cloud server speaking the socket frames the cloud backend uses.
#[derive(Clone)]
pub struct MockServer {
    pub port: u16,
    state: Arc<Mutex<ServerState>>,
    reject_pushes: Arc<AtomicBool>,
    reject_joins: Arc<AtomicBool>,
    clock: Arc<AtomicU64>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = Self {
            port,
            state: Arc::new(Mutex::new(ServerState::default())),
            reject_pushes: Arc::new(AtomicBool::new(false)),
            reject_joins: Arc::new(AtomicBool::new(false)),
            clock: Arc::new(AtomicU64::new(1_000)),
        };

        let accept = server.clone();
        tokio::spawn(async move {
            let mut next_client = 0u64;
            while let Ok((stream, _)) = listener.accept().await {
                next_client += 1;
                let server = accept.clone();
                let client_id = next_client;
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        server.serve(client_id, ws).await;
                    }
                });
            }
        });
        server
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Answer every push with `{error:{message:"conflict"}}`.
    pub fn reject_pushes(&self, reject: bool) {
        self.reject_pushes.store(reject, Ordering::SeqCst);
    }

    pub fn reject_joins(&self, reject: bool) {
        self.reject_joins.store(reject, Ordering::SeqCst);
    }

    /// Event names received so far, in order.
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// The merged document as stored by the server.
    pub fn doc(&self, space_id: &str, doc_id: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let doc = state.docs.get(&(space_id.to_string(), doc_id.to_string()))?;
        let updates: Vec<&[u8]> = doc.updates.iter().map(Vec::as_slice).collect();
        YrsMerger.merge_updates(&updates).ok()
    }

    /// Store an update as if another client pushed it, and broadcast it.
    pub fn inject_update(&self, space_id: &str, doc_id: &str, update: Vec<u8>) -> u64 {
        let timestamp = self.clock.fetch_add(1, Ordering::SeqCst);
        let broadcast = {
            let mut state = self.state.lock();
            let doc = state
                .docs
                .entry((space_id.to_string(), doc_id.to_string()))
                .or_default();
            doc.updates.push(update.clone());
            doc.timestamp = timestamp;
            BroadcastDocUpdate {
                space_type: nbstore::SpaceType::Workspace,
                space_id: space_id.to_string(),
                doc_id: doc_id.to_string(),
                update: encode_bin(&update),
                timestamp,
                editor: Some("server".into()),
            }
        };
        self.broadcast(None, protocol::BROADCAST_DOC_UPDATE, json!(broadcast));
        timestamp
    }

    /// Blob bytes as stored by the server, soft-deleted ones excluded.
    pub fn blob(&self, space_id: &str, key: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let blob = state.blobs.get(&(space_id.to_string(), key.to_string()))?;
        (!blob.deleted).then(|| blob.data.clone())
    }

    /// Store a blob as if another client uploaded it.
    pub fn put_blob(&self, space_id: &str, key: &str, data: Vec<u8>, mime: &str) {
        let created_at = self.clock.fetch_add(1, Ordering::SeqCst);
        self.state.lock().blobs.insert(
            (space_id.to_string(), key.to_string()),
            StoredBlob {
                data,
                mime: mime.to_string(),
                created_at,
                deleted: false,
            },
        );
    }

    /// Close every open socket from the server side.
    pub fn kick_all(&self) {
        self.state.lock().clients.clear();
    }

    async fn serve(&self, client_id: u64, ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.state.lock().clients.insert(client_id, tx);

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(Ok(message)) = stream.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(Frame::Event { event, data, ack }) = Frame::decode(text.as_str()) else {
                continue;
            };
            self.state.lock().events.push(event.clone());
            if let Some(reply) = self.handle(client_id, &event, data) {
                if let Some(id) = ack {
                    let frame = Frame::Ack { id, data: reply };
                    if let Some(tx) = self.state.lock().clients.get(&client_id) {
                        let _ = tx.send(frame.encode().unwrap());
                    }
                }
            }
        }

        let mut state = self.state.lock();
        state.clients.remove(&client_id);
        state.rooms.remove(&client_id);
        drop(state);
        writer.abort();
    }

    fn handle(&self, client_id: u64, event: &str, data: Value) -> Option<Value> {
        match event {
            protocol::JOIN => {
                if self.reject_joins.load(Ordering::SeqCst) {
                    Some(json!({"error": {"message": "unsupported client version"}}))
                } else {
                    Some(json!({}))
                }
            }
            protocol::LOAD_DOC => {
                let load: LoadDoc = serde_json::from_value(data).ok()?;
                let state = self.state.lock();
                let Some(doc) = state.docs.get(&(load.space_id.clone(), load.doc_id.clone())) else {
                    return Some(json!({"error": {"message": "doc not found"}}));
                };
                let updates: Vec<&[u8]> = doc.updates.iter().map(Vec::as_slice).collect();
                let merged = YrsMerger.merge_updates(&updates).ok()?;
                let sv = load.state_vector.as_deref().and_then(|sv| decode_bin(sv).ok());
                let missing = YrsMerger.diff(&merged, sv.as_deref()).ok()?;
                let state_vector = YrsMerger.state_vector(&merged).ok()?;
                Some(json!({"data": {
                    "missing": encode_bin(&missing),
                    "state": encode_bin(&state_vector),
                    "timestamp": doc.timestamp,
                }}))
            }
            protocol::PUSH_DOC_UPDATE => {
                if self.reject_pushes.load(Ordering::SeqCst) {
                    return Some(json!({"error": {"message": "conflict"}}));
                }
                let push: PushDocUpdate = serde_json::from_value(data).ok()?;
                let update = decode_bin(&push.updates).ok()?;
                let timestamp = self.clock.fetch_add(1, Ordering::SeqCst);
                {
                    let mut state = self.state.lock();
                    let doc = state.docs.entry((push.space_id.clone(), push.doc_id.clone())).or_default();
                    doc.updates.push(update);
                    doc.timestamp = timestamp;
                }
                let broadcast = BroadcastDocUpdate {
                    space_type: push.space_type,
                    space_id: push.space_id,
                    doc_id: push.doc_id,
                    update: push.updates,
                    timestamp,
                    editor: None,
                };
                self.broadcast(Some(client_id), protocol::BROADCAST_DOC_UPDATE, json!(broadcast));
                Some(json!({"data": {"timestamp": timestamp}}))
            }
            protocol::LOAD_DOC_TIMESTAMPS => {
                let load: LoadDocTimestamps = serde_json::from_value(data).ok()?;
                let state = self.state.lock();
                let clocks: HashMap<&str, u64> = state
                    .docs
                    .iter()
                    .filter(|((space, _), doc)| {
                        *space == load.space_id && load.timestamp.is_none_or(|after| doc.timestamp > after)
                    })
                    .map(|((_, doc_id), doc)| (doc_id.as_str(), doc.timestamp))
                    .collect();
                Some(json!({ "data": clocks }))
            }
            protocol::DELETE_DOC => {
                let delete: DeleteDoc = serde_json::from_value(data).ok()?;
                self.state.lock().docs.remove(&(delete.space_id, delete.doc_id));
                None
            }
            protocol::GET_BLOB => {
                let get: BlobKey = serde_json::from_value(data).ok()?;
                let state = self.state.lock();
                let blob = state
                    .blobs
                    .get(&(get.space_id, get.key.clone()))
                    .filter(|blob| !blob.deleted)
                    .map(|blob| {
                        json!({
                            "key": get.key,
                            "data": encode_bin(&blob.data),
                            "mime": blob.mime,
                            "createdAt": blob.created_at,
                        })
                    });
                Some(json!({ "data": blob }))
            }
            protocol::SET_BLOB => {
                let set: SetBlob = serde_json::from_value(data).ok()?;
                let bytes = decode_bin(&set.data).ok()?;
                self.put_blob(&set.space_id, &set.key, bytes, &set.mime);
                Some(json!({}))
            }
            protocol::DELETE_BLOB => {
                let delete: BlobKey = serde_json::from_value(data).ok()?;
                let mut state = self.state.lock();
                let key = (delete.space_id, delete.key);
                if delete.permanently {
                    state.blobs.remove(&key);
                } else if let Some(blob) = state.blobs.get_mut(&key) {
                    blob.deleted = true;
                }
                Some(json!({}))
            }
            protocol::RELEASE_BLOBS => {
                let space: SpaceBlobs = serde_json::from_value(data).ok()?;
                self.state
                    .lock()
                    .blobs
                    .retain(|(space_id, _), blob| *space_id != space.space_id || !blob.deleted);
                Some(json!({}))
            }
            protocol::LIST_BLOBS => {
                let space: SpaceBlobs = serde_json::from_value(data).ok()?;
                let state = self.state.lock();
                let listed: Vec<Value> = state
                    .blobs
                    .iter()
                    .filter(|((space_id, _), blob)| *space_id == space.space_id && !blob.deleted)
                    .map(|((_, key), blob)| {
                        json!({
                            "key": key,
                            "mime": blob.mime,
                            "size": blob.data.len(),
                            "createdAt": blob.created_at,
                        })
                    })
                    .collect();
                Some(json!({ "data": listed }))
            }
            protocol::JOIN_AWARENESS => {
                let room: AwarenessRoom = serde_json::from_value(data).ok()?;
                let key = format!("{}/{}", room.space_id, room.doc_id);
                self.state.lock().rooms.entry(client_id).or_default().push(key);
                Some(json!({}))
            }
            protocol::LEAVE_AWARENESS => {
                let room: AwarenessRoom = serde_json::from_value(data).ok()?;
                let key = format!("{}/{}", room.space_id, room.doc_id);
                if let Some(rooms) = self.state.lock().rooms.get_mut(&client_id) {
                    rooms.retain(|r| *r != key);
                }
                None
            }
            protocol::LOAD_AWARENESSES => {
                let room: AwarenessRoom = serde_json::from_value(data.clone()).ok()?;
                let key = format!("{}/{}", room.space_id, room.doc_id);
                self.broadcast_room(client_id, &key, protocol::COLLECT_AWARENESS, data);
                Some(json!({}))
            }
            protocol::UPDATE_AWARENESS => {
                let update: AwarenessUpdate = serde_json::from_value(data.clone()).ok()?;
                let key = format!("{}/{}", update.space_id, update.doc_id);
                self.broadcast_room(client_id, &key, protocol::BROADCAST_AWARENESS_UPDATE, data);
                None
            }
            _ => None,
        }
    }

    fn broadcast(&self, except: Option<u64>, event: &str, data: Value) {
        let frame = Frame::Event {
            event: event.to_string(),
            data,
            ack: None,
        };
        let text = frame.encode().unwrap();
        for (id, tx) in &self.state.lock().clients {
            if Some(*id) != except {
                let _ = tx.send(text.clone());
            }
        }
    }

    fn broadcast_room(&self, except: u64, room: &str, event: &str, data: Value) {
        let frame = Frame::Event {
            event: event.to_string(),
            data,
            ack: None,
        };
        let text = frame.encode().unwrap();
        let state = self.state.lock();
        for (id, tx) in &state.clients {
            let joined = state.rooms.get(id).is_some_and(|rooms| rooms.iter().any(|r| r == room));
            if *id != except && joined {
                let _ = tx.send(text.clone());
            }
        }
    }
}

/// A doc holding `content` in its "content" text, plus its full update.
pub fn doc_with_text(content: &str) -> (Doc, Vec<u8>) {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, content);
    }
    let state = doc.transact().encode_state_as_update_v1(&StateVector::default());
    (doc, state)
}

/// Append to the "content" text of `doc`, returning only the new update.
pub fn append_text(doc: &Doc, suffix: &str) -> Vec<u8> {
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        let len = text.get_string(&txn).len() as u32;
        text.insert(&mut txn, len, suffix);
    }
    doc.transact().encode_state_as_update_v1(&before)
}

/// The "content" text of an encoded update.
pub fn text_of(update: &[u8]) -> String {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
    }
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text("content");
    text.get_string(&txn)
}
