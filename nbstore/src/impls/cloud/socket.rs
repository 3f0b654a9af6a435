//! Shared websocket to one server.
//!
//! A reader task dispatches incoming frames: acks resolve the matching
//! pending request, events go to the listeners registered with
//! [`SocketClient::on_event`]. A writer task drains the outgoing queue.
//! When the socket dies on its own the connection is failed and retried,
//! and every request still waiting for its ack fails with
//! [`Error::ConnectionClosed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::protocol::{Ack, Frame};
use crate::connection::{ConnectionHandle, Connector, SharedConnection};
use crate::error::{Error, Result};
use crate::event::{Emitter, Subscription};

pub type SocketConnection = SharedConnection<SocketConnector>;

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type EventListeners = Arc<Mutex<HashMap<String, Arc<Emitter<Value>>>>>;

/// Turn a server base url into the socket endpoint.
///
/// `http://host` → `ws://host/`, `https://host` → `wss://host/`.
pub fn socket_url(server_base_url: &str) -> String {
    let base = server_base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/")
}

/// Opens the websocket behind `socket:<url>`.
pub struct SocketConnector {
    url: String,
}

impl SocketConnector {
    pub fn new(server_base_url: &str) -> Self {
        Self {
            url: socket_url(server_base_url),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for SocketConnector {
    type Inner = Arc<SocketClient>;

    fn share_id(&self) -> String {
        format!("socket:{}", self.url)
    }

    async fn do_connect(&self, handle: ConnectionHandle<Self>) -> Result<Arc<SocketClient>> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        log::info!("Socket connected to {}", self.url);
        Ok(Arc::new(SocketClient::start(ws_stream, handle)))
    }

    fn do_disconnect(&self, inner: Arc<SocketClient>) {
        log::debug!("Closing socket to {}", self.url);
        inner.close();
    }
}

/// Request/ack and event multiplexing over one websocket.
pub struct SocketClient {
    outgoing: mpsc::UnboundedSender<Message>,
    next_ack: AtomicU64,
    pending: PendingAcks,
    listeners: EventListeners,
    /// Set when we close the socket ourselves
    shutdown: CancellationToken,
    /// Set once the reader has stopped, for whatever reason
    closed: CancellationToken,
}

impl SocketClient {
    fn start<S>(ws_stream: tokio_tungstenite::WebSocketStream<S>, handle: ConnectionHandle<SocketConnector>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let listeners: EventListeners = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        // Writer task: forward the outgoing queue to the socket
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                    message = out_rx.recv() => {
                        let Some(message) = message else { break };
                        if ws_writer.send(message).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader task: resolve acks, dispatch events
        let reader_pending = pending.clone();
        let reader_listeners = listeners.clone();
        let reader_shutdown = shutdown.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let reason = loop {
                let message = tokio::select! {
                    _ = reader_shutdown.cancelled() => break None,
                    message = ws_reader.next() => message,
                };
                match message {
                    Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                        Ok(frame) => dispatch(frame, &reader_pending, &reader_listeners),
                        Err(e) => log::warn!("Dropping malformed frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break Some(Error::ConnectionClosed),
                    Some(Err(e)) => break Some(Error::from(e)),
                    Some(Ok(_)) => {}
                }
            };

            reader_closed.cancel();
            let dropped = {
                let mut pending = reader_pending.lock();
                let count = pending.len();
                pending.clear();
                count
            };
            if dropped > 0 {
                log::debug!("Failing {dropped} requests still waiting for an ack");
            }
            if let Some(error) = reason {
                if !reader_shutdown.is_cancelled() {
                    log::warn!("Socket lost: {error}");
                    handle.fail(error);
                }
            }
        });

        Self {
            outgoing: out_tx,
            next_ack: AtomicU64::new(1),
            pending,
            listeners,
            shutdown,
            closed,
        }
    }

    fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let text = frame.encode()?;
        self.outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Fire-and-forget event.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) -> Result<()> {
        self.send(Frame::Event {
            event: event.to_string(),
            data: serde_json::to_value(data)?,
            ack: None,
        })
    }

    /// Send an event and wait for the server's raw acknowledgement.
    pub async fn emit_with_ack<T: Serialize, R: DeserializeOwned>(&self, event: &str, data: &T) -> Result<R> {
        let data = serde_json::to_value(data)?;
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let sent = self.send(Frame::Event {
            event: event.to_string(),
            data,
            ack: Some(id),
        });
        if let Err(e) = sent {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let value = rx.await.map_err(|_| Error::ConnectionClosed)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send an event and turn an `{error}` ack into [`Error::Remote`].
    pub async fn request<T: Serialize, R: DeserializeOwned>(&self, event: &str, data: &T) -> Result<R> {
        self.emit_with_ack::<T, Ack<R>>(event, data).await?.into_result()
    }

    /// Listen for a server-pushed event.
    pub fn on_event(&self, event: &str, listener: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        let emitter = self
            .listeners
            .lock()
            .entry(event.to_string())
            .or_insert_with(|| Arc::new(Emitter::new()))
            .clone();
        emitter.subscribe(listener)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of requests waiting for an ack.
    pub fn pending_acks(&self) -> usize {
        self.pending.lock().len()
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn dispatch(frame: Frame, pending: &PendingAcks, listeners: &EventListeners) {
    match frame {
        Frame::Ack { id, data } => match pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(data);
            }
            None => log::debug!("Ack {id} has no waiting request"),
        },
        Frame::Event { event, data, .. } => {
            let emitter = listeners.lock().get(&event).cloned();
            match emitter {
                Some(emitter) => {
                    emitter.emit(&data);
                }
                None => log::trace!("No listener for {event}"),
            }
        }
    }
}
