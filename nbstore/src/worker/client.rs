//! Foreground side of the worker.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use super::ops::WorkerOp;
use super::{decode, encode, WorkerRequest, WorkerResponse};
use crate::error::{Error, Result};

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>>>>>>;
type Streams = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Result<Vec<u8>>>>>>;

/// Typed access to a background [`StoreConsumer`](super::StoreConsumer).
pub struct WorkerClient {
    requests: mpsc::UnboundedSender<Vec<u8>>,
    next_id: AtomicU64,
    pending: PendingCalls,
    streams: Streams,
}

impl WorkerClient {
    pub(crate) fn new(
        requests: mpsc::UnboundedSender<Vec<u8>>,
        mut responses: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let streams: Streams = Arc::new(Mutex::new(HashMap::new()));

        let reader_pending = pending.clone();
        let reader_streams = streams.clone();
        tokio::spawn(async move {
            while let Some(bytes) = responses.recv().await {
                let response = match decode::<WorkerResponse>(&bytes) {
                    Ok(response) => response,
                    Err(e) => {
                        log::warn!("Dropping malformed worker response: {e}");
                        continue;
                    }
                };
                match response {
                    WorkerResponse::Return { id, result } => {
                        if let Some(tx) = reader_pending.lock().remove(&id) {
                            let _ = tx.send(result);
                        }
                    }
                    WorkerResponse::Next { id, payload } => {
                        if let Some(tx) = reader_streams.lock().get(&id) {
                            let _ = tx.send(Ok(payload));
                        }
                    }
                    WorkerResponse::Complete { id, error } => {
                        if let Some(tx) = reader_streams.lock().remove(&id) {
                            if let Some(e) = error {
                                let _ = tx.send(Err(e));
                            }
                        }
                    }
                }
            }
            // Dropping the senders fails every waiting call and ends every stream.
            reader_pending.lock().clear();
            reader_streams.lock().clear();
        });

        Self {
            requests,
            next_id: AtomicU64::new(1),
            pending,
            streams,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, request: &WorkerRequest) -> Result<()> {
        self.requests
            .send(encode(request)?)
            .map_err(|_| Error::Worker("worker stopped".into()))
    }

    /// Call an op by name with an already encoded payload.
    pub async fn call_raw(&self, op: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = WorkerRequest::Call {
            id,
            op: op.to_string(),
            payload,
        };
        if let Err(e) = self.send(&request) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        rx.await
            .map_err(|_| Error::Worker(format!("worker stopped before answering {op}")))?
    }

    pub async fn call<O: WorkerOp>(&self, request: O::Request) -> Result<O::Response> {
        let bytes = self.call_raw(O::NAME, encode(&request)?).await?;
        decode(&bytes)
    }

    /// Open a stream of `O::Response` values. Dropping the returned
    /// subscription unsubscribes.
    pub fn subscribe<O: WorkerOp>(&self, request: O::Request) -> Result<WorkerSubscription<O::Response>> {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().insert(id, tx);

        let request = WorkerRequest::Subscribe {
            id,
            op: O::NAME.to_string(),
            payload: encode(&request)?,
        };
        if let Err(e) = self.send(&request) {
            self.streams.lock().remove(&id);
            return Err(e);
        }

        Ok(WorkerSubscription {
            id,
            rx,
            requests: self.requests.clone(),
            _marker: PhantomData,
        })
    }

    /// Calls still waiting for their answer.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }
}

/// A live stream opened with [`WorkerClient::subscribe`].
pub struct WorkerSubscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<Result<Vec<u8>>>,
    requests: mpsc::UnboundedSender<Vec<u8>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> WorkerSubscription<T> {
    /// The next value; `None` once the stream completed. An error that ended
    /// the stream is yielded once before `None`.
    pub async fn next(&mut self) -> Option<Result<T>> {
        let item = self.rx.recv().await?;
        Some(item.and_then(|bytes| decode(&bytes)))
    }
}

impl<T> WorkerSubscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Drop for WorkerSubscription<T> {
    fn drop(&mut self) {
        if let Ok(bytes) = encode(&WorkerRequest::Unsubscribe { id: self.id }) {
            let _ = self.requests.send(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::registry::StorageRegistry;
    use crate::storage::{DocUpdate, SpaceType, StorageOptions, StoreContext};
    use crate::worker::{ops, spawn, InitOptions, StorageSpec};
    use std::time::Duration;
    use tokio::time::timeout;

    fn local_only() -> InitOptions {
        let opts = StorageOptions::new("local", SpaceType::Workspace, "ws");
        InitOptions {
            local: vec![
                StorageSpec::new("LocalDocStorage", opts.clone()),
                StorageSpec::new("LocalSyncStorage", opts),
            ],
            remotes: vec![],
        }
    }

    #[tokio::test]
    async fn test_calls_before_init_fail() {
        let dir = tempfile::tempdir().unwrap();
        let client = spawn(
            StorageRegistry::with_defaults(),
            StoreContext::new(StoreConfig::for_testing(dir.path())),
        );
        let err = client.call::<ops::GetDoc>("doc".into()).await.unwrap_err();
        assert_eq!(err, Error::NotInitialized);

        let err = client.call_raw("docStorage.nope", vec![]).await.unwrap_err();
        assert_eq!(err, Error::UnknownOperation("docStorage.nope".into()));
    }

    #[tokio::test]
    async fn test_push_and_subscribe_across_the_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let client = spawn(
            StorageRegistry::with_defaults(),
            StoreContext::new(StoreConfig::for_testing(dir.path())),
        );
        client.call::<ops::Init>(local_only()).await.unwrap();
        assert!(client.call::<ops::WaitForConnected>(()).await.unwrap());

        let mut updates = client.subscribe::<ops::SubscribeDocUpdate>(()).unwrap();
        // The subscription is registered once a later call has been answered.
        client.call::<ops::GetDocTimestamps>(None).await.unwrap();

        let clock = client
            .call::<ops::PushDocUpdate>(ops::PushDocUpdateRequest {
                update: DocUpdate::new("doc", vec![1, 2, 3]),
                origin: Some("test".into()),
            })
            .await
            .unwrap();
        assert_eq!(clock.doc_id, "doc");

        let event = timeout(Duration::from_secs(1), updates.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(event.update.bin, vec![1, 2, 3]);
        assert_eq!(event.origin.as_deref(), Some("test"));

        let timestamps = client.call::<ops::GetDocTimestamps>(None).await.unwrap();
        assert_eq!(timestamps.get("doc"), Some(&clock.timestamp));

        client.call::<ops::Destroy>(()).await.unwrap();
        assert!(timeout(Duration::from_secs(1), updates.next()).await.unwrap().is_none());
        assert_eq!(client.pending_calls(), 0);
    }
}
