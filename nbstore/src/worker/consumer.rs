//! Background side of the worker: owns the storages and answers requests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::ops::{self, CollectRequest, WorkerOp};
use super::{decode, encode, InitOptions, StorageSpec, WorkerRequest, WorkerResponse};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event::Subscription;
use crate::registry::StorageRegistry;
use crate::storage::{
    AwarenessEvent, AwarenessRecord, AwarenessStorage, AwarenessUpdateListener, BlobStorage, CollectHandler,
    DocStorage, DocUpdateEvent, SpaceStorage, Storage, StoreContext, SyncStorage,
};
use crate::sync::{AwarenessSync, BlobSync, DocSync, StoreSync};

type CallFuture = BoxFuture<'static, Result<Vec<u8>>>;
type CallHandler = Box<dyn Fn(Arc<Engine>, Vec<u8>) -> CallFuture + Send + Sync>;
type RawSink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
type SubscribeHandler = Box<dyn Fn(Arc<Engine>, Vec<u8>, RawSink) -> Result<Subscription> + Send + Sync>;

/// Pushes one value into a subscription stream.
type Next<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ops answered without waiting for the calls queued before them.
const DETACHED: &[&str] = &[ops::WaitForConnected::NAME];

/// Everything `worker.init` builds.
struct Engine {
    local: SpaceStorage,
    remotes: Vec<SpaceStorage>,
    sync: StoreSync,
    collects: Arc<Mutex<HashMap<String, oneshot::Sender<AwarenessRecord>>>>,
    collect_timeout: Duration,
}

impl Engine {
    fn doc(&self) -> Result<Arc<dyn DocStorage>> {
        self.local.doc()
    }

    fn blob(&self) -> Result<Arc<dyn BlobStorage>> {
        self.local.blob()
    }

    fn clocks(&self) -> Result<Arc<dyn SyncStorage>> {
        self.local.sync()
    }

    fn awareness(&self) -> Result<Arc<dyn AwarenessStorage>> {
        self.local.awareness()
    }

    fn doc_sync(&self) -> Result<Arc<DocSync>> {
        self.sync.doc.clone().ok_or_else(|| Error::StorageNotFound("docSync".into()))
    }

    fn blob_sync(&self) -> Result<Arc<BlobSync>> {
        self.sync.blob.clone().ok_or_else(|| Error::StorageNotFound("blobSync".into()))
    }

    fn awareness_sync(&self) -> Result<Arc<AwarenessSync>> {
        self.sync
            .awareness
            .clone()
            .ok_or_else(|| Error::StorageNotFound("awarenessSync".into()))
    }

    fn awareness_listener(next: Next<AwarenessEvent>) -> AwarenessUpdateListener {
        Box::new(move |record: &AwarenessRecord, origin: Option<&str>| {
            next(&AwarenessEvent::Update {
                awareness: record.clone(),
                origin: origin.map(String::from),
            })
        })
    }

    /// Forward collect requests to the foreground as
    /// [`AwarenessEvent::Collect`] and wait for its `collect` call.
    fn collect_handler(&self, next: Next<AwarenessEvent>) -> CollectHandler {
        let collects = self.collects.clone();
        let timeout = self.collect_timeout;
        Arc::new(move || {
            let collect_id = Uuid::new_v4().to_string();
            let (tx, rx) = oneshot::channel();
            collects.lock().insert(collect_id.clone(), tx);
            next(&AwarenessEvent::Collect {
                collect_id: collect_id.clone(),
            });

            let collects = collects.clone();
            async move {
                let answer = tokio::time::timeout(timeout, rx).await;
                collects.lock().remove(&collect_id);
                match answer {
                    Ok(Ok(record)) => Some(record),
                    Ok(Err(_)) => None,
                    Err(_) => {
                        log::debug!("Awareness collect {collect_id} timed out");
                        None
                    }
                }
            }
            .boxed()
        })
    }

    /// A late or unknown answer is dropped.
    fn resolve_collect(&self, request: CollectRequest) -> Result<()> {
        match self.collects.lock().remove(&request.collect_id) {
            Some(tx) => {
                let _ = tx.send(request.awareness);
            }
            None => log::debug!("No pending awareness collect {}", request.collect_id),
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.sync.stop().await;
        self.local.disconnect();
        for remote in &self.remotes {
            remote.disconnect();
        }
    }
}

/// Dispatches worker requests by op name.
///
/// Calls run one after another in arrival order, except the ones listed in
/// `DETACHED`, which may wait indefinitely and so run on their own task.
pub struct StoreConsumer {
    registry: StorageRegistry,
    ctx: StoreContext,
    engine: Option<Arc<Engine>>,
    calls: HashMap<&'static str, CallHandler>,
    subscribes: HashMap<&'static str, SubscribeHandler>,
    streams: HashMap<u64, Subscription>,
    responses: mpsc::UnboundedSender<Vec<u8>>,
}

impl StoreConsumer {
    pub fn new(registry: StorageRegistry, ctx: StoreContext, responses: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        let mut consumer = Self {
            registry,
            ctx,
            engine: None,
            calls: HashMap::new(),
            subscribes: HashMap::new(),
            streams: HashMap::new(),
            responses,
        };
        consumer.register_doc_storage();
        consumer.register_blob_storage();
        consumer.register_sync_storage();
        consumer.register_awareness_storage();
        consumer.register_sync();
        consumer
    }

    /// Serve requests until the request channel closes, then tear down.
    pub async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(bytes) = requests.recv().await {
            match decode::<WorkerRequest>(&bytes) {
                Ok(request) => self.handle(request).await,
                Err(e) => log::warn!("Dropping malformed worker request: {e}"),
            }
        }
        self.destroy().await;
        log::debug!("Worker consumer stopped");
    }

    async fn handle(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::Call { id, op, payload } => {
                if DETACHED.contains(&op.as_str()) {
                    match self.prepare_call(&op, payload) {
                        Ok(pending) => {
                            let responses = self.responses.clone();
                            tokio::spawn(async move {
                                let result = pending.await;
                                respond(&responses, &WorkerResponse::Return { id, result });
                            });
                        }
                        Err(e) => self.reply(WorkerResponse::Return { id, result: Err(e) }),
                    }
                } else {
                    let result = self.call(&op, payload).await;
                    if let Err(e) = &result {
                        log::debug!("Worker call {op} failed: {e}");
                    }
                    self.reply(WorkerResponse::Return { id, result });
                }
            }
            WorkerRequest::Subscribe { id, op, payload } => match self.subscribe(id, &op, payload) {
                Ok(subscription) => {
                    self.streams.insert(id, subscription);
                }
                Err(e) => self.reply(WorkerResponse::Complete { id, error: Some(e) }),
            },
            WorkerRequest::Unsubscribe { id } => {
                if let Some(subscription) = self.streams.remove(&id) {
                    subscription.unsubscribe();
                    self.reply(WorkerResponse::Complete { id, error: None });
                }
            }
        }
    }

    async fn call(&mut self, op: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        if op == ops::Init::NAME {
            let options: InitOptions = decode(&payload)?;
            self.init(options).await?;
            encode(&())
        } else if op == ops::Destroy::NAME {
            self.destroy().await;
            encode(&())
        } else {
            self.prepare_call(op, payload)?.await
        }
    }

    fn prepare_call(&self, op: &str, payload: Vec<u8>) -> Result<CallFuture> {
        let handler = self
            .calls
            .get(op)
            .ok_or_else(|| Error::UnknownOperation(op.to_string()))?;
        let engine = self.engine.clone().ok_or(Error::NotInitialized)?;
        Ok(handler(engine, payload))
    }

    fn subscribe(&self, id: u64, op: &str, payload: Vec<u8>) -> Result<Subscription> {
        let handler = self
            .subscribes
            .get(op)
            .ok_or_else(|| Error::UnknownOperation(op.to_string()))?;
        let engine = self.engine.clone().ok_or(Error::NotInitialized)?;
        let responses = self.responses.clone();
        let sink: RawSink = Arc::new(move |payload: Vec<u8>| {
            respond(&responses, &WorkerResponse::Next { id, payload });
        });
        handler(engine, payload, sink)
    }

    fn build_space(&self, specs: &[StorageSpec]) -> Result<SpaceStorage> {
        let storages = specs
            .iter()
            .map(|spec| self.registry.create(&spec.name, spec.opts.clone(), &self.ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(SpaceStorage::new(storages))
    }

    async fn init(&mut self, options: InitOptions) -> Result<()> {
        if self.engine.is_some() {
            log::info!("Worker re-initialized; dropping previous storages");
            self.destroy().await;
        }

        let local = self.build_space(&options.local)?;
        let remotes = options
            .remotes
            .iter()
            .map(|specs| self.build_space(specs))
            .collect::<Result<Vec<_>>>()?;

        local.connect();
        for remote in &remotes {
            remote.connect();
        }
        let sync = StoreSync::new(&local, &remotes, &self.ctx.config);
        sync.start();

        log::info!(
            "Worker initialized with {} local storages and {} remote peers",
            options.local.len(),
            remotes.len()
        );
        self.engine = Some(Arc::new(Engine {
            local,
            remotes,
            sync,
            collects: Arc::new(Mutex::new(HashMap::new())),
            collect_timeout: self.ctx.config.collect_timeout,
        }));
        Ok(())
    }

    async fn destroy(&mut self) {
        let streams: Vec<u64> = self.streams.keys().copied().collect();
        for id in streams {
            if let Some(subscription) = self.streams.remove(&id) {
                subscription.unsubscribe();
            }
            self.reply(WorkerResponse::Complete { id, error: None });
        }
        if let Some(engine) = self.engine.take() {
            engine.shutdown().await;
        }
    }

    fn reply(&self, response: WorkerResponse) {
        respond(&self.responses, &response);
    }

    fn on_call<O, F, Fut>(&mut self, handler: F)
    where
        O: WorkerOp,
        F: Fn(Arc<Engine>, O::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O::Response>> + Send + 'static,
    {
        self.calls.insert(
            O::NAME,
            Box::new(move |engine: Arc<Engine>, payload: Vec<u8>| {
                let pending = decode::<O::Request>(&payload).map(|request| handler(engine, request));
                async move { encode(&pending?.await?) }.boxed()
            }),
        );
    }

    fn on_subscribe<O, F>(&mut self, handler: F)
    where
        O: WorkerOp,
        F: Fn(Arc<Engine>, O::Request, Next<O::Response>) -> Result<Subscription> + Send + Sync + 'static,
    {
        self.subscribes.insert(
            O::NAME,
            Box::new(move |engine: Arc<Engine>, payload: Vec<u8>, sink: RawSink| {
                let request = decode::<O::Request>(&payload)?;
                let next: Next<O::Response> = Arc::new(move |value: &O::Response| match encode(value) {
                    Ok(bytes) => sink(bytes),
                    Err(e) => log::warn!("Dropping {} event: {e}", O::NAME),
                });
                handler(engine, request, next)
            }),
        );
    }

    fn register_doc_storage(&mut self) {
        self.on_call::<ops::GetDoc, _, _>(|engine, doc_id| async move { engine.doc()?.get_doc(&doc_id).await });
        self.on_call::<ops::GetDocSnapshot, _, _>(|engine, doc_id| async move {
            engine.doc()?.get_doc_snapshot(&doc_id).await
        });
        self.on_call::<ops::GetDocDiff, _, _>(|engine, req| async move {
            engine.doc()?.get_doc_diff(&req.doc_id, req.state.as_deref()).await
        });
        self.on_call::<ops::PushDocUpdate, _, _>(|engine, req| async move {
            engine.doc()?.push_doc_update(req.update, req.origin.as_deref()).await
        });
        self.on_call::<ops::GetDocTimestamps, _, _>(|engine, after| async move {
            engine.doc()?.get_doc_timestamps(after).await
        });
        self.on_call::<ops::GetDocTimestamp, _, _>(|engine, doc_id| async move {
            engine.doc()?.get_doc_timestamp(&doc_id).await
        });
        self.on_call::<ops::DeleteDoc, _, _>(|engine, doc_id| async move { engine.doc()?.delete_doc(&doc_id).await });
        self.on_call::<ops::WaitForConnected, _, _>(|engine, ()| async move {
            engine.doc()?.connection().wait_for_connected(None).await.map(|()| true)
        });
        self.on_subscribe::<ops::SubscribeDocUpdate, _>(|engine, (), next| {
            Ok(engine
                .doc()?
                .subscribe_doc_update(Box::new(move |event: &DocUpdateEvent| next(event))))
        });
    }

    fn register_blob_storage(&mut self) {
        self.on_call::<ops::GetBlob, _, _>(|engine, key| async move { engine.blob()?.get_blob(&key).await });
        self.on_call::<ops::SetBlob, _, _>(|engine, blob| async move { engine.blob()?.set_blob(blob).await });
        self.on_call::<ops::DeleteBlob, _, _>(|engine, req| async move {
            engine.blob()?.delete_blob(&req.key, req.permanently).await
        });
        self.on_call::<ops::ReleaseBlobs, _, _>(|engine, ()| async move { engine.blob()?.release_blobs().await });
        self.on_call::<ops::ListBlobs, _, _>(|engine, ()| async move { engine.blob()?.list_blobs().await });
    }

    fn register_sync_storage(&mut self) {
        self.on_call::<ops::GetPeerPulledRemoteClocks, _, _>(|engine, req| async move {
            engine.clocks()?.get_peer_pulled_remote_clocks(&req.peer).await
        });
        self.on_call::<ops::GetPeerPulledRemoteClock, _, _>(|engine, req| async move {
            engine.clocks()?.get_peer_pulled_remote_clock(&req.peer, &req.doc_id).await
        });
        self.on_call::<ops::SetPeerPulledRemoteClock, _, _>(|engine, req| async move {
            engine.clocks()?.set_peer_pulled_remote_clock(&req.peer, req.clock).await
        });
        self.on_call::<ops::GetPeerRemoteClocks, _, _>(|engine, req| async move {
            engine.clocks()?.get_peer_remote_clocks(&req.peer).await
        });
        self.on_call::<ops::GetPeerRemoteClock, _, _>(|engine, req| async move {
            engine.clocks()?.get_peer_remote_clock(&req.peer, &req.doc_id).await
        });
        self.on_call::<ops::SetPeerRemoteClock, _, _>(|engine, req| async move {
            engine.clocks()?.set_peer_remote_clock(&req.peer, req.clock).await
        });
        self.on_call::<ops::GetPeerPushedClocks, _, _>(|engine, req| async move {
            engine.clocks()?.get_peer_pushed_clocks(&req.peer).await
        });
        self.on_call::<ops::GetPeerPushedClock, _, _>(|engine, req| async move {
            engine.clocks()?.get_peer_pushed_clock(&req.peer, &req.doc_id).await
        });
        self.on_call::<ops::SetPeerPushedClock, _, _>(|engine, req| async move {
            engine.clocks()?.set_peer_pushed_clock(&req.peer, req.clock).await
        });
        self.on_call::<ops::ClearClocks, _, _>(|engine, ()| async move { engine.clocks()?.clear_clocks().await });
    }

    fn register_awareness_storage(&mut self) {
        self.on_call::<ops::AwarenessUpdate, _, _>(|engine, req| async move {
            engine.awareness()?.update(req.awareness, req.origin.as_deref()).await
        });
        self.on_subscribe::<ops::AwarenessSubscribeUpdate, _>(|engine, doc_id, next| {
            let storage = engine.awareness()?;
            let on_collect = engine.collect_handler(next.clone());
            Ok(storage.subscribe_update(&doc_id, Engine::awareness_listener(next), on_collect))
        });
        self.on_call::<ops::AwarenessCollect, _, _>(|engine, req| async move { engine.resolve_collect(req) });
    }

    fn register_sync(&mut self) {
        self.on_call::<ops::GetDocSyncState, _, _>(|engine, ()| async move {
            engine.doc_sync().map(|sync| sync.state())
        });
        self.on_call::<ops::GetDocSyncDocState, _, _>(|engine, doc_id| async move {
            engine.doc_sync().map(|sync| sync.doc_state(&doc_id))
        });
        self.on_subscribe::<ops::AddPriority, _>(|engine, req, next| {
            let subscription = engine.doc_sync()?.add_priority(&req.doc_id, req.priority);
            next(&true);
            Ok(subscription)
        });

        self.on_call::<ops::DownloadBlob, _, _>(|engine, key| async move {
            engine.blob_sync()?.download_blob(&key).await
        });
        self.on_call::<ops::UploadBlob, _, _>(|engine, blob| async move { engine.blob_sync()?.upload_blob(blob).await });

        self.on_call::<ops::AwarenessSyncUpdate, _, _>(|engine, req| async move {
            engine.awareness_sync()?.update(req.awareness, req.origin.as_deref()).await
        });
        self.on_subscribe::<ops::AwarenessSyncSubscribeUpdate, _>(|engine, doc_id, next| {
            let sync = engine.awareness_sync()?;
            let on_collect = engine.collect_handler(next.clone());
            Ok(sync.subscribe_update(&doc_id, Engine::awareness_listener(next), on_collect))
        });
        self.on_call::<ops::AwarenessSyncCollect, _, _>(|engine, req| async move { engine.resolve_collect(req) });
    }

    /// Names this consumer answers, `worker.*` included.
    pub fn operations(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = vec![ops::Init::NAME, ops::Destroy::NAME];
        names.extend(self.calls.keys().copied());
        names.extend(self.subscribes.keys().copied());
        names.sort_unstable();
        names
    }
}

fn respond(responses: &mpsc::UnboundedSender<Vec<u8>>, response: &WorkerResponse) {
    match encode(response) {
        Ok(bytes) => {
            if responses.send(bytes).is_err() {
                log::debug!("Worker client gone; dropping response");
            }
        }
        Err(e) => log::error!("Failed to encode worker response: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    #[test]
    fn test_every_catalog_op_is_handled() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let consumer = StoreConsumer::new(
            StorageRegistry::with_defaults(),
            StoreContext::new(StoreConfig::for_testing(dir.path())),
            tx,
        );
        let mut catalog: Vec<&str> = ops::ALL.to_vec();
        catalog.sort_unstable();
        assert_eq!(consumer.operations(), catalog);
    }
}
