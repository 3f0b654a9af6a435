//! The worker op catalog.
//!
//! Every op is a marker type naming `"<domain>.<operation>"` and fixing its
//! request and response types. Ops marked *subscription* are used with
//! [`WorkerClient::subscribe`](super::WorkerClient::subscribe) and yield a
//! stream of responses; the rest are plain calls.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::InitOptions;
use crate::storage::{
    AwarenessEvent, AwarenessRecord, BlobRecord, DocClock, DocClocks, DocDiff, DocRecord, DocUpdate,
    DocUpdateEvent, ListedBlobRecord, Timestamp,
};
use crate::sync::{DocSyncDocState, DocSyncState};

pub trait WorkerOp: Send + Sync + 'static {
    const NAME: &'static str;
    type Request: Serialize + DeserializeOwned + Send + 'static;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocDiffRequest {
    pub doc_id: String,
    pub state: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushDocUpdateRequest {
    pub update: DocUpdate,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBlobRequest {
    pub key: String,
    pub permanently: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRequest {
    pub peer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDocRequest {
    pub peer: String,
    pub doc_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPeerClockRequest {
    pub peer: String,
    pub clock: DocClock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdateRequest {
    pub awareness: AwarenessRecord,
    pub origin: Option<String>,
}

/// Answer to an [`AwarenessEvent::Collect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectRequest {
    pub collect_id: String,
    pub awareness: AwarenessRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPriorityRequest {
    pub doc_id: String,
    pub priority: i32,
}

macro_rules! worker_ops {
    ($( $(#[$meta:meta])* $op:ident = $name:literal : $req:ty => $resp:ty; )*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, Default)]
            pub struct $op;

            impl WorkerOp for $op {
                const NAME: &'static str = $name;
                type Request = $req;
                type Response = $resp;
            }
        )*

        /// Every op name in the catalog.
        pub const ALL: &[&str] = &[$($name),*];
    };
}

worker_ops! {
    /// Build the storages and start syncing.
    Init = "worker.init": InitOptions => ();
    /// Stop syncing and release every storage.
    Destroy = "worker.destroy": () => ();

    GetDoc = "docStorage.getDoc": String => Option<DocRecord>;
    GetDocSnapshot = "docStorage.getDocSnapshot": String => Option<DocRecord>;
    GetDocDiff = "docStorage.getDocDiff": DocDiffRequest => Option<DocDiff>;
    PushDocUpdate = "docStorage.pushDocUpdate": PushDocUpdateRequest => DocClock;
    GetDocTimestamps = "docStorage.getDocTimestamps": Option<Timestamp> => DocClocks;
    GetDocTimestamp = "docStorage.getDocTimestamp": String => Option<DocClock>;
    DeleteDoc = "docStorage.deleteDoc": String => ();
    /// Subscription.
    SubscribeDocUpdate = "docStorage.subscribeDocUpdate": () => DocUpdateEvent;
    WaitForConnected = "docStorage.waitForConnected": () => bool;

    GetBlob = "blobStorage.getBlob": String => Option<BlobRecord>;
    SetBlob = "blobStorage.setBlob": BlobRecord => ();
    DeleteBlob = "blobStorage.deleteBlob": DeleteBlobRequest => ();
    ReleaseBlobs = "blobStorage.releaseBlobs": () => ();
    ListBlobs = "blobStorage.listBlobs": () => Vec<ListedBlobRecord>;

    GetPeerPulledRemoteClocks = "syncStorage.getPeerPulledRemoteClocks": PeerRequest => DocClocks;
    GetPeerPulledRemoteClock = "syncStorage.getPeerPulledRemoteClock": PeerDocRequest => Option<DocClock>;
    SetPeerPulledRemoteClock = "syncStorage.setPeerPulledRemoteClock": SetPeerClockRequest => ();
    GetPeerRemoteClocks = "syncStorage.getPeerRemoteClocks": PeerRequest => DocClocks;
    GetPeerRemoteClock = "syncStorage.getPeerRemoteClock": PeerDocRequest => Option<DocClock>;
    SetPeerRemoteClock = "syncStorage.setPeerRemoteClock": SetPeerClockRequest => ();
    GetPeerPushedClocks = "syncStorage.getPeerPushedClocks": PeerRequest => DocClocks;
    GetPeerPushedClock = "syncStorage.getPeerPushedClock": PeerDocRequest => Option<DocClock>;
    SetPeerPushedClock = "syncStorage.setPeerPushedClock": SetPeerClockRequest => ();
    ClearClocks = "syncStorage.clearClocks": () => ();

    AwarenessUpdate = "awarenessStorage.update": AwarenessUpdateRequest => ();
    /// Subscription. The request is the doc id.
    AwarenessSubscribeUpdate = "awarenessStorage.subscribeUpdate": String => AwarenessEvent;
    AwarenessCollect = "awarenessStorage.collect": CollectRequest => ();

    GetDocSyncState = "docSync.state": () => DocSyncState;
    GetDocSyncDocState = "docSync.docState": String => DocSyncDocState;
    /// Subscription. Yields `true` once; the priority holds until unsubscribed.
    AddPriority = "docSync.addPriority": AddPriorityRequest => bool;

    DownloadBlob = "blobSync.downloadBlob": String => Option<BlobRecord>;
    UploadBlob = "blobSync.uploadBlob": BlobRecord => ();

    AwarenessSyncUpdate = "awarenessSync.update": AwarenessUpdateRequest => ();
    /// Subscription. The request is the doc id.
    AwarenessSyncSubscribeUpdate = "awarenessSync.subscribeUpdate": String => AwarenessEvent;
    AwarenessSyncCollect = "awarenessSync.collect": CollectRequest => ();
}
