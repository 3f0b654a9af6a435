//! Socket frames and `space:*` event payloads.
//!
//! Every frame is one JSON text message:
//!
//! ```text
//! {"type":"event","event":"space:load-doc","data":{...},"ack":7}   client → server
//! {"type":"ack","id":7,"data":{"data":{...}}}                      server → client
//! {"type":"ack","id":7,"data":{"error":{"message":"..."}}}         server → client
//! {"type":"event","event":"space:broadcast-doc-update","data":{...}} server → client
//! ```
//!
//! Binary payloads (updates, state vectors, awareness) travel as standard
//! base64.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::storage::{SpaceType, Timestamp};

pub const JOIN: &str = "space:join";
pub const LEAVE: &str = "space:leave";
pub const LOAD_DOC: &str = "space:load-doc";
pub const PUSH_DOC_UPDATE: &str = "space:push-doc-update";
pub const LOAD_DOC_TIMESTAMPS: &str = "space:load-doc-timestamps";
pub const DELETE_DOC: &str = "space:delete-doc";
pub const BROADCAST_DOC_UPDATE: &str = "space:broadcast-doc-update";

pub const JOIN_AWARENESS: &str = "space:join-awareness";
pub const LEAVE_AWARENESS: &str = "space:leave-awareness";
pub const UPDATE_AWARENESS: &str = "space:update-awareness";
pub const LOAD_AWARENESSES: &str = "space:load-awarenesses";
pub const BROADCAST_AWARENESS_UPDATE: &str = "space:broadcast-awareness-update";
pub const COLLECT_AWARENESS: &str = "space:collect-awareness";

pub const GET_BLOB: &str = "space:get-blob";
pub const SET_BLOB: &str = "space:set-blob";
pub const DELETE_BLOB: &str = "space:delete-blob";
pub const RELEASE_BLOBS: &str = "space:release-blobs";
pub const LIST_BLOBS: &str = "space:list-blobs";

/// One websocket text message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Event {
        event: String,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
    Ack {
        id: u64,
        #[serde(default)]
        data: Value,
    },
}

impl Frame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    pub message: String,
}

/// Server acknowledgement: either `{error:{message}}` or the success shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ack<T> {
    Err { error: AckError },
    Ok(T),
}

impl<T> Ack<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            Ack::Ok(value) => Ok(value),
            Ack::Err { error } => Err(Error::Remote(error.message)),
        }
    }
}

/// `{data: T}` success payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data<T> {
    pub data: T,
}

/// Success payload with nothing in it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

pub fn encode_bin(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_bin(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| Error::Deserialization(format!("invalid base64 payload: {e}")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSpace {
    pub space_type: SpaceType,
    pub space_id: String,
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveSpace {
    pub space_type: SpaceType,
    pub space_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadDoc {
    pub space_type: SpaceType,
    pub space_id: String,
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_vector: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadDocResponse {
    pub missing: String,
    pub state: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushDocUpdate {
    pub space_type: SpaceType,
    pub space_id: String,
    pub doc_id: String,
    pub updates: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushDocUpdateResponse {
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadDocTimestamps {
    pub space_type: SpaceType,
    pub space_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

pub type LoadDocTimestampsResponse = HashMap<String, Timestamp>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDoc {
    pub space_type: SpaceType,
    pub space_id: String,
    pub doc_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastDocUpdate {
    pub space_type: SpaceType,
    pub space_id: String,
    pub doc_id: String,
    pub update: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub editor: Option<String>,
}

/// Addresses one document's awareness room. Used by join, leave, load and
/// the server's collect request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessRoom {
    pub space_type: SpaceType,
    pub space_id: String,
    pub doc_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAwareness {
    pub space_type: SpaceType,
    pub space_id: String,
    pub doc_id: String,
    pub client_version: String,
}

/// Sent by `space:update-awareness` and received as
/// `space:broadcast-awareness-update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessUpdate {
    pub space_type: SpaceType,
    pub space_id: String,
    pub doc_id: String,
    pub awareness_update: String,
}

/// Addresses one blob. Used by get and delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobKey {
    pub space_type: SpaceType,
    pub space_id: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub permanently: bool,
}

/// Addresses every blob of a space. Used by list and release.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceBlobs {
    pub space_type: SpaceType,
    pub space_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBlob {
    pub space_type: SpaceType,
    pub space_id: String,
    pub key: String,
    pub data: String,
    pub mime: String,
}

/// `space:get-blob` answers `{data: null}` for a key the server lacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBlob {
    pub key: String,
    pub data: String,
    pub mime: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedRemoteBlob {
    pub key: String,
    pub mime: String,
    pub size: u64,
    pub created_at: Timestamp,
}
