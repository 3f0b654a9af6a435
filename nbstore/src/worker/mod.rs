//! Message-passing surface between a foreground context and the background
//! context that owns the storages.
//!
//! Both sides only exchange bytes (bincode-encoded envelopes):
//!
//! ```text
//! WorkerClient ── Call / Subscribe / Unsubscribe ──► StoreConsumer
//!              ◄── Return / Next / Complete ───────
//! ```
//!
//! Payloads inside an envelope are the bincode encoding of the op's request
//! or response type (see [`ops`]). Errors cross as [`Error`] values.

mod client;
mod consumer;
pub mod ops;

pub use client::{WorkerClient, WorkerSubscription};
pub use consumer::StoreConsumer;
pub use ops::WorkerOp;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::registry::StorageRegistry;
use crate::storage::{StorageOptions, StoreContext};

/// Bumped whenever an envelope or op payload changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// One storage to build: a registry name and its options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub name: String,
    pub opts: StorageOptions,
}

impl StorageSpec {
    pub fn new(name: impl Into<String>, opts: StorageOptions) -> Self {
        Self {
            name: name.into(),
            opts,
        }
    }
}

/// Payload of `worker.init`: the local peer's storages and, per remote peer,
/// that peer's storages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitOptions {
    pub local: Vec<StorageSpec>,
    pub remotes: Vec<Vec<StorageSpec>>,
}

/// Foreground → background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRequest {
    Call { id: u64, op: String, payload: Vec<u8> },
    Subscribe { id: u64, op: String, payload: Vec<u8> },
    Unsubscribe { id: u64 },
}

/// Background → foreground.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerResponse {
    Return { id: u64, result: Result<Vec<u8>, Error> },
    Next { id: u64, payload: Vec<u8> },
    /// Ends a subscription, with the error that ended it if any.
    Complete { id: u64, error: Option<Error> },
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

/// Start a background consumer on the current runtime and return the client
/// talking to it. The consumer stops once the client and all of its
/// subscriptions are dropped.
pub fn spawn(registry: StorageRegistry, ctx: StoreContext) -> WorkerClient {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();

    let consumer = StoreConsumer::new(registry, ctx, response_tx);
    tokio::spawn(consumer.run(request_rx));

    log::debug!("Worker spawned (protocol v{PROTOCOL_VERSION})");
    WorkerClient::new(request_tx, response_rx)
}
