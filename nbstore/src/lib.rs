//! # nbstore: local-first document and blob storage with multi-backend sync
//!
//! Persists CRDT documents and binary blobs across heterogeneous backends and
//! reconciles them with per-document timestamps. The bytes of a document
//! update are never interpreted here beyond merging them with yrs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   bincode ops    ┌───────────────┐
//! │ WorkerClient │ ◄──────────────► │ StoreConsumer │
//! │ (foreground) │                  │ (background)  │
//! └──────────────┘                  └───────┬───────┘
//!                                           │
//!                      ┌────────────────────┼────────────────────┐
//!                      ▼                    ▼                    ▼
//!               ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//!               │ local peer  │ ◄── │  StoreSync   │ ──► │ remote peer │
//!               │ SpaceStorage│     │ doc/blob/awr │     │ SpaceStorage│
//!               └──────┬──────┘     └──────────────┘     └──────┬──────┘
//!                      │                                        │
//!             ┌────────┴────────┐                        ┌──────┴──────┐
//!             │ RocksDB + idb:  │                        │  websocket  │
//!             │ tab channel     │                        │  (cloud)    │
//!             └─────────────────┘                        └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: reconnecting, shareable connections
//! - [`storage`]: one trait per domain plus the snapshot/update merge policy
//! - [`impls`]: local (RocksDB), broadcast channel and cloud backends
//! - [`registry`]: backend constructors by name
//! - [`sync`]: doc, blob and awareness replication
//! - [`worker`]: typed op catalog between a foreground and the engine

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod impls;
pub mod registry;
pub mod storage;
pub mod sync;
pub mod worker;

// Re-exports for convenience
pub use channel::{BroadcastChannel, ChannelHub};
pub use config::{RetryPolicy, StoreConfig};
pub use connection::{
    AutoReconnectConnection, Connection, ConnectionPool, ConnectionStatus, Connector, SharedConnection,
};
pub use error::{Error, Result};
pub use event::{Emitter, Subscription};
pub use registry::StorageRegistry;
pub use storage::{
    AnyStorage, AwarenessEvent, AwarenessRecord, AwarenessStorage, BlobRecord, BlobStorage, DocClock,
    DocClocks, DocDiff, DocRecord, DocStorage, DocUpdate, DocUpdateEvent, ListedBlobRecord, SpaceStorage,
    SpaceType, Storage, StorageOptions, StorageType, StoreContext, SyncStorage, Timestamp,
};
pub use sync::{AwarenessSync, BlobSync, DocSync, DocSyncState, StoreSync};
pub use worker::{InitOptions, StorageSpec, WorkerClient, WorkerOp, WorkerSubscription};
