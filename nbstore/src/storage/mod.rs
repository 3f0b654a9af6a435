//! Storage contracts shared by every backend.
//!
//! One trait per domain ([`DocStorage`], [`BlobStorage`], [`SyncStorage`],
//! [`AwarenessStorage`]), all built on [`Storage`], which ties a storage to
//! its [`Connection`]. Backends are picked by name through the registry.

mod awareness;
mod blob;
mod doc;
mod merge;
mod space;
mod sync;

pub use awareness::{AwarenessEvent, AwarenessRecord, AwarenessStorage, AwarenessUpdateListener, CollectHandler};
pub use blob::{BlobRecord, BlobStorage, ListedBlobRecord};
pub use doc::{
    squash_updates, DocClock, DocClocks, DocDiff, DocRecord, DocStorage, DocUpdate,
    DocUpdateEvent, DocUpdateListener,
};
pub use merge::{UpdateMerger, YrsMerger};
pub use space::SpaceStorage;
pub use sync::{ClockKind, SyncStorage};

#[cfg(test)]
pub(crate) use merge::tests as merge_fixtures;

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelHub;
use crate::config::StoreConfig;
use crate::connection::{Connection, ConnectionPool};
use crate::impls::local::LocalDatabases;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceType {
    Workspace,
    Userspace,
}

impl SpaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceType::Workspace => "workspace",
            SpaceType::Userspace => "userspace",
        }
    }
}

impl fmt::Display for SpaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Doc,
    Blob,
    Sync,
    Awareness,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageType::Doc => "doc",
            StorageType::Blob => "blob",
            StorageType::Sync => "sync",
            StorageType::Awareness => "awareness",
        };
        f.write_str(name)
    }
}

/// Options every storage is constructed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageOptions {
    /// Peer the storage talks to (`"local"`, a server host, ...)
    pub peer: String,
    #[serde(rename = "type")]
    pub space_type: SpaceType,
    /// Space id
    pub id: String,
    /// Required by the cloud backend
    pub server_base_url: Option<String>,
}

impl StorageOptions {
    pub fn new(peer: impl Into<String>, space_type: SpaceType, id: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            space_type,
            id: id.into(),
            server_base_url: None,
        }
    }

    pub fn with_server(mut self, url: impl Into<String>) -> Self {
        self.server_base_url = Some(url.into());
        self
    }

    /// `<peer>:<type>:<id>`, the base of database and channel names.
    pub fn universal_id(&self) -> String {
        format!("{}:{}:{}", self.peer, self.space_type, self.id)
    }
}

/// Common surface of all storages.
pub trait Storage: Send + Sync {
    fn storage_type(&self) -> StorageType;

    fn options(&self) -> &StorageOptions;

    fn connection(&self) -> &dyn Connection;
}

/// A storage of any domain.
#[derive(Clone)]
pub enum AnyStorage {
    Doc(Arc<dyn DocStorage>),
    Blob(Arc<dyn BlobStorage>),
    Sync(Arc<dyn SyncStorage>),
    Awareness(Arc<dyn AwarenessStorage>),
}

impl AnyStorage {
    pub fn storage_type(&self) -> StorageType {
        match self {
            AnyStorage::Doc(_) => StorageType::Doc,
            AnyStorage::Blob(_) => StorageType::Blob,
            AnyStorage::Sync(_) => StorageType::Sync,
            AnyStorage::Awareness(_) => StorageType::Awareness,
        }
    }

    pub fn connection(&self) -> &dyn Connection {
        match self {
            AnyStorage::Doc(s) => s.connection(),
            AnyStorage::Blob(s) => s.connection(),
            AnyStorage::Sync(s) => s.connection(),
            AnyStorage::Awareness(s) => s.connection(),
        }
    }

    pub fn options(&self) -> &StorageOptions {
        match self {
            AnyStorage::Doc(s) => s.options(),
            AnyStorage::Blob(s) => s.options(),
            AnyStorage::Sync(s) => s.options(),
            AnyStorage::Awareness(s) => s.options(),
        }
    }
}

impl fmt::Debug for AnyStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyStorage")
            .field("type", &self.storage_type())
            .field("id", &self.options().universal_id())
            .finish()
    }
}

/// Resources one engine instance owns and hands to the storages it creates.
///
/// Nothing here is global: two contexts built with [`StoreContext::new`] share
/// nothing, while [`StoreContext::sibling`] behaves like a second tab of the
/// same browser (same databases and broadcast channels, separate sockets).
#[derive(Clone)]
pub struct StoreContext {
    pub config: Arc<StoreConfig>,
    pub channels: ChannelHub,
    pub databases: Arc<LocalDatabases>,
    pub pool: Arc<ConnectionPool>,
    pub merger: Arc<dyn UpdateMerger>,
}

impl StoreContext {
    pub fn new(config: StoreConfig) -> Self {
        let config = Arc::new(config);
        Self {
            channels: ChannelHub::new(config.channel_capacity),
            databases: Arc::new(LocalDatabases::new(config.clone())),
            pool: Arc::new(ConnectionPool::new(config.retry.clone())),
            merger: Arc::new(YrsMerger),
            config,
        }
    }

    /// A second tab: same channels and databases, its own connection pool.
    pub fn sibling(&self) -> Self {
        Self {
            config: self.config.clone(),
            channels: self.channels.clone(),
            databases: self.databases.clone(),
            pool: Arc::new(ConnectionPool::new(self.config.retry.clone())),
            merger: self.merger.clone(),
        }
    }

    pub fn with_merger(mut self, merger: Arc<dyn UpdateMerger>) -> Self {
        self.merger = merger;
        self
    }
}
