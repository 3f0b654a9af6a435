//! Durable on-device backend.
//!
//! All local storages of one space share one [`LocalConnection`]: a lease on
//! the space's database plus a port on the paired `idb:<name>` channel that
//! carries doc updates between tabs.

mod blob;
mod db;
mod doc;
pub mod schema;
mod sync;
mod v1;

pub use blob::LocalBlobStorage;
pub use db::{DbLease, LocalDatabases, LocalDb, VersionChangeCallback};
pub use doc::LocalDocStorage;
pub use sync::LocalSyncStorage;
pub use v1::{LocalV1BlobStorage, LocalV1DocStorage};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::channel::{BroadcastChannel, ChannelHub};
use crate::connection::{ConnectionHandle, Connector, SharedConnection};
use crate::error::{Error, Result};
use crate::event::{Emitter, Subscription};
use crate::storage::{DocUpdateEvent, StorageOptions, StoreContext};
use schema::DbSchema;

pub type LocalConnection = SharedConnection<LocalConnector>;

/// Messages exchanged between tabs on the `idb:` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum TabMessage {
    DocUpdate(DocUpdateEvent),
}

impl TabMessage {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let (message, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(message)
    }
}

/// The live resource of a local connection.
pub struct LocalHandle {
    lease: DbLease,
    channel: BroadcastChannel,
    _relay: Subscription,
}

impl LocalHandle {
    pub fn db(&self) -> &LocalDb {
        self.lease.db()
    }

    fn post(&self, message: &TabMessage) {
        match message.encode() {
            Ok(bytes) => {
                self.channel.post(bytes);
            }
            Err(e) => log::warn!("Failed to encode tab message: {e}"),
        }
    }
}

pub struct LocalConnector {
    ctx: StoreContext,
    name: String,
    schema: &'static DbSchema,
    version: u32,
    /// Doc updates of this tab and the ones relayed from other tabs
    doc_updates: Arc<Emitter<DocUpdateEvent>>,
}

impl LocalConnector {
    pub fn new(ctx: &StoreContext, name: String, schema: &'static DbSchema, version: u32) -> Self {
        Self {
            ctx: ctx.clone(),
            name,
            schema,
            version,
            doc_updates: Arc::new(Emitter::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn doc_updates(&self) -> &Emitter<DocUpdateEvent> {
        &self.doc_updates
    }
}

#[async_trait]
impl Connector for LocalConnector {
    type Inner = Arc<LocalHandle>;

    fn share_id(&self) -> String {
        format!("local({}):{}", self.version, self.name)
    }

    async fn do_connect(&self, handle: ConnectionHandle<Self>) -> Result<Arc<LocalHandle>> {
        let on_version_change = Arc::new(move || handle.close(Error::VersionChange));
        let lease = self
            .ctx
            .databases
            .open(&self.name, self.schema, self.version, on_version_change)?;

        let channel = self.ctx.channels.open(format!("idb:{}", self.name));
        let updates = self.doc_updates.clone();
        let relay = channel.on_message(move |bytes| match TabMessage::decode(bytes) {
            Ok(TabMessage::DocUpdate(event)) => {
                updates.emit(&event);
            }
            Err(e) => log::warn!("Dropping malformed tab message: {e}"),
        });

        Ok(Arc::new(LocalHandle {
            lease,
            channel,
            _relay: relay,
        }))
    }

    fn do_disconnect(&self, inner: Arc<LocalHandle>) {
        log::debug!("Releasing local database {}", self.name);
        drop(inner);
    }
}

/// Shared connection to the current-layout database of `options`' space.
fn connect_current(options: &StorageOptions, ctx: &StoreContext, version: u32) -> LocalConnection {
    ctx.pool.share(LocalConnector::new(
        ctx,
        options.universal_id(),
        &schema::CURRENT,
        version,
    ))
}

/// Shared connection to the legacy-layout database of `options`' space.
fn connect_legacy(options: &StorageOptions, ctx: &StoreContext) -> LocalConnection {
    ctx.pool.share(LocalConnector::new(
        ctx,
        format!("v1:{}", options.universal_id()),
        &schema::LEGACY,
        schema::LEGACY.version,
    ))
}
