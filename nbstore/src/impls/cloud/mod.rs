//! Server-backed storages over one shared websocket per server.
//!
//! ```text
//! CloudDocStorage ───────┐
//! CloudBlobStorage ──────┼── SocketConnection (socket:<url>) ── SocketClient ── server
//! CloudAwarenessStorage ─┘
//! ```
//!
//! Requests are scoped by `(space type, space id)`; server pushes for other
//! spaces are ignored.

mod awareness;
mod blob;
mod doc;
pub mod protocol;
mod socket;

pub use awareness::CloudAwarenessStorage;
pub use blob::CloudBlobStorage;
pub use doc::{CloudDocConnection, CloudDocStorage};
pub use socket::{socket_url, SocketClient, SocketConnection, SocketConnector};

use crate::error::{Error, Result};
use crate::storage::{StorageOptions, StoreContext};

fn require_server(options: &StorageOptions) -> Result<&str> {
    options
        .server_base_url
        .as_deref()
        .ok_or_else(|| Error::InvalidOptions(format!("{} has no server base url", options.universal_id())))
}

fn share_socket(ctx: &StoreContext, server_base_url: &str) -> SocketConnection {
    ctx.pool.share(SocketConnector::new(server_base_url))
}
