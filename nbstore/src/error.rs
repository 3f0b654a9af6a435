//! Crate-wide error type.
//!
//! Errors are `Clone` because a connection keeps its last error and hands a
//! copy to every task waiting on it, and serializable because they cross the
//! worker boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage, connection and protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Error {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// LZ4 decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Document update bytes could not be merged or diffed
    #[error("Update merge failed: {0}")]
    Merge(String),

    /// Transport-level failure (socket, channel)
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection was closed while the caller was using it
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection has no live resource
    #[error("Not connected")]
    NotConnected,

    /// The caller's abort signal fired
    #[error("Operation aborted")]
    Aborted,

    /// Another tab holds the database at a different version (retryable)
    #[error("Blocked by other tabs.")]
    Blocked,

    /// A newer version wants the database; this holder must let go
    #[error("Blocking a new version. Closing the connection.")]
    VersionChange,

    /// On-disk schema is newer than this build understands (not retryable)
    #[error("Database version {found} is newer than supported version {supported}")]
    VersionConflict { found: u32, supported: u32 },

    /// The server rejected a request in its acknowledgement
    #[error("Remote error: {0}")]
    Remote(String),

    /// No implementation registered under this name
    #[error("Unknown storage implementation: {0}")]
    UnknownStorage(String),

    /// Storage options missing a field the backend needs
    #[error("Invalid storage options: {0}")]
    InvalidOptions(String),

    /// A doc id or peer name that cannot be stored
    #[error("Invalid id: {0}")]
    InvalidId(String),

    /// The storage only serves reads
    #[error("Read-only storage: {0}")]
    ReadOnly(String),

    /// The requested storage type is not configured for this peer
    #[error("Storage not found: {0}")]
    StorageNotFound(String),

    /// Worker op name not present in the catalog
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Worker used before `worker.init`
    #[error("Worker not initialized")]
    NotInitialized,

    /// Error reported by the other side of the worker boundary
    #[error("Worker error: {0}")]
    Worker(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the connection layer should retry after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::VersionChange | Error::VersionConflict { .. } | Error::Aborted
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(e: bincode::error::EncodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(e: bincode::error::DecodeError) -> Self {
        Error::Deserialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Serialization(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Error::ConnectionClosed,
            other => Error::Connection(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
