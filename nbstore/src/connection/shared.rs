//! Reference-counted sharing of physical connections.
//!
//! Storages whose connectors report the same share id end up on one
//! [`AutoReconnectConnection`]. The physical resource is released when the
//! last consumer disconnects.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{AutoReconnectConnection, Connection, ConnectionStatus, Connector, StatusListener};
use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::event::Subscription;

struct SharedEntry<C: Connector> {
    connection: AutoReconnectConnection<C>,
    consumers: Mutex<usize>,
}

/// Share-id keyed table of live connections.
///
/// One pool stands for one process; an engine that should not share its
/// sockets with another gets its own pool.
pub struct ConnectionPool {
    entries: Mutex<HashMap<String, Weak<dyn Any + Send + Sync>>>,
    retry: RetryPolicy,
}

impl ConnectionPool {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retry,
        }
    }

    /// Get a consumer handle on the connection for `connector`'s share id,
    /// creating the connection if nobody holds it.
    pub fn share<C: Connector>(&self, connector: C) -> SharedConnection<C> {
        let id = connector.share_id();
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(&id).and_then(Weak::upgrade) {
            match existing.downcast::<SharedEntry<C>>() {
                Ok(entry) => return SharedConnection::new(entry),
                Err(_) => {
                    log::warn!("Share id {id} is held by a different connection kind, not sharing")
                }
            }
        }

        let entry = Arc::new(SharedEntry {
            connection: AutoReconnectConnection::new(connector, self.retry.clone()),
            consumers: Mutex::new(0),
        });
        let erased: Arc<dyn Any + Send + Sync> = entry.clone();
        entries.insert(id, Arc::downgrade(&erased));
        entries.retain(|_, weak| weak.strong_count() > 0);
        SharedConnection::new(entry)
    }

    /// Number of connections still alive in the pool.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

/// One consumer's view of a pooled connection.
pub struct SharedConnection<C: Connector> {
    entry: Arc<SharedEntry<C>>,
    acquired: AtomicBool,
}

impl<C: Connector> SharedConnection<C> {
    fn new(entry: Arc<SharedEntry<C>>) -> Self {
        Self {
            entry,
            acquired: AtomicBool::new(false),
        }
    }

    pub fn share_id(&self) -> String {
        self.entry.connection.share_id()
    }

    pub fn connector(&self) -> &C {
        self.entry.connection.connector()
    }

    pub fn inner(&self) -> Option<C::Inner> {
        self.entry.connection.inner()
    }

    pub fn require_inner(&self) -> Result<C::Inner> {
        self.entry.connection.require_inner()
    }

    pub fn fail(&self, error: Error) {
        self.entry.connection.fail(error);
    }

    pub fn close_with_error(&self, error: Error) {
        self.entry.connection.close_with_error(error);
    }

    /// Whether two handles point at the same physical connection.
    pub fn same_connection(&self, other: &SharedConnection<C>) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }

    /// Number of consumers that currently hold the connection open.
    pub fn consumer_count(&self) -> usize {
        *self.entry.consumers.lock()
    }
}

#[async_trait]
impl<C: Connector> Connection for SharedConnection<C> {
    fn status(&self) -> ConnectionStatus {
        self.entry.connection.status()
    }

    fn last_error(&self) -> Option<Error> {
        self.entry.connection.last_error()
    }

    fn connect(&self) {
        let mut consumers = self.entry.consumers.lock();
        if !self.acquired.swap(true, Ordering::SeqCst) {
            *consumers += 1;
        }
        self.entry.connection.connect();
    }

    fn disconnect(&self) {
        if !self.acquired.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut consumers = self.entry.consumers.lock();
        *consumers = consumers.saturating_sub(1);
        if *consumers == 0 {
            self.entry.connection.disconnect();
        }
    }

    async fn wait_for_connected(&self, signal: Option<&CancellationToken>) -> Result<()> {
        self.entry.connection.wait_for_connected(signal).await
    }

    fn on_status_changed(&self, listener: StatusListener) -> Subscription {
        self.entry.connection.on_status_changed(listener)
    }
}

impl<C: Connector> Drop for SharedConnection<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
