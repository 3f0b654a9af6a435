//! Reconnecting resource lifecycle shared by every backend.
//!
//! ```text
//!            connect()                do_connect ok
//!   Idle ───────────────► Connecting ───────────────► Connected
//!                            ▲   │                       │
//!              backoff timer │   │ do_connect err        │ fail(err)
//!                            │   ▼                       │
//!                           Error ◄──────────────────────┘
//!
//!   any ── disconnect() / close(err) / non-retryable err ──► Closed
//! ```
//!
//! A connector only knows how to produce and release its resource. Status
//! bookkeeping, retries and waiter wake-ups live in
//! [`AutoReconnectConnection`]. Status listeners run synchronously inside the
//! call that changes the status, in registration order, and transitions of
//! one connection never interleave.

mod shared;

pub use shared::{ConnectionPool, SharedConnection};

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::event::{Emitter, Subscription};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Closed,
    Error,
}

/// Status listener: `(new_status, error)`.
pub type StatusListener = Box<dyn Fn(ConnectionStatus, Option<&Error>) + Send + Sync>;

/// The connection surface storages expose to their callers.
#[async_trait]
pub trait Connection: Send + Sync {
    fn status(&self) -> ConnectionStatus;

    fn last_error(&self) -> Option<Error>;

    /// Ensure the resource exists or is being created. Never fails; failures
    /// show up as status changes.
    fn connect(&self);

    /// Release the resource and stop retrying.
    fn disconnect(&self);

    /// Suspend until the status is `Connected`.
    ///
    /// Fails with [`Error::Aborted`] when `signal` fires (immediately if it
    /// already has) and with the last error once the connection is `Closed`.
    async fn wait_for_connected(&self, signal: Option<&CancellationToken>) -> Result<()>;

    fn on_status_changed(&self, listener: StatusListener) -> Subscription;
}

/// Produces and releases the resource behind a connection.
#[async_trait]
pub trait Connector: Sized + Send + Sync + 'static {
    type Inner: Clone + Send + Sync + 'static;

    /// Connections with equal share ids may share one physical resource.
    fn share_id(&self) -> String;

    async fn do_connect(&self, handle: ConnectionHandle<Self>) -> Result<Self::Inner>;

    fn do_disconnect(&self, inner: Self::Inner);
}

#[derive(Debug, Clone)]
struct StatusEvent {
    status: ConnectionStatus,
    error: Option<Error>,
}

struct State<T> {
    status: ConnectionStatus,
    error: Option<Error>,
    inner: Option<T>,
    /// Bumped by every attempt and every disconnect; stale attempts compare
    /// against it and discard their result.
    generation: u64,
    /// Consecutive failures since the last successful connect
    failures: u32,
    /// Cancels the in-flight or scheduled attempt
    pending: Option<CancellationToken>,
}

struct Core<C: Connector> {
    connector: C,
    retry: RetryPolicy,
    state: Mutex<State<C::Inner>>,
    order: ReentrantMutex<()>,
    listeners: Emitter<StatusEvent>,
    watch_tx: watch::Sender<StatusEvent>,
}

impl<C: Connector> Core<C> {
    fn notify(&self, status: ConnectionStatus, error: Option<Error>) {
        let event = StatusEvent { status, error };
        // listeners first, so waiters wake to a fully attached connection
        self.listeners.emit(&event);
        self.watch_tx.send_replace(event);
    }

    /// Start an attempt now (`delay == None`) or after `delay`.
    ///
    /// Without `force`, does nothing while an attempt is already pending or
    /// the connection is up.
    fn start_attempt(self: &Arc<Self>, delay: Option<Duration>, force: bool) {
        let _order = self.order.lock();
        let (generation, token) = {
            let mut state = self.state.lock();
            let busy = matches!(
                state.status,
                ConnectionStatus::Connecting | ConnectionStatus::Connected
            ) || state.pending.is_some();
            if busy && !force {
                return;
            }
            if let Some(old) = state.pending.take() {
                old.cancel();
            }
            state.generation += 1;
            let token = CancellationToken::new();
            state.pending = Some(token.clone());
            if delay.is_none() {
                state.status = ConnectionStatus::Connecting;
                state.error = None;
            }
            (state.generation, token)
        };

        if delay.is_none() {
            self.notify(ConnectionStatus::Connecting, None);
        }

        let core = self.clone();
        tokio::spawn(async move {
            core.run_attempt(generation, token, delay).await;
        });
    }

    async fn run_attempt(
        self: Arc<Self>,
        generation: u64,
        token: CancellationToken,
        delay: Option<Duration>,
    ) {
        if let Some(delay) = delay {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if !self.enter_connecting(generation) {
                return;
            }
        }

        let handle = ConnectionHandle {
            core: Arc::downgrade(&self),
            generation,
        };
        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = self.connector.do_connect(handle) => result,
        };

        match result {
            Ok(inner) => self.finish_connect(generation, &token, inner),
            Err(error) => self.terminate(Some(generation), error, true),
        }
    }

    fn enter_connecting(&self, generation: u64) -> bool {
        let _order = self.order.lock();
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            state.status = ConnectionStatus::Connecting;
            state.error = None;
        }
        self.notify(ConnectionStatus::Connecting, None);
        true
    }

    fn finish_connect(&self, generation: u64, token: &CancellationToken, inner: C::Inner) {
        let order = self.order.lock();
        let stale = {
            let mut state = self.state.lock();
            if state.generation != generation || token.is_cancelled() {
                true
            } else {
                state.inner = Some(inner.clone());
                state.pending = None;
                state.failures = 0;
                state.status = ConnectionStatus::Connected;
                state.error = None;
                false
            }
        };
        if stale {
            drop(order);
            self.connector.do_disconnect(inner);
            return;
        }
        log::debug!("Connection {} established", self.connector.share_id());
        self.notify(ConnectionStatus::Connected, None);
    }

    /// Tear the resource down after a failure.
    ///
    /// `generation == None` targets whatever is current. Retryable errors
    /// schedule the next attempt when `allow_retry` is set; everything else
    /// ends in `Closed`.
    fn terminate(self: &Arc<Self>, generation: Option<u64>, error: Error, allow_retry: bool) {
        let retry = allow_retry && error.is_retryable();
        let status = if retry {
            ConnectionStatus::Error
        } else {
            ConnectionStatus::Closed
        };

        let _order = self.order.lock();
        let (inner, failures) = {
            let mut state = self.state.lock();
            if generation.is_some_and(|g| g != state.generation) {
                return;
            }
            if let Some(token) = state.pending.take() {
                token.cancel();
            }
            state.generation += 1;
            state.failures = state.failures.saturating_add(1);
            state.status = status;
            state.error = Some(error.clone());
            (state.inner.take(), state.failures)
        };

        if let Some(inner) = inner {
            self.connector.do_disconnect(inner);
        }

        if retry {
            let delay = self.retry.delay(failures - 1);
            log::warn!(
                "Connection {} failed (attempt {failures}), retrying in {delay:?}: {error}",
                self.connector.share_id()
            );
            self.start_attempt(Some(delay), true);
        } else {
            log::warn!("Connection {} closed: {error}", self.connector.share_id());
        }

        self.notify(status, Some(error));
    }

    fn shutdown(&self) {
        let _order = self.order.lock();
        let (inner, previous) = {
            let mut state = self.state.lock();
            if let Some(token) = state.pending.take() {
                token.cancel();
            }
            state.generation += 1;
            state.failures = 0;
            let previous = state.status;
            if previous != ConnectionStatus::Idle {
                state.status = ConnectionStatus::Closed;
                state.error = None;
            }
            (state.inner.take(), previous)
        };

        if let Some(inner) = inner {
            self.connector.do_disconnect(inner);
        }
        if !matches!(previous, ConnectionStatus::Idle | ConnectionStatus::Closed) {
            self.notify(ConnectionStatus::Closed, None);
        }
    }
}

/// Per-attempt handle given to [`Connector::do_connect`].
///
/// Lets the resource report its own death after the connect succeeded.
/// Calls from a superseded attempt are ignored.
pub struct ConnectionHandle<C: Connector> {
    core: Weak<Core<C>>,
    generation: u64,
}

impl<C: Connector> ConnectionHandle<C> {
    /// Report a failure; retryable errors trigger a reconnect.
    pub fn fail(&self, error: Error) {
        if let Some(core) = self.core.upgrade() {
            core.terminate(Some(self.generation), error, true);
        }
    }

    /// Close for good; no reconnect is scheduled.
    pub fn close(&self, error: Error) {
        if let Some(core) = self.core.upgrade() {
            core.terminate(Some(self.generation), error, false);
        }
    }

    pub fn is_current(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.state.lock().generation == self.generation)
    }
}

impl<C: Connector> Clone for ConnectionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            generation: self.generation,
        }
    }
}

/// A connection that reconnects with backoff after failures.
pub struct AutoReconnectConnection<C: Connector> {
    core: Arc<Core<C>>,
}

impl<C: Connector> AutoReconnectConnection<C> {
    pub fn new(connector: C, retry: RetryPolicy) -> Self {
        let (watch_tx, _) = watch::channel(StatusEvent {
            status: ConnectionStatus::Idle,
            error: None,
        });
        Self {
            core: Arc::new(Core {
                connector,
                retry,
                state: Mutex::new(State {
                    status: ConnectionStatus::Idle,
                    error: None,
                    inner: None,
                    generation: 0,
                    failures: 0,
                    pending: None,
                }),
                order: ReentrantMutex::new(()),
                listeners: Emitter::new(),
                watch_tx,
            }),
        }
    }

    pub fn share_id(&self) -> String {
        self.core.connector.share_id()
    }

    pub fn connector(&self) -> &C {
        &self.core.connector
    }

    /// The live resource, if connected.
    pub fn inner(&self) -> Option<C::Inner> {
        self.core.state.lock().inner.clone()
    }

    /// The live resource, or [`Error::NotConnected`].
    pub fn require_inner(&self) -> Result<C::Inner> {
        self.inner().ok_or(Error::NotConnected)
    }

    /// Report a failure of the current resource from outside the connector.
    pub fn fail(&self, error: Error) {
        self.core.terminate(None, error, true);
    }

    /// Close with an error; no reconnect.
    pub fn close_with_error(&self, error: Error) {
        self.core.terminate(None, error, false);
    }
}

#[async_trait]
impl<C: Connector> Connection for AutoReconnectConnection<C> {
    fn status(&self) -> ConnectionStatus {
        self.core.state.lock().status
    }

    fn last_error(&self) -> Option<Error> {
        self.core.state.lock().error.clone()
    }

    fn connect(&self) {
        self.core.start_attempt(None, false);
    }

    fn disconnect(&self) {
        self.core.shutdown();
    }

    async fn wait_for_connected(&self, signal: Option<&CancellationToken>) -> Result<()> {
        if signal.is_some_and(|s| s.is_cancelled()) {
            return Err(Error::Aborted);
        }

        let mut rx = self.core.watch_tx.subscribe();
        loop {
            {
                let event = rx.borrow_and_update();
                match event.status {
                    ConnectionStatus::Connected => return Ok(()),
                    ConnectionStatus::Closed => {
                        return Err(event.error.clone().unwrap_or(Error::ConnectionClosed));
                    }
                    _ => {}
                }
            }

            let changed = match signal {
                Some(signal) => tokio::select! {
                    _ = signal.cancelled() => return Err(Error::Aborted),
                    changed = rx.changed() => changed,
                },
                None => rx.changed().await,
            };
            if changed.is_err() {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    fn on_status_changed(&self, listener: StatusListener) -> Subscription {
        self.core
            .listeners
            .subscribe(move |event: &StatusEvent| listener(event.status, event.error.as_ref()))
    }
}

impl<C: Connector> Drop for AutoReconnectConnection<C> {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}
