//! Clock-driven document replication between the local peer and remotes.
//!
//! Per remote peer, three clock tables in the local [`SyncStorage`] record
//! how far replication got:
//!
//! ```text
//! local clock  > pushed clock        → push local doc to remote
//! remote clock > pulled remote clock → pull remote diff into local
//! remote clock                       → last clock the remote reported
//! ```
//!
//! Documents with a priority are handled first.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::event::{Emitter, Subscription};
use crate::storage::{DocClock, DocClocks, DocStorage, DocUpdate, DocUpdateEvent, SyncStorage, Timestamp};

/// Origin attached to updates written by replication.
pub const SYNC_ORIGIN_PREFIX: &str = "sync:";

/// Overall replication progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocSyncState {
    /// Documents known on either side
    pub total: usize,
    /// Documents with work left
    pub syncing: usize,
    /// No work left and no errors
    pub synced: bool,
    /// At least one document failed and will be retried next round
    pub retrying: bool,
    pub error_message: Option<String>,
}

/// Replication progress of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocSyncDocState {
    pub synced: bool,
    pub syncing: bool,
    pub retrying: bool,
    pub error_message: Option<String>,
}

/// One remote peer's doc storage.
#[derive(Clone)]
pub struct DocSyncPeer {
    pub peer: String,
    pub remote: Arc<dyn DocStorage>,
}

#[derive(Debug, Default)]
struct Progress {
    known: BTreeSet<String>,
    pending: BTreeSet<String>,
    /// Per-document failures of the last attempt
    errors: HashMap<String, String>,
    /// Failures that stopped a whole peer or round
    peer_errors: HashMap<String, String>,
    rounds: u64,
}

impl Progress {
    fn state(&self) -> DocSyncState {
        let error_message = self
            .peer_errors
            .values()
            .chain(self.errors.values())
            .next()
            .cloned();
        DocSyncState {
            total: self.known.len(),
            syncing: self.pending.len(),
            synced: self.rounds > 0 && self.pending.is_empty() && error_message.is_none(),
            retrying: error_message.is_some(),
            error_message,
        }
    }

    fn doc_state(&self, doc_id: &str) -> DocSyncDocState {
        let error_message = self.errors.get(doc_id).cloned();
        let syncing = self.pending.contains(doc_id);
        DocSyncDocState {
            synced: self.rounds > 0 && !syncing && error_message.is_none(),
            syncing,
            retrying: error_message.is_some(),
            error_message,
        }
    }
}

/// What one round decided to do for a document.
#[derive(Debug, Clone, Copy, Default)]
struct DocPlan {
    local: Option<Timestamp>,
    pushed: Option<Timestamp>,
    remote: Option<Timestamp>,
    pulled: Option<Timestamp>,
}

impl DocPlan {
    fn needs_push(&self) -> bool {
        matches!((self.local, self.pushed), (Some(l), p) if p.is_none_or(|p| l > p))
    }

    fn needs_pull(&self) -> bool {
        matches!((self.remote, self.pulled), (Some(r), p) if p.is_none_or(|p| r > p))
    }
}

pub struct DocSync {
    local: Arc<dyn DocStorage>,
    sync: Arc<dyn SyncStorage>,
    peers: Vec<DocSyncPeer>,
    priorities: Arc<Mutex<HashMap<String, Vec<(u64, i32)>>>>,
    next_priority: Mutex<u64>,
    progress: Mutex<Progress>,
    state_changed: Emitter<DocSyncState>,
    wake: Arc<Notify>,
    interval: std::time::Duration,
}

impl DocSync {
    pub fn new(
        local: Arc<dyn DocStorage>,
        sync: Arc<dyn SyncStorage>,
        peers: Vec<DocSyncPeer>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            local,
            sync,
            peers,
            priorities: Arc::new(Mutex::new(HashMap::new())),
            next_priority: Mutex::new(0),
            progress: Mutex::new(Progress::default()),
            state_changed: Emitter::new(),
            wake: Arc::new(Notify::new()),
            interval: config.doc_sync_interval,
        }
    }

    pub fn peers(&self) -> &[DocSyncPeer] {
        &self.peers
    }

    pub fn state(&self) -> DocSyncState {
        self.progress.lock().state()
    }

    pub fn doc_state(&self, doc_id: &str) -> DocSyncDocState {
        self.progress.lock().doc_state(doc_id)
    }

    /// Called with the new state after every change.
    pub fn subscribe_state(&self, listener: impl Fn(&DocSyncState) + Send + Sync + 'static) -> Subscription {
        self.state_changed.subscribe(listener)
    }

    /// Handle `doc_id` before documents with a lower priority while the
    /// subscription is held.
    pub fn add_priority(&self, doc_id: &str, priority: i32) -> Subscription {
        let id = {
            let mut next = self.next_priority.lock();
            *next += 1;
            *next
        };
        self.priorities
            .lock()
            .entry(doc_id.to_string())
            .or_default()
            .push((id, priority));
        self.wake.notify_one();

        let priorities = Arc::downgrade(&self.priorities);
        let doc_id = doc_id.to_string();
        Subscription::new(move || {
            if let Some(priorities) = priorities.upgrade() {
                let mut priorities = priorities.lock();
                if let Some(entries) = priorities.get_mut(&doc_id) {
                    entries.retain(|(eid, _)| *eid != id);
                    if entries.is_empty() {
                        priorities.remove(&doc_id);
                    }
                }
            }
        })
    }

    fn priority_of(&self, doc_id: &str) -> i32 {
        self.priorities
            .lock()
            .get(doc_id)
            .and_then(|entries| entries.iter().map(|(_, p)| *p).max())
            .unwrap_or(0)
    }

    /// Start the next round now instead of after the interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    fn update_progress(&self, change: impl FnOnce(&mut Progress)) {
        let state = {
            let mut progress = self.progress.lock();
            change(&mut progress);
            progress.state()
        };
        self.state_changed.emit(&state);
    }

    /// One replication round against every peer.
    pub async fn sync_once(&self) -> Result<()> {
        let local_clocks = self.local.get_doc_timestamps(None).await?;
        self.update_progress(|p| {
            p.peer_errors.remove("local");
        });
        for peer in &self.peers {
            self.sync_peer(peer, &local_clocks).await?;
        }
        self.update_progress(|p| p.rounds += 1);
        Ok(())
    }

    async fn sync_peer(&self, peer: &DocSyncPeer, local_clocks: &DocClocks) -> Result<()> {
        let remote_clocks = match peer.remote.get_doc_timestamps(None).await {
            Ok(clocks) => clocks,
            Err(e) => {
                log::warn!("Could not list docs of peer {}: {e}", peer.peer);
                self.update_progress(|p| {
                    p.peer_errors.insert(peer.peer.clone(), e.to_string());
                });
                return Ok(());
            }
        };
        self.update_progress(|p| {
            p.peer_errors.remove(&peer.peer);
        });

        for (doc_id, timestamp) in &remote_clocks {
            self.sync
                .set_peer_remote_clock(&peer.peer, DocClock::new(doc_id.clone(), *timestamp))
                .await?;
        }
        let pushed = self.sync.get_peer_pushed_clocks(&peer.peer).await?;
        let pulled = self.sync.get_peer_pulled_remote_clocks(&peer.peer).await?;

        let mut plans: HashMap<String, DocPlan> = HashMap::new();
        for (doc_id, t) in local_clocks {
            plans.entry(doc_id.clone()).or_default().local = Some(*t);
        }
        for (doc_id, t) in &remote_clocks {
            plans.entry(doc_id.clone()).or_default().remote = Some(*t);
        }
        for (doc_id, plan) in plans.iter_mut() {
            plan.pushed = pushed.get(doc_id).copied();
            plan.pulled = pulled.get(doc_id).copied();
        }

        let mut order: Vec<(String, DocPlan)> = plans
            .into_iter()
            .filter(|(_, plan)| plan.needs_push() || plan.needs_pull())
            .collect();
        order.sort_by(|(a, _), (b, _)| self.priority_of(b).cmp(&self.priority_of(a)).then_with(|| a.cmp(b)));

        self.update_progress(|p| {
            p.known.extend(local_clocks.keys().cloned());
            p.known.extend(remote_clocks.keys().cloned());
            p.pending.extend(order.iter().map(|(id, _)| id.clone()));
        });

        for (doc_id, plan) in order {
            let result = self.sync_doc(peer, &doc_id, plan).await;
            self.update_progress(|p| {
                p.pending.remove(&doc_id);
                match &result {
                    Ok(()) => {
                        p.errors.remove(&doc_id);
                    }
                    Err(e) => {
                        p.errors.insert(doc_id.clone(), e.to_string());
                    }
                }
            });
            if let Err(e) = result {
                log::warn!("Syncing {doc_id} with {} failed: {e}", peer.peer);
            }
        }
        Ok(())
    }

    async fn sync_doc(&self, peer: &DocSyncPeer, doc_id: &str, plan: DocPlan) -> Result<()> {
        let origin = format!("{SYNC_ORIGIN_PREFIX}{}", peer.peer);
        // Newest local clock the remote is known to hold
        let mut on_remote = plan.pushed;

        if let (true, Some(local_clock)) = (plan.needs_push(), plan.local) {
            let mut pushed_clock = local_clock;
            if let Some(doc) = self.local.get_doc(doc_id).await? {
                pushed_clock = pushed_clock.max(doc.timestamp);
                peer.remote
                    .push_doc_update(DocUpdate::new(doc_id, doc.bin), Some(&origin))
                    .await?;
                log::debug!("Pushed {doc_id} to {}", peer.peer);
            }
            self.sync
                .set_peer_pushed_clock(&peer.peer, DocClock::new(doc_id, pushed_clock))
                .await?;
            on_remote = Some(pushed_clock);
        }

        if let (true, Some(remote_clock)) = (plan.needs_pull(), plan.remote) {
            let local_state = match self.local.get_doc(doc_id).await? {
                Some(doc) => Some(self.local.merger().state_vector(&doc.bin)?),
                None => None,
            };
            if let Some(diff) = peer.remote.get_doc_diff(doc_id, local_state.as_deref()).await? {
                let before = self.local.get_doc_timestamp(doc_id).await?.map(|c| c.timestamp);
                let clock = self
                    .local
                    .push_doc_update(DocUpdate::new(doc_id, diff.missing), Some(&origin))
                    .await?;
                // The pulled write is already on the remote, but a local edit
                // made since the push is not and must go out next round.
                let unpushed = before.is_some_and(|t| on_remote.is_none_or(|r| t > r));
                if unpushed {
                    log::debug!("{doc_id} changed locally during the pull from {}", peer.peer);
                } else {
                    self.sync.set_peer_pushed_clock(&peer.peer, clock).await?;
                }
                log::debug!("Pulled {doc_id} from {}", peer.peer);
            }
            self.sync
                .set_peer_pulled_remote_clock(&peer.peer, DocClock::new(doc_id, remote_clock))
                .await?;
        }
        Ok(())
    }

    /// Run rounds until `token` is cancelled. A round starts after the
    /// configured interval, or sooner when a storage reports an update.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let wake = self.wake.clone();
        let mut watchers = vec![self.local.subscribe_doc_update(Box::new({
            let wake = wake.clone();
            move |event: &DocUpdateEvent| {
                let from_sync = event
                    .origin
                    .as_deref()
                    .is_some_and(|o| o.starts_with(SYNC_ORIGIN_PREFIX));
                if !from_sync {
                    wake.notify_one();
                }
            }
        }))];
        for peer in &self.peers {
            let wake = wake.clone();
            watchers.push(peer.remote.subscribe_doc_update(Box::new(move |_| wake.notify_one())));
        }

        let this = self.clone();
        tokio::spawn(async move {
            let _watchers = watchers;
            log::info!("Doc sync started with {} peers", this.peers.len());
            loop {
                if let Err(e) = this.sync_once().await {
                    log::warn!("Doc sync round failed: {e}");
                    this.update_progress(|p| {
                        p.peer_errors.insert(String::from("local"), e.to_string());
                    });
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(this.interval) => {}
                    _ = wake.notified() => {}
                }
            }
            log::info!("Doc sync stopped");
        })
    }
}
