//! Per-peer sync bookkeeping.
//!
//! Three clock tables per remote peer:
//!
//! | table          | meaning                                            |
//! |----------------|----------------------------------------------------|
//! | `remote`       | latest clock the peer reported for a doc           |
//! | `pulled_remote`| remote clock of the last version pulled from it    |
//! | `pushed`       | local clock of the last version pushed to it       |
//!
//! Clocks only move forward; a write that is not newer is ignored.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DocClock, DocClocks, Storage};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockKind {
    Remote,
    PulledRemote,
    Pushed,
}

impl ClockKind {
    pub const ALL: [ClockKind; 3] = [ClockKind::Remote, ClockKind::PulledRemote, ClockKind::Pushed];
}

#[async_trait]
pub trait SyncStorage: Storage {
    async fn get_peer_clocks(&self, kind: ClockKind, peer: &str) -> Result<DocClocks>;

    async fn get_peer_clock(&self, kind: ClockKind, peer: &str, doc_id: &str) -> Result<Option<DocClock>>;

    async fn set_peer_clock(&self, kind: ClockKind, peer: &str, clock: DocClock) -> Result<()>;

    /// Forget every clock of every peer.
    async fn clear_clocks(&self) -> Result<()>;

    async fn get_peer_remote_clocks(&self, peer: &str) -> Result<DocClocks> {
        self.get_peer_clocks(ClockKind::Remote, peer).await
    }

    async fn get_peer_remote_clock(&self, peer: &str, doc_id: &str) -> Result<Option<DocClock>> {
        self.get_peer_clock(ClockKind::Remote, peer, doc_id).await
    }

    async fn set_peer_remote_clock(&self, peer: &str, clock: DocClock) -> Result<()> {
        self.set_peer_clock(ClockKind::Remote, peer, clock).await
    }

    async fn get_peer_pulled_remote_clocks(&self, peer: &str) -> Result<DocClocks> {
        self.get_peer_clocks(ClockKind::PulledRemote, peer).await
    }

    async fn get_peer_pulled_remote_clock(&self, peer: &str, doc_id: &str) -> Result<Option<DocClock>> {
        self.get_peer_clock(ClockKind::PulledRemote, peer, doc_id).await
    }

    async fn set_peer_pulled_remote_clock(&self, peer: &str, clock: DocClock) -> Result<()> {
        self.set_peer_clock(ClockKind::PulledRemote, peer, clock).await
    }

    async fn get_peer_pushed_clocks(&self, peer: &str) -> Result<DocClocks> {
        self.get_peer_clocks(ClockKind::Pushed, peer).await
    }

    async fn get_peer_pushed_clock(&self, peer: &str, doc_id: &str) -> Result<Option<DocClock>> {
        self.get_peer_clock(ClockKind::Pushed, peer, doc_id).await
    }

    async fn set_peer_pushed_clock(&self, peer: &str, clock: DocClock) -> Result<()> {
        self.set_peer_clock(ClockKind::Pushed, peer, clock).await
    }
}
