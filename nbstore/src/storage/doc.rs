//! Document storage contract and the snapshot/update reconciliation shared
//! by every backend.
//!
//! Durable state per document is one snapshot plus a log of updates not yet
//! folded into it. Reads fold the log lazily:
//!
//! ```text
//! get_doc(id)
//!   snapshot ─┐
//!   update 1 ─┼─ squash ─► set_doc_snapshot(new, prev) ─► mark_updates_merged
//!   update n ─┘
//! ```
//!
//! Snapshot writes race across tabs; the backend keeps whichever snapshot has
//! the strictly greater timestamp.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::merge::UpdateMerger;
use super::{Storage, Timestamp};
use crate::error::Result;
use crate::event::Subscription;

/// A materialized document state or one logged update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRecord {
    pub doc_id: String,
    pub bin: Vec<u8>,
    pub timestamp: Timestamp,
    pub editor: Option<String>,
}

/// An update handed to [`DocStorage::push_doc_update`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocUpdate {
    pub doc_id: String,
    pub bin: Vec<u8>,
    pub editor: Option<String>,
    /// Set when replaying an update that already has a clock (sync pulls).
    /// The storage issues one when absent.
    pub timestamp: Option<Timestamp>,
}

impl DocUpdate {
    pub fn new(doc_id: impl Into<String>, bin: Vec<u8>) -> Self {
        Self {
            doc_id: doc_id.into(),
            bin,
            editor: None,
            timestamp: None,
        }
    }

    pub fn with_editor(mut self, editor: impl Into<String>) -> Self {
        self.editor = Some(editor.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocClock {
    pub doc_id: String,
    pub timestamp: Timestamp,
}

impl DocClock {
    pub fn new(doc_id: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            doc_id: doc_id.into(),
            timestamp,
        }
    }
}

/// `doc_id -> timestamp`
pub type DocClocks = HashMap<String, Timestamp>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocDiff {
    pub doc_id: String,
    /// Update carrying what the caller's state vector lacks
    pub missing: Vec<u8>,
    /// State vector of the stored document
    pub state: Vec<u8>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocUpdateEvent {
    pub update: DocRecord,
    pub origin: Option<String>,
}

pub type DocUpdateListener = Box<dyn Fn(&DocUpdateEvent) + Send + Sync>;

/// Fold records into one: merged bytes, greatest timestamp, last editor.
///
/// `records` must be non-empty and in log order.
pub fn squash_updates(merger: &dyn UpdateMerger, records: &[&DocRecord]) -> Result<DocRecord> {
    let bins: Vec<&[u8]> = records.iter().map(|r| r.bin.as_slice()).collect();
    let bin = merger.merge_updates(&bins)?;
    let timestamp = records.iter().map(|r| r.timestamp).max().unwrap_or_default();
    let last = records.last();
    Ok(DocRecord {
        doc_id: last.map(|r| r.doc_id.clone()).unwrap_or_default(),
        bin,
        timestamp,
        editor: last.and_then(|r| r.editor.clone()),
    })
}

#[async_trait]
pub trait DocStorage: Storage {
    fn merger(&self) -> &dyn UpdateMerger;

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>>;

    /// Replace the snapshot if `snapshot` is strictly newer than what is
    /// stored. Returns whether it was written.
    async fn set_doc_snapshot(&self, snapshot: DocRecord, prev: Option<&DocRecord>) -> Result<bool>;

    /// Logged updates not yet folded into the snapshot, oldest first.
    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocRecord>>;

    /// Drop logged updates that a snapshot now covers. Returns how many went.
    async fn mark_updates_merged(&self, doc_id: &str, updates: &[DocRecord]) -> Result<usize>;

    /// Append an update. A timestamped update no newer than the stored clock
    /// is ignored and the stored clock is returned.
    async fn push_doc_update(&self, update: DocUpdate, origin: Option<&str>) -> Result<DocClock>;

    async fn get_doc_timestamp(&self, doc_id: &str) -> Result<Option<DocClock>>;

    /// Clocks of all documents, or only those newer than `after`.
    async fn get_doc_timestamps(&self, after: Option<Timestamp>) -> Result<DocClocks>;

    async fn delete_doc(&self, doc_id: &str) -> Result<()>;

    /// Updates pushed through this storage or observed from other tabs or
    /// the server.
    fn subscribe_doc_update(&self, listener: DocUpdateListener) -> Subscription;

    /// Current document state, folding pending updates into the snapshot.
    async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>> {
        let snapshot = self.get_doc_snapshot(doc_id).await?;
        let updates = self.get_doc_updates(doc_id).await?;
        if updates.is_empty() {
            return Ok(snapshot);
        }

        let records: Vec<&DocRecord> = snapshot.iter().chain(updates.iter()).collect();
        let mut merged = squash_updates(self.merger(), &records)?;
        merged.doc_id = doc_id.to_string();

        self.set_doc_snapshot(merged.clone(), snapshot.as_ref()).await?;
        let removed = self.mark_updates_merged(doc_id, &updates).await?;
        log::debug!("Merged {removed} updates into snapshot of {doc_id}");
        Ok(Some(merged))
    }

    /// What a replica at `state_vector` lacks, plus the stored state vector.
    async fn get_doc_diff(&self, doc_id: &str, state_vector: Option<&[u8]>) -> Result<Option<DocDiff>> {
        let Some(doc) = self.get_doc(doc_id).await? else {
            return Ok(None);
        };
        let missing = self.merger().diff(&doc.bin, state_vector)?;
        let state = self.merger().state_vector(&doc.bin)?;
        Ok(Some(DocDiff {
            doc_id: doc_id.to_string(),
            missing,
            state,
            timestamp: doc.timestamp,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::merge_fixtures::{append_text, doc_with_text, text_of};
    use crate::storage::YrsMerger;

    fn record(doc_id: &str, bin: Vec<u8>, timestamp: Timestamp, editor: Option<&str>) -> DocRecord {
        DocRecord {
            doc_id: doc_id.into(),
            bin,
            timestamp,
            editor: editor.map(String::from),
        }
    }

    #[test]
    fn test_squash_takes_max_timestamp_and_last_editor() {
        let (doc, first) = doc_with_text("a");
        let second = append_text(&doc, "b");
        let third = append_text(&doc, "c");

        let records = [
            record("d", first, 10, Some("alice")),
            record("d", second, 30, None),
            record("d", third, 20, Some("bob")),
        ];
        let refs: Vec<&DocRecord> = records.iter().collect();
        let squashed = squash_updates(&YrsMerger, &refs).unwrap();

        assert_eq!(squashed.timestamp, 30);
        assert_eq!(squashed.editor.as_deref(), Some("bob"));
        assert_eq!(text_of(&squashed.bin), "abc");
    }

    #[test]
    fn test_update_builders() {
        let update = DocUpdate::new("doc", vec![1]).with_editor("me").with_timestamp(5);
        assert_eq!(update.timestamp, Some(5));
        assert_eq!(update.editor.as_deref(), Some("me"));
    }
}
