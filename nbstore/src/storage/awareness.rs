//! Ephemeral presence.
//!
//! Awareness is never persisted. A subscriber that joins late asks the others
//! to re-send their state with a *collect* request; each subscriber answers
//! through its `on_collect` handler.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::Storage;
use crate::error::Result;
use crate::event::Subscription;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessRecord {
    pub doc_id: String,
    pub bin: Vec<u8>,
}

/// What a remote awareness subscriber observes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessEvent {
    Update {
        awareness: AwarenessRecord,
        origin: Option<String>,
    },
    Collect {
        collect_id: String,
    },
}

pub type AwarenessUpdateListener = Box<dyn Fn(&AwarenessRecord, Option<&str>) + Send + Sync>;

/// Produces this subscriber's current state when someone collects.
pub type CollectHandler = Arc<dyn Fn() -> BoxFuture<'static, Option<AwarenessRecord>> + Send + Sync>;

#[async_trait]
pub trait AwarenessStorage: Storage {
    async fn update(&self, record: AwarenessRecord, origin: Option<&str>) -> Result<()>;

    fn subscribe_update(
        &self,
        doc_id: &str,
        on_update: AwarenessUpdateListener,
        on_collect: CollectHandler,
    ) -> Subscription;
}
