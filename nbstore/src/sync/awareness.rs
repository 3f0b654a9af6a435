use std::sync::Arc;

use crate::error::Result;
use crate::event::Subscription;
use crate::storage::{AwarenessRecord, AwarenessStorage, AwarenessUpdateListener, CollectHandler};

/// Fans awareness out to the local storage and every remote.
pub struct AwarenessSync {
    local: Arc<dyn AwarenessStorage>,
    remotes: Vec<Arc<dyn AwarenessStorage>>,
}

impl AwarenessSync {
    pub fn new(local: Arc<dyn AwarenessStorage>, remotes: Vec<Arc<dyn AwarenessStorage>>) -> Self {
        Self { local, remotes }
    }

    /// Only a local failure is returned; remotes are best effort.
    pub async fn update(&self, record: AwarenessRecord, origin: Option<&str>) -> Result<()> {
        let remotes = self.remotes.iter().map(|remote| {
            let record = record.clone();
            async move {
                if let Err(e) = remote.update(record, origin).await {
                    log::debug!("Remote awareness update for {} failed: {e}", remote.options().peer);
                }
            }
        });
        let (local, _) = futures_util::future::join(
            self.local.update(record.clone(), origin),
            futures_util::future::join_all(remotes),
        )
        .await;
        local
    }

    pub fn subscribe_update(
        &self,
        doc_id: &str,
        on_update: AwarenessUpdateListener,
        on_collect: CollectHandler,
    ) -> Subscription {
        let on_update = Arc::new(on_update);
        let subscriptions = std::iter::once(&self.local)
            .chain(self.remotes.iter())
            .map(|storage| {
                let on_update = on_update.clone();
                storage.subscribe_update(
                    doc_id,
                    Box::new(move |record: &AwarenessRecord, origin: Option<&str>| on_update(record, origin)),
                    on_collect.clone(),
                )
            })
            .collect();
        Subscription::merge(subscriptions)
    }
}
