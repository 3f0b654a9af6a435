use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::{BlobRecord, BlobStorage};

/// Blobs are fetched lazily from remotes and written through to all of them.
pub struct BlobSync {
    local: Arc<dyn BlobStorage>,
    remotes: Vec<(String, Arc<dyn BlobStorage>)>,
}

impl BlobSync {
    pub fn new(local: Arc<dyn BlobStorage>, remotes: Vec<(String, Arc<dyn BlobStorage>)>) -> Self {
        Self { local, remotes }
    }

    /// Local copy first, then each remote in order. A blob found remotely is
    /// cached locally.
    pub async fn download_blob(&self, key: &str) -> Result<Option<BlobRecord>> {
        if let Some(blob) = self.local.get_blob(key).await? {
            return Ok(Some(blob));
        }

        for (peer, remote) in &self.remotes {
            match remote.get_blob(key).await {
                Ok(Some(blob)) => {
                    if let Err(e) = self.local.set_blob(blob.clone()).await {
                        log::warn!("Could not cache blob {key} from {peer}: {e}");
                    }
                    return Ok(Some(blob));
                }
                Ok(None) => {}
                Err(e) => log::warn!("Downloading blob {key} from {peer} failed: {e}"),
            }
        }
        Ok(None)
    }

    /// Write locally, then to every remote. Remote failures are logged; the
    /// next [`BlobSync::sync_once`] retries them.
    pub async fn upload_blob(&self, blob: BlobRecord) -> Result<()> {
        self.local.set_blob(blob.clone()).await?;
        for (peer, remote) in &self.remotes {
            if let Err(e) = remote.set_blob(blob.clone()).await {
                log::warn!("Uploading blob {} to {peer} failed: {e}", blob.key);
            }
        }
        Ok(())
    }

    /// Copy blobs missing on either side. Returns how many were copied.
    pub async fn sync_once(&self) -> Result<usize> {
        let local_keys: HashSet<String> = self.local.list_blobs().await?.into_iter().map(|b| b.key).collect();
        let mut copied = 0;

        for (peer, remote) in &self.remotes {
            let remote_keys: HashSet<String> = match remote.list_blobs().await {
                Ok(listed) => listed.into_iter().map(|b| b.key).collect(),
                Err(e) => {
                    log::warn!("Listing blobs of {peer} failed: {e}");
                    continue;
                }
            };

            for key in local_keys.difference(&remote_keys) {
                if let Some(blob) = self.local.get_blob(key).await? {
                    match remote.set_blob(blob).await {
                        Ok(()) => copied += 1,
                        Err(e) => log::warn!("Uploading blob {key} to {peer} failed: {e}"),
                    }
                }
            }
            for key in remote_keys.difference(&local_keys) {
                match remote.get_blob(key).await {
                    Ok(Some(blob)) => {
                        self.local.set_blob(blob).await?;
                        copied += 1;
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("Downloading blob {key} from {peer} failed: {e}"),
                }
            }
        }

        if copied > 0 {
            log::info!("Blob sync copied {copied} blobs");
        }
        Ok(copied)
    }
}
