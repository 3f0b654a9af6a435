use std::sync::Arc;

use async_trait::async_trait;

use super::protocol::{
    decode_bin, encode_bin, BlobKey, Data, Empty, ListedRemoteBlob, RemoteBlob, SetBlob, SpaceBlobs, DELETE_BLOB,
    GET_BLOB, LIST_BLOBS, RELEASE_BLOBS, SET_BLOB,
};
use super::socket::{SocketClient, SocketConnection};
use super::{require_server, share_socket};
use crate::connection::Connection;
use crate::error::Result;
use crate::storage::{
    BlobRecord, BlobStorage, ListedBlobRecord, Storage, StorageOptions, StorageType, StoreContext,
};

/// Blobs kept by the server, addressed by space.
///
/// Every call is a request on the shared socket; nothing is cached here,
/// `BlobSync` keeps the local copy.
pub struct CloudBlobStorage {
    options: StorageOptions,
    socket: SocketConnection,
}

impl CloudBlobStorage {
    pub fn new(options: StorageOptions, ctx: &StoreContext) -> Result<Self> {
        let server = require_server(&options)?;
        let socket = share_socket(ctx, server);
        Ok(Self { options, socket })
    }

    fn client(&self) -> Result<Arc<SocketClient>> {
        self.socket.require_inner()
    }

    fn blob_key(&self, key: &str, permanently: bool) -> BlobKey {
        BlobKey {
            space_type: self.options.space_type,
            space_id: self.options.id.clone(),
            key: key.to_string(),
            permanently,
        }
    }

    fn space(&self) -> SpaceBlobs {
        SpaceBlobs {
            space_type: self.options.space_type,
            space_id: self.options.id.clone(),
        }
    }
}

impl Storage for CloudBlobStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Blob
    }

    fn options(&self) -> &StorageOptions {
        &self.options
    }

    fn connection(&self) -> &dyn Connection {
        &self.socket
    }
}

#[async_trait]
impl BlobStorage for CloudBlobStorage {
    async fn get_blob(&self, key: &str) -> Result<Option<BlobRecord>> {
        let client = self.client()?;
        let response: Data<Option<RemoteBlob>> = client.request(GET_BLOB, &self.blob_key(key, false)).await?;
        let Some(blob) = response.data else {
            return Ok(None);
        };
        Ok(Some(BlobRecord {
            key: blob.key,
            data: decode_bin(&blob.data)?,
            mime: blob.mime,
            created_at: blob.created_at,
        }))
    }

    async fn set_blob(&self, blob: BlobRecord) -> Result<()> {
        let client = self.client()?;
        let upload = SetBlob {
            space_type: self.options.space_type,
            space_id: self.options.id.clone(),
            key: blob.key,
            data: encode_bin(&blob.data),
            mime: blob.mime,
        };
        client.request::<_, Empty>(SET_BLOB, &upload).await?;
        log::debug!("Uploaded blob {} to {}", upload.key, self.options.id);
        Ok(())
    }

    async fn delete_blob(&self, key: &str, permanently: bool) -> Result<()> {
        let client = self.client()?;
        client
            .request::<_, Empty>(DELETE_BLOB, &self.blob_key(key, permanently))
            .await?;
        Ok(())
    }

    /// The server applies its own retention.
    async fn release_blobs(&self) -> Result<()> {
        let client = self.client()?;
        client.request::<_, Empty>(RELEASE_BLOBS, &self.space()).await?;
        Ok(())
    }

    async fn list_blobs(&self) -> Result<Vec<ListedBlobRecord>> {
        let client = self.client()?;
        let response: Data<Vec<ListedRemoteBlob>> = client.request(LIST_BLOBS, &self.space()).await?;
        Ok(response
            .data
            .into_iter()
            .map(|blob| ListedBlobRecord {
                key: blob.key,
                mime: blob.mime,
                size: blob.size,
                created_at: blob.created_at,
            })
            .collect())
    }
}
