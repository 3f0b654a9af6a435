//! Same-device fan-out with no persistence.

mod awareness;

pub use awareness::BroadcastChannelAwarenessStorage;

use async_trait::async_trait;
use std::sync::Arc;

use crate::channel::{BroadcastChannel, ChannelHub};
use crate::connection::{ConnectionHandle, Connector, SharedConnection};
use crate::error::Result;
use crate::storage::StorageOptions;

pub type BroadcastChannelConnection = SharedConnection<BroadcastChannelConnector>;

/// Opens a port on `channel:<peer>:<type>:<id>`.
pub struct BroadcastChannelConnector {
    hub: ChannelHub,
    name: String,
}

impl BroadcastChannelConnector {
    pub fn new(hub: &ChannelHub, options: &StorageOptions) -> Self {
        Self {
            hub: hub.clone(),
            name: format!("channel:{}", options.universal_id()),
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Connector for BroadcastChannelConnector {
    type Inner = Arc<BroadcastChannel>;

    fn share_id(&self) -> String {
        self.name.clone()
    }

    async fn do_connect(&self, _handle: ConnectionHandle<Self>) -> Result<Arc<BroadcastChannel>> {
        Ok(Arc::new(self.hub.open(self.name.clone())))
    }

    fn do_disconnect(&self, inner: Arc<BroadcastChannel>) {
        inner.close();
    }
}
