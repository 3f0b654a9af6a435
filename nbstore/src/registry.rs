//! Storage implementations by name.
//!
//! Configuration names an implementation (`"LocalDocStorage"`,
//! `"CloudDocStorage"`, ...) and the registry builds it. Registering a name
//! twice keeps the later constructor.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::impls::broadcast_channel::BroadcastChannelAwarenessStorage;
use crate::impls::cloud::{CloudAwarenessStorage, CloudBlobStorage, CloudDocStorage};
use crate::impls::local::{
    LocalBlobStorage, LocalDocStorage, LocalSyncStorage, LocalV1BlobStorage, LocalV1DocStorage,
};
use crate::storage::{AnyStorage, StorageOptions, StoreContext};

pub type StorageConstructor = Arc<dyn Fn(StorageOptions, &StoreContext) -> Result<AnyStorage> + Send + Sync>;

#[derive(Clone, Default)]
pub struct StorageRegistry {
    entries: Vec<(String, StorageConstructor)>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cloud, then the legacy local layout, then the current local layout.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register("CloudDocStorage", |opts, ctx| {
            Ok(AnyStorage::Doc(Arc::new(CloudDocStorage::new(opts, ctx)?)))
        });
        registry.register("CloudBlobStorage", |opts, ctx| {
            Ok(AnyStorage::Blob(Arc::new(CloudBlobStorage::new(opts, ctx)?)))
        });
        registry.register("CloudAwarenessStorage", |opts, ctx| {
            Ok(AnyStorage::Awareness(Arc::new(CloudAwarenessStorage::new(opts, ctx)?)))
        });

        registry.register("LocalV1DocStorage", |opts, ctx| {
            Ok(AnyStorage::Doc(Arc::new(LocalV1DocStorage::new(opts, ctx))))
        });
        registry.register("LocalV1BlobStorage", |opts, ctx| {
            Ok(AnyStorage::Blob(Arc::new(LocalV1BlobStorage::new(opts, ctx))))
        });

        registry.register("LocalDocStorage", |opts, ctx| {
            Ok(AnyStorage::Doc(Arc::new(LocalDocStorage::new(opts, ctx))))
        });
        registry.register("LocalBlobStorage", |opts, ctx| {
            Ok(AnyStorage::Blob(Arc::new(LocalBlobStorage::new(opts, ctx))))
        });
        registry.register("LocalSyncStorage", |opts, ctx| {
            Ok(AnyStorage::Sync(Arc::new(LocalSyncStorage::new(opts, ctx))))
        });
        registry.register("BroadcastChannelAwarenessStorage", |opts, ctx| {
            Ok(AnyStorage::Awareness(Arc::new(BroadcastChannelAwarenessStorage::new(opts, ctx))))
        });

        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: impl Fn(StorageOptions, &StoreContext) -> Result<AnyStorage> + Send + Sync + 'static,
    ) {
        let name = name.into();
        if self.entries.iter().any(|(n, _)| *n == name) {
            log::debug!("Storage implementation {name} re-registered, keeping the new one");
            self.entries.retain(|(n, _)| *n != name);
        }
        self.entries.push((name, Arc::new(constructor)));
    }

    pub fn create(&self, name: &str, options: StorageOptions, ctx: &StoreContext) -> Result<AnyStorage> {
        let (_, constructor) = self
            .entries
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| Error::UnknownStorage(name.to_string()))?;
        constructor(options, ctx)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }
}

impl fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::{SpaceType, StorageType};

    fn ctx(dir: &tempfile::TempDir) -> StoreContext {
        StoreContext::new(StoreConfig::for_testing(dir.path()))
    }

    #[test]
    fn test_default_order() {
        let registry = StorageRegistry::with_defaults();
        assert_eq!(
            registry.names(),
            vec![
                "CloudDocStorage",
                "CloudBlobStorage",
                "CloudAwarenessStorage",
                "LocalV1DocStorage",
                "LocalV1BlobStorage",
                "LocalDocStorage",
                "LocalBlobStorage",
                "LocalSyncStorage",
                "BroadcastChannelAwarenessStorage",
            ]
        );
    }

    #[test]
    fn test_create_local_storages() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        let registry = StorageRegistry::with_defaults();
        let options = StorageOptions::new("local", SpaceType::Workspace, "ws");

        let doc = registry.create("LocalDocStorage", options.clone(), &ctx).unwrap();
        assert_eq!(doc.storage_type(), StorageType::Doc);
        let awareness = registry
            .create("BroadcastChannelAwarenessStorage", options, &ctx)
            .unwrap();
        assert_eq!(awareness.storage_type(), StorageType::Awareness);
    }

    #[test]
    fn test_unknown_name() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StorageRegistry::with_defaults();
        let err = registry
            .create("SqliteDocStorage", StorageOptions::new("local", SpaceType::Workspace, "ws"), &ctx(&dir))
            .unwrap_err();
        assert_eq!(err, Error::UnknownStorage("SqliteDocStorage".into()));
    }

    #[test]
    fn test_later_registration_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = StorageRegistry::with_defaults();
        registry.register("LocalDocStorage", |opts, ctx| {
            Ok(AnyStorage::Blob(Arc::new(LocalBlobStorage::new(opts, ctx))))
        });

        let storage = registry
            .create("LocalDocStorage", StorageOptions::new("local", SpaceType::Workspace, "ws"), &ctx(&dir))
            .unwrap();
        assert_eq!(storage.storage_type(), StorageType::Blob);
        assert_eq!(registry.names().iter().filter(|n| **n == "LocalDocStorage").count(), 1);
    }

    #[test]
    fn test_cloud_without_server_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StorageRegistry::with_defaults();
        let result = registry.create(
            "CloudDocStorage",
            StorageOptions::new("cloud", SpaceType::Workspace, "ws"),
            &ctx(&dir),
        );
        assert!(matches!(result, Err(Error::InvalidOptions(_))));
    }

    #[test]
    fn test_create_cloud_blob_storage() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StorageRegistry::with_defaults();
        let options = StorageOptions::new("cloud", SpaceType::Workspace, "ws").with_server("http://127.0.0.1:1");
        let blob = registry.create("CloudBlobStorage", options, &ctx(&dir)).unwrap();
        assert_eq!(blob.storage_type(), StorageType::Blob);
    }
}
