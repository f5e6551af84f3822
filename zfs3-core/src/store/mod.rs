/*!
Object store adapters for chunk persistence.

This module defines the object store port used by the upload pipeline and its
adapters: a local directory, process memory, and S3 (behind the `s3` feature). The
pipeline only relies on the [`ObjectStore`] trait, so adding a backend does not touch
the upload engine.
*/

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};
use crate::{BackupError, Result};

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

/// Acknowledgement of a completed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutReceipt {
    pub key: String,
    /// SHA-256 (hex) of the bytes the store holds for `key`
    pub checksum: String,
    /// Stored object length in bytes
    pub size: u64,
    /// Backend-specific version tag, if any
    pub etag: Option<String>,
}

/// Storage abstraction for chunk objects
///
/// All operations address objects by their full key. `put_object` must only return a
/// receipt once the write is durable; the receipt's checksum is compared with the one
/// computed before upload.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` under `key` with the given storage class, replacing any existing object
    async fn put_object(&self, key: &str, body: Bytes, storage_class: &str) -> Result<PutReceipt>;

    /// Read the full object stored under `key`
    async fn get_object(&self, key: &str) -> Result<Bytes>;

    /// Check whether an object exists under `key`
    async fn exists(&self, key: &str) -> Result<bool>;

    /// List all keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete the object under `key`; deleting a missing object is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Short human-readable description used in logs
    fn describe(&self) -> String;
}

/// Open the object store selected by `config`
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    config.validate()?;
    match config.backend {
        StoreBackend::Local => {
            let base = config
                .local_base_path
                .clone()
                .ok_or_else(|| BackupError::validation("local backend requires a base directory"))?;
            Ok(Arc::new(LocalObjectStore::with_base_dir(base)))
        }
        StoreBackend::Memory => Ok(Arc::new(MemoryObjectStore::new())),
        StoreBackend::S3 => open_s3(config).await,
    }
}

#[cfg(feature = "s3")]
async fn open_s3(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    Ok(Arc::new(S3ObjectStore::new(config).await?))
}

#[cfg(not(feature = "s3"))]
async fn open_s3(_config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    Err(BackupError::validation("S3 support not enabled (build with the `s3` feature)"))
}

/// Reject keys that could escape a key namespace or a base directory
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(BackupError::validation("object key cannot be empty"));
    }
    if key.starts_with('/') || key.split('/').any(|part| part == ".." || part == ".") {
        return Err(BackupError::validation(format!("invalid object key '{key}'")));
    }
    Ok(())
}
