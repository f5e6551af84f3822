/*!
Local filesystem object store.
*/

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::{validate_key, ObjectStore, PutReceipt};
use crate::manifest::compute_checksum;
use crate::{BackupError, Result};

const TEMP_MARKER: &str = ".zfs3-partial-";

/// Local directory object store
///
/// Keys map to paths below the base directory; `/` in a key becomes a directory
/// separator. Writes go to a temporary file that is renamed into place, so a reader
/// never sees a half-written object. Storage classes are accepted and ignored.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    base_dir: PathBuf,
}

impl LocalObjectStore {
    /// Create a store rooted at `base_dir`
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve the full path for a key
    fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.base_dir.join(key))
    }

    async fn collect_keys(&self, dir: PathBuf, keys: &mut Vec<String>) -> Result<()> {
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let is_partial = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(TEMP_MARKER));
                if is_partial {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.base_dir) {
                    let key: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(&self, key: &str, body: Bytes, _storage_class: &str) -> Result<PutReceipt> {
        let full_path = self.resolve_path(key)?;
        let parent = full_path
            .parent()
            .ok_or_else(|| BackupError::validation(format!("invalid object key '{key}'")))?;
        fs::create_dir_all(parent).await.map_err(|e| {
            BackupError::upload(format!("Failed to create directory {}: {e}", parent.display()))
        })?;

        let file_name = full_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let temp_path = parent.join(format!("{TEMP_MARKER}{}-{file_name}", uuid::Uuid::new_v4()));

        fs::write(&temp_path, &body)
            .await
            .map_err(|e| BackupError::upload(format!("Failed to write {}: {e}", temp_path.display())))?;
        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(BackupError::upload(format!(
                "Failed to move object into place at {}: {e}",
                full_path.display()
            )));
        }

        debug!(key = %key, size = body.len(), "Stored object on local disk");
        Ok(PutReceipt {
            key: key.to_string(),
            checksum: compute_checksum(&body),
            size: body.len() as u64,
            etag: None,
        })
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(key)?;
        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BackupError::not_found(format!("object '{key}'")))
            }
            Err(e) => Err(BackupError::upload(format!(
                "Failed to read {}: {e}",
                full_path.display()
            ))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_path = self.resolve_path(key)?;
        Ok(fs::try_exists(&full_path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(self.base_dir.clone(), &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.resolve_path(key)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::upload(format!(
                "Failed to delete {}: {e}",
                full_path.display()
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("local:{}", self.base_dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::with_base_dir(temp_dir.path());
        let key = "zfs3backup/tank/data@daily-1/chunk-00000000";

        let receipt = store
            .put_object(key, Bytes::from_static(b"chunk bytes"), "STANDARD")
            .await
            .unwrap();
        assert_eq!(receipt.checksum, compute_checksum(b"chunk bytes"));
        assert_eq!(receipt.size, 11);

        assert!(store.exists(key).await.unwrap());
        assert_eq!(store.get_object(key).await.unwrap(), Bytes::from_static(b"chunk bytes"));

        store.delete(key).await.unwrap();
        assert!(!store.exists(key).await.unwrap());
        // deleting twice is fine
        store.delete(key).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_overwrites_existing_object() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::with_base_dir(temp_dir.path());

        store.put_object("a/b", Bytes::from_static(b"first"), "STANDARD").await.unwrap();
        store.put_object("a/b", Bytes::from_static(b"second"), "STANDARD").await.unwrap();

        assert_eq!(store.get_object("a/b").await.unwrap(), Bytes::from_static(b"second"));
        assert_eq!(store.list("a/").await.unwrap(), vec!["a/b".to_string()]);
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::with_base_dir(temp_dir.path());

        for key in ["p/ds@2/chunk-00000001", "p/ds@2/chunk-00000000", "p/ds@1/manifest.json", "q/x"] {
            store.put_object(key, Bytes::from_static(b"x"), "STANDARD").await.unwrap();
        }

        assert_eq!(
            store.list("p/ds@2/").await.unwrap(),
            vec!["p/ds@2/chunk-00000000".to_string(), "p/ds@2/chunk-00000001".to_string()]
        );
        assert_eq!(store.list("p/").await.unwrap().len(), 3);
        assert!(store.list("missing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_object_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::with_base_dir(temp_dir.path());

        let result = store.get_object("nope").await;
        assert!(matches!(result, Err(BackupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::with_base_dir(temp_dir.path());

        let result = store.put_object("../outside", Bytes::new(), "STANDARD").await;
        assert!(matches!(result, Err(BackupError::Validation(_))));
    }
}
