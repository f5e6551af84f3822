/*!
In-memory object store, used for dry runs and tests.
*/

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{validate_key, ObjectStore, PutReceipt};
use crate::manifest::compute_checksum;
use crate::{BackupError, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    storage_class: String,
}

/// Memory-based object store
///
/// Cloning the store shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, StoredObject>> {
        // the map stays consistent even if a holder panicked
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    /// All stored keys in order
    pub fn keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    /// Storage class an object was written with
    pub fn storage_class_of(&self, key: &str) -> Option<String> {
        self.objects().get(key).map(|o| o.storage_class.clone())
    }

    /// Overwrite an object's bytes without going through `put_object`
    pub fn corrupt(&self, key: &str, body: Bytes) -> bool {
        match self.objects().get_mut(key) {
            Some(object) => {
                object.body = body;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, key: &str, body: Bytes, storage_class: &str) -> Result<PutReceipt> {
        validate_key(key)?;
        let receipt = PutReceipt {
            key: key.to_string(),
            checksum: compute_checksum(&body),
            size: body.len() as u64,
            etag: None,
        };
        self.objects().insert(
            key.to_string(),
            StoredObject {
                body,
                storage_class: storage_class.to_string(),
            },
        );
        Ok(receipt)
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        self.objects()
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| BackupError::not_found(format!("object '{key}'")))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects().contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects().remove(key);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryObjectStore::new();
        store
            .put_object("p/ds/chunk-00000000", Bytes::from_static(b"abc"), "GLACIER")
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get_object("p/ds/chunk-00000000").await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(store.storage_class_of("p/ds/chunk-00000000").as_deref(), Some("GLACIER"));
    }

    #[tokio::test]
    async fn test_clones_share_objects() {
        let store = MemoryObjectStore::new();
        let view = store.clone();
        store.put_object("k", Bytes::from_static(b"v"), "STANDARD").await.unwrap();
        assert!(view.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_uses_prefix_range() {
        let store = MemoryObjectStore::new();
        for key in ["a/1", "a/2", "ab/1", "b/1"] {
            store.put_object(key, Bytes::new(), "STANDARD").await.unwrap();
        }
        assert_eq!(store.list("a/").await.unwrap(), vec!["a/1".to_string(), "a/2".to_string()]);
        assert_eq!(store.list("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_corrupt_changes_stored_bytes() {
        let store = MemoryObjectStore::new();
        store.put_object("k", Bytes::from_static(b"good"), "STANDARD").await.unwrap();
        assert!(store.corrupt("k", Bytes::from_static(b"bad")));
        assert!(!store.corrupt("missing", Bytes::new()));
        assert_eq!(store.get_object("k").await.unwrap(), Bytes::from_static(b"bad"));
    }
}
