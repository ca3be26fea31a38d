//! In-memory blob store for tests and ephemeral deployments.

use crate::blob::{validate_key, BlobEntry, BlobStore, StoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    uploads: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `upload` calls so far.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn location(&self) -> String {
        "memory://blobs".to_string()
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn upload(&self, key: &str, data: Vec<u8>, _content_type: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.objects.write().await.insert(key.to_string(), data);
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StoreError> {
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| BlobEntry {
                key: k.clone(),
                size: v.len() as u64,
            })
            .collect())
    }
}
