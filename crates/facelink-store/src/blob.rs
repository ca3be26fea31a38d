//! Durable blob storage contract.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage backend returned {status}: {message}")]
    Backend { status: u16, message: String },
    #[error("storage credentials unavailable: {0}")]
    Auth(String),
}

/// One object in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobEntry {
    pub key: String,
    pub size: u64,
}

impl BlobEntry {
    /// Final path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Key-addressed object storage.
///
/// Keys are `/`-separated relative paths. Uploading an existing key
/// replaces it.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Location shown in health and info responses, e.g. `gs://bucket`.
    fn location(&self) -> String;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn upload(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StoreError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// All objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StoreError>;
}

/// Reject keys that are empty, absolute, or escape the store root.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
