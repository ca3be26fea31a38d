//! Model weight and image asset management.
//!
//! Model weights live in a local weights directory that the embedding engine
//! reads from. Under [`SyncPolicy::Durable`] a blob store is the authoritative
//! copy: missing weights are pulled from it on demand, and locally acquired
//! weights are pushed back by an explicit [`AssetManager::publish_local_changes`].
//! Under [`SyncPolicy::LocalOnly`] the blob store is never consulted for models.

use crate::blob::{BlobStore, StoreError};
use chrono::{DateTime, Utc};
use facelink_core::preprocess::{self, ImageError};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;

/// Durable key prefix for archived request images.
pub const IMAGES_PREFIX: &str = "facial-recognition-images/";
const IMAGE_FILE_PREFIX: &str = "facial_recognition_image_";
/// Durable key prefix for model weight files.
pub const MODELS_PREFIX: &str = "models/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Blob store is authoritative for model weights.
    Durable,
    /// Local disk only.
    LocalOnly,
}

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("invalid asset name: {0:?}")]
    InvalidName(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("Image not found in storage: {0}")]
    ImageNotFound(String),
    #[error(transparent)]
    Image(#[from] ImageError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> AssetError + '_ {
    move |source| AssetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where `ensure_local` found (or failed to find) a model file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetLocation {
    /// Already present in the weights directory.
    Local(PathBuf),
    /// Linked or copied from the bundled models directory.
    Bundled(PathBuf),
    /// Downloaded from durable storage.
    Downloaded(PathBuf),
    /// Not available anywhere; the path is where it is expected.
    Missing(PathBuf),
}

impl AssetLocation {
    pub fn path(&self) -> &Path {
        match self {
            AssetLocation::Local(p)
            | AssetLocation::Bundled(p)
            | AssetLocation::Downloaded(p)
            | AssetLocation::Missing(p) => p,
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, AssetLocation::Missing(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredIn {
    Local,
    Durable,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelAssetInfo {
    pub name: String,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub location: StoredIn,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of one write-back pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub policy: SyncPolicy,
    pub uploaded: Vec<String>,
    pub already_present: Vec<String>,
    pub failed: Vec<SyncFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

/// A bare file name: no separators, not `.`/`..`, not empty.
fn validate_name(name: &str) -> Result<(), AssetError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(AssetError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub struct AssetManager {
    weights_dir: PathBuf,
    bundled_dir: Option<PathBuf>,
    store: Arc<dyn BlobStore>,
    policy: SyncPolicy,
}

impl AssetManager {
    pub fn new(weights_dir: impl Into<PathBuf>, store: Arc<dyn BlobStore>, policy: SyncPolicy) -> Self {
        Self {
            weights_dir: weights_dir.into(),
            bundled_dir: None,
            store,
            policy,
        }
    }

    /// Read-only models directory shipped with the deployment.
    pub fn with_bundled_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundled_dir = Some(dir.into());
        self
    }

    pub fn weights_dir(&self) -> &Path {
        &self.weights_dir
    }

    pub fn bundled_dir(&self) -> Option<&Path> {
        self.bundled_dir.as_deref()
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Durable location of archived images, e.g. `gs://bucket/facial-recognition-images/`.
    pub fn images_location(&self) -> String {
        format!("{}/{IMAGES_PREFIX}", self.store.location().trim_end_matches('/'))
    }

    /// Make `name` available in the weights directory if possible.
    ///
    /// Checks the weights directory, then the bundled directory, then (under
    /// `Durable`) the blob store.
    pub async fn ensure_local(&self, name: &str) -> Result<AssetLocation, AssetError> {
        validate_name(name)?;
        let target = self.weights_dir.join(name);

        if fs::metadata(&target).await.is_ok_and(|m| m.is_file()) {
            return Ok(AssetLocation::Local(target));
        }

        fs::create_dir_all(&self.weights_dir)
            .await
            .map_err(io_err(&self.weights_dir))?;

        if let Some(bundled) = &self.bundled_dir {
            let source = bundled.join(name);
            if fs::metadata(&source).await.is_ok_and(|m| m.is_file()) {
                link_or_copy(&source, &target).await?;
                tracing::info!(model = name, source = %source.display(), "linked bundled model");
                return Ok(AssetLocation::Bundled(target));
            }
        }

        if self.policy == SyncPolicy::Durable {
            let key = format!("{MODELS_PREFIX}{name}");
            if self.store.exists(&key).await? {
                let bytes = self.store.download(&key).await?;
                let size = bytes.len();
                write_atomic(&target, bytes).await?;
                tracing::info!(
                    model = name,
                    bytes = size,
                    store = %self.store.location(),
                    "downloaded model from durable storage"
                );
                return Ok(AssetLocation::Downloaded(target));
            }
        }

        tracing::debug!(model = name, "model not available locally or in storage");
        Ok(AssetLocation::Missing(target))
    }

    /// Link every file of `dir` into the weights directory, skipping names
    /// already present. Returns the names linked.
    pub async fn link_bundled(&self, dir: &Path) -> Result<Vec<String>, AssetError> {
        fs::create_dir_all(&self.weights_dir)
            .await
            .map_err(io_err(&self.weights_dir))?;

        let mut linked = Vec::new();
        for (name, _) in list_files(dir).await? {
            let target = self.weights_dir.join(&name);
            if fs::symlink_metadata(&target).await.is_ok() {
                tracing::debug!(model = %name, "model already present in weights directory");
                continue;
            }
            link_or_copy(&dir.join(&name), &target).await?;
            linked.push(name);
        }
        tracing::info!(count = linked.len(), dir = %dir.display(), "linked bundled models");
        Ok(linked)
    }

    /// Upload local weight files that durable storage does not have yet.
    ///
    /// Existence is judged by file name only. Per-file failures are collected
    /// in the report; the pass continues with the next file.
    pub async fn publish_local_changes(&self) -> Result<SyncReport, AssetError> {
        let started_at = Utc::now();
        let mut report = SyncReport {
            policy: self.policy,
            uploaded: Vec::new(),
            already_present: Vec::new(),
            failed: Vec::new(),
            started_at,
            finished_at: started_at,
        };
        if self.policy == SyncPolicy::LocalOnly {
            tracing::debug!("local-only deployment, nothing to publish");
            return Ok(report);
        }

        let remote: HashSet<String> = self
            .store
            .list(MODELS_PREFIX)
            .await?
            .iter()
            .map(|e| e.file_name().to_string())
            .collect();

        for (name, _) in list_files(&self.weights_dir).await? {
            if remote.contains(&name) {
                report.already_present.push(name);
                continue;
            }
            let path = self.weights_dir.join(&name);
            let result = match fs::read(&path).await {
                Ok(bytes) => self
                    .store
                    .upload(&format!("{MODELS_PREFIX}{name}"), bytes, "application/octet-stream")
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(format!("{}: {e}", path.display())),
            };
            match result {
                Ok(()) => {
                    tracing::info!(model = %name, "published model to durable storage");
                    report.uploaded.push(name);
                }
                Err(error) => {
                    tracing::warn!(model = %name, %error, "failed to publish model");
                    report.failed.push(SyncFailure { name, error });
                }
            }
        }

        report.finished_at = Utc::now();
        Ok(report)
    }

    /// JPEG-encode and archive an image under a fresh id. Returns the blob id.
    pub async fn store_image(&self, image: &RgbImage) -> Result<String, AssetError> {
        let bytes = preprocess::encode_jpeg(image)?;
        let blob_id = format!("{IMAGES_PREFIX}{IMAGE_FILE_PREFIX}{}.jpg", uuid::Uuid::new_v4());
        self.store.upload(&blob_id, bytes, "image/jpeg").await?;
        tracing::info!(blob_id = %blob_id, "archived image");
        Ok(blob_id)
    }

    pub async fn fetch_image(&self, blob_id: &str) -> Result<RgbImage, AssetError> {
        let bytes = match self.store.download(blob_id).await {
            Ok(b) => b,
            Err(StoreError::NotFound(_)) => return Err(AssetError::ImageNotFound(blob_id.to_string())),
            Err(e) => return Err(e.into()),
        };
        Ok(preprocess::decode_image_bytes(&bytes)?)
    }

    /// Union of local and (under `Durable`) stored model files.
    pub async fn list_models(&self) -> Result<Vec<ModelAssetInfo>, AssetError> {
        let mut by_name: BTreeMap<String, ModelAssetInfo> = BTreeMap::new();

        for (name, size) in list_files(&self.weights_dir).await? {
            by_name.insert(
                name.clone(),
                ModelAssetInfo {
                    name,
                    size_bytes: size,
                    size_mb: bytes_to_mb(size),
                    location: StoredIn::Local,
                },
            );
        }

        if self.policy == SyncPolicy::Durable {
            for entry in self.store.list(MODELS_PREFIX).await? {
                let name = entry.file_name().to_string();
                by_name
                    .entry(name.clone())
                    .and_modify(|m| m.location = StoredIn::Both)
                    .or_insert(ModelAssetInfo {
                        name,
                        size_bytes: entry.size,
                        size_mb: bytes_to_mb(entry.size),
                        location: StoredIn::Durable,
                    });
            }
        }

        Ok(by_name.into_values().collect())
    }
}

/// Regular files directly inside `dir` (following symlinks), with sizes.
/// Hidden and partial files are skipped. A missing directory is empty.
async fn list_files(dir: &Path) -> Result<Vec<(String, u64)>, AssetError> {
    let mut rd = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir)(e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = rd.next_entry().await.map_err(io_err(dir))? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') || name.ends_with(".part") {
            continue;
        }
        // Follows symlinks; dangling links are skipped
        match fs::metadata(entry.path()).await {
            Ok(meta) if meta.is_file() => files.push((name, meta.len())),
            _ => {}
        }
    }
    files.sort();
    Ok(files)
}

async fn write_atomic(target: &Path, bytes: Vec<u8>) -> Result<(), AssetError> {
    crate::fs::write_atomic(target.to_path_buf(), bytes)
        .await
        .map_err(io_err(target))
}

/// Symlink `source` at `target`, copying when linking is unsupported.
async fn link_or_copy(source: &Path, target: &Path) -> Result<(), AssetError> {
    let source = fs::canonicalize(source).await.map_err(io_err(source))?;

    #[cfg(unix)]
    match fs::symlink(&source, target).await {
        Ok(()) => return Ok(()),
        Err(e) => tracing::debug!(error = %e, "symlink failed, copying instead"),
    }

    fs::copy(&source, target).await.map_err(io_err(target))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlobStore;
    use crate::BlobEntry;
    use async_trait::async_trait;

    fn manager(dir: &Path, store: Arc<MemoryBlobStore>, policy: SyncPolicy) -> AssetManager {
        AssetManager::new(dir.join("weights"), store, policy)
    }

    #[tokio::test]
    async fn test_ensure_local_prefers_local_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.upload("models/m.onnx", b"remote".to_vec(), "").await.unwrap();
        let mgr = manager(tmp.path(), store.clone(), SyncPolicy::Durable);

        std::fs::create_dir_all(mgr.weights_dir()).unwrap();
        std::fs::write(mgr.weights_dir().join("m.onnx"), b"local").unwrap();

        let loc = mgr.ensure_local("m.onnx").await.unwrap();
        assert!(matches!(loc, AssetLocation::Local(_)));
        assert_eq!(std::fs::read(loc.path()).unwrap(), b"local");
    }

    #[tokio::test]
    async fn test_ensure_local_downloads_from_durable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.upload("models/m.onnx", b"remote".to_vec(), "").await.unwrap();
        let mgr = manager(tmp.path(), store, SyncPolicy::Durable);

        let loc = mgr.ensure_local("m.onnx").await.unwrap();
        assert!(matches!(loc, AssetLocation::Downloaded(_)));
        assert_eq!(std::fs::read(loc.path()).unwrap(), b"remote");

        // Second call finds it locally
        assert!(matches!(mgr.ensure_local("m.onnx").await.unwrap(), AssetLocation::Local(_)));
    }

    #[tokio::test]
    async fn test_ensure_local_only_skips_durable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.upload("models/m.onnx", b"remote".to_vec(), "").await.unwrap();
        let mgr = manager(tmp.path(), store, SyncPolicy::LocalOnly);

        let loc = mgr.ensure_local("m.onnx").await.unwrap();
        assert_eq!(loc, AssetLocation::Missing(mgr.weights_dir().join("m.onnx")));
        assert!(!loc.is_available());
    }

    #[tokio::test]
    async fn test_ensure_local_links_bundled() {
        let tmp = tempfile::tempdir().unwrap();
        let bundled = tmp.path().join("models");
        std::fs::create_dir_all(&bundled).unwrap();
        std::fs::write(bundled.join("m.onnx"), b"bundled").unwrap();

        let mgr = manager(tmp.path(), Arc::new(MemoryBlobStore::new()), SyncPolicy::Durable)
            .with_bundled_dir(&bundled);
        let loc = mgr.ensure_local("m.onnx").await.unwrap();
        assert!(matches!(loc, AssetLocation::Bundled(_)));
        assert_eq!(std::fs::read(loc.path()).unwrap(), b"bundled");
    }

    #[tokio::test]
    async fn test_ensure_local_rejects_path_names() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), Arc::new(MemoryBlobStore::new()), SyncPolicy::Durable);
        for bad in ["", "..", "a/b", "..\\x"] {
            assert!(matches!(mgr.ensure_local(bad).await, Err(AssetError::InvalidName(_))));
        }
    }

    #[tokio::test]
    async fn test_link_bundled_skips_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let bundled = tmp.path().join("models");
        std::fs::create_dir_all(&bundled).unwrap();
        std::fs::write(bundled.join("a.onnx"), b"a").unwrap();
        std::fs::write(bundled.join("b.onnx"), b"b").unwrap();

        let mgr = manager(tmp.path(), Arc::new(MemoryBlobStore::new()), SyncPolicy::LocalOnly);
        std::fs::create_dir_all(mgr.weights_dir()).unwrap();
        std::fs::write(mgr.weights_dir().join("a.onnx"), b"mine").unwrap();

        assert_eq!(mgr.link_bundled(&bundled).await.unwrap(), vec!["b.onnx"]);
        assert_eq!(std::fs::read(mgr.weights_dir().join("a.onnx")).unwrap(), b"mine");
        assert!(mgr.link_bundled(&bundled).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_uploads_only_missing_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.upload("models/old.onnx", b"o".to_vec(), "").await.unwrap();
        let mgr = manager(tmp.path(), store.clone(), SyncPolicy::Durable);

        std::fs::create_dir_all(mgr.weights_dir()).unwrap();
        std::fs::write(mgr.weights_dir().join("old.onnx"), b"o").unwrap();
        std::fs::write(mgr.weights_dir().join("new.onnx"), b"n").unwrap();
        std::fs::write(mgr.weights_dir().join("partial.onnx.part"), b"p").unwrap();

        let first = mgr.publish_local_changes().await.unwrap();
        assert_eq!(first.uploaded, vec!["new.onnx"]);
        assert_eq!(first.already_present, vec!["old.onnx"]);
        assert!(first.failed.is_empty());
        assert_eq!(store.download("models/new.onnx").await.unwrap(), b"n");

        let uploads = store.upload_count();
        let second = mgr.publish_local_changes().await.unwrap();
        assert!(second.uploaded.is_empty());
        assert_eq!(store.upload_count(), uploads);
    }

    #[tokio::test]
    async fn test_publish_is_noop_when_local_only() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let mgr = manager(tmp.path(), store.clone(), SyncPolicy::LocalOnly);
        std::fs::create_dir_all(mgr.weights_dir()).unwrap();
        std::fs::write(mgr.weights_dir().join("new.onnx"), b"n").unwrap();

        let report = mgr.publish_local_changes().await.unwrap();
        assert!(report.uploaded.is_empty());
        assert_eq!(store.upload_count(), 0);
    }

    /// Accepts everything except uploads of keys containing "bad".
    struct FlakyStore(MemoryBlobStore);

    #[async_trait]
    impl BlobStore for FlakyStore {
        fn location(&self) -> String {
            "flaky://".into()
        }
        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            self.0.exists(key).await
        }
        async fn upload(&self, key: &str, data: Vec<u8>, ct: &str) -> Result<(), StoreError> {
            if key.contains("bad") {
                return Err(StoreError::Backend { status: 503, message: "unavailable".into() });
            }
            self.0.upload(key, data, ct).await
        }
        async fn download(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            self.0.download(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StoreError> {
            self.0.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_publish_collects_per_file_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = AssetManager::new(
            tmp.path().join("w"),
            Arc::new(FlakyStore(MemoryBlobStore::new())),
            SyncPolicy::Durable,
        );
        std::fs::create_dir_all(mgr.weights_dir()).unwrap();
        std::fs::write(mgr.weights_dir().join("bad.onnx"), b"x").unwrap();
        std::fs::write(mgr.weights_dir().join("good.onnx"), b"y").unwrap();

        let report = mgr.publish_local_changes().await.unwrap();
        assert_eq!(report.uploaded, vec!["good.onnx"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "bad.onnx");
        assert!(report.failed[0].error.contains("503"));
    }

    #[tokio::test]
    async fn test_store_image_ids_are_unique_and_fetchable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let mgr = manager(tmp.path(), store.clone(), SyncPolicy::Durable);
        let img = RgbImage::from_pixel(32, 24, image::Rgb([10, 200, 30]));

        let a = mgr.store_image(&img).await.unwrap();
        let b = mgr.store_image(&img).await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("facial-recognition-images/facial_recognition_image_"));
        assert!(a.ends_with(".jpg"));
        assert_eq!(store.list(IMAGES_PREFIX).await.unwrap().len(), 2);

        let fetched = mgr.fetch_image(&a).await.unwrap();
        assert_eq!(fetched.dimensions(), (32, 24));
    }

    #[tokio::test]
    async fn test_fetch_missing_image() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), Arc::new(MemoryBlobStore::new()), SyncPolicy::Durable);
        let err = mgr.fetch_image("facial-recognition-images/none.jpg").await.unwrap_err();
        assert!(matches!(err, AssetError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_models_union() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.upload("models/both.onnx", vec![0; 10], "").await.unwrap();
        store.upload("models/remote.onnx", vec![0; 20], "").await.unwrap();
        let mgr = manager(tmp.path(), store, SyncPolicy::Durable);
        std::fs::create_dir_all(mgr.weights_dir()).unwrap();
        std::fs::write(mgr.weights_dir().join("both.onnx"), vec![0; 10]).unwrap();
        std::fs::write(mgr.weights_dir().join("local.onnx"), vec![0; 5]).unwrap();

        let models = mgr.list_models().await.unwrap();
        let summary: Vec<(&str, StoredIn)> =
            models.iter().map(|m| (m.name.as_str(), m.location)).collect();
        assert_eq!(
            summary,
            vec![
                ("both.onnx", StoredIn::Both),
                ("local.onnx", StoredIn::Local),
                ("remote.onnx", StoredIn::Durable),
            ]
        );
        assert_eq!(models[2].size_bytes, 20);
    }

    #[test]
    fn test_bytes_to_mb() {
        assert_eq!(bytes_to_mb(0), 0.0);
        assert_eq!(bytes_to_mb(1024 * 1024), 1.0);
        assert_eq!(bytes_to_mb(95 * 1024 * 1024 + 512 * 1024), 95.5);
    }

    #[test]
    fn test_images_location() {
        let mgr = AssetManager::new("/w", Arc::new(MemoryBlobStore::new()), SyncPolicy::Durable);
        assert_eq!(mgr.images_location(), "memory://blobs/facial-recognition-images/");
    }
}
