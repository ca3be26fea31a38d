//! Process-wide service state shared by every request handler.

use crate::config::{Config, DeploymentMode, EngineKind, StorageKind};
use crate::engine::{self, EngineError};
use crate::remote::RemoteRepresenter;
use chrono::{DateTime, Utc};
use facelink_core::recognizer::RecognizerProfile;
use facelink_core::{FallbackController, Representer};
use facelink_store::{
    AssetManager, BlobStore, FsBlobStore, GcsBlobStore, GcsCredentials, SyncPolicy,
};
use std::sync::Arc;
use tokio::sync::OnceCell;

pub struct AppContext {
    pub config: Config,
    pub assets: AssetManager,
    pub controller: FallbackController,
    representer: OnceCell<Arc<dyn Representer>>,
    pub started_at: DateTime<Utc>,
}

impl AppContext {
    /// Build the storage client and asset manager. The embedding engine is
    /// not loaded until the first request that needs it.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn BlobStore> = match config.storage {
            StorageKind::Fs => Arc::new(FsBlobStore::new(&config.storage_dir)),
            StorageKind::Gcs => {
                let credentials = match &config.gcs_token {
                    Some(token) => GcsCredentials::Static(token.clone()),
                    None => GcsCredentials::MetadataServer,
                };
                Arc::new(GcsBlobStore::new(&config.storage_bucket, credentials))
            }
        };

        let policy = match config.deployment {
            DeploymentMode::Serverless => SyncPolicy::Durable,
            DeploymentMode::Standalone => SyncPolicy::LocalOnly,
        };

        let mut assets = AssetManager::new(config.weights_dir(), store, policy);
        if let Some(dir) = &config.models_dir {
            assets = assets.with_bundled_dir(dir);
            if dir.is_dir() {
                assets.link_bundled(dir).await?;
            } else {
                tracing::warn!(dir = %dir.display(), "bundled models directory not found");
            }
        }

        tracing::info!(
            deployment = %config.deployment,
            engine = config.engine.as_str(),
            model = %config.model_name,
            weights = %assets.weights_dir().display(),
            storage = %assets.store().location(),
            "service context ready"
        );

        Ok(Self::assemble(config, assets, OnceCell::new()))
    }

    fn assemble(config: Config, assets: AssetManager, representer: OnceCell<Arc<dyn Representer>>) -> Self {
        let controller = FallbackController::new(&config.model_name, &config.scratch_dir);
        Self {
            config,
            assets,
            controller,
            representer,
            started_at: Utc::now(),
        }
    }

    /// The embedding engine, initialized on first use.
    pub async fn representer(&self) -> Result<Arc<dyn Representer>, EngineError> {
        self.representer
            .get_or_try_init(|| self.init_representer())
            .await
            .cloned()
    }

    pub fn engine_initialized(&self) -> bool {
        self.representer.initialized()
    }

    async fn init_representer(&self) -> Result<Arc<dyn Representer>, EngineError> {
        let started = std::time::Instant::now();
        let representer: Arc<dyn Representer> = match self.config.engine {
            EngineKind::Remote => {
                let url = self.config.remote_url.as_deref().ok_or_else(|| {
                    EngineError::Config("FACELINK_REMOTE_URL is required for the remote engine".into())
                })?;
                let remote = RemoteRepresenter::new(url)?;
                tracing::info!(endpoint = remote.endpoint(), "using remote embedding service");
                Arc::new(remote)
            }
            EngineKind::Onnx => {
                let profile = RecognizerProfile::by_name(&self.config.model_name)?;
                let (detector, recognizer) = engine::prepare_weights(
                    &self.assets,
                    &profile,
                    self.config.model_base_url.as_deref(),
                )
                .await?;
                // Session creation is CPU-bound
                let handle = tokio::task::spawn_blocking(move || {
                    engine::spawn_engine(&detector, &recognizer, profile)
                })
                .await??;
                Arc::new(handle)
            }
        };
        tracing::info!(
            engine = self.config.engine.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "embedding engine initialized"
        );
        Ok(representer)
    }
}

#[cfg(test)]
impl AppContext {
    /// Context with a preset engine and the given asset manager.
    pub fn for_tests(config: Config, assets: AssetManager, representer: Option<Arc<dyn Representer>>) -> Self {
        let cell = match representer {
            Some(r) => OnceCell::new_with(Some(r)),
            None => OnceCell::new(),
        };
        Self::assemble(config, assets, cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_links_bundled_models() {
        let tmp = tempfile::tempdir().unwrap();
        let bundled = tmp.path().join("models");
        std::fs::create_dir_all(&bundled).unwrap();
        std::fs::write(bundled.join("facenet512.onnx"), b"weights").unwrap();

        let mut config = Config::for_tests(tmp.path());
        config.models_dir = Some(bundled);
        let ctx = AppContext::from_config(config).await.unwrap();

        assert_eq!(ctx.assets.policy(), SyncPolicy::LocalOnly);
        assert!(ctx.assets.weights_dir().join("facenet512.onnx").exists());
        assert!(!ctx.engine_initialized());
    }

    #[tokio::test]
    async fn test_serverless_uses_durable_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(tmp.path());
        config.deployment = DeploymentMode::Serverless;
        let ctx = AppContext::from_config(config).await.unwrap();
        assert_eq!(ctx.assets.policy(), SyncPolicy::Durable);
    }

    #[tokio::test]
    async fn test_remote_engine_requires_url() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(tmp.path());
        config.engine = EngineKind::Remote;
        let ctx = AppContext::from_config(config).await.unwrap();
        assert!(matches!(ctx.representer().await, Err(EngineError::Config(_))));
        assert!(!ctx.engine_initialized());
    }

    #[tokio::test]
    async fn test_remote_engine_initializes_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(tmp.path());
        config.engine = EngineKind::Remote;
        config.remote_url = Some("http://127.0.0.1:9".into());
        let ctx = AppContext::from_config(config).await.unwrap();

        let a = ctx.representer().await.unwrap();
        let b = ctx.representer().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(ctx.engine_initialized());
    }

    #[tokio::test]
    async fn test_onnx_engine_fails_without_weights() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = AppContext::from_config(Config::for_tests(tmp.path())).await.unwrap();
        assert!(matches!(ctx.representer().await, Err(EngineError::WeightsMissing(_))));
    }
}
