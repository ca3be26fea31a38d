use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Which transport surface the daemon presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Long-running server with local-only asset storage.
    Standalone,
    /// Function-platform deployment backed by durable blob storage.
    Serverless,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Standalone => "standalone",
            DeploymentMode::Serverless => "serverless",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standalone" | "server" | "local" => Ok(DeploymentMode::Standalone),
            "serverless" | "function" | "functions" => Ok(DeploymentMode::Serverless),
            other => Err(format!("unknown deployment mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// In-process ONNX Runtime engine.
    Onnx,
    /// External DeepFace-compatible HTTP service.
    Remote,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Onnx => "onnx",
            EngineKind::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Fs,
    Gcs,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub deployment: DeploymentMode,
    /// Root under which the weights directory lives.
    pub home: PathBuf,
    /// Read-only models directory shipped with the deployment, if any.
    pub models_dir: Option<PathBuf>,
    /// Where transient request images are written.
    pub scratch_dir: PathBuf,
    pub engine: EngineKind,
    pub remote_url: Option<String>,
    pub model_name: String,
    /// Base URL for fetching missing ONNX weights by file name.
    pub model_base_url: Option<String>,
    pub storage: StorageKind,
    /// Root directory of the filesystem blob store.
    pub storage_dir: PathBuf,
    pub storage_bucket: String,
    /// Static bearer token for GCS; the metadata server is used when unset.
    pub gcs_token: Option<String>,
    /// Allowed CORS origins; any origin when empty.
    pub cors_origins: Vec<String>,
}

pub const DEFAULT_BUCKET: &str = "kl2pen.firebasestorage.app";

impl Config {
    /// Load configuration from `FACELINK_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let deployment = env_parse("FACELINK_DEPLOYMENT", DeploymentMode::Standalone);

        let home = std::env::var("FACELINK_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home)
            });

        // Serverless platforms only allow writes under /tmp
        let default_scratch = match deployment {
            DeploymentMode::Serverless => PathBuf::from("/tmp/facelink"),
            DeploymentMode::Standalone => std::env::temp_dir().join("facelink"),
        };

        let storage = match std::env::var("FACELINK_STORAGE").as_deref() {
            Ok("gcs") => StorageKind::Gcs,
            Ok("fs") => StorageKind::Fs,
            _ if deployment == DeploymentMode::Serverless => StorageKind::Gcs,
            _ => StorageKind::Fs,
        };

        let engine = match std::env::var("FACELINK_ENGINE").as_deref() {
            Ok("remote") => EngineKind::Remote,
            _ => EngineKind::Onnx,
        };

        Self {
            bind: env_parse("FACELINK_BIND", SocketAddr::from(([0, 0, 0, 0], 5001))),
            deployment,
            models_dir: env_opt("FACELINK_MODELS_DIR").map(PathBuf::from),
            scratch_dir: env_opt("FACELINK_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(default_scratch),
            engine,
            remote_url: env_opt("FACELINK_REMOTE_URL"),
            model_name: env_opt("FACELINK_MODEL_NAME").unwrap_or_else(|| "Facenet512".to_string()),
            model_base_url: env_opt("FACELINK_MODEL_BASE_URL"),
            storage,
            storage_dir: env_opt("FACELINK_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join(".facelink").join("storage")),
            storage_bucket: env_opt("FACELINK_STORAGE_BUCKET")
                .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            gcs_token: env_opt("FACELINK_GCS_TOKEN"),
            cors_origins: env_opt("FACELINK_CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            home,
        }
    }

    /// Directory the embedding engine loads weights from.
    pub fn weights_dir(&self) -> PathBuf {
        self.home.join(".facelink").join("weights")
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
impl Config {
    /// Standalone configuration rooted at `root`, for tests.
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            deployment: DeploymentMode::Standalone,
            home: root.to_path_buf(),
            models_dir: None,
            scratch_dir: root.join("scratch"),
            engine: EngineKind::Onnx,
            remote_url: None,
            model_name: "Facenet512".to_string(),
            model_base_url: None,
            storage: StorageKind::Fs,
            storage_dir: root.join("storage"),
            storage_bucket: DEFAULT_BUCKET.to_string(),
            gcs_token: None,
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_mode_parse() {
        assert_eq!("serverless".parse(), Ok(DeploymentMode::Serverless));
        assert_eq!(" Standalone ".parse(), Ok(DeploymentMode::Standalone));
        assert!("cloud".parse::<DeploymentMode>().is_err());
    }

    #[test]
    fn test_weights_dir_under_home() {
        let cfg = Config::for_tests(std::path::Path::new("/srv/app"));
        assert_eq!(cfg.weights_dir(), PathBuf::from("/srv/app/.facelink/weights"));
    }

    #[test]
    fn test_env_parse_default_when_unset() {
        // Key chosen to never be set by the environment
        let v: u16 = env_parse("FACELINK_TEST_UNSET_PORT_7F3A", 5001);
        assert_eq!(v, 5001);
    }
}
