//! In-process ONNX embedding engine.
//!
//! Sessions are not shared across threads, so the detector and recognizer
//! live on one dedicated OS thread that serves `represent` requests over a
//! channel. [`EngineHandle`] is the clone-safe async front end.

use async_trait::async_trait;
use facelink_core::detector::{DetectorError, FaceDetector};
use facelink_core::recognizer::{FaceRecognizer, RecognizerError, RecognizerProfile};
use facelink_core::{
    DetectionBackend, FaceRepresentation, FacialArea, RepresentError, Representer, Strictness,
};
use facelink_store::{AssetError, AssetLocation, AssetManager};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// SCRFD weights served as the `retinaface` backend.
pub const DETECTOR_WEIGHTS: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("model weights unavailable: {0}")]
    WeightsMissing(String),
    #[error("assets: {0}")]
    Assets(#[from] AssetError),
    #[error("weight download failed for {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("remote engine: {0}")]
    Remote(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("engine initialization task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

struct RepresentRequest {
    img_path: PathBuf,
    model_name: String,
    backend: DetectionBackend,
    strictness: Strictness,
    reply: oneshot::Sender<Result<Vec<FaceRepresentation>, RepresentError>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<RepresentRequest>,
}

#[async_trait]
impl Representer for EngineHandle {
    async fn represent(
        &self,
        img_path: &Path,
        model_name: &str,
        backend: DetectionBackend,
        strictness: Strictness,
    ) -> Result<Vec<FaceRepresentation>, RepresentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RepresentRequest {
                img_path: img_path.to_path_buf(),
                model_name: model_name.to_string(),
                backend,
                strictness,
                reply,
            })
            .await
            .map_err(|_| RepresentError::Engine("engine thread exited".into()))?;
        rx.await
            .map_err(|_| RepresentError::Engine("engine thread exited".into()))?
    }
}

/// Make the detector and recognizer weights available locally.
///
/// Falls back to `<base_url>/<file>` for weights the asset manager cannot
/// provide.
pub async fn prepare_weights(
    assets: &AssetManager,
    profile: &RecognizerProfile,
    base_url: Option<&str>,
) -> Result<(PathBuf, PathBuf), EngineError> {
    let mut paths = Vec::with_capacity(2);
    for name in [DETECTOR_WEIGHTS, profile.weights_file] {
        let path = match assets.ensure_local(name).await? {
            AssetLocation::Missing(path) => match base_url {
                Some(base) => {
                    fetch_weights(base, name, &path).await?;
                    path
                }
                None => return Err(EngineError::WeightsMissing(path.display().to_string())),
            },
            found => {
                tracing::debug!(model = name, location = ?found, "weights available");
                found.path().to_path_buf()
            }
        };
        paths.push(path);
    }
    let recognizer = paths.pop().unwrap_or_default();
    let detector = paths.pop().unwrap_or_default();
    Ok((detector, recognizer))
}

/// Download one weight file and move it into place atomically.
async fn fetch_weights(base_url: &str, name: &str, dest: &Path) -> Result<(), EngineError> {
    let url = format!("{}/{name}", base_url.trim_end_matches('/'));
    let download_err = |reason: String| EngineError::Download {
        url: url.clone(),
        reason,
    };
    tracing::info!(%url, "downloading model weights");

    let resp = reqwest::get(&url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| download_err(e.to_string()))?;
    let bytes = resp.bytes().await.map_err(|e| download_err(e.to_string()))?;

    let size = bytes.len();
    facelink_store::write_atomic(dest.to_path_buf(), bytes.to_vec())
        .await
        .map_err(|e| download_err(format!("{}: {e}", dest.display())))?;

    tracing::info!(model = name, bytes = size, "model weights downloaded");
    Ok(())
}

/// Load both models and spawn the engine thread. Blocking; fails fast if
/// either model cannot be loaded.
pub fn spawn_engine(
    detector_path: &Path,
    recognizer_path: &Path,
    profile: RecognizerProfile,
) -> Result<EngineHandle, EngineError> {
    let mut detector = FaceDetector::load(detector_path)?;
    let mut recognizer = FaceRecognizer::load(recognizer_path, profile)?;

    let (tx, mut rx) = mpsc::channel::<RepresentRequest>(8);

    std::thread::Builder::new()
        .name("facelink-engine".into())
        .spawn(move || {
            tracing::info!(model = profile.name, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = run_represent(&mut detector, &mut recognizer, &req);
                let _ = req.reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_represent(
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
    req: &RepresentRequest,
) -> Result<Vec<FaceRepresentation>, RepresentError> {
    check_request(recognizer.profile(), &req.model_name, req.backend)?;

    let image = image::open(&req.img_path)
        .map_err(|e| RepresentError::Engine(format!("failed to read {}: {e}", req.img_path.display())))?
        .to_rgb8();

    let faces = detector
        .detect(&image)
        .map_err(|e| RepresentError::Engine(e.to_string()))?;

    if faces.is_empty() {
        return match req.strictness {
            Strictness::Strict => Err(RepresentError::NoFaceDetected(
                req.img_path.display().to_string(),
            )),
            Strictness::Relaxed => {
                tracing::debug!("no face localized, embedding whole frame");
                let embedding = recognizer
                    .extract_whole(&image)
                    .map_err(|e| RepresentError::Engine(e.to_string()))?;
                Ok(vec![FaceRepresentation {
                    embedding,
                    facial_area: Some(FacialArea {
                        x: 0,
                        y: 0,
                        w: image.width() as i32,
                        h: image.height() as i32,
                    }),
                    face_confidence: 0.0,
                }])
            }
        };
    }

    faces
        .iter()
        .map(|face| {
            let embedding = recognizer
                .extract(&image, face)
                .map_err(|e| RepresentError::Engine(e.to_string()))?;
            Ok(FaceRepresentation {
                embedding,
                facial_area: Some(FacialArea::from(face)),
                face_confidence: face.confidence,
            })
        })
        .collect()
}

/// Reject requests this engine cannot serve before touching the image.
fn check_request(
    profile: &RecognizerProfile,
    model_name: &str,
    backend: DetectionBackend,
) -> Result<(), RepresentError> {
    if !profile.name.eq_ignore_ascii_case(model_name) {
        return Err(RepresentError::ModelUnavailable(model_name.to_string()));
    }
    if backend != DetectionBackend::RetinaFace {
        return Err(RepresentError::BackendUnavailable(backend));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use facelink_core::recognizer::{ARCFACE, FACENET512};
    use facelink_store::{MemoryBlobStore, SyncPolicy};
    use std::sync::Arc;

    #[test]
    fn test_check_request_backends() {
        assert!(check_request(&FACENET512, "Facenet512", DetectionBackend::RetinaFace).is_ok());
        for b in [DetectionBackend::Mtcnn, DetectionBackend::OpenCv, DetectionBackend::Ssd] {
            assert!(matches!(
                check_request(&FACENET512, "Facenet512", b),
                Err(RepresentError::BackendUnavailable(x)) if x == b
            ));
        }
    }

    #[test]
    fn test_check_request_model_name() {
        assert!(check_request(&ARCFACE, "arcface", DetectionBackend::RetinaFace).is_ok());
        assert!(matches!(
            check_request(&ARCFACE, "Facenet512", DetectionBackend::RetinaFace),
            Err(RepresentError::ModelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_prepare_weights_uses_local_files() {
        let tmp = tempfile::tempdir().unwrap();
        let weights = tmp.path().join("weights");
        std::fs::create_dir_all(&weights).unwrap();
        std::fs::write(weights.join(DETECTOR_WEIGHTS), b"d").unwrap();
        std::fs::write(weights.join(FACENET512.weights_file), b"r").unwrap();

        let assets = AssetManager::new(&weights, Arc::new(MemoryBlobStore::new()), SyncPolicy::LocalOnly);
        let (det, rec) = prepare_weights(&assets, &FACENET512, None).await.unwrap();
        assert_eq!(det, weights.join(DETECTOR_WEIGHTS));
        assert_eq!(rec, weights.join("facenet512.onnx"));
    }

    #[tokio::test]
    async fn test_prepare_weights_missing_without_base_url() {
        let tmp = tempfile::tempdir().unwrap();
        let assets = AssetManager::new(
            tmp.path().join("weights"),
            Arc::new(MemoryBlobStore::new()),
            SyncPolicy::Durable,
        );
        let err = prepare_weights(&assets, &ARCFACE, None).await.unwrap_err();
        assert!(matches!(err, EngineError::WeightsMissing(p) if p.ends_with(DETECTOR_WEIGHTS)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_weight_downloads_land_once() {
        let app = axum::Router::new().route(
            "/det_10g.onnx",
            axum::routing::get(|| async { vec![7u8; 512 * 1024] }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join(DETECTOR_WEIGHTS);
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let base = base.clone();
            let dest = dest.clone();
            tasks.push(tokio::spawn(async move {
                fetch_weights(&base, DETECTOR_WEIGHTS, &dest).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(std::fs::read(&dest).unwrap(), vec![7u8; 512 * 1024]);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_handle_reports_closed_engine() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = EngineHandle { tx };
        let err = handle
            .represent(Path::new("/nonexistent.jpg"), "Facenet512", DetectionBackend::RetinaFace, Strictness::Strict)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "engine thread exited");
    }
}
