//! Multi-backend face detection fallback.
//!
//! The embedding engine is a black box that, given an image on disk, a
//! detector backend, and a strictness mode, either returns one
//! representation per detected face or fails. [`FallbackController`] drives
//! it over the backends in priority order, first in strict mode and then in
//! relaxed mode, and returns the first success.
//!
//! When every attempt fails, only the error of the last attempt is reported.
//! Earlier diagnostics are discarded; `probe` exists to recover them.

use crate::preprocess::{self, ImageError};
use crate::types::{Embedding, FaceRepresentation, FacialArea};
use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Face detector backends, in descending order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionBackend {
    RetinaFace,
    Mtcnn,
    OpenCv,
    Ssd,
}

impl DetectionBackend {
    /// All backends, most accurate first.
    pub const ALL: [DetectionBackend; 4] = [
        DetectionBackend::RetinaFace,
        DetectionBackend::Mtcnn,
        DetectionBackend::OpenCv,
        DetectionBackend::Ssd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionBackend::RetinaFace => "retinaface",
            DetectionBackend::Mtcnn => "mtcnn",
            DetectionBackend::OpenCv => "opencv",
            DetectionBackend::Ssd => "ssd",
        }
    }
}

impl fmt::Display for DetectionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown detector backend: {0}")]
pub struct UnknownBackend(pub String);

impl FromStr for DetectionBackend {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DetectionBackend::ALL
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownBackend(s.to_string()))
    }
}

/// Whether the engine must localize a face before embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Fail outright when no face is found.
    Strict,
    /// Best effort: embed even when localization fails.
    Relaxed,
}

impl Strictness {
    pub fn enforce_detection(&self) -> bool {
        matches!(self, Strictness::Strict)
    }
}

#[derive(Debug, Error, Clone)]
pub enum RepresentError {
    #[error("Face could not be detected in {0}. Please confirm that the picture is a face photo or consider relaxing detection.")]
    NoFaceDetected(String),
    #[error("detector backend {0} is not available in this engine")]
    BackendUnavailable(DetectionBackend),
    #[error("model {0} is not loaded")]
    ModelUnavailable(String),
    #[error("{0}")]
    Engine(String),
}

/// The external embedding engine.
#[async_trait]
pub trait Representer: Send + Sync {
    /// Represent every face found in the image at `img_path`.
    async fn represent(
        &self,
        img_path: &Path,
        model_name: &str,
        backend: DetectionBackend,
        strictness: Strictness,
    ) -> Result<Vec<FaceRepresentation>, RepresentError>;
}

/// Successful detection: the first face's embedding plus provenance.
#[derive(Debug, Clone)]
pub struct Detection {
    pub embedding: Embedding,
    pub facial_area: Option<FacialArea>,
    pub faces_count: usize,
    pub backend: DetectionBackend,
    pub strictness: Strictness,
}

#[derive(Debug, Error)]
pub enum DetectionFailure {
    /// Every backend failed in both modes. Carries the last attempt's error.
    #[error("No face could be detected. Last error: {last_error}")]
    NoFace { last_error: String },
    #[error("failed to prepare image for detection: {0}")]
    Scratch(#[from] std::io::Error),
    #[error("failed to prepare image for detection: {0}")]
    Encode(#[from] ImageError),
}

/// Outcome of one `represent` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttemptOutcome {
    Faces { faces_detected: usize },
    Failed { error: String },
}

/// One backend/strictness attempt, used for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionAttempt {
    pub backend: DetectionBackend,
    pub enforce_detection: bool,
    pub success: bool,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

const NO_FACES_RETURNED: &str = "no faces returned";

/// Drives a [`Representer`] across backends and strictness modes.
pub struct FallbackController {
    backends: Vec<DetectionBackend>,
    model_name: String,
    scratch_dir: PathBuf,
}

impl FallbackController {
    /// Controller over all backends, writing transient images to `scratch_dir`.
    pub fn new(model_name: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            backends: DetectionBackend::ALL.to_vec(),
            model_name: model_name.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Replace the backend priority list.
    pub fn with_backends(mut self, backends: Vec<DetectionBackend>) -> Self {
        self.backends = backends;
        self
    }

    pub fn backends(&self) -> &[DetectionBackend] {
        &self.backends
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Embed the first face found, trying a strict pass then a relaxed pass.
    ///
    /// Makes at most `2 × backends` engine calls and none after the first
    /// success. The scratch file is removed on every exit path.
    pub async fn detect_and_embed(
        &self,
        representer: &dyn Representer,
        image: &RgbImage,
    ) -> Result<Detection, DetectionFailure> {
        let scratch = self.write_scratch(image)?;
        let path = scratch.path();

        let mut last_error: Option<String> = None;

        for strictness in [Strictness::Strict, Strictness::Relaxed] {
            if strictness == Strictness::Relaxed {
                tracing::info!("strict detection failed on all backends, retrying relaxed");
            }
            for &backend in &self.backends {
                tracing::debug!(%backend, ?strictness, "trying detector backend");
                match representer
                    .represent(path, &self.model_name, backend, strictness)
                    .await
                {
                    Ok(faces) if !faces.is_empty() => {
                        tracing::info!(
                            %backend,
                            ?strictness,
                            faces = faces.len(),
                            "detection succeeded"
                        );
                        let faces_count = faces.len();
                        let first = faces.into_iter().next().ok_or_else(|| {
                            DetectionFailure::NoFace {
                                last_error: NO_FACES_RETURNED.to_string(),
                            }
                        })?;
                        return Ok(Detection {
                            embedding: first.embedding,
                            facial_area: first.facial_area,
                            faces_count,
                            backend,
                            strictness,
                        });
                    }
                    Ok(_) => {
                        tracing::debug!(%backend, ?strictness, "backend returned no faces");
                        last_error = Some(NO_FACES_RETURNED.to_string());
                    }
                    Err(e) => {
                        tracing::debug!(%backend, ?strictness, error = %e, "backend failed");
                        last_error = Some(e.to_string());
                    }
                }
            }
        }

        let last_error = last_error.unwrap_or_else(|| "no detector backends configured".into());
        tracing::warn!(error = %last_error, "no face detected on any backend");
        Err(DetectionFailure::NoFace { last_error })
    }

    /// Try every backend in both modes without stopping early.
    pub async fn probe(
        &self,
        representer: &dyn Representer,
        image: &RgbImage,
    ) -> Result<Vec<DetectionAttempt>, DetectionFailure> {
        let scratch = self.write_scratch(image)?;
        let path = scratch.path();

        let mut attempts = Vec::with_capacity(self.backends.len() * 2);
        for &backend in &self.backends {
            for strictness in [Strictness::Strict, Strictness::Relaxed] {
                let outcome = match representer
                    .represent(path, &self.model_name, backend, strictness)
                    .await
                {
                    Ok(faces) if !faces.is_empty() => AttemptOutcome::Faces {
                        faces_detected: faces.len(),
                    },
                    Ok(_) => AttemptOutcome::Failed {
                        error: NO_FACES_RETURNED.to_string(),
                    },
                    Err(e) => AttemptOutcome::Failed {
                        error: e.to_string(),
                    },
                };
                attempts.push(DetectionAttempt {
                    backend,
                    enforce_detection: strictness.enforce_detection(),
                    success: matches!(outcome, AttemptOutcome::Faces { .. }),
                    outcome,
                });
            }
        }
        Ok(attempts)
    }

    /// Write the image to a uniquely named JPEG that is deleted on drop.
    fn write_scratch(&self, image: &RgbImage) -> Result<NamedTempFile, DetectionFailure> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let bytes = preprocess::encode_jpeg(image)?;
        let mut file = tempfile::Builder::new()
            .prefix("process_image_")
            .suffix(".jpg")
            .tempfile_in(&self.scratch_dir)?;
        file.write_all(&bytes)?;
        file.flush()?;
        tracing::debug!(path = %file.path().display(), "wrote scratch image");
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Script = HashMap<(DetectionBackend, Strictness), Result<usize, String>>;

    /// Scripted engine: each (backend, strictness) either yields N faces or an error.
    /// Missing entries fail with "<backend>/<mode> failed".
    struct ScriptedRepresenter {
        script: Script,
        calls: Mutex<Vec<(DetectionBackend, Strictness)>>,
        seen_paths: Mutex<Vec<PathBuf>>,
    }

    impl ScriptedRepresenter {
        fn new(script: Script) -> Self {
            Self {
                script,
                calls: Mutex::new(Vec::new()),
                seen_paths: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(DetectionBackend, Strictness)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Representer for ScriptedRepresenter {
        async fn represent(
            &self,
            img_path: &Path,
            _model_name: &str,
            backend: DetectionBackend,
            strictness: Strictness,
        ) -> Result<Vec<FaceRepresentation>, RepresentError> {
            assert!(img_path.exists(), "scratch image must exist during the call");
            self.calls.lock().unwrap().push((backend, strictness));
            self.seen_paths.lock().unwrap().push(img_path.to_path_buf());

            match self.script.get(&(backend, strictness)) {
                Some(Ok(n)) => Ok((0..*n)
                    .map(|i| FaceRepresentation {
                        embedding: Embedding::new(vec![i as f32 + 1.0; 4]),
                        facial_area: None,
                        face_confidence: 0.9,
                    })
                    .collect()),
                Some(Err(msg)) => Err(RepresentError::Engine(msg.clone())),
                None => Err(RepresentError::Engine(format!(
                    "{backend}/{} failed",
                    if strictness.enforce_detection() { "strict" } else { "relaxed" }
                ))),
            }
        }
    }

    fn image() -> RgbImage {
        RgbImage::from_pixel(32, 32, image::Rgb([100, 120, 140]))
    }

    fn controller(dir: &Path) -> FallbackController {
        FallbackController::new("Facenet512", dir)
    }

    #[tokio::test]
    async fn test_first_strict_success_stops_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let mut script = Script::new();
        script.insert((DetectionBackend::RetinaFace, Strictness::Strict), Ok(1));
        let rep = ScriptedRepresenter::new(script);

        let d = controller(dir.path()).detect_and_embed(&rep, &image()).await.unwrap();
        assert_eq!(d.backend, DetectionBackend::RetinaFace);
        assert_eq!(d.strictness, Strictness::Strict);
        assert_eq!(d.faces_count, 1);
        assert_eq!(rep.calls(), vec![(DetectionBackend::RetinaFace, Strictness::Strict)]);
    }

    #[tokio::test]
    async fn test_falls_back_to_later_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut script = Script::new();
        script.insert((DetectionBackend::OpenCv, Strictness::Strict), Ok(3));
        script.insert((DetectionBackend::Ssd, Strictness::Strict), Ok(1));
        let rep = ScriptedRepresenter::new(script);

        let d = controller(dir.path()).detect_and_embed(&rep, &image()).await.unwrap();
        assert_eq!(d.backend, DetectionBackend::OpenCv);
        assert_eq!(d.faces_count, 3);
        // First face's embedding is selected
        assert_eq!(d.embedding.values, vec![1.0; 4]);
        assert_eq!(
            rep.calls(),
            vec![
                (DetectionBackend::RetinaFace, Strictness::Strict),
                (DetectionBackend::Mtcnn, Strictness::Strict),
                (DetectionBackend::OpenCv, Strictness::Strict),
            ]
        );
    }

    #[tokio::test]
    async fn test_relaxed_pass_after_strict_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let mut script = Script::new();
        script.insert((DetectionBackend::Mtcnn, Strictness::Relaxed), Ok(1));
        let rep = ScriptedRepresenter::new(script);

        let d = controller(dir.path()).detect_and_embed(&rep, &image()).await.unwrap();
        assert_eq!(d.backend, DetectionBackend::Mtcnn);
        assert_eq!(d.strictness, Strictness::Relaxed);
        // 4 strict + 2 relaxed
        assert_eq!(rep.calls().len(), 6);
        assert!(rep.calls()[..4].iter().all(|(_, s)| *s == Strictness::Strict));
    }

    #[tokio::test]
    async fn test_total_failure_reports_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let rep = ScriptedRepresenter::new(Script::new());

        let err = controller(dir.path())
            .detect_and_embed(&rep, &image())
            .await
            .unwrap_err();
        match err {
            DetectionFailure::NoFace { last_error } => {
                assert_eq!(last_error, "ssd/relaxed failed");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(rep.calls().len(), 2 * DetectionBackend::ALL.len());
    }

    #[tokio::test]
    async fn test_failure_message_format() {
        let dir = tempfile::tempdir().unwrap();
        let rep = ScriptedRepresenter::new(Script::new());
        let err = controller(dir.path())
            .with_backends(vec![DetectionBackend::OpenCv])
            .detect_and_embed(&rep, &image())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "No face could be detected. Last error: opencv/relaxed failed"
        );
    }

    #[tokio::test]
    async fn test_empty_result_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut script = Script::new();
        for b in DetectionBackend::ALL {
            script.insert((b, Strictness::Strict), Ok(0));
            script.insert((b, Strictness::Relaxed), Ok(0));
        }
        let rep = ScriptedRepresenter::new(script);
        let err = controller(dir.path())
            .detect_and_embed(&rep, &image())
            .await
            .unwrap_err();
        assert!(err.to_string().ends_with(NO_FACES_RETURNED));
        assert_eq!(rep.calls().len(), 8);
    }

    #[tokio::test]
    async fn test_scratch_file_removed_on_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();

        let mut script = Script::new();
        script.insert((DetectionBackend::Mtcnn, Strictness::Strict), Ok(1));
        let ok = ScriptedRepresenter::new(script);
        controller(dir.path()).detect_and_embed(&ok, &image()).await.unwrap();

        let fail = ScriptedRepresenter::new(Script::new());
        let _ = controller(dir.path()).detect_and_embed(&fail, &image()).await;

        for rep in [&ok, &fail] {
            for p in rep.seen_paths.lock().unwrap().iter() {
                assert!(!p.exists(), "scratch file {} left behind", p.display());
            }
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_scratch_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("processing").join("deep");
        let mut script = Script::new();
        script.insert((DetectionBackend::RetinaFace, Strictness::Strict), Ok(1));
        let rep = ScriptedRepresenter::new(script);
        FallbackController::new("Facenet512", &nested)
            .detect_and_embed(&rep, &image())
            .await
            .unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_probe_reports_every_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let mut script = Script::new();
        script.insert((DetectionBackend::RetinaFace, Strictness::Strict), Ok(2));
        let rep = ScriptedRepresenter::new(script);

        let attempts = controller(dir.path()).probe(&rep, &image()).await.unwrap();
        assert_eq!(attempts.len(), 8);
        assert!(attempts[0].success);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Faces { faces_detected: 2 });
        assert!(!attempts[1].success);
        assert!(!attempts[1].enforce_detection);
        assert_eq!(attempts[7].backend, DetectionBackend::Ssd);
    }

    #[test]
    fn test_backend_order_and_names() {
        let names: Vec<&str> = DetectionBackend::ALL.iter().map(|b| b.as_str()).collect();
        assert_eq!(names, ["retinaface", "mtcnn", "opencv", "ssd"]);
        assert_eq!("MTCNN".parse::<DetectionBackend>(), Ok(DetectionBackend::Mtcnn));
        assert!("dlib".parse::<DetectionBackend>().is_err());
    }

    #[test]
    fn test_attempt_serialization() {
        let a = DetectionAttempt {
            backend: DetectionBackend::Ssd,
            enforce_detection: true,
            success: false,
            outcome: AttemptOutcome::Failed { error: "boom".into() },
        };
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["backend"], "ssd");
        assert_eq!(v["error"], "boom");
        assert_eq!(v["success"], false);
    }
}
