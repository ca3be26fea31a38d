//! Face embedding extraction via ONNX Runtime.
//!
//! Supports the two recognition model families the service ships with. Each
//! [`RecognizerProfile`] fixes the input size, tensor layout, and pixel
//! normalization the exported graph expects.

use crate::alignment;
use crate::types::{BoundingBox, Embedding};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognition model not found: {0}")]
    ModelNotFound(String),
    #[error("unsupported recognition model: {0}")]
    UnsupportedModel(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks to align")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

/// Input contract of one recognition model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecognizerProfile {
    pub name: &'static str,
    pub weights_file: &'static str,
    pub input_size: u32,
    pub layout: TensorLayout,
    pub mean: f32,
    pub std: f32,
    pub embedding_dim: usize,
}

/// FaceNet-512: 160×160 NHWC, pixels scaled to [0, 1].
pub const FACENET512: RecognizerProfile = RecognizerProfile {
    name: "Facenet512",
    weights_file: "facenet512.onnx",
    input_size: 160,
    layout: TensorLayout::Nhwc,
    mean: 0.0,
    std: 255.0,
    embedding_dim: 512,
};

/// ArcFace w600k_r50: 112×112 NCHW, symmetric normalization.
pub const ARCFACE: RecognizerProfile = RecognizerProfile {
    name: "ArcFace",
    weights_file: "w600k_r50.onnx",
    input_size: 112,
    layout: TensorLayout::Nchw,
    mean: 127.5,
    std: 127.5,
    embedding_dim: 512,
};

impl RecognizerProfile {
    /// Look up a profile by model name, case-insensitively.
    pub fn by_name(name: &str) -> Result<Self, RecognizerError> {
        [FACENET512, ARCFACE]
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| RecognizerError::UnsupportedModel(name.to_string()))
    }

    fn tensor(&self, crop: &RgbImage) -> Array4<f32> {
        let size = self.input_size as usize;
        let mut tensor = match self.layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, size, size)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, size, size, 3)),
        };
        for (x, y, px) in crop.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let v = (px.0[c] as f32 - self.mean) / self.std;
                match self.layout {
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = v,
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = v,
                }
            }
        }
        tensor
    }
}

/// Embedding extractor for one loaded model.
pub struct FaceRecognizer {
    session: Session,
    profile: RecognizerProfile,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path, profile: RecognizerProfile) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            model = profile.name,
            "loaded recognition model"
        );

        Ok(Self { session, profile })
    }

    pub fn profile(&self) -> &RecognizerProfile {
        &self.profile
    }

    /// Embed a detected face after aligning it on its landmarks.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(image, landmarks, self.profile.input_size);
        self.embed_crop(&aligned)
    }

    /// Embed the whole image as if it were a face crop.
    pub fn extract_whole(&mut self, image: &RgbImage) -> Result<Embedding, RecognizerError> {
        let size = self.profile.input_size;
        let crop = image::imageops::resize(image, size, size, FilterType::Triangle);
        self.embed_crop(&crop)
    }

    fn embed_crop(&mut self, crop: &RgbImage) -> Result<Embedding, RecognizerError> {
        let input = self.profile.tensor(crop);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != self.profile.embedding_dim {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.profile.embedding_dim,
                raw.len()
            )));
        }

        Ok(Embedding::new(raw.to_vec()).l2_normalized())
    }
}
