//! facelink-core — face photo preprocessing, detection fallback, and
//! embedding comparison.
//!
//! The ONNX pieces (`detector`, `recognizer`, `alignment`) form a local
//! embedding engine. `detection` drives any engine through the backend
//! fallback chain; `compare` decides whether two embeddings match.

pub mod alignment;
pub mod color;
pub mod compare;
pub mod detection;
pub mod detector;
pub mod filters;
pub mod preprocess;
pub mod recognizer;
pub mod types;

pub use compare::{compare, is_match, CompareError, Comparison, ConfidenceLevel, MATCH_THRESHOLD};
pub use detection::{
    AttemptOutcome, Detection, DetectionAttempt, DetectionBackend, DetectionFailure,
    FallbackController, RepresentError, Representer, Strictness,
};
pub use preprocess::ImageError;
pub use types::{BoundingBox, Embedding, FaceRepresentation, FacialArea};
