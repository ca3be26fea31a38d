//! Embedding comparison: cosine similarity, Euclidean distance, match decision.
//!
//! The threshold and confidence bands are tuned for 512-dim FaceNet-class
//! embeddings and are not configurable.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Cosine similarity above which two embeddings are the same person.
pub const MATCH_THRESHOLD: f64 = 0.6;

/// Lower bounds (exclusive) of the confidence bands, highest first.
const VERY_HIGH_ABOVE: f64 = 0.8;
const HIGH_ABOVE: f64 = 0.7;
const MEDIUM_ABOVE: f64 = 0.6;
const LOW_ABOVE: f64 = 0.4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompareError {
    #[error("embeddings must not be empty")]
    EmptyEmbedding,
    #[error("Embedding dimensions mismatch: {left} vs {right}")]
    ShapeMismatch { left: usize, right: usize },
    #[error("Invalid embedding: zero norm")]
    ZeroNorm,
}

/// Coarse confidence band derived from cosine similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    /// Step function of cosine similarity. Each band excludes its lower bound.
    pub fn from_similarity(similarity: f64) -> Self {
        if similarity > VERY_HIGH_ABOVE {
            ConfidenceLevel::VeryHigh
        } else if similarity > HIGH_ABOVE {
            ConfidenceLevel::High
        } else if similarity > MEDIUM_ABOVE {
            ConfidenceLevel::Medium
        } else if similarity > LOW_ABOVE {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::VeryLow
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::VeryLow => "very_low",
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::High => "high",
            ConfidenceLevel::VeryHigh => "very_high",
        }
    }

    /// Human-readable band ranges, highest first.
    pub fn bands() -> [(ConfidenceLevel, &'static str); 5] {
        [
            (ConfidenceLevel::VeryHigh, "> 0.8"),
            (ConfidenceLevel::High, "0.7 - 0.8"),
            (ConfidenceLevel::Medium, "0.6 - 0.7"),
            (ConfidenceLevel::Low, "0.4 - 0.6"),
            (ConfidenceLevel::VeryLow, "< 0.4"),
        ]
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of comparing two embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub is_match: bool,
    pub cosine_similarity: f64,
    pub euclidean_distance: f64,
    pub confidence_level: ConfidenceLevel,
}

/// A similarity of exactly [`MATCH_THRESHOLD`] is not a match.
pub fn is_match(cosine_similarity: f64) -> bool {
    cosine_similarity > MATCH_THRESHOLD
}

/// Compare two embeddings of identical, non-zero length.
///
/// Sums are accumulated in f64 so the result does not depend on the
/// embedding's magnitude range.
pub fn compare(e1: &[f32], e2: &[f32]) -> Result<Comparison, CompareError> {
    if e1.len() != e2.len() {
        return Err(CompareError::ShapeMismatch {
            left: e1.len(),
            right: e2.len(),
        });
    }
    if e1.is_empty() {
        return Err(CompareError::EmptyEmbedding);
    }

    let mut dot = 0.0f64;
    let mut norm1 = 0.0f64;
    let mut norm2 = 0.0f64;
    let mut dist = 0.0f64;

    for (&a, &b) in e1.iter().zip(e2.iter()) {
        let (a, b) = (a as f64, b as f64);
        dot += a * b;
        norm1 += a * a;
        norm2 += b * b;
        dist += (a - b) * (a - b);
    }

    let norm1 = norm1.sqrt();
    let norm2 = norm2.sqrt();
    if norm1 == 0.0 || norm2 == 0.0 {
        return Err(CompareError::ZeroNorm);
    }

    let cosine_similarity = dot / (norm1 * norm2);

    Ok(Comparison {
        is_match: is_match(cosine_similarity),
        cosine_similarity,
        euclidean_distance: dist.sqrt(),
        confidence_level: ConfidenceLevel::from_similarity(cosine_similarity),
    })
}
