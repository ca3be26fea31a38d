use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face region reported alongside an embedding, in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacialArea {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl From<&BoundingBox> for FacialArea {
    fn from(b: &BoundingBox) -> Self {
        Self {
            x: b.x.round() as i32,
            y: b.y.round() as i32,
            w: b.width.round() as i32,
            h: b.height.round() as i32,
        }
    }
}

/// Face embedding vector (512-dimensional for the supported recognition models).
///
/// Serializes as a bare JSON array of floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Return a unit-length copy. A zero vector is returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            Embedding::new(self.values.iter().map(|x| x / norm).collect())
        } else {
            self.clone()
        }
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// One face returned by a representation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRepresentation {
    pub embedding: Embedding,
    pub facial_area: Option<FacialArea>,
    /// Detector confidence; 0.0 when the face was not localized (relaxed mode).
    pub face_confidence: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalized_unit_length() {
        let e = Embedding::new(vec![3.0, 4.0]);
        let n = e.l2_normalized();
        assert!((n.values[0] - 0.6).abs() < 1e-6);
        assert!((n.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalized_zero_vector_unchanged() {
        let e = Embedding::new(vec![0.0; 4]);
        assert_eq!(e.l2_normalized(), e);
    }

    #[test]
    fn test_embedding_serializes_as_array() {
        let e = Embedding::new(vec![1.0, 0.5]);
        assert_eq!(serde_json::to_string(&e).unwrap(), "[1.0,0.5]");
    }

    #[test]
    fn test_facial_area_from_bbox_rounds() {
        let b = BoundingBox {
            x: 10.4,
            y: 20.6,
            width: 99.5,
            height: 120.2,
            confidence: 0.9,
            landmarks: None,
        };
        let area = FacialArea::from(&b);
        assert_eq!(area, FacialArea { x: 10, y: 21, w: 100, h: 120 });
    }
}
