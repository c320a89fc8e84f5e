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

impl BoundingBox {
    /// Integer crop rectangle `(x, y, width, height)` clamped to a `frame_w` × `frame_h` image.
    ///
    /// Returns `None` when the box lies entirely outside the frame.
    pub fn clamped_rect(&self, frame_w: u32, frame_h: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(frame_w);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(frame_h);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Scale to unit length. Returns `None` for a zero or non-finite vector,
    /// which cannot take part in cosine matching.
    pub fn normalized(self) -> Option<Self> {
        let norm = self.norm();
        if !norm.is_finite() || norm <= f32::EPSILON {
            return None;
        }
        Some(Self {
            values: self.values.iter().map(|x| x / norm).collect(),
            model_version: self.model_version,
        })
    }

    /// Dot product. Both vectors must have the same dimension; extra
    /// components of the longer one are ignored.
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Cosine distance `1 - dot(a, b)`. Both embeddings must be unit-normalized.
    ///
    /// Returns a value in [0, 2]: 0 for identical direction, 2 for opposite.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.dot(other)
    }
}

/// An embedding tagged with the identity it belongs to.
///
/// This is the boundary type produced right after an analyzer call; nothing
/// downstream inspects the analyzer's own output shape.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub identity: String,
    pub embedding: Embedding,
}
