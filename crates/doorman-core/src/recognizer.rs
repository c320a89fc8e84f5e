//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from aligned face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment;
use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
// Symmetric normalization to [-1, 1]; SCRFD divides by 128 instead.
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (expected w600k_r50.onnx from insightface in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region lies outside the image")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract a unit-length embedding for a detected face in a grayscale image.
    pub fn extract(
        &mut self,
        image: &GrayImage,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let aligned = aligned_crop(image, face)?;
        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Embedding {
            values: raw_data.to_vec(),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        }
        .normalized()
        .ok_or_else(|| RecognizerError::InferenceFailed("zero-norm embedding".into()))
    }

    /// Turn a 112×112 aligned crop into the 1×3×112×112 input tensor, with
    /// the gray channel repeated into all three color planes.
    fn preprocess(aligned_face: &[u8]) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        Array4::from_shape_fn((1, 3, size, size), |(_, _, y, x)| {
            let pixel = aligned_face.get(y * size + x).copied().unwrap_or(0);
            (f32::from(pixel) - ARCFACE_MEAN) / ARCFACE_STD
        })
    }
}

/// Produce the 112×112 ArcFace input for `face`.
///
/// Faces with landmarks are aligned with the similarity transform; faces
/// without (pre-cropped inputs) fall back to a plain crop-and-resize of the box.
fn aligned_crop(image: &GrayImage, face: &BoundingBox) -> Result<Vec<u8>, RecognizerError> {
    if let Some(landmarks) = face.landmarks.as_ref() {
        return Ok(alignment::align_face(
            image.as_raw(),
            image.width(),
            image.height(),
            landmarks,
        ));
    }

    let (x, y, w, h) = face
        .clamped_rect(image.width(), image.height())
        .ok_or(RecognizerError::EmptyCrop)?;
    let crop = imageops::crop_imm(image, x, y, w, h).to_image();
    let size = ARCFACE_INPUT_SIZE as u32;
    Ok(imageops::resize(&crop, size, size, FilterType::Triangle).into_raw())
}
