//! The face-analysis seam: detection plus embedding behind one trait.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MODEL_VERSION};
use crate::types::{BoundingBox, Embedding};
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Face detector + embedder.
///
/// Methods take `&mut self` because inference sessions are stateful; callers
/// that need the analyzer on another thread move it there.
pub trait FaceAnalyzer: Send {
    /// Detect faces, most confident first. An empty vector means no face.
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, AnalyzerError>;

    /// Embed one detected face.
    fn embed(&mut self, image: &GrayImage, face: &BoundingBox) -> Result<Embedding, AnalyzerError>;

    /// Identifier of the embedding model, recorded in the persisted cache.
    fn model_version(&self) -> Option<&str> {
        None
    }

    /// Detect and embed the most confident face in `image`.
    fn embed_best(&mut self, image: &GrayImage) -> Result<(BoundingBox, Embedding), AnalyzerError> {
        let face = self
            .detect(image)?
            .into_iter()
            .next()
            .ok_or(AnalyzerError::NoFaceDetected)?;
        let embedding = self.embed(image, &face)?;
        Ok((face, embedding))
    }
}

/// SCRFD detection + ArcFace embedding via ONNX Runtime.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceAnalyzer {
    pub fn load(
        scrfd_path: &Path,
        arcface_path: &Path,
        detection_confidence: f32,
    ) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(scrfd_path)?.with_confidence_threshold(detection_confidence);
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
        Ok(self.detector.detect(image)?)
    }

    fn embed(&mut self, image: &GrayImage, face: &BoundingBox) -> Result<Embedding, AnalyzerError> {
        self.recognizer.extract(image, face).map_err(|e| match e {
            RecognizerError::EmptyCrop | RecognizerError::InferenceFailed(_) => {
                AnalyzerError::EmbeddingFailed(e.to_string())
            }
            other => AnalyzerError::Recognizer(other),
        })
    }

    fn model_version(&self) -> Option<&str> {
        Some(ARCFACE_MODEL_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        faces: Vec<BoundingBox>,
    }

    impl FaceAnalyzer for Fixed {
        fn detect(&mut self, _image: &GrayImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
            Ok(self.faces.clone())
        }

        fn embed(&mut self, _image: &GrayImage, face: &BoundingBox) -> Result<Embedding, AnalyzerError> {
            Ok(Embedding::new(vec![face.confidence, 1.0]))
        }
    }

    fn bbox(confidence: f32) -> BoundingBox {
        BoundingBox {
            x: 0.0, y: 0.0, width: 10.0, height: 10.0,
            confidence, landmarks: None,
        }
    }

    #[test]
    fn test_embed_best_uses_first_face() {
        let mut analyzer = Fixed { faces: vec![bbox(0.9), bbox(0.6)] };
        let (face, embedding) = analyzer.embed_best(&GrayImage::new(4, 4)).unwrap();
        assert_eq!(face.confidence, 0.9);
        assert_eq!(embedding.values, vec![0.9, 1.0]);
    }

    #[test]
    fn test_embed_best_no_face() {
        let mut analyzer = Fixed { faces: vec![] };
        let err = analyzer.embed_best(&GrayImage::new(4, 4)).unwrap_err();
        assert!(matches!(err, AnalyzerError::NoFaceDetected));
    }
}
