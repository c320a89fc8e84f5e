//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Default minimum detection score.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (expected det_10g.onnx from insightface in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty image")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    confidence_threshold: f32,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            stride_indices,
        })
    }

    /// Override the minimum detection score.
    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Detect faces in a grayscale image, returning bounding boxes sorted by confidence.
    pub fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyImage);
        }
        let (input, letterbox) = preprocess(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                &letterbox,
                self.confidence_threshold,
            ));
        }

        let mut result = nms(all_detections, SCRFD_NMS_THRESHOLD);
        sort_by_confidence(&mut result);
        Ok(result)
    }
}

/// Letterbox a grayscale image into the square SCRFD input and normalize it
/// into a NCHW tensor (gray replicated across the three channels).
fn preprocess(image: &GrayImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = image.dimensions();
    let size = SCRFD_INPUT_SIZE as f32;
    let scale = (size / width as f32).min(size / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let pad_x = (SCRFD_INPUT_SIZE - new_w) as f32 / 2.0;
    let pad_y = (SCRFD_INPUT_SIZE - new_h) as f32 / 2.0;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let input = SCRFD_INPUT_SIZE as usize;
    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, input, input));
    let (x_off, y_off) = (pad_x.floor() as usize, pad_y.floor() as usize);

    for (x, y, pixel) in resized.enumerate_pixels() {
        let normalized = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (tx, ty) = (x as usize + x_off, y as usize + y_off);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = normalized;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

fn sort_by_confidence(faces: &mut [BoundingBox]) {
    faces.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Discover output tensor ordering by name.
///
/// SCRFD models may export tensors with named outputs ("score_8", "bbox_16", ...) or
/// generic numeric names. If named pattern is detected, maps them to stride slots.
/// Otherwise falls back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    // Try name-based discovery: look for "score_8", "bbox_8", "kps_8" patterns.
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named = SCRFD_STRIDES.iter().all(|&stride| {
        find("score", stride).is_some()
            && find("bbox", stride).is_some()
            && find("kps", stride).is_some()
    });

    if named {
        tracing::info!("SCRFD: using name-based output tensor mapping");
        std::array::from_fn(|i| {
            let stride = SCRFD_STRIDES[i];
            (
                find("score", stride).unwrap_or(i),
                find("bbox", stride).unwrap_or(i + 3),
                find("kps", stride).unwrap_or(i + 6),
            )
        })
    } else {
        // Positional fallback: [scores 8/16/32, bboxes 8/16/32, kps 8/16/32]
        tracing::info!(
            ?names,
            "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes, [6-8]=kps"
        );
        [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let (grid_h, grid_w) = (grid, grid);
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let cy = (anchor_idx / grid_w) as f32;
        let cx = (anchor_idx % grid_w) as f32;

        let anchor_cx = cx * stride as f32;
        let anchor_cy = cy * stride as f32;

        // Decode bbox: [x1_offset, y1_offset, x2_offset, y2_offset] * stride
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = anchor_cx - bboxes[bbox_off] * stride as f32;
        let y1 = anchor_cy - bboxes[bbox_off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[bbox_off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[bbox_off + 3] * stride as f32;

        // Map from letterboxed space to original frame space
        let orig_x1 = (x1 - letterbox.pad_x) / letterbox.scale;
        let orig_y1 = (y1 - letterbox.pad_y) / letterbox.scale;
        let orig_x2 = (x2 - letterbox.pad_x) / letterbox.scale;
        let orig_y2 = (y2 - letterbox.pad_y) / letterbox.scale;

        // Decode landmarks
        let kps_off = idx * 10;
        let landmarks = if kps_off + 9 < kps.len() {
            let mut lms = [(0.0f32, 0.0f32); 5];
            for i in 0..5 {
                let lx = anchor_cx + kps[kps_off + i * 2] * stride as f32;
                let ly = anchor_cy + kps[kps_off + i * 2 + 1] * stride as f32;
                lms[i] = (
                    (lx - letterbox.pad_x) / letterbox.scale,
                    (ly - letterbox.pad_y) / letterbox.scale,
                );
            }
            Some(lms)
        } else {
            None
        };

        detections.push(BoundingBox {
            x: orig_x1,
            y: orig_y1,
            width: orig_x2 - orig_x1,
            height: orig_y2 - orig_y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    sort_by_confidence(&mut detections);

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_w = (x2 - x1).max(0.0);
    let inter_h = (y2 - y1).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = a.width * a.height;
    let area_b = b.width * b.height;
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, size: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: size,
            height: size,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou() {
        let a = face(0.0, 0.0, 20.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &face(40.0, 40.0, 20.0, 1.0)), 0.0);
        // 10x20 overlap over a 600 union.
        let shifted = face(10.0, 0.0, 20.0, 1.0);
        assert!((iou(&a, &shifted) - 200.0 / 600.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_each_cluster() {
        let kept = nms(
            vec![
                face(300.0, 300.0, 40.0, 0.6),
                face(0.0, 0.0, 80.0, 0.95),
                face(4.0, 2.0, 80.0, 0.7),
            ],
            0.4,
        );
        let scores: Vec<f32> = kept.iter().map(|f| f.confidence).collect();
        assert_eq!(scores, vec![0.95, 0.6]);
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_discover_output_indices() {
        let strings = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let grouped = strings(&[
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]);
        assert_eq!(discover_output_indices(&grouped), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);

        let numeric: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&numeric), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_preprocess_letterbox_wide_image() {
        let image = GrayImage::from_pixel(320, 240, image::Luma([200u8]));
        let (tensor, letterbox) = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((letterbox.scale - 2.0).abs() < 1e-6);
        assert_eq!(letterbox.pad_x, 0.0);
        assert!((letterbox.pad_y - 80.0).abs() < 1e-6);

        let inside = (200.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 0, 320, 320]] - inside).abs() < 0.01);
        assert_eq!(tensor[[0, 1, 10, 320]], 0.0, "padding must normalize to zero");
        assert_eq!(tensor[[0, 0, 320, 320]], tensor[[0, 2, 320, 320]]);
    }

    #[test]
    fn test_decode_stride_maps_back_to_frame() {
        // One anchor at grid cell (1, 1) of stride 32, scale 2, no padding.
        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 0.0 };
        let grid = 640 / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let idx = (grid + 1) * SCRFD_ANCHORS_PER_CELL;

        let mut scores = vec![0.0f32; anchors];
        scores[idx] = 0.9;
        let mut bboxes = vec![0.0f32; anchors * 4];
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);
        let kps = vec![0.0f32; anchors * 10];

        let dets = decode_stride(&scores, &bboxes, &kps, 32, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        // Anchor center (32, 32) ± 16 in letterbox space → (8..24) in frame space.
        assert!((d.x - 8.0).abs() < 1e-4);
        assert!((d.y - 8.0).abs() < 1e-4);
        assert!((d.width - 16.0).abs() < 1e-4);
        assert!((d.confidence - 0.9).abs() < 1e-6);
        assert_eq!(d.landmarks.unwrap()[0], (16.0, 16.0));
    }
}
