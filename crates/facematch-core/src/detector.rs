//! Face detection: the [`Detector`] seam and an SCRFD implementation on ONNX Runtime.
//!
//! SCRFD is anchor-free over three strides. Each stride emits scores, box
//! offsets and five keypoints per anchor; the first three keypoints are the
//! eyes and nose.

use crate::types::{BoundingBox, DetectedFace, Landmarks, Point};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_KEYPOINTS: usize = 5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("detection failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces and their eye/nose landmarks in an RGB image.
///
/// Zero faces is a normal result. Order is stable within a call.
pub trait Detector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectorError>;
}

/// Scale and padding applied when fitting the image into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, side: u32) -> (Self, u32, u32) {
        let scale = (side as f32 / width as f32).min(side as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, side);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, side);
        let letterbox = Self {
            scale,
            pad_x: ((side - new_w) / 2) as f32,
            pad_y: ((side - new_h) / 2) as f32,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point from network input space back to the source image.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Where a stride's three output tensors live in the session outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD face detector (e.g. `det_10g.onnx`).
pub struct ScrfdDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
    confidence_threshold: f32,
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let outputs = stride_outputs(&names);

        tracing::info!(path = %model_path.display(), ?outputs, "loaded SCRFD detector");

        Ok(Self {
            session,
            outputs,
            confidence_threshold: SCRFD_CONFIDENCE_THRESHOLD,
        })
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }
}

impl Detector for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectorError> {
        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in self.outputs.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data.to_vec())
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(slot.score, "scores")?;
            let boxes = extract(slot.bbox, "boxes")?;
            let kps = extract(slot.kps, "keypoints")?;

            candidates.extend(decode_stride(
                &scores,
                &boxes,
                &kps,
                stride,
                &letterbox,
                self.confidence_threshold,
            ));
        }

        let faces = suppress_overlaps(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "detection complete");
        Ok(faces)
    }
}

/// Letterbox the image into a normalized 1×3×640×640 tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let side = SCRFD_INPUT_SIZE;
    let (letterbox, new_w, new_h) = Letterbox::fit(image.width(), image.height(), side);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, side as usize, side as usize));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, oy + y as usize, ox + x as usize]] =
                (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Resolve output indices by tensor name (`score_8`, `bbox_16`, ...), falling
/// back to the usual positional layout of scores, then boxes, then keypoints.
fn stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideOutputs {
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
                kps: find("kps", stride)?,
            })
        })
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized; using positional layout");
            std::array::from_fn(|i| StrideOutputs {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<DetectedFace> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let step = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * step;
            let ay = (cell / grid_w) as f32 * step;

            let b = boxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.unmap(ax - b[0] * step, ay - b[1] * step);
            let (x2, y2) = letterbox.unmap(ax + b[2] * step, ay + b[3] * step);

            let k = kps.get(idx * SCRFD_KEYPOINTS * 2..(idx + 1) * SCRFD_KEYPOINTS * 2)?;
            let point = |i: usize| {
                let (x, y) = letterbox.unmap(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step);
                Point::new(x, y)
            };

            Some(DetectedFace {
                bbox: BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                },
                landmarks: Landmarks {
                    left_eye: point(0),
                    right_eye: point(1),
                    nose: point(2),
                },
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence, highest first.
fn suppress_overlaps(mut faces: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<DetectedFace> = Vec::with_capacity(faces.len());
    for face in faces {
        if kept.iter().all(|k| iou(&k.bbox, &face.bbox) <= iou_threshold) {
            kept.push(face);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, size: f32, confidence: f32) -> DetectedFace {
        let p = Point::new(x + size / 2.0, y + size / 2.0);
        DetectedFace {
            bbox: BoundingBox {
                x,
                y,
                width: size,
                height: size,
            },
            landmarks: Landmarks {
                left_eye: p,
                right_eye: p,
                nose: p,
            },
            confidence,
        }
    }

    #[test]
    fn test_iou() {
        let a = face(0.0, 0.0, 10.0, 1.0).bbox;
        let b = BoundingBox {
            x: 5.0,
            y: 0.0,
            width: 10.0,
            height: 10.0,
        };
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(iou(&a, &face(20.0, 20.0, 10.0, 1.0).bbox), 0.0);
    }

    #[test]
    fn test_suppress_overlaps_keeps_best() {
        let kept = suppress_overlaps(
            vec![
                face(5.0, 5.0, 100.0, 0.8),
                face(200.0, 200.0, 50.0, 0.7),
                face(0.0, 0.0, 100.0, 0.9),
            ],
            SCRFD_NMS_THRESHOLD,
        );
        let confidences: Vec<f32> = kept.iter().map(|f| f.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_letterbox_round_trip() {
        let (lb, new_w, new_h) = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        assert_eq!((new_w, new_h), (640, 480));
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);

        let (x, y) = lb.unmap(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let image = RgbImage::from_pixel(320, 240, image::Rgb([255, 255, 255]));
        let (tensor, _) = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 1, 320, 320]];
        assert!((inside - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
    }

    #[test]
    fn test_stride_outputs_by_name() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let outputs = stride_outputs(&names);
        assert_eq!(outputs[0], StrideOutputs { score: 2, bbox: 0, kps: 1 });
        assert_eq!(outputs[2], StrideOutputs { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_stride_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        let outputs = stride_outputs(&names);
        assert_eq!(outputs[1], StrideOutputs { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_decode_stride_maps_landmarks() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let stride = 32;
        let anchors = (640 / stride) * (640 / stride) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let boxes = vec![1.0f32; anchors * 4];
        let mut kps = vec![0.0f32; anchors * 10];

        // Anchor 2 → cell 1 → grid (1, 0) → anchor centre (32, 0).
        scores[2] = 0.95;
        kps[20..26].copy_from_slice(&[-0.5, 1.0, 0.5, 1.0, 0.0, 1.5]);

        let faces = decode_stride(&scores, &boxes, &kps, stride, &lb, 0.5);
        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert_eq!(f.bbox.x, 0.0);
        assert_eq!(f.bbox.width, 64.0);
        assert_eq!(f.landmarks.left_eye, Point::new(16.0, 32.0));
        assert_eq!(f.landmarks.right_eye, Point::new(48.0, 32.0));
        assert_eq!(f.landmarks.nose, Point::new(32.0, 48.0));
    }
}
