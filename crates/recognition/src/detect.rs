//! ONNX face detector (SCRFD-family model with 5-point landmarks).
//!
//! The model takes a 640x640 letterboxed RGB input and emits, per stride
//! (8/16/32), anchor scores, box distances, and landmark offsets. Decoding,
//! NMS, and the landmark-based pose estimate are plain functions so they can
//! be tested without a model file.

use std::path::Path;
use std::sync::Arc;

use image::RgbImage;
use image::imageops::{self, FilterType};
use ndarray::{Array4, CowArray, IxDyn};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use tracing::{debug, info};
use vigil_protocol::BoundingBox;

use crate::error::RecognitionError;
use crate::types::{FaceDetection, Landmarks, RecognitionFrame};

pub const DETECT_MODEL_FILE: &str = "scrfd_2.5g_kps.onnx";

pub const INPUT_SIZE: u32 = 640;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const NMS_IOU: f32 = 0.4;

pub struct FaceDetector {
    session: Session,
}

impl FaceDetector {
    pub fn load(env: &Arc<Environment>, model_dir: &Path) -> Result<Self, RecognitionError> {
        let path = model_dir.join(DETECT_MODEL_FILE);
        let session = SessionBuilder::new(env)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .with_model_from_file(&path)
            .map_err(|e| RecognitionError::ModelLoad(format!("{}: {e}", path.display())))?;
        info!(model = %path.display(), "Face detector loaded");
        Ok(Self { session })
    }

    /// Detect faces in a frame. Detections below `conf_min` are discarded.
    /// Returned boxes and landmarks are in original frame pixels.
    pub fn detect(
        &self,
        frame: &RecognitionFrame,
        conf_min: f32,
    ) -> Result<Vec<FaceDetection>, RecognitionError> {
        let (tensor, scale) = preprocess(frame);

        let input = CowArray::from(tensor.into_dyn());
        let outputs = self
            .session
            .run(vec![Value::from_array(self.session.allocator(), &input)?])?;

        // Output order: scores per stride, then boxes, then landmarks.
        let mut flat: Vec<Vec<f32>> = Vec::with_capacity(outputs.len());
        for out in &outputs {
            let tensor: ort::tensor::OrtOwnedTensor<f32, IxDyn> = out.try_extract()?;
            flat.push(tensor.view().iter().copied().collect());
        }

        let mut detections = Vec::new();
        for (si, &stride) in STRIDES.iter().enumerate() {
            let scores = &flat[si];
            let boxes = &flat[si + 3];
            let kps = flat.get(si + 6).map(|v| v.as_slice());
            detections.extend(decode_stride(scores, boxes, kps, stride, conf_min));
        }

        let kept = nms(detections, NMS_IOU);
        debug!(
            frame_index = frame.frame_index,
            faces = kept.len(),
            "Face detection complete"
        );

        Ok(kept
            .into_iter()
            .filter_map(|d| to_frame_coords(d, scale, frame.width, frame.height))
            .collect())
    }
}

/// Candidate face in letterbox (640x640) coordinates, pre-NMS.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

/// Letterbox the frame into the model input and return (tensor, scale).
/// The image is pasted at the top-left; only a scale factor maps back.
fn preprocess(frame: &RecognitionFrame) -> (Array4<f32>, f32) {
    let img = RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone())
        .unwrap_or_else(|| RgbImage::new(frame.width, frame.height));

    let scale = (INPUT_SIZE as f32 / frame.width as f32)
        .min(INPUT_SIZE as f32 / frame.height as f32)
        .min(1.0);
    let new_w = ((frame.width as f32 * scale) as u32).max(1);
    let new_h = ((frame.height as f32 * scale) as u32).max(1);
    let resized = imageops::resize(&img, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - 127.5) / 128.0;
        }
    }
    (tensor, scale)
}

/// Decode one stride's outputs into letterbox-space candidates.
/// Boxes are distance-coded (left/top/right/bottom from the anchor center),
/// landmarks are offsets from the anchor center, all in stride units.
pub(crate) fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: Option<&[f32]>,
    stride: u32,
    conf_min: f32,
) -> Vec<Candidate> {
    let cells = (INPUT_SIZE / stride) as usize;
    let anchors = cells * cells * ANCHORS_PER_CELL;
    let mut out = Vec::new();

    for k in 0..anchors.min(scores.len()) {
        let confidence = scores[k];
        if confidence < conf_min {
            continue;
        }
        if (k + 1) * 4 > boxes.len() {
            break;
        }
        let cell = k / ANCHORS_PER_CELL;
        let cx = ((cell % cells) * stride as usize) as f32;
        let cy = ((cell / cells) * stride as usize) as f32;
        let s = stride as f32;

        let l = boxes[k * 4] * s;
        let t = boxes[k * 4 + 1] * s;
        let r = boxes[k * 4 + 2] * s;
        let b = boxes[k * 4 + 3] * s;

        let landmarks = kps.and_then(|kps| {
            if (k + 1) * 10 > kps.len() {
                return None;
            }
            let mut lm = [(0.0f32, 0.0f32); 5];
            for (j, point) in lm.iter_mut().enumerate() {
                point.0 = cx + kps[k * 10 + j * 2] * s;
                point.1 = cy + kps[k * 10 + j * 2 + 1] * s;
            }
            Some(lm)
        });

        out.push(Candidate {
            x0: cx - l,
            y0: cy - t,
            x1: cx + r,
            y1: cy + b,
            confidence,
            landmarks,
        });
    }
    out
}

pub(crate) fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let ix0 = a.x0.max(b.x0);
    let iy0 = a.y0.max(b.y0);
    let ix1 = a.x1.min(b.x1);
    let iy1 = a.y1.min(b.y1);
    let iw = (ix1 - ix0).max(0.0);
    let ih = (iy1 - iy0).max(0.0);
    let inter = iw * ih;
    let area_a = (a.x1 - a.x0).max(0.0) * (a.y1 - a.y0).max(0.0);
    let area_b = (b.x1 - b.x0).max(0.0) * (b.y1 - b.y0).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Greedy NMS, highest confidence first.
pub(crate) fn nms(mut candidates: Vec<Candidate>, iou_max: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<Candidate> = Vec::new();
    for c in candidates {
        if kept.iter().all(|k| iou(k, &c) < iou_max) {
            kept.push(c);
        }
    }
    kept
}

/// Map a letterbox-space candidate back into frame pixels, estimating pose
/// from the landmarks. Degenerate boxes are dropped.
fn to_frame_coords(
    c: Candidate,
    scale: f32,
    frame_w: u32,
    frame_h: u32,
) -> Option<FaceDetection> {
    let inv = 1.0 / scale;
    let bbox = BoundingBox {
        x: (c.x0 * inv) as i32,
        y: (c.y0 * inv) as i32,
        w: ((c.x1 - c.x0) * inv).max(0.0) as u32,
        h: ((c.y1 - c.y0) * inv).max(0.0) as u32,
    }
    .clamp_to(frame_w, frame_h)?;

    let landmarks = c.landmarks.map(|lm| {
        let mut mapped = lm;
        for point in &mut mapped {
            point.0 *= inv;
            point.1 *= inv;
        }
        mapped
    });

    let (yaw, pitch) = landmarks.map(|lm| estimate_pose(&lm)).unwrap_or((0.0, 0.0));

    Some(FaceDetection {
        bbox,
        confidence: c.confidence,
        landmarks,
        yaw,
        pitch,
    })
}

/// Approximate head pose from 5-point landmark geometry.
///
/// Yaw from the nose offset relative to the eye midpoint; pitch from where
/// the nose sits between the eye line and the mouth line (~55% on a frontal
/// face). Accurate to maybe 10 degrees, which is all the quality score needs.
pub(crate) fn estimate_pose(lm: &Landmarks) -> (f32, f32) {
    let (lex, ley) = lm[0];
    let (rex, rey) = lm[1];
    let (nx, ny) = lm[2];
    let (_lmx, lmy) = lm[3];
    let (_rmx, rmy) = lm[4];

    let eye_cx = (lex + rex) / 2.0;
    let eye_cy = (ley + rey) / 2.0;
    let mouth_cy = (lmy + rmy) / 2.0;

    let inter_eye = ((rex - lex).powi(2) + (rey - ley).powi(2)).sqrt().max(1.0);
    let yaw = ((nx - eye_cx) / (inter_eye / 2.0)).clamp(-1.0, 1.0) * 45.0;

    let face_h = (mouth_cy - eye_cy).max(1.0);
    let pitch = (((ny - eye_cy) / face_h) - 0.55).clamp(-1.0, 1.0) * 90.0;

    (yaw, pitch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x0: f32, y0: f32, x1: f32, y1: f32, confidence: f32) -> Candidate {
        Candidate {
            x0,
            y0,
            x1,
            y1,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn iou_identical_boxes_is_one() {
        let a = candidate(0.0, 0.0, 10.0, 10.0, 0.9);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_disjoint_boxes_is_zero() {
        let a = candidate(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = candidate(20.0, 20.0, 30.0, 30.0, 0.9);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn nms_suppresses_overlapping_lower_confidence() {
        let strong = candidate(0.0, 0.0, 100.0, 100.0, 0.95);
        let weak_overlap = candidate(5.0, 5.0, 105.0, 105.0, 0.6);
        let separate = candidate(300.0, 300.0, 400.0, 400.0, 0.7);
        let kept = nms(vec![weak_overlap, strong, separate], 0.4);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.95);
        assert_eq!(kept[1].confidence, 0.7);
    }

    #[test]
    fn decode_stride_skips_below_threshold() {
        // Two anchors: one above, one below the confidence cut
        let scores = vec![0.8, 0.2];
        let boxes = vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let out = decode_stride(&scores, &boxes, None, 8, 0.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.8);
        // Anchor 0 sits at the origin; distances are 1 stride each way
        assert_eq!(out[0].x0, -8.0);
        assert_eq!(out[0].x1, 8.0);
    }

    #[test]
    fn decode_stride_anchor_centers_advance_by_stride() {
        let cells = (INPUT_SIZE / 32) as usize;
        let anchors = cells * cells * ANCHORS_PER_CELL;
        let mut scores = vec![0.0; anchors];
        // Third cell (index 2), first anchor of the pair
        scores[4] = 0.9;
        let boxes = vec![0.0; anchors * 4];
        let out = decode_stride(&scores, &boxes, None, 32, 0.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].x0, 64.0);
        assert_eq!(out[0].y0, 0.0);
    }

    #[test]
    fn frontal_face_has_near_zero_pose() {
        // Symmetric landmarks, nose at 55% between eyes and mouth
        let lm: Landmarks = [
            (40.0, 50.0),  // left eye
            (80.0, 50.0),  // right eye
            (60.0, 72.0),  // nose
            (45.0, 90.0),  // left mouth
            (75.0, 90.0),  // right mouth
        ];
        let (yaw, pitch) = estimate_pose(&lm);
        assert!(yaw.abs() < 1.0, "yaw = {yaw}");
        assert!(pitch.abs() < 5.0, "pitch = {pitch}");
    }

    #[test]
    fn turned_face_has_large_yaw() {
        // Nose shifted far toward the right eye
        let lm: Landmarks = [
            (40.0, 50.0),
            (80.0, 50.0),
            (78.0, 72.0),
            (45.0, 90.0),
            (75.0, 90.0),
        ];
        let (yaw, _) = estimate_pose(&lm);
        assert!(yaw > 30.0, "yaw = {yaw}");
    }
}
