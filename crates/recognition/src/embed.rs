//! ONNX face embedder (ArcFace-family, 112x112 input, 512-d output).

use std::path::Path;
use std::sync::Arc;

use image::RgbImage;
use image::imageops::{self, FilterType};
use ndarray::{Array4, CowArray, IxDyn};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use ort::tensor::OrtOwnedTensor;
use tracing::info;
use vigil_protocol::BoundingBox;

use crate::error::RecognitionError;
use crate::types::RecognitionFrame;

pub const EMBED_MODEL_FILE: &str = "w600k_r50.onnx";

pub const EMBEDDING_DIM: usize = 512;
const CROP_SIZE: u32 = 112;
/// Expand the detector box before cropping so chin and forehead survive.
const CROP_MARGIN: f32 = 0.2;

pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    pub fn load(env: &Arc<Environment>, model_dir: &Path) -> Result<Self, RecognitionError> {
        let path = model_dir.join(EMBED_MODEL_FILE);
        let session = SessionBuilder::new(env)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .with_model_from_file(&path)
            .map_err(|e| RecognitionError::ModelLoad(format!("{}: {e}", path.display())))?;
        info!(model = %path.display(), "Face embedder loaded");
        Ok(Self { session })
    }

    /// Embed one face. Returns an L2-normalized 512-d vector.
    pub fn embed(
        &self,
        frame: &RecognitionFrame,
        bbox: &BoundingBox,
    ) -> Result<Vec<f32>, RecognitionError> {
        let crop = crop_face(frame, bbox);

        let mut tensor = Array4::<f32>::zeros((1, 3, CROP_SIZE as usize, CROP_SIZE as usize));
        for (x, y, pixel) in crop.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - 127.5) / 127.5;
            }
        }

        let input = CowArray::from(tensor.into_dyn());
        let outputs = self
            .session
            .run(vec![Value::from_array(self.session.allocator(), &input)?])?;
        let embedding: OrtOwnedTensor<f32, IxDyn> = outputs[0].try_extract()?;
        let mut vector: Vec<f32> = embedding.view().iter().copied().collect();
        vector.truncate(EMBEDDING_DIM);

        l2_normalize(&mut vector);
        Ok(vector)
    }
}

/// Cut the face region (expanded by `CROP_MARGIN`) and resize to the model
/// input. The expansion is clamped at frame borders.
pub(crate) fn crop_face(frame: &RecognitionFrame, bbox: &BoundingBox) -> RgbImage {
    let img = RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone())
        .unwrap_or_else(|| RgbImage::new(frame.width, frame.height));

    let mx = (bbox.w as f32 * CROP_MARGIN / 2.0) as i32;
    let my = (bbox.h as f32 * CROP_MARGIN / 2.0) as i32;
    let expanded = BoundingBox {
        x: bbox.x - mx,
        y: bbox.y - my,
        w: bbox.w + 2 * mx as u32,
        h: bbox.h + 2 * my as u32,
    };
    let region = expanded
        .clamp_to(frame.width, frame.height)
        .unwrap_or(BoundingBox {
            x: 0,
            y: 0,
            w: frame.width,
            h: frame.height,
        });

    let sub = imageops::crop_imm(&img, region.x as u32, region.y as u32, region.w, region.h)
        .to_image();
    imageops::resize(&sub, CROP_SIZE, CROP_SIZE, FilterType::Triangle)
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
