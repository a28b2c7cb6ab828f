//! Face quality scoring.
//!
//! The score is the product of four terms in [0, 1]: face-area ratio,
//! sharpness (variance of the Laplacian over the face crop), distance from
//! the usable brightness band, and absolute head pose. Each term is
//! monotone along its axis, so the product is monotone per axis too.

use image::{GrayImage, Luma, RgbImage};
use imageproc::filter::laplacian_filter;
use vigil_protocol::BoundingBox;

use crate::types::RecognitionFrame;

/// Face area ratio at which the area term saturates.
const AREA_SATURATION: f32 = 0.05;
/// Laplacian variance at which the sharpness term saturates.
const SHARPNESS_SATURATION: f32 = 200.0;
/// Center of the usable brightness band (0-255 gray).
const BRIGHTNESS_IDEAL: f32 = 120.0;
/// Half-width of the brightness band; score reaches 0 at the edges.
const BRIGHTNESS_HALF_BAND: f32 = 100.0;
/// Pose angle (degrees) at which the pose term reaches 0.
const POSE_LIMIT_DEG: f32 = 60.0;

/// Measurements feeding the quality score.
#[derive(Debug, Clone, Copy)]
pub struct QualityInput {
    /// Face area / frame area
    pub area_ratio: f32,
    /// Variance of the Laplacian over the gray face crop
    pub sharpness: f32,
    /// Mean gray level of the face crop (0-255)
    pub brightness: f32,
    /// max(|yaw|, |pitch|) in degrees
    pub pose_deg: f32,
}

pub fn quality_score(input: QualityInput) -> f32 {
    let area = (input.area_ratio / AREA_SATURATION).clamp(0.0, 1.0);
    let sharp = (input.sharpness / SHARPNESS_SATURATION).clamp(0.0, 1.0);
    let bright =
        (1.0 - (input.brightness - BRIGHTNESS_IDEAL).abs() / BRIGHTNESS_HALF_BAND).clamp(0.0, 1.0);
    let pose = (1.0 - input.pose_deg.abs() / POSE_LIMIT_DEG).clamp(0.0, 1.0);
    area * sharp * bright * pose
}

/// Measure a face region and score it.
pub fn measure(frame: &RecognitionFrame, bbox: &BoundingBox, pose_deg: f32) -> f32 {
    let Some(region) = bbox.clamp_to(frame.width, frame.height) else {
        return 0.0;
    };
    let gray = gray_crop(frame, &region);

    let area_ratio = region.area() as f32 / (frame.width as f32 * frame.height as f32);
    let sharpness = laplacian_variance(&gray);
    let brightness = mean_gray(&gray);

    quality_score(QualityInput {
        area_ratio,
        sharpness,
        brightness,
        pose_deg,
    })
}

fn gray_crop(frame: &RecognitionFrame, region: &BoundingBox) -> GrayImage {
    let img = RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone())
        .unwrap_or_else(|| RgbImage::new(frame.width, frame.height));
    let sub = image::imageops::crop_imm(
        &img,
        region.x as u32,
        region.y as u32,
        region.w,
        region.h,
    )
    .to_image();
    image::imageops::grayscale(&sub)
}

pub(crate) fn laplacian_variance(gray: &GrayImage) -> f32 {
    if gray.width() < 3 || gray.height() < 3 {
        return 0.0;
    }
    // laplacian_filter widens to i16 to hold negative responses
    let lap = laplacian_filter(gray);
    let n = (lap.width() * lap.height()) as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for Luma([v]) in lap.pixels() {
        let x = f64::from(*v);
        sum += x;
        sum_sq += x * x;
    }
    let mean = sum / n;
    ((sum_sq / n) - mean * mean).max(0.0) as f32
}

fn mean_gray(gray: &GrayImage) -> f32 {
    let n = (gray.width() * gray.height()).max(1) as f64;
    let sum: f64 = gray.pixels().map(|Luma([v])| *v as f64).sum();
    (sum / n) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> QualityInput {
        QualityInput {
            area_ratio: 0.04,
            sharpness: 150.0,
            brightness: 120.0,
            pose_deg: 10.0,
        }
    }

    #[test]
    fn score_is_in_unit_interval() {
        let s = quality_score(base_input());
        assert!((0.0..=1.0).contains(&s), "score = {s}");
    }

    #[test]
    fn larger_face_scores_higher() {
        let small = quality_score(QualityInput {
            area_ratio: 0.005,
            ..base_input()
        });
        let large = quality_score(QualityInput {
            area_ratio: 0.04,
            ..base_input()
        });
        assert!(large > small);
    }

    #[test]
    fn sharper_face_scores_higher() {
        let blurry = quality_score(QualityInput {
            sharpness: 20.0,
            ..base_input()
        });
        let sharp = quality_score(QualityInput {
            sharpness: 180.0,
            ..base_input()
        });
        assert!(sharp > blurry);
    }

    #[test]
    fn brightness_outside_band_scores_lower() {
        let ideal = quality_score(base_input());
        let dark = quality_score(QualityInput {
            brightness: 30.0,
            ..base_input()
        });
        let blown = quality_score(QualityInput {
            brightness: 250.0,
            ..base_input()
        });
        assert!(ideal > dark);
        assert!(ideal > blown);
    }

    #[test]
    fn extreme_pose_scores_zero() {
        let s = quality_score(QualityInput {
            pose_deg: 80.0,
            ..base_input()
        });
        assert_eq!(s, 0.0);
    }

    #[test]
    fn pose_term_is_monotone() {
        let frontal = quality_score(QualityInput {
            pose_deg: 0.0,
            ..base_input()
        });
        let angled = quality_score(QualityInput {
            pose_deg: 30.0,
            ..base_input()
        });
        assert!(frontal > angled);
    }

    #[test]
    fn laplacian_variance_flat_image_is_zero() {
        let flat = GrayImage::from_pixel(32, 32, Luma([128]));
        assert_eq!(laplacian_variance(&flat), 0.0);
    }

    #[test]
    fn laplacian_variance_checkerboard_is_high() {
        let mut img = GrayImage::new(32, 32);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]);
        }
        assert!(laplacian_variance(&img) > 100.0);
    }
}
