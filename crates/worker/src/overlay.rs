//! Draws recognition boxes and identity labels onto decoded frames.
//!
//! The overlay owns the frame exclusively while drawing, so annotation
//! mutates the buffer in place. Label text needs a TTF from disk; when the
//! configured font is missing the stage degrades to boxes only.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use tracing::{info, warn};
use vigil_recognition::FaceRecord;

use crate::capture::Frame;

const COLOR_KNOWN: Rgb<u8> = Rgb([0, 200, 60]);
const COLOR_UNKNOWN: Rgb<u8> = Rgb([235, 200, 0]);
const COLOR_LOW_QUALITY: Rgb<u8> = Rgb([140, 140, 140]);

const LABEL_SCALE: f32 = 18.0;
const UNKNOWN_LABEL: &str = "Desconhecido";

pub struct Overlay {
    font: Option<Font<'static>>,
    /// Unknown faces below this quality draw gray instead of yellow
    low_quality: f32,
}

impl Overlay {
    pub fn new(font_path: &str, low_quality: f32) -> Self {
        let font = match std::fs::read(font_path) {
            Ok(bytes) => match Font::try_from_vec(bytes) {
                Some(font) => {
                    info!(font_path, "Overlay font loaded");
                    Some(font)
                }
                None => {
                    warn!(font_path, "Font file unparsable, drawing boxes only");
                    None
                }
            },
            Err(e) => {
                warn!(font_path, "Font not readable ({e}), drawing boxes only");
                None
            }
        };
        Self { font, low_quality }
    }

    /// Draw boxes and labels for all records onto the frame.
    pub fn annotate(&self, frame: &mut Frame, records: &[FaceRecord]) {
        if records.is_empty() {
            return;
        }
        let width = frame.width;
        let height = frame.height;
        // Length check up front: from_raw would otherwise eat the buffer
        // on mismatch and leave the frame empty.
        if frame.data.len() != (width * height * 3) as usize {
            warn!(frame_index = frame.frame_index, "Frame buffer size mismatch, skipping overlay");
            return;
        }
        let mut canvas = RgbImage::from_raw(width, height, std::mem::take(&mut frame.data))
            .expect("buffer length checked above");

        for record in records {
            let Some(bbox) = record.bbox.clamp_to(width, height) else {
                continue;
            };
            let color = self.color_for(record);

            // Two nested rectangles read as a 2px border
            draw_hollow_rect_mut(
                &mut canvas,
                Rect::at(bbox.x, bbox.y).of_size(bbox.w.max(2), bbox.h.max(2)),
                color,
            );
            if bbox.w > 4 && bbox.h > 4 {
                draw_hollow_rect_mut(
                    &mut canvas,
                    Rect::at(bbox.x + 1, bbox.y + 1).of_size(bbox.w - 2, bbox.h - 2),
                    color,
                );
            }

            if let Some(ref font) = self.font {
                let label = label_for(record);
                let text_y = (bbox.y - LABEL_SCALE as i32 - 2).max(0);
                draw_text_mut(
                    &mut canvas,
                    color,
                    bbox.x,
                    text_y,
                    Scale::uniform(LABEL_SCALE),
                    font,
                    &label,
                );
            }
        }

        frame.data = canvas.into_raw();
    }

    fn color_for(&self, record: &FaceRecord) -> Rgb<u8> {
        if !record.is_unknown() {
            COLOR_KNOWN
        } else if record.quality < self.low_quality {
            COLOR_LOW_QUALITY
        } else {
            COLOR_UNKNOWN
        }
    }
}

/// `Name (similarity%)` for known faces, a fixed marker otherwise.
pub fn label_for(record: &FaceRecord) -> String {
    match record.person_name {
        Some(ref name) => format!("{} ({:.0}%)", name, record.similarity * 100.0),
        None => UNKNOWN_LABEL.to_string(),
    }
}

/// JPEG-encode a frame for the snapshot endpoint.
pub fn to_jpeg(frame: &Frame) -> anyhow::Result<Vec<u8>> {
    let img = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| anyhow::anyhow!("frame buffer size mismatch"))?;
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 80);
    encoder.encode(
        &img,
        frame.width,
        frame.height,
        image::ColorType::Rgb8,
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use std::sync::Arc;
    use vigil_protocol::BoundingBox;

    fn test_frame(width: u32, height: u32) -> Frame {
        Frame {
            camera_id: Arc::from("cam-test"),
            frame_index: 0,
            timestamp_ns: 0,
            width,
            height,
            format: PixelFormat::Rgb24,
            data: vec![0u8; (width * height * 3) as usize],
        }
    }

    fn record(person: Option<(&str, &str)>, similarity: f32, quality: f32) -> FaceRecord {
        FaceRecord {
            bbox: BoundingBox {
                x: 20,
                y: 20,
                w: 60,
                h: 60,
            },
            person_id: person.map(|(id, _)| id.to_string()),
            person_name: person.map(|(_, name)| name.to_string()),
            similarity,
            quality,
            embedding: vec![],
        }
    }

    fn overlay_without_font() -> Overlay {
        Overlay::new("/nonexistent/font.ttf", 0.5)
    }

    #[test]
    fn known_label_has_name_and_percent() {
        let r = record(Some(("p-1", "Ana")), 0.834, 0.9);
        assert_eq!(label_for(&r), "Ana (83%)");
    }

    #[test]
    fn unknown_label_is_fixed_marker() {
        let r = record(None, 0.31, 0.9);
        assert_eq!(label_for(&r), "Desconhecido");
    }

    #[test]
    fn color_mapping() {
        let overlay = overlay_without_font();
        assert_eq!(overlay.color_for(&record(Some(("p", "P")), 0.9, 0.9)), COLOR_KNOWN);
        assert_eq!(overlay.color_for(&record(None, 0.2, 0.9)), COLOR_UNKNOWN);
        assert_eq!(overlay.color_for(&record(None, 0.2, 0.3)), COLOR_LOW_QUALITY);
    }

    #[test]
    fn annotate_draws_box_border() {
        let overlay = overlay_without_font();
        let mut frame = test_frame(160, 120);
        overlay.annotate(&mut frame, &[record(Some(("p-1", "Ana")), 0.9, 0.9)]);

        // Top-left corner of the box border must be green now
        let idx = ((20 * 160 + 20) * 3) as usize;
        assert_eq!(&frame.data[idx..idx + 3], &[0, 200, 60]);
    }

    #[test]
    fn annotate_without_records_is_a_noop() {
        let overlay = overlay_without_font();
        let mut frame = test_frame(64, 64);
        let before = frame.data.clone();
        overlay.annotate(&mut frame, &[]);
        assert_eq!(frame.data, before);
    }

    #[test]
    fn annotate_clamps_out_of_frame_box() {
        let overlay = overlay_without_font();
        let mut frame = test_frame(64, 64);
        let mut r = record(None, 0.2, 0.9);
        r.bbox = BoundingBox {
            x: 60,
            y: 60,
            w: 100,
            h: 100,
        };
        // Must not panic
        overlay.annotate(&mut frame, &[r]);
    }

    #[test]
    fn jpeg_snapshot_is_decodable() {
        let mut frame = test_frame(64, 48);
        // Make it non-trivial so the JPEG isn't empty
        for (i, b) in frame.data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let jpeg = to_jpeg(&frame).unwrap();
        assert!(!jpeg.is_empty());
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.height(), 48);
    }
}
