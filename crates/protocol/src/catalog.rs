use serde::{Deserialize, Serialize};

/// Axis-aligned face bounding box in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    /// Clamp the box to frame bounds, dropping it if nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let x0 = self.x.max(0);
        let y0 = self.y.max(0);
        let x1 = (self.x + self.w as i32).min(width as i32);
        let y1 = (self.y + self.h as i32).min(height as i32);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(BoundingBox {
            x: x0,
            y: y0,
            w: (x1 - x0) as u32,
            h: (y1 - y0) as u32,
        })
    }
}

/// Camera source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Rtsp,
    File,
}

/// RTSP credentials.
/// Password is redacted in Debug output to prevent accidental logging.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Camera snapshot as served by `GET /api/v1/cameras`.
/// Immutable for the lifetime of a worker; updates restart the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSnapshot {
    pub id: String,
    pub name: String,
    pub source: SourceKind,
    pub uri: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Frames per second delivered into the pipeline (1-60)
    pub fps_limit: u32,
    pub enabled: bool,
}

/// Person status in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonStatus {
    Active,
    Inactive,
}

/// Person snapshot as served by `GET /api/v1/persons`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonSnapshot {
    pub id: String,
    pub name: String,
    pub status: PersonStatus,
}

/// One enrolled embedding: 512 L2-normalized floats plus capture quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub person_id: String,
    pub vector: Vec<f32>,
    pub quality: f32,
}

/// Full person catalog at a given version, as consumed by the identity index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    /// Max person/embedding mutation seen; monotonic
    pub version: u64,
    pub persons: Vec<PersonSnapshot>,
    pub embeddings: Vec<EmbeddingRecord>,
}

/// Body of `POST /api/v1/recognitions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionReport {
    pub camera_id: String,
    /// Wall clock, Unix epoch milliseconds
    pub wall_clock: u64,
    pub person_id: Option<String>,
    pub similarity: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    /// Frame index within the pipeline instance that produced the match
    pub frame_ref: u64,
}

/// Body of `POST /api/v1/unknowns`.
#[derive(Clone, Serialize, Deserialize)]
pub struct UnknownReport {
    pub camera_id: String,
    pub wall_clock: u64,
    pub crop_png_base64: String,
    pub embedding: Vec<f32>,
    pub quality: f32,
}

impl std::fmt::Debug for UnknownReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The crop and embedding are large; keep Debug output usable
        f.debug_struct("UnknownReport")
            .field("camera_id", &self.camera_id)
            .field("wall_clock", &self.wall_clock)
            .field("crop_bytes", &self.crop_png_base64.len())
            .field("embedding_dims", &self.embedding.len())
            .field("quality", &self.quality)
            .finish()
    }
}

/// Body of the best-effort `POST /api/v1/events` fatal-termination report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FatalEventReport {
    pub camera_id: String,
    pub wall_clock: u64,
    pub kind: String,
    pub message: String,
}

/// Per-camera entry in the `/health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraHealth {
    pub id: String,
    pub state: crate::WorkerState,
    pub fps: f32,
    pub viewers: usize,
}

/// `/health` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub cameras: Vec<CameraHealth>,
}
