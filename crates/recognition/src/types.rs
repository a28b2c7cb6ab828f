use vigil_protocol::BoundingBox;

/// Owned copy of a decoded frame handed to the recognition engine.
/// The pipeline keeps the original; recognition works on its own pixels so
/// the frame can continue to overlay/encode without waiting.
#[derive(Clone)]
pub struct RecognitionFrame {
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGB24
    pub rgb: Vec<u8>,
}

impl std::fmt::Debug for RecognitionFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognitionFrame")
            .field("frame_index", &self.frame_index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("rgb_bytes", &self.rgb.len())
            .finish()
    }
}

/// Five-point facial landmarks in frame pixels:
/// left eye, right eye, nose tip, left mouth corner, right mouth corner.
pub type Landmarks = [(f32, f32); 5];

/// Raw detector output for one face. Lives only within a recognition request.
#[derive(Debug, Clone)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
    /// Estimated head yaw in degrees (positive = facing right)
    pub yaw: f32,
    /// Estimated head pitch in degrees (positive = facing down)
    pub pitch: f32,
}

/// One recognized face in a frame, as consumed by overlay and the unknown
/// policy.
#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub bbox: BoundingBox,
    /// Matched identity, or None when below the similarity threshold
    pub person_id: Option<String>,
    pub person_name: Option<String>,
    /// Inner-product similarity against the best index row, in [-1, 1]
    pub similarity: f32,
    pub quality: f32,
    /// L2-normalized 512-d embedding (kept for unknown-face bookkeeping)
    pub embedding: Vec<f32>,
}

impl FaceRecord {
    pub fn is_unknown(&self) -> bool {
        self.person_id.is_none()
    }
}

/// Result of recognizing one frame.
#[derive(Debug, Clone)]
pub struct RecognitionResult {
    pub frame_index: u64,
    pub records: Vec<FaceRecord>,
    /// True when the hard time budget expired before every face was embedded
    pub partial: bool,
}
