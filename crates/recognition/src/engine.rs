//! Recognition engine.
//!
//! A dedicated compute thread owns the ONNX sessions; the async pipeline
//! talks to it over a depth-1 channel so recognition can never block
//! decode: when the engine is busy the caller gets
//! [`RecognitionError::Busy`] and skips the frame. Index reloads go straight to the shared
//! [`IdentityIndex`]; in-flight queries finish against the snapshot they
//! pinned when processing began.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, TrySendError};
use std::time::{Duration, Instant};

use ort::Environment;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use vigil_protocol::CatalogSnapshot;

use crate::detect::FaceDetector;
use crate::embed::FaceEmbedder;
use crate::error::RecognitionError;
use crate::index::{IdentityIndex, ReloadOutcome};
use crate::quality;
use crate::types::{FaceRecord, RecognitionFrame, RecognitionResult};

/// Soft per-frame budget; exceeding it is logged but not acted on.
const SOFT_BUDGET: Duration = Duration::from_millis(120);
/// Hard per-frame budget; faces not embedded by now are dropped from the
/// result (partial, never an error).
const HARD_BUDGET: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model_dir: PathBuf,
    /// Detections below this confidence are discarded
    pub det_conf_min: f32,
    /// Similarity at or above this is a known identity
    pub sim_match: f32,
}

enum Request {
    Recognize {
        frame: RecognitionFrame,
        resp: oneshot::Sender<RecognitionResult>,
    },
}

pub struct RecognitionEngine {
    req_tx: Option<mpsc::SyncSender<Request>>,
    index: Arc<IdentityIndex>,
    warm: Arc<AtomicBool>,
    /// True while a request is in flight; lets callers skip building a
    /// frame copy they would only throw away on Busy.
    busy: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl RecognitionEngine {
    /// Spawn the compute thread. Model loading and warm-up happen on the
    /// thread; until warm-up completes every `recognize` call returns
    /// [`RecognitionError::ModelNotLoaded`].
    pub fn start(config: EngineConfig) -> Self {
        let index = Arc::new(IdentityIndex::new());
        let warm = Arc::new(AtomicBool::new(false));
        // Depth 1: one request in flight, the next try_send reports Busy
        let (req_tx, req_rx) = mpsc::sync_channel::<Request>(1);

        let busy = Arc::new(AtomicBool::new(false));
        let thread_index = Arc::clone(&index);
        let thread_warm = Arc::clone(&warm);
        let thread_busy = Arc::clone(&busy);
        let thread = std::thread::Builder::new()
            .name("recognition".into())
            .spawn(move || compute_loop(config, req_rx, thread_index, thread_warm, thread_busy))
            .expect("failed to spawn recognition thread");

        Self {
            req_tx: Some(req_tx),
            index,
            warm,
            busy,
            thread: Some(thread),
        }
    }

    pub fn is_warm(&self) -> bool {
        self.warm.load(Ordering::Acquire)
    }

    /// True while a request is in flight. Advisory only: a dispatch may
    /// still hit Busy if another caller wins the race.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    /// Hand a frame to the compute thread without waiting for the result.
    ///
    /// Never blocks: a busy engine yields [`RecognitionError::Busy`] and the
    /// caller skips recognition for this frame. On success the returned
    /// receiver resolves with the result (possibly partial).
    pub fn try_recognize(
        &self,
        frame: RecognitionFrame,
    ) -> Result<oneshot::Receiver<RecognitionResult>, RecognitionError> {
        if !self.is_warm() {
            return Err(RecognitionError::ModelNotLoaded);
        }
        let (resp, rx) = oneshot::channel();
        let tx = self.req_tx.as_ref().ok_or(RecognitionError::EngineStopped)?;
        tx.try_send(Request::Recognize { frame, resp })
            .map_err(|e| match e {
                TrySendError::Full(_) => RecognitionError::Busy,
                TrySendError::Disconnected(_) => RecognitionError::EngineStopped,
            })?;
        self.busy.store(true, Ordering::Relaxed);
        Ok(rx)
    }

    /// Detect and identify faces in a frame, waiting for the result.
    pub async fn recognize(
        &self,
        frame: RecognitionFrame,
    ) -> Result<RecognitionResult, RecognitionError> {
        let rx = self.try_recognize(frame)?;
        rx.await.map_err(|_| RecognitionError::EngineStopped)
    }

    /// Swap the identity index to a new catalog snapshot.
    /// Idempotent for unchanged content; serialized internally.
    pub fn reload_index(
        &self,
        catalog: &CatalogSnapshot,
    ) -> Result<ReloadOutcome, RecognitionError> {
        self.index.reload(catalog)
    }

    pub fn index_version(&self) -> u64 {
        self.index.version()
    }
}

impl Drop for RecognitionEngine {
    fn drop(&mut self) {
        // Closing the request channel ends the compute loop
        self.req_tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn compute_loop(
    config: EngineConfig,
    req_rx: mpsc::Receiver<Request>,
    index: Arc<IdentityIndex>,
    warm: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
) {
    let env = match Environment::builder().with_name("vigil-recognition").build() {
        Ok(env) => env.into_arc(),
        Err(e) => {
            error!("ONNX runtime init failed: {e}");
            return;
        }
    };
    let detector = match FaceDetector::load(&env, &config.model_dir) {
        Ok(d) => d,
        Err(e) => {
            error!("Detector load failed: {e}");
            return;
        }
    };
    let embedder = match FaceEmbedder::load(&env, &config.model_dir) {
        Ok(e) => e,
        Err(e) => {
            error!("Embedder load failed: {e}");
            return;
        }
    };

    // Warm-up: one dummy pass so the first real frame doesn't pay
    // allocator/kernel setup costs inside its latency budget.
    let warmup_start = Instant::now();
    let dummy = RecognitionFrame {
        frame_index: 0,
        width: 640,
        height: 640,
        rgb: vec![96; 640 * 640 * 3],
    };
    if let Err(e) = detector.detect(&dummy, config.det_conf_min) {
        error!("Warm-up detection failed: {e}");
        return;
    }
    let dummy_box = vigil_protocol::BoundingBox {
        x: 200,
        y: 200,
        w: 128,
        h: 128,
    };
    if let Err(e) = embedder.embed(&dummy, &dummy_box) {
        error!("Warm-up embedding failed: {e}");
        return;
    }
    warm.store(true, Ordering::Release);
    info!(
        warmup_ms = warmup_start.elapsed().as_millis() as u64,
        "Recognition engine warm"
    );

    while let Ok(request) = req_rx.recv() {
        match request {
            Request::Recognize { frame, resp } => {
                let result = recognize_one(&detector, &embedder, &index, &config, frame);
                busy.store(false, Ordering::Relaxed);
                // Receiver may have timed out and gone away; that's fine
                let _ = resp.send(result);
            }
        }
    }
    info!("Recognition engine stopped");
}

fn recognize_one(
    detector: &FaceDetector,
    embedder: &FaceEmbedder,
    index: &IdentityIndex,
    config: &EngineConfig,
    frame: RecognitionFrame,
) -> RecognitionResult {
    let started = Instant::now();
    let frame_index = frame.frame_index;
    // Pin the snapshot up front: every face in this frame is matched against
    // the same index version.
    let snapshot = index.snapshot();

    let mut detections = match detector.detect(&frame, config.det_conf_min) {
        Ok(d) => d,
        Err(e) => {
            warn!(frame_index, "Detection failed: {e}");
            return RecognitionResult {
                frame_index,
                records: Vec::new(),
                partial: false,
            };
        }
    };
    // Embed the biggest faces first so a partial result keeps the ones that
    // matter most in the scene.
    detections.sort_by(|a, b| b.bbox.area().cmp(&a.bbox.area()));

    let mut records = Vec::with_capacity(detections.len());
    let mut partial = false;
    for det in &detections {
        if started.elapsed() >= HARD_BUDGET {
            warn!(
                frame_index,
                embedded = records.len(),
                detected = detections.len(),
                "Recognition hard budget hit, returning partial results"
            );
            partial = true;
            break;
        }
        let embedding = match embedder.embed(&frame, &det.bbox) {
            Ok(v) => v,
            Err(e) => {
                warn!(frame_index, "Embedding failed: {e}");
                continue;
            }
        };
        let pose_deg = det.yaw.abs().max(det.pitch.abs());
        let quality = quality::measure(&frame, &det.bbox, pose_deg);

        let matched = snapshot.query(&embedding);
        let (person_id, person_name, similarity) = match matched {
            Some(m) if m.similarity >= config.sim_match => {
                (Some(m.person_id), Some(m.person_name), m.similarity)
            }
            Some(m) => (None, None, m.similarity),
            None => (None, None, 0.0),
        };

        records.push(FaceRecord {
            bbox: det.bbox,
            person_id,
            person_name,
            similarity,
            quality,
            embedding,
        });
    }

    let elapsed = started.elapsed();
    if elapsed > SOFT_BUDGET {
        debug!(
            frame_index,
            elapsed_ms = elapsed.as_millis() as u64,
            faces = records.len(),
            "Recognition exceeded soft budget"
        );
    }

    RecognitionResult {
        frame_index,
        records,
        partial,
    }
}
