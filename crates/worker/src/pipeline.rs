//! The per-camera pipeline: one instance per Connecting→Running incarnation,
//! plus the outer self-healing loop that classifies stage errors and
//! schedules reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use image::{ImageEncoder as _, RgbImage};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use vigil_protocol::{
    CameraSnapshot, FatalEventReport, PacketHeader, RecognitionReport, UnknownReport, VigilConfig,
    WorkerEvent, WorkerState,
};
use vigil_recognition::{
    Observation, RecognitionEngine, RecognitionError, RecognitionFrame, RecognitionResult,
    UnknownPolicy,
};

use crate::bus::{self, BusReceiver};
use crate::capture::{CaptureStage, Frame};
use crate::control::ControlPlane;
use crate::dispatch::ResultRouterHandle;
use crate::encode::EncodeStage;
use crate::error::StageError;
use crate::overlay::{self, Overlay};
use crate::state::{Backoff, HEALTH_WINDOW, HealthWindow, StateMachine};
use crate::uplink::WsSender;

/// How long Connecting may wait for the first decoded frame.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(15);
/// Poll granularity for stage errors while the frame bus is quiet.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Supervisor cadence.
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(1);
/// Minimum spacing of JPEG snapshots on the uplink.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);
/// Per-person spacing of recognition log events.
const RECOGNITION_LOG_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) struct WorkerCtx {
    pub camera: CameraSnapshot,
    pub config: VigilConfig,
    pub engine: Arc<RecognitionEngine>,
    pub policy: Arc<Mutex<UnknownPolicy>>,
    pub overlay: Overlay,
    pub control: Arc<ControlPlane>,
    pub router: Arc<ResultRouterHandle>,
    pub outbox: WsSender,
    pub force_keyframe: Arc<AtomicBool>,
    /// Last time each person was reported to the event plane
    pub recent_reports: Arc<Mutex<HashMap<String, Instant>>>,
}

/// Run the worker until a fatal error closes it.
pub(crate) async fn run_worker(ctx: WorkerCtx) {
    let mut sm = StateMachine::new();
    let mut backoff = Backoff::default();

    sm.on_start();
    send_state(&ctx.outbox, sm.state(), None);

    loop {
        let error = run_instance(&ctx, &mut sm, &mut backoff).await;
        warn!(camera_id = %ctx.camera.id, error = %error, "Pipeline instance ended");

        match sm.on_error(&error) {
            Some(WorkerState::Closed) => {
                send_state(&ctx.outbox, WorkerState::Closed, Some(error.to_string()));
                let event = WorkerEvent::Fatal {
                    kind: error.kind().to_string(),
                    message: error.to_string(),
                };
                send_event(&ctx.outbox, &event);
                ctx.control
                    .report_fatal(&FatalEventReport {
                        camera_id: ctx.camera.id.clone(),
                        wall_clock: wall_clock_ms(),
                        kind: error.kind().to_string(),
                        message: error.to_string(),
                    })
                    .await;
                return;
            }
            _ => {
                send_state(&ctx.outbox, sm.state(), Some(error.to_string()));
                let delay = backoff.next_delay();
                sm.on_retry_scheduled();
                send_state(&ctx.outbox, sm.state(), None);
                info!(
                    camera_id = %ctx.camera.id,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                sm.on_backoff_elapsed();
                send_state(&ctx.outbox, sm.state(), None);
            }
        }
    }
}

/// Run one pipeline instance until a stage raises a terminal error.
async fn run_instance(
    ctx: &WorkerCtx,
    sm: &mut StateMachine,
    backoff: &mut Backoff,
) -> StageError {
    let (frame_tx, mut frame_rx) = bus::bus::<Frame>(bus::DEFAULT_CAPACITY);
    let capture = match CaptureStage::start(&ctx.camera, frame_tx) {
        Ok(c) => c,
        Err(e) => return StageError::Connect(format!("{e:#}")),
    };

    // Connecting holds until the first decoded frame is here AND the
    // recognition models are warm.
    let connect_start = Instant::now();
    let first = loop {
        if let Some(err) = capture.take_error() {
            return err;
        }
        if connect_start.elapsed() > FIRST_FRAME_TIMEOUT {
            return StageError::Connect("no decoded frames before timeout".into());
        }
        match timeout(POLL_INTERVAL, frame_rx.pop()).await {
            Ok(Some(frame)) => {
                if ctx.engine.is_warm() {
                    break frame;
                }
                debug!("Holding in Connecting until recognition warm-up completes");
            }
            Ok(None) => return capture.take_error().unwrap_or(StageError::Halted),
            Err(_) => {}
        }
    };

    sm.on_first_frame();
    send_state(&ctx.outbox, sm.state(), None);
    backoff.reset();

    let encode = match EncodeStage::start(
        first.width,
        first.height,
        ctx.camera.fps_limit,
        ctx.config.webrtc.target_bitrate_kbps,
        ctx.config.webrtc.keyframe_interval_s,
    ) {
        Ok(e) => e,
        Err(e) => return StageError::Encode(format!("{e:#}")),
    };
    // First frame of a fresh instance always starts on a keyframe
    encode.force_keyframe();

    let mut health = HealthWindow::new(HEALTH_WINDOW);
    let deadline = Duration::from_millis(ctx.config.overlay.deadline_ms);
    let mut last_supervisor = Instant::now();
    let mut last_snapshot = Instant::now() - SNAPSHOT_INTERVAL;
    let mut frames_since_tick: u32 = 0;
    let mut pending_frame = Some(first);

    loop {
        if let Some(err) = capture.take_error() {
            return err;
        }
        if encode.has_error() {
            return StageError::Encode("encoder pipeline error".into());
        }

        let frame = match pending_frame.take() {
            Some(f) => f,
            None => match timeout(POLL_INTERVAL, frame_rx.pop()).await {
                Ok(Some(f)) => f,
                Ok(None) => return capture.take_error().unwrap_or(StageError::Halted),
                Err(_) => {
                    supervisor_tick(
                        ctx,
                        sm,
                        &mut health,
                        &frame_rx,
                        &mut last_supervisor,
                        &mut frames_since_tick,
                    );
                    continue;
                }
            },
        };

        if let Err(err) = process_frame(
            ctx,
            &encode,
            &mut health,
            deadline,
            &mut last_snapshot,
            frame,
        )
        .await
        {
            return err;
        }
        frames_since_tick += 1;

        if last_supervisor.elapsed() >= SUPERVISOR_INTERVAL {
            supervisor_tick(
                ctx,
                sm,
                &mut health,
                &frame_rx,
                &mut last_supervisor,
                &mut frames_since_tick,
            );
        }
    }
}

/// Take one frame through recognition dispatch, overlay, encode, uplink.
async fn process_frame(
    ctx: &WorkerCtx,
    encode: &EncodeStage,
    health: &mut HealthWindow,
    deadline: Duration,
    last_snapshot: &mut Instant,
    mut frame: Frame,
) -> Result<(), StageError> {
    let frame_index = frame.frame_index;

    // Recognition dispatch is strictly best-effort; a busy engine means
    // this frame goes through unannotated. The busy probe avoids copying
    // pixels for frames that would only be bounced.
    if !ctx.engine.is_busy() {
        let rec_frame = RecognitionFrame {
            frame_index,
            width: frame.width,
            height: frame.height,
            rgb: frame.data.clone(),
        };
        match ctx.engine.try_recognize(rec_frame.clone()) {
            Ok(result_rx) => {
                ctx.router.mark_dispatched(frame_index);
                // The handler keeps its own copy of the pixels so an unknown
                // admission can ship a face crop after this frame has moved on.
                spawn_result_handler(ctx, result_rx, rec_frame);
            }
            Err(RecognitionError::Busy) | Err(RecognitionError::ModelNotLoaded) => {}
            Err(e) => {
                warn!(frame_index, "Recognition dispatch failed: {e}");
            }
        }
    }

    let records = ctx.router.wait_for(frame_index, deadline).await;
    let passthrough = records.is_none();
    health.record(passthrough, Instant::now());

    if let Some(ref records) = records {
        ctx.overlay.annotate(&mut frame, records);
    }

    if ctx.force_keyframe.swap(false, Ordering::Relaxed) {
        encode.force_keyframe();
    }

    // Snapshot before the pixel buffer moves into the encoder
    if last_snapshot.elapsed() >= SNAPSHOT_INTERVAL {
        *last_snapshot = Instant::now();
        match overlay::to_jpeg(&frame) {
            Ok(jpeg) => {
                let header = PacketHeader::snapshot(
                    frame.width as u16,
                    frame.height as u16,
                    frame.timestamp_ns,
                    jpeg.len() as u32,
                );
                let _ = ctx
                    .outbox
                    .try_send(Message::Binary(header.serialize_with_payload(&jpeg).into()));
            }
            Err(e) => debug!("Snapshot encode failed: {e:#}"),
        }
    }

    encode.encode_frame(
        frame.frame_index,
        frame.timestamp_ns,
        frame.width,
        frame.height,
        frame.data,
        passthrough,
    )?;

    // Drain whatever the encoder has ready; packets leave in frame order.
    while let Some(packet) = encode.pull_encoded()? {
        let header = PacketHeader::video(
            packet.width,
            packet.height,
            packet.frame_index,
            packet.timestamp_ns,
            packet.data.len() as u32,
            packet.keyframe,
            packet.passthrough,
        );
        match ctx
            .outbox
            .try_send(Message::Binary(header.serialize_with_payload(&packet.data).into()))
        {
            Ok(()) => {}
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                debug!("Dropping encoded packet (uplink outbox full)");
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                return Err(StageError::Halted);
            }
        }
    }

    Ok(())
}

/// Process a finished recognition result off the hot path: unknown-face
/// bookkeeping and event-plane reports, then hand the records to overlay.
fn spawn_result_handler(
    ctx: &WorkerCtx,
    result_rx: tokio::sync::oneshot::Receiver<RecognitionResult>,
    rec_frame: RecognitionFrame,
) {
    let router = Arc::clone(&ctx.router);
    let policy = Arc::clone(&ctx.policy);
    let control = Arc::clone(&ctx.control);
    let recent = Arc::clone(&ctx.recent_reports);
    let camera_id = ctx.camera.id.clone();

    tokio::spawn(async move {
        let Ok(result) = result_rx.await else {
            return;
        };

        for record in &result.records {
            if record.is_unknown() {
                let admission = {
                    let mut policy = policy.lock().unwrap_or_else(|e| e.into_inner());
                    policy.observe(
                        Observation {
                            embedding: &record.embedding,
                            bbox: record.bbox,
                            quality: record.quality,
                        },
                        Instant::now(),
                    )
                };
                if let Some(admission) = admission {
                    let crop_png_base64 =
                        crop_png_base64(&rec_frame, &admission.bbox).unwrap_or_default();
                    let report = UnknownReport {
                        camera_id: camera_id.clone(),
                        wall_clock: wall_clock_ms(),
                        crop_png_base64,
                        embedding: admission.embedding.clone(),
                        quality: admission.quality,
                    };
                    if let Err(e) = control.report_unknown(&report).await {
                        warn!("Unknown report failed: {e:#}");
                    }
                }
            } else if let Some(ref person_id) = record.person_id {
                let due = {
                    let mut recent = recent.lock().unwrap_or_else(|e| e.into_inner());
                    let now = Instant::now();
                    match recent.get(person_id) {
                        Some(last) if now.duration_since(*last) < RECOGNITION_LOG_INTERVAL => {
                            false
                        }
                        _ => {
                            recent.insert(person_id.clone(), now);
                            true
                        }
                    }
                };
                if due {
                    let report = RecognitionReport {
                        camera_id: camera_id.clone(),
                        wall_clock: wall_clock_ms(),
                        person_id: Some(person_id.clone()),
                        similarity: record.similarity,
                        bbox: record.bbox,
                        frame_ref: result.frame_index,
                    };
                    if let Err(e) = control.report_recognition(&report).await {
                        warn!("Recognition report failed: {e:#}");
                    }
                }
            }
        }

        router.store(result);
    });
}

fn supervisor_tick(
    ctx: &WorkerCtx,
    sm: &mut StateMachine,
    health: &mut HealthWindow,
    frame_rx: &BusReceiver<Frame>,
    last_supervisor: &mut Instant,
    frames_since_tick: &mut u32,
) {
    let elapsed = last_supervisor.elapsed();
    *last_supervisor = Instant::now();

    let ratio = health.missed_ratio(Instant::now());
    if let Some(state) = sm.on_health(ratio) {
        send_state(
            &ctx.outbox,
            state,
            Some(format!("overlay miss ratio {:.0}%", ratio * 100.0)),
        );
    }

    let counters = frame_rx.counters();
    let fps = *frames_since_tick as f32 / elapsed.as_secs_f32().max(0.001);
    *frames_since_tick = 0;
    send_event(
        &ctx.outbox,
        &WorkerEvent::Stats {
            fps,
            frames_produced: counters.produced,
            frames_dropped: counters.dropped,
            overlay_missed: ctx.router.overlay_missed(),
        },
    );
}

fn send_state(outbox: &WsSender, state: WorkerState, detail: Option<String>) {
    send_event(outbox, &WorkerEvent::State { state, detail });
}

fn send_event(outbox: &WsSender, event: &WorkerEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = outbox.try_send(Message::Text(json.into()));
        }
        Err(e) => warn!("Failed to serialize worker event: {e}"),
    }
}

pub(crate) fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// PNG-encode the face region of a frame, base64 for the JSON event body.
fn crop_png_base64(
    frame: &RecognitionFrame,
    bbox: &vigil_protocol::BoundingBox,
) -> anyhow::Result<String> {
    let img = RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone())
        .ok_or_else(|| anyhow::anyhow!("frame buffer size mismatch"))?;
    let region = bbox
        .clamp_to(frame.width, frame.height)
        .ok_or_else(|| anyhow::anyhow!("face box outside frame"))?;
    let crop = image::imageops::crop_imm(
        &img,
        region.x as u32,
        region.y as u32,
        region.w,
        region.h,
    )
    .to_image();

    let mut png = Vec::new();
    image::codecs::png::PngEncoder::new(&mut png).write_image(
        &crop,
        crop.width(),
        crop.height(),
        image::ColorType::Rgb8,
    )?;
    Ok(base64::engine::general_purpose::STANDARD.encode(&png))
}
