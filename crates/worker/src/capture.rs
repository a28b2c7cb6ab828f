use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use gstreamer::{self as gst, ElementFactory, FlowError, prelude::*};
use gstreamer_app::{AppSink, AppSinkCallbacks};
use tracing::{debug, info, warn};
use vigil_protocol::{CameraSnapshot, SourceKind};

use crate::bus::BusSender;
use crate::error::StageError;

/// Defaults for RTSP session setup.
const RTSP_CONNECT_TIMEOUT_US: u64 = 10_000_000;
const RTSP_READ_TIMEOUT_US: u64 = 5_000_000;
const RTSP_LATENCY_MS: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Nv12,
}

impl PixelFormat {
    /// Expected buffer size for a tightly packed frame.
    pub fn frame_bytes(self, width: u32, height: u32) -> usize {
        match self {
            PixelFormat::Rgb24 => (width * height * 3) as usize,
            PixelFormat::Nv12 => (width * height * 3 / 2) as usize,
        }
    }
}

/// One decoded frame. Owned exclusively by whichever stage holds it;
/// no stage keeps a reference after passing it forward.
pub struct Frame {
    pub camera_id: Arc<str>,
    /// Strictly increasing from 0, scoped to this pipeline instance
    pub frame_index: u64,
    /// Monotonic nanoseconds since the pipeline started
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("camera_id", &self.camera_id)
            .field("frame_index", &self.frame_index)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Capture-decode stage: one GStreamer pipeline turning an RTSP or file
/// source into RGB frames on the frame bus, rate-limited to the camera's
/// fps cap by dropping early frames.
///
/// `uridecodebin` handles both source kinds and auto-plugs hardware
/// decoders (nvdec, vaapi) when the environment provides them; the chosen
/// decoder is logged as elements appear.
pub struct CaptureStage {
    pipeline: gst::Pipeline,
    _bus_watch: gst::bus::BusWatchGuard,
    error_slot: Arc<Mutex<Option<StageError>>>,
}

impl CaptureStage {
    pub fn start(camera: &CameraSnapshot, frame_tx: BusSender<Frame>) -> anyhow::Result<Self> {
        let camera_id: Arc<str> = Arc::from(camera.id.as_str());
        info!(
            camera_id = %camera.id,
            source = ?camera.source,
            fps_limit = camera.fps_limit,
            "Starting capture pipeline"
        );

        let pipeline = gst::Pipeline::new();

        let decodebin = ElementFactory::make("uridecodebin")
            .property("uri", &camera.uri)
            .build()
            .context("Failed to create uridecodebin")?;

        let convert = ElementFactory::make("videoconvert")
            .build()
            .context("Failed to create videoconvert")?;

        // Everything downstream works on tightly packed RGB24
        let caps = gst::Caps::builder("video/x-raw").field("format", "RGB").build();
        let capsfilter = ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .context("Failed to create capsfilter")?;

        // File sources pace to the container rate against the clock
        // (sync=true); live RTSP is already paced by the network.
        let sync = camera.source == SourceKind::File;
        let appsink_elem = ElementFactory::make("appsink")
            .name("sink")
            .property("sync", sync)
            .property("emit-signals", true)
            .property("max-buffers", 1u32)
            .property("drop", true)
            .build()
            .context("Failed to create appsink")?;
        let appsink = appsink_elem
            .dynamic_cast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSink"))?;

        pipeline
            .add_many([&decodebin, &convert, &capsfilter, appsink.upcast_ref()])
            .context("Failed to add elements to capture pipeline")?;
        gst::Element::link_many([&convert, &capsfilter, appsink.upcast_ref()])
            .context("Failed to link capture pipeline")?;

        // uridecodebin exposes pads only once the stream is probed
        let convert_clone = convert.clone();
        decodebin.connect_pad_added(move |_, pad| {
            let is_video = pad
                .current_caps()
                .and_then(|caps| caps.structure(0).map(|s| s.name().starts_with("video/")))
                .unwrap_or(false);
            if !is_video {
                debug!("Ignoring non-video pad");
                return;
            }
            let sink_pad = match convert_clone.static_pad("sink") {
                Some(p) if !p.is_linked() => p,
                _ => return,
            };
            if let Err(e) = pad.link(&sink_pad) {
                warn!("Failed to link decoded pad: {e}");
            } else {
                info!("Decoded video pad linked");
            }
        });

        // Configure rtspsrc before it connects: timeouts, credentials, TCP
        // transport (UDP behind NAT silently produces no frames).
        if camera.source == SourceKind::Rtsp {
            let credentials = camera.credentials.clone();
            decodebin.connect("source-setup", false, move |values| {
                let source = values[1]
                    .get::<gst::Element>()
                    .expect("source-setup signal carries the source element");
                let is_rtsp = source
                    .factory()
                    .map(|f| f.name() == "rtspsrc")
                    .unwrap_or(false);
                if !is_rtsp {
                    return None;
                }
                source.set_property("latency", RTSP_LATENCY_MS);
                source.set_property("timeout", RTSP_READ_TIMEOUT_US);
                source.set_property("tcp-timeout", RTSP_CONNECT_TIMEOUT_US);
                source.set_property_from_str("protocols", "tcp");
                if let Some(ref creds) = credentials {
                    source.set_property("user-id", &creds.username);
                    source.set_property("user-pw", &creds.password);
                }
                debug!("rtspsrc configured");
                None
            });
        }

        // Log which decoder decodebin picked (nvh264dec, vah264dec, avdec_*)
        pipeline.connect_deep_element_added(|_, _, element| {
            if let Some(factory) = element.factory() {
                let name = factory.name();
                if name.contains("dec") && !name.contains("decodebin") {
                    info!(decoder = %name, "Decoder selected");
                }
            }
        });

        // Frame delivery: index assignment, fps gate, monotonic timestamps
        let mut gate = FpsGate::new(camera.fps_limit);
        let mut frame_index: u64 = 0;
        let mut last_ts: u64 = 0;
        let sink_id = Arc::clone(&camera_id);
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(FlowError::Error)?;
                    let caps = sample.caps().ok_or(FlowError::Error)?;
                    let s = caps.structure(0).ok_or(FlowError::Error)?;
                    let width = s.get::<i32>("width").map_err(|_| FlowError::Error)? as u32;
                    let height = s.get::<i32>("height").map_err(|_| FlowError::Error)? as u32;

                    let pts = buffer.pts().map(|t| t.nseconds()).unwrap_or(last_ts);
                    if !gate.admit(pts) {
                        return Ok(gst::FlowSuccess::Ok);
                    }

                    // Timestamps never go backwards, even if the demuxer
                    // reorders slightly around a discontinuity.
                    let ts = pts.max(last_ts + 1);
                    last_ts = ts;

                    // Copy row by row through VideoFrameRef: videoconvert may
                    // pad rows to a stride wider than width * 3.
                    let info = gstreamer_video::VideoInfo::from_caps(caps)
                        .map_err(|_| FlowError::Error)?;
                    let vframe =
                        gstreamer_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
                            .map_err(|_| FlowError::Error)?;
                    let stride = vframe.plane_stride()[0] as usize;
                    let src = vframe.plane_data(0).map_err(|_| FlowError::Error)?;
                    let format = PixelFormat::Rgb24;
                    let row_bytes = (width * 3) as usize;
                    let mut data = Vec::with_capacity(format.frame_bytes(width, height));
                    for row in 0..height as usize {
                        let start = row * stride;
                        data.extend_from_slice(&src[start..start + row_bytes]);
                    }

                    let frame = Frame {
                        camera_id: Arc::clone(&sink_id),
                        frame_index,
                        timestamp_ns: ts,
                        width,
                        height,
                        format,
                        data,
                    };
                    frame_index += 1;
                    // Downstream gone: stop the pipeline cleanly
                    frame_tx.push(frame).map_err(|_| FlowError::Eos)?;
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        // Bus watch: classify terminal errors for the supervisor
        let error_slot: Arc<Mutex<Option<StageError>>> = Arc::new(Mutex::new(None));
        let watch_slot = Arc::clone(&error_slot);
        let is_file = camera.source == SourceKind::File;
        let bus = pipeline.bus().context("Failed to get pipeline bus")?;
        let _bus_watch = bus
            .add_watch(move |_, msg| {
                use gst::MessageView;
                match msg.view() {
                    MessageView::Error(err) => {
                        let classified = classify_error(&err.error(), err.debug().as_deref());
                        tracing::error!(
                            source = ?err.src().map(|s| s.name().to_string()),
                            error = %err.error(),
                            classified = classified.kind(),
                            "Capture pipeline error"
                        );
                        let mut slot = watch_slot.lock().unwrap_or_else(|e| e.into_inner());
                        slot.get_or_insert(classified);
                    }
                    MessageView::Eos(_) => {
                        info!("Capture pipeline EOS");
                        let mut slot = watch_slot.lock().unwrap_or_else(|e| e.into_inner());
                        slot.get_or_insert(if is_file {
                            StageError::EndOfMedia
                        } else {
                            StageError::StreamLost("unexpected EOS on live source".into())
                        });
                    }
                    MessageView::Warning(w) => {
                        tracing::warn!(
                            source = ?w.src().map(|s| s.name().to_string()),
                            warning = %w.error(),
                            "Capture pipeline warning"
                        );
                    }
                    _ => {}
                }
                gst::glib::ControlFlow::Continue
            })
            .context("Failed to add bus watch")?;

        pipeline
            .set_state(gst::State::Playing)
            .context("Failed to set capture pipeline to Playing")?;

        Ok(Self {
            pipeline,
            _bus_watch,
            error_slot,
        })
    }

    /// Terminal error reported by the pipeline, if any. The first error
    /// wins; later ones are usually knock-on effects.
    pub fn take_error(&self) -> Option<StageError> {
        self.error_slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl Drop for CaptureStage {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
        debug!("Capture pipeline torn down");
    }
}

/// FPS limiter. Keeps a next-deliverable timestamp `t_next`: frames whose
/// capture time falls before it are skipped; admitting a frame advances
/// `t_next` by one interval.
pub(crate) struct FpsGate {
    interval_ns: u64,
    t_next: u64,
}

impl FpsGate {
    pub fn new(fps_limit: u32) -> Self {
        Self {
            interval_ns: 1_000_000_000 / u64::from(fps_limit.clamp(1, 60)),
            t_next: 0,
        }
    }

    pub fn admit(&mut self, pts_ns: u64) -> bool {
        if pts_ns < self.t_next {
            return false;
        }
        self.t_next = pts_ns + self.interval_ns;
        true
    }
}

/// Map a GStreamer error to the stage taxonomy.
fn classify_error(error: &gst::glib::Error, debug: Option<&str>) -> StageError {
    let detail = debug
        .map(|d| format!("{error} ({d})"))
        .unwrap_or_else(|| error.to_string());

    if let Some(kind) = error.kind::<gst::ResourceError>() {
        return match kind {
            gst::ResourceError::NotAuthorized => StageError::Auth(detail),
            gst::ResourceError::OpenRead
            | gst::ResourceError::OpenWrite
            | gst::ResourceError::OpenReadWrite
            | gst::ResourceError::NotFound => StageError::Connect(detail),
            gst::ResourceError::Read | gst::ResourceError::Seek => {
                StageError::StreamLost(detail)
            }
            _ => StageError::StreamLost(detail),
        };
    }
    if let Some(kind) = error.kind::<gst::StreamError>() {
        return match kind {
            gst::StreamError::CodecNotFound
            | gst::StreamError::WrongType
            | gst::StreamError::Format => StageError::UnsupportedCodec(detail),
            gst::StreamError::Decode | gst::StreamError::Demux | gst::StreamError::Failed => {
                StageError::Decode(detail)
            }
            _ => StageError::Decode(detail),
        };
    }
    if let Some(kind) = error.kind::<gst::CoreError>() {
        if kind == gst::CoreError::MissingPlugin {
            return StageError::UnsupportedCodec(detail);
        }
    }
    // 401 responses sometimes surface as plain library errors
    if detail.contains("401") || detail.contains("403") || detail.contains("nauthorized") {
        return StageError::Auth(detail);
    }
    StageError::Connect(detail)
}
