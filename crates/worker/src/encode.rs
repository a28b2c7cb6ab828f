use std::collections::VecDeque;
use std::sync::{Arc, Mutex, mpsc};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use gstreamer::{self as gst, ClockTime, ElementFactory, FlowError, prelude::*};
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use tracing::{debug, info};

use crate::error::StageError;
use crate::vp8;

/// One encoded VP8 packet with the metadata the uplink header needs.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub frame_index: u64,
    pub timestamp_ns: u64,
    pub width: u16,
    pub height: u16,
    pub keyframe: bool,
    pub passthrough: bool,
    pub data: Vec<u8>,
}

/// Metadata queued at push time and married to the encoder output.
/// vp8enc with lag-in-frames=0 is strictly one-in one-out and in order.
struct PendingMeta {
    frame_index: u64,
    timestamp_ns: u64,
    passthrough: bool,
}

/// VP8 encode stage: appsrc(RGB) → videoconvert → vp8enc → appsink.
pub struct EncodeStage {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    encoded_rx: Mutex<mpsc::Receiver<EncodedFrame>>,
    pending: Arc<Mutex<VecDeque<PendingMeta>>>,
    _bus_watch: gst::bus::BusWatchGuard,
    pipeline_error: Arc<AtomicBool>,
    width: u32,
    height: u32,
}

impl EncodeStage {
    pub fn start(
        width: u32,
        height: u32,
        fps: u32,
        bitrate_kbps: u32,
        keyframe_interval_s: u32,
    ) -> anyhow::Result<Self> {
        info!(
            width,
            height, fps, bitrate_kbps, keyframe_interval_s, "Creating VP8 encoder pipeline"
        );

        let pipeline = gst::Pipeline::new();

        let appsrc_elem = ElementFactory::make("appsrc")
            .name("src")
            .build()
            .context("Failed to create appsrc")?;
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", gst::Fraction::new(fps as i32, 1))
            .build();
        let appsrc = appsrc_elem
            .dynamic_cast::<AppSrc>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSrc"))?;
        appsrc.set_caps(Some(&caps));
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        // block=false: a stalled encoder must surface as drops + a bus
        // error, never as a silently hung pipeline task.
        appsrc.set_property("block", false);
        appsrc.set_property("max-bytes", 0u64);

        let convert = ElementFactory::make("videoconvert")
            .build()
            .context("Failed to create videoconvert")?;

        // Realtime deadline with no frame lag: each pushed frame comes out
        // before the next one goes in, keeping glass-to-glass latency low
        // and the metadata queue in lockstep.
        let keyframe_max_dist = (fps * keyframe_interval_s).max(1) as i32;
        let encoder = ElementFactory::make("vp8enc")
            .property("deadline", 1i64)
            .property("target-bitrate", (bitrate_kbps * 1000) as i32)
            .property("keyframe-max-dist", keyframe_max_dist)
            .property("lag-in-frames", 0i32)
            .property("cpu-used", 8i32)
            .property_from_str("end-usage", "cbr")
            .property_from_str("error-resilient", "default")
            .build()
            .context("Failed to create vp8enc")?;

        let appsink_elem = ElementFactory::make("appsink")
            .name("sink")
            .property("sync", false)
            .property("async", false)
            .property("emit-signals", true)
            .property("max-buffers", 2u32)
            .property("drop", false)
            .build()
            .context("Failed to create appsink")?;
        let appsink = appsink_elem
            .dynamic_cast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSink"))?;

        pipeline
            .add_many([
                appsrc.upcast_ref(),
                &convert,
                &encoder,
                appsink.upcast_ref(),
            ])
            .context("Failed to add elements to encode pipeline")?;
        gst::Element::link_many([
            appsrc.upcast_ref(),
            &convert,
            &encoder,
            appsink.upcast_ref(),
        ])
        .context("Failed to link encode pipeline")?;

        let pending: Arc<Mutex<VecDeque<PendingMeta>>> = Arc::new(Mutex::new(VecDeque::new()));
        let pending_sink = Arc::clone(&pending);
        let (encoded_tx, encoded_rx) = mpsc::channel::<EncodedFrame>();

        let out_width = width as u16;
        let out_height = height as u16;
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| FlowError::Error)?;
                    let data = map.to_vec();

                    let meta = pending_sink
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .pop_front();
                    let Some(meta) = meta else {
                        // Output without a pushed frame: should not happen
                        // with lag-in-frames=0; drop rather than misattribute
                        return Ok(gst::FlowSuccess::Ok);
                    };

                    let keyframe = vp8::vp8_is_keyframe(&data);
                    if keyframe {
                        // The keyframe header carries dimensions; a mismatch
                        // means the pipeline renegotiated under us
                        if let Some((w, h)) = vp8::vp8_keyframe_dimensions(&data) {
                            if (w, h) != (out_width, out_height) {
                                tracing::warn!(
                                    w,
                                    h,
                                    expected_w = out_width,
                                    expected_h = out_height,
                                    "VP8 keyframe dimensions disagree with pipeline caps"
                                );
                            }
                        }
                    }
                    let _ = encoded_tx.send(EncodedFrame {
                        frame_index: meta.frame_index,
                        timestamp_ns: meta.timestamp_ns,
                        width: out_width,
                        height: out_height,
                        keyframe,
                        passthrough: meta.passthrough,
                        data,
                    });
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let pipeline_error = Arc::new(AtomicBool::new(false));
        let error_flag = Arc::clone(&pipeline_error);
        let bus = pipeline.bus().context("Failed to get pipeline bus")?;
        let _bus_watch = bus
            .add_watch(move |_, msg| {
                use gst::MessageView;
                match msg.view() {
                    MessageView::Error(err) => {
                        tracing::error!(
                            source = ?err.src().map(|s| s.name().to_string()),
                            error = %err.error(),
                            "Encoder pipeline error"
                        );
                        error_flag.store(true, Ordering::Relaxed);
                    }
                    MessageView::Warning(w) => {
                        tracing::warn!(warning = %w.error(), "Encoder pipeline warning");
                    }
                    _ => {}
                }
                gst::glib::ControlFlow::Continue
            })
            .context("Failed to add bus watch")?;

        pipeline
            .set_state(gst::State::Playing)
            .context("Failed to set encode pipeline to Playing")?;

        Ok(Self {
            pipeline,
            appsrc,
            encoded_rx: Mutex::new(encoded_rx),
            pending,
            _bus_watch,
            pipeline_error,
            width,
            height,
        })
    }

    /// Push one annotated RGB frame into the encoder.
    pub fn encode_frame(
        &self,
        frame_index: u64,
        timestamp_ns: u64,
        width: u32,
        height: u32,
        rgb: Vec<u8>,
        passthrough: bool,
    ) -> Result<(), StageError> {
        if width != self.width || height != self.height {
            // Mid-stream renegotiation; restart the pipeline instance
            return Err(StageError::Encode(format!(
                "resolution changed from {}x{} to {}x{}",
                self.width, self.height, width, height
            )));
        }

        // Queue metadata before the buffer so the appsink can never observe
        // output with an empty queue.
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(PendingMeta {
                frame_index,
                timestamp_ns,
                passthrough,
            });

        let mut buffer = gst::Buffer::from_mut_slice(rgb);
        {
            let buffer_mut = buffer
                .get_mut()
                .expect("freshly-created GstBuffer should have unique ownership");
            buffer_mut.set_pts(ClockTime::from_nseconds(timestamp_ns));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| StageError::Encode(format!("push_buffer: {e}")))?;
        Ok(())
    }

    /// Pull one encoded packet if ready. `Ok(None)` when the encoder hasn't
    /// produced anything yet.
    pub fn pull_encoded(&self) -> Result<Option<EncodedFrame>, StageError> {
        let rx = self.encoded_rx.lock().unwrap_or_else(|e| e.into_inner());
        match rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => {
                Err(StageError::Encode("encoder pipeline disconnected".into()))
            }
        }
    }

    /// Force the next encoded frame to be a keyframe (viewer joined or the
    /// uplink reconnected).
    pub fn force_keyframe(&self) {
        let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        self.appsrc.send_event(event);
        debug!("Forced VP8 keyframe");
    }

    /// True if the GStreamer pipeline has reported an error.
    pub fn has_error(&self) -> bool {
        self.pipeline_error.load(Ordering::Relaxed)
    }
}

impl Drop for EncodeStage {
    fn drop(&mut self) {
        info!("Encoder shutting down: sending EOS and setting pipeline to Null");
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
