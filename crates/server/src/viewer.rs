//! One WebRTC peer connection per viewer.
//!
//! The server is the offerer: VP8-only media engine, ICE restricted to one
//! UDP port from the configured pool, host candidates only in LAN mode.
//! Encoded packets arrive from the camera's broadcast channel and are
//! written to the viewer's track by reference; a late joiner is gated to
//! the next keyframe, and a viewer that cannot drain its queue sheds
//! non-keyframes until it either catches up or is closed as congested.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use vigil_protocol::{IceCandidate, WebRtcConfig};

use crate::fanout::EncodedPacket;

/// Send-queue depth per session (~2 s at 30 fps).
const SEND_QUEUE_MAX: usize = 60;
/// Congestion persisting this long closes the session.
const CONGESTION_TIMEOUT: Duration = Duration::from_secs(4);
/// Fallback sample duration when packet timestamps are unusable.
const FALLBACK_FRAME_DURATION: Duration = Duration::from_millis(33);

#[derive(Debug)]
pub enum SessionEvent {
    IceCandidate(IceCandidate),
    Ended { reason: String },
}

pub struct ViewerSession {
    pub id: Uuid,
    pub port: u16,
    pc: Arc<RTCPeerConnection>,
}

impl ViewerSession {
    /// Create the peer connection and start the forwarding tasks.
    /// `on_keyframe_request` fires when the browser sends RTCP PLI/FIR
    /// (packet loss); the caller routes it to the camera worker.
    pub async fn new(
        config: &WebRtcConfig,
        port: u16,
        packets: broadcast::Receiver<Arc<EncodedPacket>>,
        on_keyframe_request: impl Fn() + Send + Sync + 'static,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        let id = Uuid::new_v4();

        let mut media_engine = MediaEngine::default();
        // VP8 only. Offering more codecs invites the browser to pick one
        // the pipeline does not produce.
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![
                        RTCPFeedback {
                            typ: "nack".into(),
                            parameter: String::new(),
                        },
                        RTCPFeedback {
                            typ: "nack".into(),
                            parameter: "pli".into(),
                        },
                        RTCPFeedback {
                            typ: "ccm".into(),
                            parameter: "fir".into(),
                        },
                        RTCPFeedback {
                            typ: "goog-remb".into(),
                            parameter: String::new(),
                        },
                    ],
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        // One UDP port per session, first-fit from the shared pool.
        let mut setting_engine = SettingEngine::default();
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(
            EphemeralUDP::new(port, port).context("Invalid session UDP port")?,
        ));
        setting_engine.set_network_types(vec![NetworkType::Udp4]);

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_setting_engine(setting_engine)
            .with_interceptor_registry(registry)
            .build();

        // No ICE servers: with neither STUN nor TURN configured only host
        // candidates are gathered, which is exactly LAN mode.
        if !config.lan_mode {
            warn!("lan_mode=false but no STUN/TURN is configured; still using host candidates");
        }
        let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_string(),
            "vigil".to_string(),
        ));
        let video_sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add video track")?;

        // RTCP reader: PLI/FIR from the browser means its decoder lost
        // state; without a prompt keyframe the viewer shows artifacts
        // until the next periodic one.
        tokio::spawn(async move {
            while let Ok((rtcp_packets, _)) = video_sender.read_rtcp().await {
                for packet in &rtcp_packets {
                    let any = packet.as_any();
                    if any.is::<webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                        || any.is::<webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                    {
                        debug!("PLI/FIR keyframe request from viewer");
                        on_keyframe_request();
                    }
                }
            }
        });

        let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(16);

        // Trickle ICE toward the browser
        let ice_tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => {
                        let _ = ice_tx.try_send(SessionEvent::IceCandidate(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));

        let state_tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            info!(?state, "Viewer peer connection state changed");
            if state == RTCPeerConnectionState::Failed {
                let _ = state_tx.try_send(SessionEvent::Ended {
                    reason: "peer-failed".to_string(),
                });
            }
            Box::pin(async {})
        }));

        spawn_forwarders(id, track, packets, events_tx);

        info!(session_id = %id, port, "Viewer session created");
        Ok((Self { id, port, pc }, events_rx))
    }

    /// Create and pin the local offer; the browser answers.
    pub async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;
        Ok(offer.sdp)
    }

    pub async fn handle_answer(&self, sdp: &str) -> Result<()> {
        let answer =
            RTCSessionDescription::answer(sdp.to_string()).context("Failed to parse answer")?;
        self.pc
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")?;
        Ok(())
    }

    pub async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")?;
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(session_id = %self.id, "Peer connection close: {e:#}");
        }
    }
}

/// Decides, per packet, whether a session forwards, sheds, or gives up.
/// Kept free of I/O so the policy is unit-testable.
pub(crate) struct ForwardGate {
    waiting_keyframe: bool,
    congested_since: Option<Instant>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum GateDecision {
    Forward,
    Drop,
    Close,
}

impl ForwardGate {
    pub fn new() -> Self {
        Self {
            // A fresh session starts at the next keyframe
            waiting_keyframe: true,
            congested_since: None,
        }
    }

    pub fn on_packet(&mut self, keyframe: bool, queue_full: bool, now: Instant) -> GateDecision {
        if self.waiting_keyframe && !keyframe {
            return GateDecision::Drop;
        }
        if queue_full {
            let since = *self.congested_since.get_or_insert(now);
            if now.duration_since(since) >= CONGESTION_TIMEOUT {
                return GateDecision::Close;
            }
            // Shed until the next keyframe fits
            self.waiting_keyframe = true;
            return GateDecision::Drop;
        }
        self.waiting_keyframe = false;
        self.congested_since = None;
        GateDecision::Forward
    }

    /// The broadcast ring overwrote packets we never saw; resume at a
    /// keyframe so the decoder never sees a gap.
    pub fn on_lagged(&mut self) {
        self.waiting_keyframe = true;
    }
}

/// Ingest (broadcast → bounded queue, gating + congestion policy) and
/// writer (queue → WebRTC track).
fn spawn_forwarders(
    session_id: Uuid,
    track: Arc<TrackLocalStaticSample>,
    mut packets: broadcast::Receiver<Arc<EncodedPacket>>,
    events_tx: mpsc::Sender<SessionEvent>,
) {
    let (queue_tx, mut queue_rx) = mpsc::channel::<Arc<EncodedPacket>>(SEND_QUEUE_MAX);

    // Ingest
    tokio::spawn(async move {
        let mut gate = ForwardGate::new();
        loop {
            match packets.recv().await {
                Ok(packet) => {
                    let keyframe = packet.header.is_keyframe();
                    let full = queue_tx.capacity() == 0;
                    match gate.on_packet(keyframe, full, Instant::now()) {
                        GateDecision::Forward => {
                            if queue_tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                        GateDecision::Drop => {
                            debug!(session_id = %session_id, keyframe, "Packet shed");
                        }
                        GateDecision::Close => {
                            warn!(session_id = %session_id, "Session congested, closing");
                            let _ = events_tx
                                .send(SessionEvent::Ended {
                                    reason: "congested".to_string(),
                                })
                                .await;
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(session_id = %session_id, skipped = n, "Fan-out consumer lagged");
                    gate.on_lagged();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = events_tx
                        .send(SessionEvent::Ended {
                            reason: "camera-stopped".to_string(),
                        })
                        .await;
                    break;
                }
            }
        }
    });

    // Writer
    tokio::spawn(async move {
        let mut prev_ts: Option<u64> = None;
        while let Some(packet) = queue_rx.recv().await {
            let duration = match prev_ts {
                Some(prev) if packet.header.timestamp_ns > prev => {
                    Duration::from_nanos(packet.header.timestamp_ns - prev)
                }
                _ => FALLBACK_FRAME_DURATION,
            };
            prev_ts = Some(packet.header.timestamp_ns);

            if let Err(e) = track
                .write_sample(&webrtc::media::Sample {
                    data: packet.payload.clone(),
                    duration,
                    ..Default::default()
                })
                .await
            {
                debug!(session_id = %session_id, "Track write failed: {e:#}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_waits_for_first_keyframe() {
        let mut gate = ForwardGate::new();
        let now = Instant::now();
        assert_eq!(gate.on_packet(false, false, now), GateDecision::Drop);
        assert_eq!(gate.on_packet(false, false, now), GateDecision::Drop);
        assert_eq!(gate.on_packet(true, false, now), GateDecision::Forward);
        // After the keyframe, inter frames flow
        assert_eq!(gate.on_packet(false, false, now), GateDecision::Forward);
    }

    #[test]
    fn gate_sheds_on_full_queue_until_keyframe() {
        let mut gate = ForwardGate::new();
        let now = Instant::now();
        gate.on_packet(true, false, now);

        assert_eq!(gate.on_packet(false, true, now), GateDecision::Drop);
        // Still shedding inter frames even with queue room
        assert_eq!(gate.on_packet(false, false, now), GateDecision::Drop);
        // Keyframe with room resumes the flow
        assert_eq!(gate.on_packet(true, false, now), GateDecision::Forward);
    }

    #[test]
    fn gate_closes_after_sustained_congestion() {
        let mut gate = ForwardGate::new();
        let t0 = Instant::now();
        gate.on_packet(true, false, t0);

        assert_eq!(gate.on_packet(false, true, t0), GateDecision::Drop);
        let t1 = t0 + Duration::from_secs(2);
        assert_eq!(gate.on_packet(true, true, t1), GateDecision::Drop);
        let t2 = t0 + Duration::from_secs(5);
        assert_eq!(gate.on_packet(true, true, t2), GateDecision::Close);
    }

    #[test]
    fn gate_congestion_clears_on_forward() {
        let mut gate = ForwardGate::new();
        let t0 = Instant::now();
        gate.on_packet(true, false, t0);
        gate.on_packet(false, true, t0);
        // Keyframe goes through: congestion episode over
        assert_eq!(
            gate.on_packet(true, false, t0 + Duration::from_secs(1)),
            GateDecision::Forward
        );
        // A much later stall starts a fresh congestion clock
        let t1 = t0 + Duration::from_secs(30);
        assert_eq!(gate.on_packet(false, true, t1), GateDecision::Drop);
        assert_eq!(
            gate.on_packet(true, true, t1 + Duration::from_secs(1)),
            GateDecision::Drop
        );
    }

    #[test]
    fn gate_regates_after_lag() {
        let mut gate = ForwardGate::new();
        let now = Instant::now();
        gate.on_packet(true, false, now);
        assert_eq!(gate.on_packet(false, false, now), GateDecision::Forward);

        gate.on_lagged();
        assert_eq!(gate.on_packet(false, false, now), GateDecision::Drop);
        assert_eq!(gate.on_packet(true, false, now), GateDecision::Forward);
    }
}
