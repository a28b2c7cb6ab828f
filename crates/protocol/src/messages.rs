use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// ICE candidate payload exchanged over signaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Signaling messages between a browser viewer and the server.
///
/// The envelope is symmetric: one tagged enum covers both directions.
/// Tags are kebab-case on the wire (`start-stream`, `ice-candidate`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Browser requests a stream for a camera; starts negotiation.
    StartStream { camera_id: String },
    /// SDP offer from the server (sent once the camera is Running).
    Offer { sdp: String, session_id: Uuid },
    /// SDP answer from the browser.
    Answer { sdp: String, session_id: Uuid },
    /// ICE candidate exchange (both directions).
    IceCandidate {
        candidate: IceCandidate,
        session_id: Uuid,
    },
    /// Browser asks to stop the stream.
    Stop,
    /// Error surfaced to the viewer.
    Error { code: String, message: String },
    /// Stream ended (camera stopped, session congested, worker restart).
    Ended { reason: String },
}

/// Lifecycle states of a camera worker, reported over the uplink and
/// exposed on `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Connecting,
    Running,
    Degraded,
    Failed,
    Retrying,
    Closed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Connecting => "connecting",
            WorkerState::Running => "running",
            WorkerState::Degraded => "degraded",
            WorkerState::Failed => "failed",
            WorkerState::Retrying => "retrying",
            WorkerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Events a worker reports to the server over its uplink WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// State machine transition.
    State {
        state: WorkerState,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Periodic pipeline statistics (1 Hz).
    Stats {
        fps: f32,
        frames_produced: u64,
        frames_dropped: u64,
        overlay_missed: u64,
    },
    /// Terminal error the server should not retry (auth, unsupported codec).
    Fatal { kind: String, message: String },
}

/// Commands the server sends to a worker over its uplink WebSocket.
/// Adjacently tagged so a nested enum never collides with the outer tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// A viewer joined; emit a keyframe so it can start decoding.
    ForceKeyframe,
    /// Shut the worker down gracefully.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stream_tag_is_kebab_case() {
        let msg = SignalMessage::StartStream {
            camera_id: "cam-entrance".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"start-stream""#));
        assert!(json.contains(r#""camera_id":"cam-entrance""#));
    }

    #[test]
    fn offer_roundtrip() {
        let msg = SignalMessage::Offer {
            sdp: "v=0\r\n...".to_string(),
            session_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"offer""#));
        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            SignalMessage::Offer { sdp, .. } => assert_eq!(sdp, "v=0\r\n..."),
            _ => panic!("Expected Offer"),
        }
    }

    #[test]
    fn ice_candidate_nested_payload() {
        let msg = SignalMessage::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 UDP 2130706431 192.168.1.40 40007 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
            session_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"ice-candidate""#));
        assert!(!json.contains("ice_candidate"));

        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            SignalMessage::IceCandidate { candidate, .. } => {
                assert!(candidate.candidate.starts_with("candidate:"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            _ => panic!("Expected IceCandidate"),
        }
    }

    #[test]
    fn ice_candidate_from_browser_format() {
        // What the web client actually sends: sdp fields may be absent
        let browser_json = r#"{
            "type": "ice-candidate",
            "candidate": {"candidate": "candidate:2 1 UDP 1694498815 10.0.0.3 40012 typ host"},
            "session_id": "00000000-0000-0000-0000-000000000000"
        }"#;
        let msg: SignalMessage = serde_json::from_str(browser_json).unwrap();
        match msg {
            SignalMessage::IceCandidate { candidate, .. } => {
                assert!(candidate.candidate.contains("typ host"));
                assert!(candidate.sdp_mid.is_none());
            }
            _ => panic!("Expected IceCandidate"),
        }
    }

    #[test]
    fn stop_has_no_payload() {
        let json = r#"{"type":"stop"}"#;
        let msg: SignalMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, SignalMessage::Stop));
    }

    #[test]
    fn error_and_ended_shapes() {
        let err = SignalMessage::Error {
            code: "camera-not-found".to_string(),
            message: "no such camera".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""code":"camera-not-found""#));

        let ended = SignalMessage::Ended {
            reason: "congested".to_string(),
        };
        let json = serde_json::to_string(&ended).unwrap();
        assert!(json.contains(r#""type":"ended""#));
        assert!(json.contains(r#""reason":"congested""#));
    }

    #[test]
    fn worker_state_serializes_snake_case() {
        let json = serde_json::to_string(&WorkerState::Retrying).unwrap();
        assert_eq!(json, r#""retrying""#);
        let state: WorkerState = serde_json::from_str(r#""degraded""#).unwrap();
        assert_eq!(state, WorkerState::Degraded);
    }

    #[test]
    fn worker_event_state_roundtrip() {
        let ev = WorkerEvent::State {
            state: WorkerState::Running,
            detail: None,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""event":"state""#));
        assert!(json.contains(r#""state":"running""#));
        // detail is omitted when None
        assert!(!json.contains("detail"));
        let _: WorkerEvent = serde_json::from_str(&json).unwrap();
    }

    #[test]
    fn worker_event_fatal_carries_kind() {
        let ev = WorkerEvent::Fatal {
            kind: "auth_error".to_string(),
            message: "RTSP 401 Unauthorized".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""event":"fatal""#));
        assert!(json.contains(r#""kind":"auth_error""#));
    }

    #[test]
    fn worker_command_adjacent_tagging() {
        let cmd = WorkerCommand::ForceKeyframe;
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""cmd":"force_keyframe""#));

        let cmd = WorkerCommand::Shutdown;
        let json = serde_json::to_string(&cmd).unwrap();
        let parsed: WorkerCommand = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, WorkerCommand::Shutdown));
    }
}
