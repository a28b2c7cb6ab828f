use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval, timeout};
use tracing::{debug, info, warn};
use vigil_protocol::{PacketHeader, SignalMessage, WorkerEvent, WorkerState};

use crate::fanout::{CameraChannel, EncodedPacket};
use crate::viewer::{SessionEvent, ViewerSession};
use crate::web::AppState;

/// Interval between WebSocket ping frames.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Three missed pings and the connection is considered dead.
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);
/// How long a viewer may wait for the camera to reach Running.
const WAIT_RUNNING_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT_RUNNING_POLL: Duration = Duration::from_millis(250);

/// Handle a WebSocket connection from a **camera worker**.
///
/// Worker sends binary framed packets → relayed to the camera's broadcast
/// channel (snapshots are cached instead). Worker sends JSON events →
/// folded into the camera status. Worker receives JSON commands.
pub async fn handle_worker_ws(mut socket: WebSocket, camera_id: String, state: Arc<AppState>) {
    let channel = state.registry.get_or_create(&camera_id).await;
    let mut commands = channel.commands.subscribe();

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick
    let mut last_pong = Instant::now();

    info!(%camera_id, "Worker uplink connected");

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    debug!(%camera_id, "Worker uplink ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            cmd = commands.recv() => {
                let cmd = match cmd {
                    Ok(c) => c,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(%camera_id, skipped = n, "Worker command consumer lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let json = match serde_json::to_string(&cmd) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!("Failed to serialize worker command: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Some(result) = socket.recv() => {
                match result {
                    Ok(Message::Binary(data)) => {
                        handle_worker_packet(&channel, &camera_id, Bytes::from(data));
                    }
                    Ok(Message::Text(text)) => {
                        handle_worker_event(&state, &channel, &camera_id, &text).await;
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => {
                        info!(%camera_id, "Worker uplink closed");
                        break;
                    }
                    Err(e) => {
                        debug!(%camera_id, "Worker uplink error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            else => break,
        }
    }

    info!(%camera_id, "Worker uplink disconnected");
}

fn handle_worker_packet(channel: &Arc<CameraChannel>, camera_id: &str, data: Bytes) {
    if let Err(e) = PacketHeader::validate_complete(&data) {
        warn!(%camera_id, "Worker sent malformed packet: {e}");
        return;
    }
    let header = PacketHeader::deserialize(&data).expect("validated header parses");
    let payload = data.slice(
        vigil_protocol::PACKET_HEADER_SIZE
            ..vigil_protocol::PACKET_HEADER_SIZE + header.payload_length as usize,
    );

    if header.is_snapshot() {
        channel.store_snapshot(payload);
        return;
    }

    // Fan out by reference; zero viewers is not an error
    let _ = channel.packets.send(Arc::new(EncodedPacket { header, payload }));
}

async fn handle_worker_event(
    state: &Arc<AppState>,
    channel: &Arc<CameraChannel>,
    camera_id: &str,
    text: &str,
) {
    match serde_json::from_str::<WorkerEvent>(text) {
        Ok(WorkerEvent::State {
            state: worker_state,
            detail,
        }) => {
            debug!(%camera_id, state = %worker_state, ?detail, "Worker state");
            let fatal_detail = (worker_state == WorkerState::Closed)
                .then_some(detail)
                .flatten();
            channel.set_state(worker_state, fatal_detail);
        }
        Ok(WorkerEvent::Stats { fps, .. }) => {
            channel.set_fps(fps);
        }
        Ok(WorkerEvent::Fatal { kind, message }) => {
            warn!(%camera_id, kind, message, "Worker reported fatal error");
            channel.set_state(WorkerState::Closed, Some(kind));
            state.workers.mark_fatal(camera_id).await;
        }
        Err(e) => {
            warn!(%camera_id, "Invalid worker event: {e}");
        }
    }
}

/// Handle a WebSocket connection from a **browser viewer**.
///
/// Protocol per the signaling schema: the client opens with start-stream,
/// the server offers once the camera is Running, the client answers, ICE
/// candidates trickle both ways, stop or socket close tears down.
pub async fn handle_browser_ws(mut socket: WebSocket, camera_id: String, state: Arc<AppState>) {
    info!(%camera_id, "Viewer WebSocket connected");

    let mut session: Option<ViewerSession> = None;
    let mut session_events: Option<mpsc::Receiver<SessionEvent>> = None;
    let mut _viewer_guard = None;

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    debug!(%camera_id, "Viewer ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            ev = recv_session_event(&mut session_events) => {
                match ev {
                    Some(SessionEvent::IceCandidate(candidate)) => {
                        if let Some(ref s) = session {
                            send_signal(&mut socket, &SignalMessage::IceCandidate {
                                candidate,
                                session_id: s.id,
                            }).await;
                        }
                    }
                    Some(SessionEvent::Ended { reason }) => {
                        send_signal(&mut socket, &SignalMessage::Ended { reason }).await;
                        break;
                    }
                    None => break,
                }
            }
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        let parsed: Result<SignalMessage, _> = serde_json::from_str(&text);
                        match parsed {
                            Ok(SignalMessage::StartStream { camera_id: requested }) => {
                                if session.is_some() {
                                    send_error(&mut socket, "already-started",
                                        "stream already negotiated on this socket").await;
                                    continue;
                                }
                                if requested != camera_id {
                                    send_error(&mut socket, "camera-mismatch",
                                        "camera_id does not match the socket path").await;
                                    continue;
                                }
                                match negotiate(&mut socket, &camera_id, &state).await {
                                    Some((s, events, guard)) => {
                                        session = Some(s);
                                        session_events = Some(events);
                                        _viewer_guard = Some(guard);
                                    }
                                    None => break,
                                }
                            }
                            Ok(SignalMessage::Answer { sdp, .. }) => {
                                match session {
                                    Some(ref s) => {
                                        if let Err(e) = s.handle_answer(&sdp).await {
                                            warn!(%camera_id, "Answer rejected: {e:#}");
                                            send_error(&mut socket, "bad-answer",
                                                "could not apply SDP answer").await;
                                        }
                                    }
                                    None => {
                                        send_error(&mut socket, "session-not-found",
                                            "no negotiated session on this socket").await;
                                    }
                                }
                            }
                            Ok(SignalMessage::IceCandidate { candidate, .. }) => {
                                match session {
                                    Some(ref s) => {
                                        if let Err(e) = s.add_ice_candidate(&candidate).await {
                                            debug!(%camera_id, "ICE candidate rejected: {e:#}");
                                        }
                                    }
                                    None => {
                                        send_error(&mut socket, "session-not-found",
                                            "no negotiated session on this socket").await;
                                    }
                                }
                            }
                            Ok(SignalMessage::Stop) => {
                                send_signal(&mut socket, &SignalMessage::Ended {
                                    reason: "stopped".to_string(),
                                }).await;
                                break;
                            }
                            Ok(other) => {
                                debug!(%camera_id, ?other, "Unexpected client message");
                            }
                            Err(e) => {
                                // Input-shape error: reported, never retried
                                warn!(%camera_id, "Malformed signaling message: {e}");
                                send_error(&mut socket, "bad-message",
                                    "message did not match the signaling schema").await;
                            }
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        debug!(%camera_id, "Viewer WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Teardown must be prompt: close the peer and recycle the UDP port
    if let Some(s) = session {
        s.close().await;
        state.ports.lock().unwrap_or_else(|e| e.into_inner()).release(s.port);
    }
    info!(%camera_id, "Viewer WebSocket disconnected");
}

/// Recv helper that stays pending while no session exists yet.
async fn recv_session_event(
    events: &mut Option<mpsc::Receiver<SessionEvent>>,
) -> Option<SessionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Run the offer side of the negotiation. Returns None when the viewer
/// cannot be served (socket already notified).
async fn negotiate(
    socket: &mut WebSocket,
    camera_id: &str,
    state: &Arc<AppState>,
) -> Option<(
    ViewerSession,
    mpsc::Receiver<SessionEvent>,
    crate::fanout::ViewerGuard,
)> {
    let Some(channel) = state.registry.get(camera_id).await else {
        send_error(socket, "camera-not-found", "no such camera").await;
        return None;
    };

    // The offer goes out only once the worker is Running (Degraded still
    // streams, so it counts).
    let ready = timeout(WAIT_RUNNING_TIMEOUT, async {
        loop {
            let status = channel.status();
            match status.state {
                WorkerState::Running | WorkerState::Degraded => return true,
                WorkerState::Closed => return false,
                _ => tokio::time::sleep(WAIT_RUNNING_POLL).await,
            }
        }
    })
    .await;
    match ready {
        Ok(true) => {}
        Ok(false) => {
            send_error(socket, "camera-closed", "camera worker is closed").await;
            return None;
        }
        Err(_) => {
            send_error(socket, "camera-not-ready", "camera is not streaming yet").await;
            return None;
        }
    }

    let port = {
        let mut ports = state.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports.allocate()
    };
    let Some(port) = port else {
        // Session-level resource exhaustion refuses the viewer only
        warn!(%camera_id, "UDP port pool exhausted");
        send_error(socket, "resource-exhausted", "no free UDP port for this session").await;
        return None;
    };

    let packets = channel.packets.subscribe();
    let kf_channel = Arc::clone(&channel);
    let keyframe_request = move || kf_channel.request_keyframe();
    let (session, events) =
        match ViewerSession::new(&state.config.webrtc, port, packets, keyframe_request).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%camera_id, "Failed to create viewer session: {e:#}");
            state.ports.lock().unwrap_or_else(|e| e.into_inner()).release(port);
            send_error(socket, "session-failed", "could not create WebRTC session").await;
            return None;
        }
    };

    let sdp = match session.create_offer().await {
        Ok(sdp) => sdp,
        Err(e) => {
            warn!(%camera_id, "Offer creation failed: {e:#}");
            session.close().await;
            state.ports.lock().unwrap_or_else(|e| e.into_inner()).release(port);
            send_error(socket, "session-failed", "could not create offer").await;
            return None;
        }
    };

    send_signal(
        socket,
        &SignalMessage::Offer {
            sdp,
            session_id: session.id,
        },
    )
    .await;

    // The join keyframe: late joiners wait for it before seeing video
    channel.request_keyframe();
    let guard = channel.register_viewer();
    info!(%camera_id, session_id = %session.id, "Viewer session negotiated");

    Some((session, events, guard))
}

async fn send_signal(socket: &mut WebSocket, msg: &SignalMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = socket.send(Message::Text(json.into())).await;
        }
        Err(e) => warn!("Failed to serialize signaling message: {e}"),
    }
}

async fn send_error(socket: &mut WebSocket, code: &str, message: &str) {
    send_signal(
        socket,
        &SignalMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        },
    )
    .await;
}
