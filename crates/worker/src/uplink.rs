use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use vigil_protocol::WorkerCommand;

/// Outgoing uplink messages: framed encoded packets (binary) and worker
/// events (JSON text).
pub(crate) type WsSender = mpsc::Sender<Message>;

pub(crate) struct UplinkCtx<'a> {
    pub server_url: &'a str,
    pub camera_id: &'a str,
    pub worker_token: Option<&'a str>,
    /// Set when the server asks for a keyframe; cleared by the pipeline.
    pub force_keyframe: Arc<AtomicBool>,
}

/// Run the uplink WebSocket with reconnect.
///
/// Returns when the server sends a shutdown command or the outbox closes.
pub(crate) async fn run_uplink(ctx: &UplinkCtx<'_>, outbox_rx: &mut mpsc::Receiver<Message>) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(60);
    loop {
        info!(url = ctx.server_url, "Connecting to server uplink");
        match connect_and_relay(ctx, outbox_rx).await {
            Ok(()) => {
                info!("Uplink closed cleanly");
                return;
            }
            Err(e) => {
                warn!("Uplink error: {e:#}");
                info!("Reconnecting uplink in {} seconds", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

async fn connect_and_relay(
    ctx: &UplinkCtx<'_>,
    outbox_rx: &mut mpsc::Receiver<Message>,
) -> anyhow::Result<()> {
    let url = match ctx.worker_token {
        Some(token) => format!(
            "{}/ws/worker/{}?token={}",
            ctx.server_url,
            ctx.camera_id,
            urlencoding::encode(token)
        ),
        None => format!("{}/ws/worker/{}", ctx.server_url, ctx.camera_id),
    };

    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .context("Uplink WebSocket connection failed")?;
    info!("Uplink connected");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Stale packets from before the reconnect are useless to viewers;
    // drop them and start clean with a fresh keyframe.
    let mut drained = 0u32;
    while outbox_rx.try_recv().is_ok() {
        drained += 1;
    }
    if drained > 0 {
        debug!(drained, "Dropped stale uplink messages after reconnect");
    }
    ctx.force_keyframe.store(true, Ordering::Relaxed);

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WorkerCommand>(&text) {
                            Ok(WorkerCommand::ForceKeyframe) => {
                                debug!("Server requested keyframe");
                                ctx.force_keyframe.store(true, Ordering::Relaxed);
                            }
                            Ok(WorkerCommand::Shutdown) => {
                                info!("Received shutdown command from server");
                                return Ok(());
                            }
                            Err(e) => {
                                warn!("Invalid command from server: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("server closed the uplink");
                    }
                    Some(Err(e)) => {
                        return Err(e.into());
                    }
                    _ => {}
                }
            }
            msg = outbox_rx.recv() => {
                match msg {
                    Some(msg) => ws_tx.send(msg).await.context("Uplink send failed")?,
                    // Pipeline gone; nothing left to relay
                    None => return Ok(()),
                }
            }
        }
    }
}
