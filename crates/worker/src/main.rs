mod bus;
mod capture;
mod cli;
mod control;
mod dispatch;
mod encode;
mod error;
mod overlay;
mod pipeline;
mod state;
mod uplink;
mod vp8;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};
use vigil_recognition::{EngineConfig, RecognitionEngine, RecognitionError, UnknownPolicy};

use crate::control::ControlPlane;
use crate::dispatch::ResultRouterHandle;
use crate::overlay::Overlay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    gstreamer::init().context("Failed to initialize GStreamer")?;

    let args = cli::parse_args()?;
    let config = vigil_protocol::load_config(&args.config_path)
        .with_context(|| format!("Failed to load config from {}", args.config_path.display()))?;

    let camera = args.camera();
    info!(
        camera_id = %camera.id,
        source = ?camera.source,
        fps_limit = camera.fps_limit,
        server_url = %args.server_url,
        "Starting vigil-worker"
    );

    let engine = Arc::new(RecognitionEngine::start(EngineConfig {
        model_dir: PathBuf::from(&config.recognition.model_dir),
        det_conf_min: config.recognition.det_conf_min,
        sim_match: config.recognition.sim_match,
    }));
    let policy = Arc::new(Mutex::new(UnknownPolicy::new(config.unknown.clone())));
    let overlay = Overlay::new(&config.overlay.font_path, config.unknown.min_quality);
    let control = Arc::new(ControlPlane::new(&config.server.control_plane_url)?);
    let router = Arc::new(ResultRouterHandle::new(Duration::from_millis(
        config.overlay.skew_window_ms,
    )));
    let force_keyframe = Arc::new(AtomicBool::new(false));

    // Uplink outbox: encoded packets, snapshots, and state events.
    // Bounded so a dead uplink sheds packets instead of buffering latency.
    let (outbox_tx, mut outbox_rx) = mpsc::channel(32);

    let catalog_poll = Duration::from_secs(config.recognition.catalog_poll_s.max(1));
    let ctx = pipeline::WorkerCtx {
        camera: camera.clone(),
        config,
        engine: Arc::clone(&engine),
        policy,
        overlay,
        control: Arc::clone(&control),
        router,
        outbox: outbox_tx,
        force_keyframe: Arc::clone(&force_keyframe),
        recent_reports: Arc::new(Mutex::new(HashMap::new())),
    };
    let uplink_ctx = uplink::UplinkCtx {
        server_url: &args.server_url,
        camera_id: &args.camera_id,
        worker_token: args.worker_token.as_deref(),
        force_keyframe,
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        // The pipeline with its self-healing loop; returns only on fatal
        _ = pipeline::run_worker(ctx) => {
            info!("Pipeline closed");
        }

        // Uplink to the server; returns on shutdown command
        _ = uplink::run_uplink(&uplink_ctx, &mut outbox_rx) => {
            info!("Uplink finished");
        }

        // Person catalog polling and index reloads
        _ = catalog_poll_loop(&engine, &control, catalog_poll) => {}

        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    info!(camera_id = %camera.id, "Worker shutdown complete");
    Ok(())
}

/// Keep the identity index in step with the person catalog.
///
/// The control plane exposes a monotonic catalog version; a reload happens
/// only when it advances, and always swaps a complete snapshot.
async fn catalog_poll_loop(
    engine: &RecognitionEngine,
    control: &ControlPlane,
    interval: Duration,
) {
    loop {
        let current = engine.index_version();
        let remote = match control.catalog_version().await {
            Ok(v) => v,
            Err(e) => {
                warn!("Catalog version poll failed: {e:#}");
                tokio::time::sleep(interval).await;
                continue;
            }
        };

        if remote > current || current == 0 {
            // Full snapshot: a scan-based index rebuilds in one pass, so
            // partial application buys nothing.
            match control.fetch_catalog(0).await {
                Ok(catalog) => match engine.reload_index(&catalog) {
                    Ok(outcome) => info!(?outcome, "Index reload"),
                    Err(RecognitionError::VersionMismatch { current, requested }) => {
                        warn!(current, requested, "Stale catalog fetch, will re-read");
                    }
                    Err(e) => warn!("Index reload failed: {e}"),
                },
                Err(e) => warn!("Catalog fetch failed: {e:#}"),
            }
        }

        tokio::time::sleep(interval).await;
    }
}
