mod control;
mod fanout;
mod ports;
mod signaling;
mod viewer;
mod web;
mod workers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::fanout::CameraRegistry;
use crate::ports::PortAllocator;
use crate::web::AppState;
use crate::workers::WorkerManager;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("/etc/vigil/vigil.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = vigil_protocol::load_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if config_path.exists() {
        tracing::info!("Loaded config from {}", config_path.display());
    } else {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            config_path.display()
        );
    }
    if let Some(p) = port_override {
        config.server.port = p;
    }

    // Validate configuration semantics
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    // Camera catalog from the control plane; the server is useless without
    // it, so keep trying for a while before giving up.
    let control = control::ControlPlane::new(&config.server.control_plane_url)?;
    let cameras = control
        .fetch_cameras_with_retry(5)
        .await
        .context("Control plane unreachable, cannot enumerate cameras")?;
    tracing::info!(count = cameras.len(), "Camera catalog loaded");

    let registry = Arc::new(CameraRegistry::new());
    let workers = Arc::new(WorkerManager::new(
        config.server.clone(),
        config_path.display().to_string(),
    ));
    workers.spawn_all(cameras, Arc::clone(&registry)).await;

    let ports = PortAllocator::new(config.webrtc.udp_port_min, config.webrtc.udp_port_max);
    let state = Arc::new(AppState {
        config,
        registry,
        workers: Arc::clone(&workers),
        ports: std::sync::Mutex::new(ports),
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  Vigil Camera Streaming Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Listening on http://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Workers outlive no one: stop them before exiting
    tracing::info!("Shutting down camera workers");
    workers.shutdown_all().await;
    tracing::info!("Vigil server shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
