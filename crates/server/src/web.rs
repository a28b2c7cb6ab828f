use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Deserialize;
use vigil_protocol::{CameraHealth, HealthReport, VigilConfig};

use crate::fanout::CameraRegistry;
use crate::ports::PortAllocator;
use crate::signaling;
use crate::workers::WorkerManager;

/// Shared application state.
pub struct AppState {
    pub config: VigilConfig,
    pub registry: Arc<CameraRegistry>,
    pub workers: Arc<WorkerManager>,
    pub ports: std::sync::Mutex<PortAllocator>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/{camera_id}", get(browser_ws_upgrade))
        .route("/ws/worker/{camera_id}", get(worker_ws_upgrade))
        .route("/health", get(health))
        .route("/snapshot/{camera_id}", get(snapshot))
        .with_state(state)
}

async fn browser_ws_upgrade(
    Path(camera_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| signaling::handle_browser_ws(socket, camera_id, state))
}

#[derive(Deserialize)]
struct WorkerAuthQuery {
    token: Option<String>,
}

async fn worker_ws_upgrade(
    Path(camera_id): Path<String>,
    Query(auth): Query<WorkerAuthQuery>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = auth.token.unwrap_or_default();
    if !state.workers.verify_token(&camera_id, &token).await {
        tracing::warn!(%camera_id, "Worker uplink rejected: bad token");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| signaling::handle_worker_ws(socket, camera_id, state))
        .into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    let mut cameras = Vec::new();
    for id in state.registry.camera_ids().await {
        if let Some(channel) = state.registry.get(&id).await {
            let status = channel.status();
            cameras.push(CameraHealth {
                id,
                state: status.state,
                fps: status.fps,
                viewers: channel.viewer_count(),
            });
        }
    }
    Json(HealthReport {
        status: "ok".to_string(),
        cameras,
    })
}

/// Latest annotated JPEG for a camera. Best effort: empty during
/// Connecting, 404 for cameras that do not exist.
async fn snapshot(
    Path(camera_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some(channel) = state.registry.get(&camera_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match channel.latest_snapshot() {
        Some(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
