use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use vigil_protocol::{CameraSnapshot, ServerConfig, SourceKind};

use crate::fanout::CameraRegistry;

/// Delay before restarting a worker that exited unexpectedly. Workers run
/// their own reconnect backoff internally; this only covers crashes.
const RESTART_DELAY: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Constant-time byte comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a random hex token for worker uplink authentication.
fn generate_worker_token() -> String {
    use std::fmt::Write;
    use std::io::Read;
    let mut bytes = [0u8; 32];
    let f = std::fs::File::open("/dev/urandom").expect("Failed to open /dev/urandom");
    (&f).read_exact(&mut bytes)
        .expect("Failed to read random bytes");
    let mut hex = String::with_capacity(64);
    for b in &bytes {
        write!(hex, "{b:02x}").unwrap();
    }
    hex
}

struct ManagedWorker {
    camera: CameraSnapshot,
    child: Option<Child>,
    pid: Option<u32>,
    token: String,
    /// Set when the worker reported a fatal error; blocks auto-restart
    fatal: bool,
    restarts: u32,
}

/// Spawns and supervises one `vigil-worker` process per enabled camera.
/// Restarts are serialized per camera: only the monitor task respawns, so
/// two pipelines for one camera can never coexist.
pub struct WorkerManager {
    workers: RwLock<HashMap<String, ManagedWorker>>,
    server_config: ServerConfig,
    config_path: String,
    uplink_url: String,
}

impl WorkerManager {
    pub fn new(server_config: ServerConfig, config_path: String) -> Self {
        let uplink_url = format!("ws://127.0.0.1:{}", server_config.port);
        Self {
            workers: RwLock::new(HashMap::new()),
            server_config,
            config_path,
            uplink_url,
        }
    }

    /// Spawn workers for every enabled camera and their monitor tasks.
    pub async fn spawn_all(
        self: &Arc<Self>,
        cameras: Vec<CameraSnapshot>,
        registry: Arc<CameraRegistry>,
    ) {
        for camera in cameras {
            if !camera.enabled {
                tracing::info!(camera_id = %camera.id, "Camera disabled, skipping");
                continue;
            }
            registry.get_or_create(&camera.id).await;
            if let Err(e) = self.spawn_worker(camera.clone()).await {
                tracing::error!(camera_id = %camera.id, "Failed to spawn worker: {e:#}");
                continue;
            }
            self.spawn_monitor(camera.id.clone());
        }
    }

    async fn spawn_worker(&self, camera: CameraSnapshot) -> Result<()> {
        let token = generate_worker_token();
        let child = self.launch(&camera, &token).await?;
        let pid = child.id();
        tracing::info!(
            camera_id = %camera.id,
            pid = pid.unwrap_or(0),
            "Worker process spawned"
        );

        let mut workers = self.workers.write().await;
        workers.insert(
            camera.id.clone(),
            ManagedWorker {
                camera,
                child: Some(child),
                pid,
                token,
                fatal: false,
                restarts: 0,
            },
        );
        Ok(())
    }

    async fn launch(&self, camera: &CameraSnapshot, token: &str) -> Result<Child> {
        let binary = self
            .server_config
            .worker_binary
            .clone()
            .unwrap_or_else(|| "vigil-worker".to_string());

        let source = match camera.source {
            SourceKind::Rtsp => "rtsp",
            SourceKind::File => "file",
        };

        let mut cmd = Command::new(&binary);
        cmd.arg("--camera-id")
            .arg(&camera.id)
            .arg("--camera-name")
            .arg(&camera.name)
            .arg("--server-url")
            .arg(&self.uplink_url)
            .arg("--source")
            .arg(source)
            .arg("--uri")
            .arg(&camera.uri)
            .arg("--fps-limit")
            .arg(camera.fps_limit.to_string())
            .arg("--config")
            .arg(&self.config_path);

        // Secrets go through the environment: argv is world-readable via
        // /proc/<pid>/cmdline.
        cmd.env("VIGIL_WORKER_TOKEN", token);
        if let Some(ref creds) = camera.credentials {
            cmd.env("VIGIL_SOURCE_USER", &creds.username);
            cmd.env("VIGIL_SOURCE_PASS", &creds.password);
        }
        cmd.env("RUST_LOG", "info");

        // Per-camera log file. Never use Stdio::piped() without reading the
        // pipe - the 64KB pipe buffer fills up and blocks the worker.
        let log_dir = &self.server_config.worker_log_dir;
        let _ = std::fs::create_dir_all(log_dir);
        let log_path = format!("{}/worker-{}.log", log_dir, camera.id);
        let log_file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create worker log at {log_path}"))?;
        let log_file_clone = log_file
            .try_clone()
            .context("Failed to clone worker log file")?;

        let child = cmd
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_clone))
            .spawn()
            .with_context(|| format!("Failed to spawn {binary} for camera {}", camera.id))?;
        Ok(child)
    }

    /// Monitor one worker: wait for exit, restart unless it went fatal.
    fn spawn_monitor(self: &Arc<Self>, camera_id: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let mut child = {
                    let mut workers = manager.workers.write().await;
                    match workers.get_mut(&camera_id).and_then(|w| w.child.take()) {
                        Some(c) => c,
                        None => return,
                    }
                };

                let status = child.wait().await;
                tracing::warn!(
                    camera_id = %camera_id,
                    status = ?status,
                    "Worker process exited"
                );

                let (fatal, camera, restarts) = {
                    let mut workers = manager.workers.write().await;
                    let Some(w) = workers.get_mut(&camera_id) else {
                        return;
                    };
                    w.pid = None;
                    w.restarts += 1;
                    (w.fatal, w.camera.clone(), w.restarts)
                };

                if fatal {
                    tracing::error!(
                        camera_id = %camera_id,
                        "Worker terminated fatally, not restarting"
                    );
                    return;
                }

                tokio::time::sleep(RESTART_DELAY).await;
                tracing::info!(camera_id = %camera_id, restarts, "Restarting worker");
                let token = generate_worker_token();
                match manager.launch(&camera, &token).await {
                    Ok(child) => {
                        let mut workers = manager.workers.write().await;
                        if let Some(w) = workers.get_mut(&camera_id) {
                            w.pid = child.id();
                            w.child = Some(child);
                            w.token = token;
                        }
                    }
                    Err(e) => {
                        tracing::error!(camera_id = %camera_id, "Worker respawn failed: {e:#}");
                        return;
                    }
                }
            }
        });
    }

    /// Mark a worker fatal (it reported auth failure or a missing codec);
    /// the monitor will let it rest when the process exits.
    pub async fn mark_fatal(&self, camera_id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(w) = workers.get_mut(camera_id) {
            w.fatal = true;
        }
    }

    /// Verify a worker's uplink token in constant time.
    pub async fn verify_token(&self, camera_id: &str, token: &str) -> bool {
        let workers = self.workers.read().await;
        workers
            .get(camera_id)
            .map(|w| constant_time_eq(w.token.as_bytes(), token.as_bytes()))
            .unwrap_or(false)
    }

    /// SIGTERM every worker and wait briefly; stragglers get killed.
    pub async fn shutdown_all(&self) {
        let mut workers = self.workers.write().await;
        for (camera_id, worker) in workers.iter_mut() {
            worker.fatal = true; // block monitor restarts during shutdown
            if let Some(pid) = worker.pid {
                tracing::info!(camera_id = %camera_id, pid, "Sending SIGTERM to worker");
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
        }
        for (camera_id, worker) in workers.iter_mut() {
            if let Some(ref mut child) = worker.child {
                match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::info!(camera_id = %camera_id, ?status, "Worker exited");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(camera_id = %camera_id, "Error waiting for worker: {e}");
                    }
                    Err(_) => {
                        tracing::warn!(camera_id = %camera_id, "Worker did not exit in time, killing");
                        let _ = child.kill().await;
                    }
                }
            }
        }
    }
}
