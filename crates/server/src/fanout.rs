//! Per-camera fan-out: encoded packets from the worker uplink are
//! broadcast to every viewer session, worker state is cached for
//! `/health`, and the latest JPEG still backs `/snapshot`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{RwLock, broadcast};
use vigil_protocol::{PacketHeader, WorkerCommand, WorkerState};

/// One encoded VP8 packet, shared by reference across sessions. Fan-out
/// copies the Arc, never the payload.
#[derive(Debug)]
pub struct EncodedPacket {
    pub header: PacketHeader,
    pub payload: Bytes,
}

/// Worker status as last reported over the uplink.
#[derive(Debug, Clone)]
pub struct CameraStatus {
    pub state: WorkerState,
    pub fps: f32,
    pub fatal: Option<String>,
}

impl Default for CameraStatus {
    fn default() -> Self {
        Self {
            state: WorkerState::Idle,
            fps: 0.0,
            fatal: None,
        }
    }
}

pub struct CameraChannel {
    /// Encoded packets toward viewer sessions
    pub packets: broadcast::Sender<Arc<EncodedPacket>>,
    /// Commands toward the worker (keyframe requests, shutdown)
    pub commands: broadcast::Sender<WorkerCommand>,
    status: Mutex<CameraStatus>,
    snapshot: Mutex<Option<Bytes>>,
    viewers: AtomicUsize,
}

impl CameraChannel {
    fn new() -> Self {
        let (packets, _) = broadcast::channel(64);
        let (commands, _) = broadcast::channel(8);
        Self {
            packets,
            commands,
            status: Mutex::new(CameraStatus::default()),
            snapshot: Mutex::new(None),
            viewers: AtomicUsize::new(0),
        }
    }

    pub fn status(&self) -> CameraStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_state(&self, state: WorkerState, fatal: Option<String>) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.state = state;
        if fatal.is_some() {
            status.fatal = fatal;
        }
    }

    pub fn set_fps(&self, fps: f32) {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).fps = fps;
    }

    pub fn store_snapshot(&self, jpeg: Bytes) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(jpeg);
    }

    pub fn latest_snapshot(&self) -> Option<Bytes> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::Relaxed)
    }

    /// RAII viewer registration; the count drops with the guard.
    pub fn register_viewer(self: &Arc<Self>) -> ViewerGuard {
        self.viewers.fetch_add(1, Ordering::Relaxed);
        ViewerGuard {
            channel: Arc::clone(self),
        }
    }

    /// Ask the worker for a keyframe (new viewer joined).
    pub fn request_keyframe(&self) {
        // No worker connected is fine; it will force one on reconnect
        let _ = self.commands.send(WorkerCommand::ForceKeyframe);
    }
}

pub struct ViewerGuard {
    channel: Arc<CameraChannel>,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.channel.viewers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Registry of per-camera channels, created up front from the camera
/// catalog. Workers and viewers meet here.
pub struct CameraRegistry {
    channels: RwLock<HashMap<String, Arc<CameraChannel>>>,
}

impl Default for CameraRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, camera_id: &str) -> Arc<CameraChannel> {
        {
            let channels = self.channels.read().await;
            if let Some(ch) = channels.get(camera_id) {
                return Arc::clone(ch);
            }
        }
        let mut channels = self.channels.write().await;
        Arc::clone(
            channels
                .entry(camera_id.to_string())
                .or_insert_with(|| Arc::new(CameraChannel::new())),
        )
    }

    pub async fn get(&self, camera_id: &str) -> Option<Arc<CameraChannel>> {
        self.channels.read().await.get(camera_id).cloned()
    }

    pub async fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let registry = CameraRegistry::new();
        let a = registry.get_or_create("cam-1").await;
        let b = registry.get_or_create("cam-1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn unknown_camera_is_none() {
        let registry = CameraRegistry::new();
        assert!(registry.get("cam-x").await.is_none());
    }

    #[tokio::test]
    async fn viewer_guard_tracks_count() {
        let registry = CameraRegistry::new();
        let channel = registry.get_or_create("cam-1").await;
        assert_eq!(channel.viewer_count(), 0);
        let g1 = channel.register_viewer();
        let g2 = channel.register_viewer();
        assert_eq!(channel.viewer_count(), 2);
        drop(g1);
        assert_eq!(channel.viewer_count(), 1);
        drop(g2);
        assert_eq!(channel.viewer_count(), 0);
    }

    #[tokio::test]
    async fn status_updates_are_visible() {
        let registry = CameraRegistry::new();
        let channel = registry.get_or_create("cam-1").await;
        channel.set_state(WorkerState::Running, None);
        channel.set_fps(9.7);
        let status = channel.status();
        assert_eq!(status.state, WorkerState::Running);
        assert!((status.fps - 9.7).abs() < 1e-6);
        assert!(status.fatal.is_none());
    }

    #[tokio::test]
    async fn fatal_detail_sticks() {
        let registry = CameraRegistry::new();
        let channel = registry.get_or_create("cam-1").await;
        channel.set_state(WorkerState::Closed, Some("auth_error".into()));
        channel.set_state(WorkerState::Closed, None);
        assert_eq!(channel.status().fatal.as_deref(), Some("auth_error"));
    }

    #[tokio::test]
    async fn packets_fan_out_to_all_subscribers() {
        let registry = CameraRegistry::new();
        let channel = registry.get_or_create("cam-1").await;
        let mut rx1 = channel.packets.subscribe();
        let mut rx2 = channel.packets.subscribe();

        let packet = Arc::new(EncodedPacket {
            header: PacketHeader::video(640, 480, 0, 0, 3, true, false),
            payload: Bytes::from_static(&[1, 2, 3]),
        });
        channel.packets.send(Arc::clone(&packet)).unwrap();

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        // Same allocation, byte-identical for every viewer
        assert!(Arc::ptr_eq(&a, &packet));
        assert!(Arc::ptr_eq(&b, &packet));
    }
}
