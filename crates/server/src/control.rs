//! Control-plane client for the server: camera catalog enumeration.

use std::time::Duration;

use anyhow::Context;
use vigil_protocol::CameraSnapshot;

pub struct ControlPlane {
    base: String,
    http: reqwest::Client,
}

impl ControlPlane {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build control-plane HTTP client")?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn fetch_cameras(&self) -> anyhow::Result<Vec<CameraSnapshot>> {
        self.http
            .get(format!("{}/api/v1/cameras", self.base))
            .send()
            .await
            .context("GET /api/v1/cameras failed")?
            .error_for_status()?
            .json()
            .await
            .context("Invalid cameras payload")
    }

    /// Fetch the camera catalog, retrying while the control plane boots.
    /// Gives up after `attempts` tries and returns the last error.
    pub async fn fetch_cameras_with_retry(
        &self,
        attempts: u32,
    ) -> anyhow::Result<Vec<CameraSnapshot>> {
        let mut delay = Duration::from_secs(2);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.fetch_cameras().await {
                Ok(cameras) => return Ok(cameras),
                Err(e) => {
                    tracing::warn!(attempt, attempts, "Camera catalog fetch failed: {e:#}");
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(30));
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made")))
    }
}
