//! Control-plane client: person catalog polling and event reporting.

use std::time::Duration;

use anyhow::Context;
use vigil_protocol::{
    CatalogSnapshot, EmbeddingRecord, FatalEventReport, PersonSnapshot, RecognitionReport,
    UnknownReport,
};

/// Header carrying the embeddings catalog version on `/api/v1/persons`.
const VERSION_HEADER: &str = "x-embeddings-version";

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

    /// Current embeddings catalog version, read from the persons endpoint
    /// without fetching embedding payloads.
    pub async fn catalog_version(&self) -> anyhow::Result<u64> {
        let resp = self
            .http
            .get(format!("{}/api/v1/persons", self.base))
            .send()
            .await
            .context("GET /api/v1/persons failed")?
            .error_for_status()?;
        Ok(parse_version(resp.headers().get(VERSION_HEADER)))
    }

    /// Fetch the full person catalog and all embeddings newer than `since`.
    pub async fn fetch_catalog(&self, since: u64) -> anyhow::Result<CatalogSnapshot> {
        let resp = self
            .http
            .get(format!("{}/api/v1/persons", self.base))
            .send()
            .await
            .context("GET /api/v1/persons failed")?
            .error_for_status()?;
        let version = parse_version(resp.headers().get(VERSION_HEADER));
        let persons: Vec<PersonSnapshot> =
            resp.json().await.context("Invalid persons payload")?;

        let embeddings: Vec<EmbeddingRecord> = self
            .http
            .get(format!("{}/api/v1/embeddings", self.base))
            .query(&[("since", since)])
            .send()
            .await
            .context("GET /api/v1/embeddings failed")?
            .error_for_status()?
            .json()
            .await
            .context("Invalid embeddings payload")?;

        Ok(CatalogSnapshot {
            version,
            persons,
            embeddings,
        })
    }

    pub async fn report_recognition(&self, report: &RecognitionReport) -> anyhow::Result<()> {
        self.http
            .post(format!("{}/api/v1/recognitions", self.base))
            .json(report)
            .send()
            .await
            .context("POST /api/v1/recognitions failed")?
            .error_for_status()?;
        Ok(())
    }

    pub async fn report_unknown(&self, report: &UnknownReport) -> anyhow::Result<()> {
        self.http
            .post(format!("{}/api/v1/unknowns", self.base))
            .json(report)
            .send()
            .await
            .context("POST /api/v1/unknowns failed")?
            .error_for_status()?;
        Ok(())
    }

    /// Best effort: a fatal report that cannot be delivered is logged and
    /// forgotten; local cleanup must not depend on the control plane.
    pub async fn report_fatal(&self, report: &FatalEventReport) {
        let result = self
            .http
            .post(format!("{}/api/v1/events", self.base))
            .json(report)
            .send()
            .await;
        match result.and_then(|r| r.error_for_status()) {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Fatal event report not delivered: {e}");
            }
        }
    }
}

fn parse_version(header: Option<&reqwest::header::HeaderValue>) -> u64 {
    header
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}
