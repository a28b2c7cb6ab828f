use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub unknown: UnknownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the signaling/session host
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL of the control plane (camera/person catalog)
    #[serde(default = "default_control_plane_url")]
    pub control_plane_url: String,
    /// Directory for per-camera worker log files
    #[serde(default = "default_worker_log_dir")]
    pub worker_log_dir: String,
    /// Override the worker binary path (default: resolve from PATH)
    pub worker_binary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// First UDP port used for ICE host candidates
    #[serde(default = "default_udp_port_min")]
    pub udp_port_min: u16,
    /// Last UDP port used for ICE host candidates (inclusive)
    #[serde(default = "default_udp_port_max")]
    pub udp_port_max: u16,
    /// Target VP8 bitrate in kbps
    #[serde(default = "default_bitrate_kbps")]
    pub target_bitrate_kbps: u32,
    /// Keyframe interval in seconds
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval_s: u32,
    /// LAN mode: host candidates only, no STUN
    #[serde(default = "default_true")]
    pub lan_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    /// Directory holding the detection and embedding ONNX models
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    /// Similarity threshold for a known-identity match
    #[serde(default = "default_sim_match")]
    pub sim_match: f32,
    /// Minimum detector confidence to keep a face
    #[serde(default = "default_det_conf_min")]
    pub det_conf_min: f32,
    /// Seconds between person-catalog polls
    #[serde(default = "default_catalog_poll_s")]
    pub catalog_poll_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// How long to wait for a frame's recognition result before passing through
    #[serde(default = "default_overlay_deadline_ms")]
    pub deadline_ms: u64,
    /// How long a recognition result stays matchable to its frame
    #[serde(default = "default_skew_window_ms")]
    pub skew_window_ms: u64,
    /// TTF used for identity labels; boxes only if it cannot be loaded
    #[serde(default = "default_font_path")]
    pub font_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnknownConfig {
    /// Cosine distance under which two unknown faces are the same candidate
    #[serde(default = "default_cluster_dist")]
    pub cluster_dist: f32,
    /// Minimum continuous presence before admission (ms)
    #[serde(default = "default_min_presence_ms")]
    pub min_presence_ms: u64,
    /// Minimum frames a candidate must appear in
    #[serde(default = "default_min_frames")]
    pub min_frames: u32,
    /// Minimum face side length in pixels
    #[serde(default = "default_min_face_px")]
    pub min_face_px: u32,
    /// Minimum quality score
    #[serde(default = "default_min_quality")]
    pub min_quality: f32,
    /// Per-cluster re-admission cooldown (ms)
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Candidates not updated for this long are evicted (ms)
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            control_plane_url: default_control_plane_url(),
            worker_log_dir: default_worker_log_dir(),
            worker_binary: None,
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            udp_port_min: default_udp_port_min(),
            udp_port_max: default_udp_port_max(),
            target_bitrate_kbps: default_bitrate_kbps(),
            keyframe_interval_s: default_keyframe_interval(),
            lan_mode: true,
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            sim_match: default_sim_match(),
            det_conf_min: default_det_conf_min(),
            catalog_poll_s: default_catalog_poll_s(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_overlay_deadline_ms(),
            skew_window_ms: default_skew_window_ms(),
            font_path: default_font_path(),
        }
    }
}

impl Default for UnknownConfig {
    fn default() -> Self {
        Self {
            cluster_dist: default_cluster_dist(),
            min_presence_ms: default_min_presence_ms(),
            min_frames: default_min_frames(),
            min_face_px: default_min_face_px(),
            min_quality: default_min_quality(),
            cooldown_ms: default_cooldown_ms(),
            idle_ms: default_idle_ms(),
        }
    }
}

impl VigilConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the process should not
    /// start) or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.server.control_plane_url.is_empty() {
            issues.push("ERROR: server.control_plane_url must not be empty.".to_string());
        } else if !self.server.control_plane_url.starts_with("http://")
            && !self.server.control_plane_url.starts_with("https://")
        {
            issues.push(format!(
                "ERROR: server.control_plane_url '{}' must start with http:// or https://.",
                self.server.control_plane_url
            ));
        }

        // --- UDP port range ---
        if self.webrtc.udp_port_min >= self.webrtc.udp_port_max {
            issues.push(format!(
                "ERROR: webrtc.udp_port_min ({}) must be below webrtc.udp_port_max ({}).",
                self.webrtc.udp_port_min, self.webrtc.udp_port_max
            ));
        } else {
            let span = self.webrtc.udp_port_max - self.webrtc.udp_port_min + 1;
            if span < 4 {
                issues.push(format!(
                    "ERROR: UDP port range {}-{} has only {} ports. \
                     Each viewer session needs one; allow at least 4.",
                    self.webrtc.udp_port_min, self.webrtc.udp_port_max, span
                ));
            }
        }
        if self.webrtc.udp_port_min < 1024 {
            issues.push(format!(
                "ERROR: webrtc.udp_port_min must be >= 1024 (unprivileged), got {}.",
                self.webrtc.udp_port_min
            ));
        }

        // --- Bitrate ---
        if self.webrtc.target_bitrate_kbps == 0 {
            issues.push("ERROR: webrtc.target_bitrate_kbps must be >= 1.".to_string());
        } else if self.webrtc.target_bitrate_kbps > 20_000 {
            issues.push(format!(
                "WARNING: webrtc.target_bitrate_kbps is {}, unusually high for a \
                 surveillance stream. Typical values: 500-4000 kbps.",
                self.webrtc.target_bitrate_kbps
            ));
        }

        // --- Keyframe interval ---
        if self.webrtc.keyframe_interval_s == 0 || self.webrtc.keyframe_interval_s > 30 {
            issues.push(format!(
                "ERROR: webrtc.keyframe_interval_s must be between 1 and 30, got {}. \
                 Late-joining viewers wait for a keyframe before seeing video.",
                self.webrtc.keyframe_interval_s
            ));
        }

        // --- Recognition thresholds ---
        if !(0.0..=1.0).contains(&self.recognition.sim_match) {
            issues.push(format!(
                "ERROR: recognition.sim_match must be within [0.0, 1.0], got {}.",
                self.recognition.sim_match
            ));
        }
        if !(0.0..=1.0).contains(&self.recognition.det_conf_min) {
            issues.push(format!(
                "ERROR: recognition.det_conf_min must be within [0.0, 1.0], got {}.",
                self.recognition.det_conf_min
            ));
        }
        if self.recognition.sim_match < 0.4 && (0.0..=1.0).contains(&self.recognition.sim_match) {
            issues.push(format!(
                "WARNING: recognition.sim_match = {} will match almost any face. \
                 Values below 0.4 produce frequent misidentifications.",
                self.recognition.sim_match
            ));
        }

        // --- Overlay ---
        if self.overlay.deadline_ms == 0 || self.overlay.deadline_ms > 2000 {
            issues.push(format!(
                "ERROR: overlay.deadline_ms must be between 1 and 2000, got {}.",
                self.overlay.deadline_ms
            ));
        }
        if self.overlay.skew_window_ms < self.overlay.deadline_ms {
            issues.push(format!(
                "ERROR: overlay.skew_window_ms ({}) must be >= overlay.deadline_ms ({}); \
                 results would expire before the overlay stops waiting for them.",
                self.overlay.skew_window_ms, self.overlay.deadline_ms
            ));
        }

        // --- Unknown policy ---
        if !(0.0..=2.0).contains(&self.unknown.cluster_dist) {
            issues.push(format!(
                "ERROR: unknown.cluster_dist is a cosine distance and must be within \
                 [0.0, 2.0], got {}.",
                self.unknown.cluster_dist
            ));
        }
        if !(0.0..=1.0).contains(&self.unknown.min_quality) {
            issues.push(format!(
                "ERROR: unknown.min_quality must be within [0.0, 1.0], got {}.",
                self.unknown.min_quality
            ));
        }
        if self.unknown.min_frames == 0 {
            issues.push("ERROR: unknown.min_frames must be >= 1.".to_string());
        }
        if self.unknown.idle_ms >= self.unknown.cooldown_ms {
            issues.push(format!(
                "WARNING: unknown.idle_ms ({}) >= unknown.cooldown_ms ({}): candidates \
                 are evicted before their cooldown matters, so the same person can be \
                 admitted repeatedly.",
                self.unknown.idle_ms, self.unknown.cooldown_ms
            ));
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load configuration from a TOML file at the given path.
/// A missing file yields the default configuration.
pub fn load_config(path: &std::path::Path) -> Result<VigilConfig, ConfigLoadError> {
    if !path.exists() {
        return Ok(toml::from_str("").expect("default config deserializes"));
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_control_plane_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_worker_log_dir() -> String {
    "/var/log/vigil".to_string()
}
fn default_udp_port_min() -> u16 {
    40000
}
fn default_udp_port_max() -> u16 {
    40100
}
fn default_bitrate_kbps() -> u32 {
    1500
}
fn default_keyframe_interval() -> u32 {
    2
}
fn default_true() -> bool {
    true
}
fn default_model_dir() -> String {
    "/var/lib/vigil/models".to_string()
}
fn default_sim_match() -> f32 {
    0.60
}
fn default_det_conf_min() -> f32 {
    0.5
}
fn default_catalog_poll_s() -> u64 {
    30
}
fn default_overlay_deadline_ms() -> u64 {
    100
}
fn default_skew_window_ms() -> u64 {
    500
}
fn default_font_path() -> String {
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string()
}
fn default_cluster_dist() -> f32 {
    0.4
}
fn default_min_presence_ms() -> u64 {
    2000
}
fn default_min_frames() -> u32 {
    10
}
fn default_min_face_px() -> u32 {
    80
}
fn default_min_quality() -> f32 {
    0.5
}
fn default_cooldown_ms() -> u64 {
    60_000
}
fn default_idle_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> VigilConfig {
        toml::from_str("").expect("default config")
    }

    fn validate_issues(config: &VigilConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn default_config_from_empty_string() {
        let config: VigilConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8090);
        assert_eq!(config.server.control_plane_url, "http://127.0.0.1:8000");
        assert!(config.server.worker_binary.is_none());

        assert_eq!(config.webrtc.udp_port_min, 40000);
        assert_eq!(config.webrtc.udp_port_max, 40100);
        assert_eq!(config.webrtc.target_bitrate_kbps, 1500);
        assert_eq!(config.webrtc.keyframe_interval_s, 2);
        assert!(config.webrtc.lan_mode);

        assert_eq!(config.recognition.sim_match, 0.60);
        assert_eq!(config.recognition.det_conf_min, 0.5);
        assert_eq!(config.recognition.catalog_poll_s, 30);

        assert_eq!(config.overlay.deadline_ms, 100);
        assert_eq!(config.overlay.skew_window_ms, 500);

        assert_eq!(config.unknown.cluster_dist, 0.4);
        assert_eq!(config.unknown.min_presence_ms, 2000);
        assert_eq!(config.unknown.min_frames, 10);
        assert_eq!(config.unknown.min_face_px, 80);
        assert_eq!(config.unknown.min_quality, 0.5);
        assert_eq!(config.unknown.cooldown_ms, 60_000);
        assert_eq!(config.unknown.idle_ms, 5000);
    }

    #[test]
    fn partial_config_only_webrtc_section() {
        let toml_str = r#"
[webrtc]
target_bitrate_kbps = 800
udp_port_min = 50000
udp_port_max = 50050
"#;
        let config: VigilConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");

        assert_eq!(config.webrtc.target_bitrate_kbps, 800);
        assert_eq!(config.webrtc.udp_port_min, 50000);
        assert_eq!(config.webrtc.udp_port_max, 50050);
        // Remaining fields keep defaults
        assert_eq!(config.webrtc.keyframe_interval_s, 2);
        assert_eq!(config.server.port, 8090);
        assert_eq!(config.recognition.sim_match, 0.60);
    }

    #[test]
    fn default_trait_matches_empty_toml() {
        let from_toml = valid_config();
        assert_eq!(ServerConfig::default().port, from_toml.server.port);
        assert_eq!(
            WebRtcConfig::default().udp_port_min,
            from_toml.webrtc.udp_port_min
        );
        assert_eq!(
            RecognitionConfig::default().sim_match,
            from_toml.recognition.sim_match
        );
        assert_eq!(
            OverlayConfig::default().deadline_ms,
            from_toml.overlay.deadline_ms
        );
        assert_eq!(
            UnknownConfig::default().cooldown_ms,
            from_toml.unknown.cooldown_ms
        );
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = valid_config();
        config.server.port = 0;
        assert!(has_error(&validate_issues(&config), "port"));
    }

    #[test]
    fn validate_inverted_udp_range_is_error() {
        let mut config = valid_config();
        config.webrtc.udp_port_min = 41000;
        config.webrtc.udp_port_max = 40000;
        assert!(has_error(&validate_issues(&config), "udp_port_min"));
    }

    #[test]
    fn validate_tiny_udp_range_is_error() {
        let mut config = valid_config();
        config.webrtc.udp_port_min = 40000;
        config.webrtc.udp_port_max = 40002;
        assert!(has_error(&validate_issues(&config), "only"));
    }

    #[test]
    fn validate_privileged_udp_port_is_error() {
        let mut config = valid_config();
        config.webrtc.udp_port_min = 800;
        assert!(has_error(&validate_issues(&config), "1024"));
    }

    #[test]
    fn validate_bitrate_zero_is_error() {
        let mut config = valid_config();
        config.webrtc.target_bitrate_kbps = 0;
        assert!(has_error(&validate_issues(&config), "target_bitrate_kbps"));
    }

    #[test]
    fn validate_high_bitrate_is_warning_only() {
        let mut config = valid_config();
        config.webrtc.target_bitrate_kbps = 50_000;
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "target_bitrate_kbps"));
        assert!(!issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn validate_keyframe_interval_bounds() {
        let mut config = valid_config();
        config.webrtc.keyframe_interval_s = 0;
        assert!(has_error(&validate_issues(&config), "keyframe_interval_s"));
        config.webrtc.keyframe_interval_s = 31;
        assert!(has_error(&validate_issues(&config), "keyframe_interval_s"));
        config.webrtc.keyframe_interval_s = 30;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_sim_match_out_of_range_is_error() {
        let mut config = valid_config();
        config.recognition.sim_match = 1.2;
        assert!(has_error(&validate_issues(&config), "sim_match"));
    }

    #[test]
    fn validate_low_sim_match_is_warning() {
        let mut config = valid_config();
        config.recognition.sim_match = 0.3;
        assert!(has_warning(&validate_issues(&config), "sim_match"));
    }

    #[test]
    fn validate_skew_window_below_deadline_is_error() {
        let mut config = valid_config();
        config.overlay.deadline_ms = 400;
        config.overlay.skew_window_ms = 200;
        assert!(has_error(&validate_issues(&config), "skew_window_ms"));
    }

    #[test]
    fn validate_cluster_dist_out_of_range_is_error() {
        let mut config = valid_config();
        config.unknown.cluster_dist = 2.5;
        assert!(has_error(&validate_issues(&config), "cluster_dist"));
    }

    #[test]
    fn validate_idle_above_cooldown_is_warning() {
        let mut config = valid_config();
        config.unknown.idle_ms = 120_000;
        assert!(has_warning(&validate_issues(&config), "idle_ms"));
    }

    #[test]
    fn validate_bad_control_plane_url_is_error() {
        let mut config = valid_config();
        config.server.control_plane_url = "127.0.0.1:8000".to_string();
        assert!(has_error(&validate_issues(&config), "control_plane_url"));
    }

    #[test]
    fn validate_multiple_errors_collected() {
        let mut config = valid_config();
        config.server.port = 0;
        config.webrtc.keyframe_interval_s = 0;
        config.unknown.min_frames = 0;
        let issues = validate_issues(&config);
        assert!(
            issues.len() >= 3,
            "expected at least 3 errors, got {}: {:?}",
            issues.len(),
            issues
        );
    }
}
