use anyhow::Context;
use vigil_protocol::{CameraSnapshot, Credentials, SourceKind};

pub(crate) struct Args {
    pub camera_id: String,
    pub camera_name: String,
    pub server_url: String,
    pub source: SourceKind,
    pub uri: String,
    pub fps_limit: u32,
    pub config_path: std::path::PathBuf,
    pub worker_token: Option<String>,
    pub credentials: Option<Credentials>,
}

impl Args {
    pub fn camera(&self) -> CameraSnapshot {
        CameraSnapshot {
            id: self.camera_id.clone(),
            name: self.camera_name.clone(),
            source: self.source,
            uri: self.uri.clone(),
            credentials: self.credentials.clone(),
            fps_limit: self.fps_limit,
            enabled: true,
        }
    }
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut camera_id = String::new();
    let mut camera_name = String::new();
    let mut server_url = String::new();
    let mut source: Option<SourceKind> = None;
    let mut uri = String::new();
    let mut fps_limit: u32 = 10;
    let mut config_path = std::path::PathBuf::from("/etc/vigil/vigil.toml");

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("vigil-worker {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("vigil-worker - Vigil per-camera pipeline worker");
                println!();
                println!("USAGE:");
                println!("    vigil-worker [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --camera-id <ID>        Camera identifier (required)");
                println!("    --camera-name <NAME>    Display name [default: camera id]");
                println!("    --server-url <URL>      Server uplink WebSocket URL (required)");
                println!("    --source <KIND>         Source kind: rtsp or file (required)");
                println!("    --uri <URI>             Source URI (required)");
                println!("    --fps-limit <FPS>       Pipeline frame rate cap, 1-60 [default: 10]");
                println!("    --config <PATH>         Config file [default: /etc/vigil/vigil.toml]");
                println!("    -V, --version           Print version and exit");
                println!("    -h, --help              Print this help and exit");
                println!();
                println!("ENVIRONMENT:");
                println!("    VIGIL_WORKER_TOKEN      Uplink authentication token");
                println!("    VIGIL_SOURCE_USER       RTSP username");
                println!("    VIGIL_SOURCE_PASS       RTSP password");
                std::process::exit(0);
            }
            "--camera-id" => {
                i += 1;
                camera_id = args.get(i).context("Missing --camera-id value")?.clone();
            }
            "--camera-name" => {
                i += 1;
                camera_name = args.get(i).context("Missing --camera-name value")?.clone();
            }
            "--server-url" => {
                i += 1;
                server_url = args.get(i).context("Missing --server-url value")?.clone();
            }
            "--source" => {
                i += 1;
                source = Some(match args.get(i).context("Missing --source value")?.as_str() {
                    "rtsp" => SourceKind::Rtsp,
                    "file" => SourceKind::File,
                    other => anyhow::bail!("Invalid --source '{other}' (use rtsp or file)"),
                });
            }
            "--uri" => {
                i += 1;
                uri = args.get(i).context("Missing --uri value")?.clone();
            }
            "--fps-limit" => {
                i += 1;
                fps_limit = args
                    .get(i)
                    .context("Missing --fps-limit value")?
                    .parse()
                    .context("Invalid --fps-limit")?;
            }
            "--config" => {
                i += 1;
                config_path = args.get(i).context("Missing --config value")?.into();
            }
            other => {
                anyhow::bail!("Unknown argument: {other}");
            }
        }
        i += 1;
    }

    if camera_id.is_empty() {
        anyhow::bail!("--camera-id is required");
    }
    if server_url.is_empty() {
        anyhow::bail!("--server-url is required");
    }
    if uri.is_empty() {
        anyhow::bail!("--uri is required");
    }
    let source = source.context("--source is required")?;
    if !(1..=60).contains(&fps_limit) {
        anyhow::bail!("--fps-limit must be between 1 and 60, got {fps_limit}");
    }
    if camera_name.is_empty() {
        camera_name = camera_id.clone();
    }

    // Secrets travel in the environment; argv is world-readable via
    // /proc/<pid>/cmdline.
    let worker_token = std::env::var("VIGIL_WORKER_TOKEN").ok().filter(|t| !t.is_empty());
    let credentials = match (
        std::env::var("VIGIL_SOURCE_USER").ok(),
        std::env::var("VIGIL_SOURCE_PASS").ok(),
    ) {
        (Some(username), Some(password)) if !username.is_empty() => {
            Some(Credentials { username, password })
        }
        _ => None,
    };

    Ok(Args {
        camera_id,
        camera_name,
        server_url,
        source,
        uri,
        fps_limit,
        config_path,
        worker_token,
        credentials,
    })
}
