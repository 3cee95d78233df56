//! Door camera MJPEG streamer

use anyhow::{Context, Result};
use clap::Parser;
use doorcam_mjpeg::{camera::V4l2Driver, config::Config, server::Server};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "doorcam.toml";

#[derive(Parser, Debug)]
#[command(name = "doorcam")]
#[command(about = "MJPEG over HTTP streamer for a V4L2 door camera")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "DOORCAM_CONFIG")]
    config: Option<PathBuf>,

    /// Camera device node
    #[arg(long, env = "DOORCAM_DEVICE")]
    device: Option<String>,

    /// Listen address, e.g. 0.0.0.0:8080
    #[arg(long, env = "DOORCAM_LISTEN")]
    listen: Option<String>,

    /// Capture width in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Capture height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// How long to wait for a frame before logging a timeout
    #[arg(long)]
    frame_timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// An explicit config path must exist; the default one is optional.
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("cannot load config {}", path.display()))?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH)
                .with_context(|| format!("cannot load config {}", DEFAULT_CONFIG_PATH))?,
            None => Config::default(),
        };

        if let Some(device) = &self.device {
            config.camera.device_path = device.clone();
        }
        if let Some(listen) = &self.listen {
            config.server.listen_addr = listen.clone();
        }
        if let Some(width) = self.width {
            config.camera.width = width;
        }
        if let Some(height) = self.height {
            config.camera.height = height;
        }
        if let Some(ms) = self.frame_timeout_ms {
            config.camera.frame_timeout_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!(version = env!("CARGO_PKG_VERSION"), "Door camera streamer starting");

    let config = cli.load_config()?;
    info!(
        device = %config.camera.device_path,
        listen = %config.server.listen_addr,
        resolution = %format!("{}x{}", config.camera.width, config.camera.height),
        "Configuration loaded"
    );

    let driver = Arc::new(V4l2Driver::new(config.camera.buffer_count));
    Server::new(config, driver).run().await
}
