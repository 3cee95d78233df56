//! Configuration management for the door camera streamer

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub capture: CaptureConfig,
}

/// Capture device configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    /// V4L2 device node, e.g. "/dev/video0"
    #[serde(default = "default_device_path")]
    pub device_path: String,

    /// Pixel format description the device must advertise
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// How long a single wait for the next frame may take
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,

    /// Number of mmap buffers requested from the driver
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Upper bound on draining in-flight connections at shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Serve the `/info` diagnostics page. Disable when the driver
    /// refuses a second open while capture is running.
    #[serde(default = "default_enable_info")]
    pub enable_info: bool,

    /// Concurrent `/video.mjpg` viewers (0 = unlimited)
    #[serde(default = "default_max_viewers")]
    pub max_viewers: usize,
}

/// Fan-out configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamConfig {
    /// Frames buffered per viewer before the oldest is dropped (rounded up
    /// to a power of two)
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

/// Restart policy for faulted capture sessions
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CaptureConfig {
    /// Consecutive failed sessions tolerated before giving up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

// Default value functions
fn default_device_path() -> String { "/dev/video0".to_string() }
fn default_pixel_format() -> String { "Motion-JPEG".to_string() }
fn default_width() -> u32 { 1280 }
fn default_height() -> u32 { 720 }
fn default_frame_timeout_ms() -> u64 { 1000 }
fn default_buffer_count() -> u32 { 4 }
fn default_listen_addr() -> String { "0.0.0.0:8080".to_string() }
fn default_shutdown_grace_secs() -> u64 { 30 }
fn default_enable_info() -> bool { true }
fn default_max_viewers() -> usize { 16 }
fn default_subscriber_buffer() -> usize { 4 }
fn default_max_restarts() -> u32 { 10 }
fn default_initial_backoff_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 30_000 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_path: default_device_path(),
            pixel_format: default_pixel_format(),
            width: default_width(),
            height: default_height(),
            frame_timeout_ms: default_frame_timeout_ms(),
            buffer_count: default_buffer_count(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            enable_info: default_enable_info(),
            max_viewers: default_max_viewers(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl CameraConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Parsed listen address
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr.parse().map_err(|e| {
            ConfigError::Invalid(format!(
                "listen-addr '{}' is not a socket address: {}",
                self.listen_addr, e
            ))
        })
    }
}

impl CaptureConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cam = &self.camera;

        if cam.device_path.is_empty() {
            return Err(ConfigError::Invalid("camera.device-path must not be empty".into()));
        }

        if cam.width == 0 || cam.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "camera: width and height must be > 0, got {}x{}",
                cam.width, cam.height
            )));
        }

        if cam.frame_timeout_ms == 0 {
            return Err(ConfigError::Invalid("camera.frame-timeout-ms must be > 0".into()));
        }

        if cam.buffer_count == 0 {
            return Err(ConfigError::Invalid("camera.buffer-count must be > 0".into()));
        }

        self.server.socket_addr()?;

        if self.stream.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid("stream.subscriber-buffer must be >= 1".into()));
        }

        if self.capture.initial_backoff_ms > self.capture.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "capture: initial-backoff-ms ({}) exceeds max-backoff-ms ({})",
                self.capture.initial_backoff_ms, self.capture.max_backoff_ms
            )));
        }

        Ok(())
    }

    /// Saves configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.camera.device_path, "/dev/video0");
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.camera.height, 720);
        assert_eq!(config.camera.frame_timeout(), Duration::from_secs(1));
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.server.shutdown_grace(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[camera]
device-path = "/dev/video2"
width = 640
height = 480
frame-timeout-ms = 250

[server]
listen-addr = "127.0.0.1:9090"
enable-info = false
max-viewers = 2

[stream]
subscriber-buffer = 8

[capture]
max-restarts = 0
        "#;

        let config = Config::from_str(toml).unwrap();

        assert_eq!(config.camera.device_path, "/dev/video2");
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.camera.height, 480);
        assert_eq!(config.camera.frame_timeout(), Duration::from_millis(250));
        assert_eq!(config.camera.pixel_format, "Motion-JPEG");
        assert_eq!(config.server.socket_addr().unwrap().port(), 9090);
        assert!(!config.server.enable_info);
        assert_eq!(config.server.max_viewers, 2);
        assert_eq!(config.stream.subscriber_buffer, 8);
        assert_eq!(config.capture.max_restarts, 0);
        assert_eq!(config.capture.max_backoff_ms, 30_000);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.camera.device_path, "/dev/video0");
        assert_eq!(config.stream.subscriber_buffer, 4);
    }

    #[test]
    fn test_invalid_dimensions() {
        let toml = r#"
[camera]
width = 0
        "#;
        assert!(matches!(Config::from_str(toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_listen_addr() {
        let toml = r#"
[server]
listen-addr = ":8080"
        "#;
        assert!(matches!(Config::from_str(toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_subscriber_buffer_rejected() {
        let toml = r#"
[stream]
subscriber-buffer = 0
        "#;
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn test_backoff_ordering() {
        let toml = r#"
[capture]
initial-backoff-ms = 5000
max-backoff-ms = 100
        "#;
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doorcam.toml");

        let mut config = Config::default();
        config.camera.device_path = "/dev/video7".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.camera.device_path, "/dev/video7");
        assert_eq!(loaded.server.max_viewers, config.server.max_viewers);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
