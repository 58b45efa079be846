//! Service configuration

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub detection: DetectionConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_ip
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bind-ip is not an address: {}", self.bind_ip)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Capture device and JPEG pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    /// Capture node path, e.g. "/dev/video0"
    #[serde(default = "default_device")]
    pub device: String,

    /// Desired frame width; 0 keeps the device default
    #[serde(default)]
    pub width: u32,

    /// Desired frame height; 0 keeps the device default
    #[serde(default)]
    pub height: u32,

    /// Buffers mapped for an MJPEG stream
    #[serde(default = "default_stream_buffers")]
    pub stream_buffers: u32,

    /// Buffers mapped for a single capture
    #[serde(default = "default_capture_buffers")]
    pub capture_buffers: u32,

    /// How long an HTTP request waits for the camera
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// How long a dequeue may block before the session gives up
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    #[serde(default = "default_encode_timeout_ms")]
    pub encode_timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            width: 0,
            height: 0,
            stream_buffers: default_stream_buffers(),
            capture_buffers: default_capture_buffers(),
            lock_timeout_ms: default_lock_timeout_ms(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            jpeg_quality: default_jpeg_quality(),
            encode_timeout_ms: default_encode_timeout_ms(),
        }
    }
}

impl CameraConfig {
    /// Desired resolution, if one is configured
    pub fn resolution(&self) -> Option<(u32, u32)> {
        (self.width > 0 && self.height > 0).then_some((self.width, self.height))
    }
}

/// Background face detection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Buffers mapped for a detection session
    #[serde(default = "default_stream_buffers")]
    pub buffer_count: u32,

    /// Minimum time between processed frames; 0 runs as fast as frames arrive
    #[serde(default)]
    pub min_interval_ms: u64,

    /// Sleep after the camera was busy or a session failed
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// How long the detector waits for the camera per attempt
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Frames processed before the detector yields the camera
    #[serde(default = "default_frames_per_session")]
    pub frames_per_session: u32,

    /// Upper bound for waiting on the detection thread at shutdown
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Hand reports to the publisher sink
    #[serde(default)]
    pub publish: bool,

    /// Detections below this score are discarded
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_count: default_stream_buffers(),
            min_interval_ms: 0,
            backoff_ms: default_backoff_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            frames_per_session: default_frames_per_session(),
            stop_timeout_ms: default_stop_timeout_ms(),
            publish: false,
            score_threshold: default_score_threshold(),
        }
    }
}

// Default value functions
fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_device() -> String {
    "/dev/video0".to_string()
}

fn default_stream_buffers() -> u32 {
    3
}

fn default_capture_buffers() -> u32 {
    1
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_dequeue_timeout_ms() -> u64 {
    2_000
}

fn default_jpeg_quality() -> u8 {
    75
}

fn default_encode_timeout_ms() -> u64 {
    200
}

fn default_true() -> bool {
    true
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_acquire_timeout_ms() -> u64 {
    1_000
}

fn default_frames_per_session() -> u32 {
    30
}

fn default_stop_timeout_ms() -> u64 {
    2_000
}

fn default_score_threshold() -> f32 {
    0.5
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise falls back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.socket_addr()?;

        let cam = &self.camera;
        if cam.device.is_empty() {
            return Err(ConfigError::Invalid("camera.device must not be empty".to_string()));
        }

        if (cam.width == 0) != (cam.height == 0) {
            return Err(ConfigError::Invalid(format!(
                "camera width and height must both be set or both be 0, got {}x{}",
                cam.width, cam.height
            )));
        }

        if cam.stream_buffers == 0 || cam.capture_buffers == 0 {
            return Err(ConfigError::Invalid(
                "camera buffer counts must be > 0".to_string(),
            ));
        }

        if cam.jpeg_quality == 0 || cam.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "jpeg-quality must be between 1 and 100, got {}",
                cam.jpeg_quality
            )));
        }

        if cam.lock_timeout_ms == 0 || cam.encode_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "camera timeouts must be > 0".to_string(),
            ));
        }

        let det = &self.detection;
        if det.buffer_count == 0 {
            return Err(ConfigError::Invalid(
                "detection.buffer-count must be > 0".to_string(),
            ));
        }

        if det.frames_per_session == 0 {
            return Err(ConfigError::Invalid(
                "detection.frames-per-session must be > 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&det.score_threshold) {
            return Err(ConfigError::Invalid(format!(
                "detection.score-threshold must be between 0 and 1, got {}",
                det.score_threshold
            )));
        }

        Ok(())
    }
}
