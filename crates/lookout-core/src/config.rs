use lookout_media::{Constraints, DEFAULT_JPEG_QUALITY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Client configuration.
///
/// Built from defaults, then an optional TOML file named by
/// `LOOKOUT_CONFIG`, then `LOOKOUT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base origin of the recognition service (default: http://localhost:5001).
    pub service_url: String,
    /// V4L2 device used for live capture (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Auto-capture sampling period in milliseconds.
    pub capture_interval_ms: u64,
    /// Per-request timeout. Video searches run server-side for minutes.
    pub request_timeout_secs: u64,
    /// JPEG quality (1–100) for captured frames.
    pub jpeg_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_url: "http://localhost:5001".to_string(),
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            capture_interval_ms: 2000,
            request_timeout_secs: 300,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Config {
    /// Load from `LOOKOUT_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("LOOKOUT_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from `LOOKOUT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `LOOKOUT_*` overrides. Unparseable values keep the current setting.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("LOOKOUT_SERVICE_URL") {
            self.service_url = v;
        }
        if let Some(v) = lookup("LOOKOUT_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        self.frame_width = parsed(&lookup, "LOOKOUT_FRAME_WIDTH", self.frame_width);
        self.frame_height = parsed(&lookup, "LOOKOUT_FRAME_HEIGHT", self.frame_height);
        self.capture_interval_ms =
            parsed(&lookup, "LOOKOUT_CAPTURE_INTERVAL_MS", self.capture_interval_ms);
        self.request_timeout_secs =
            parsed(&lookup, "LOOKOUT_REQUEST_TIMEOUT_SECS", self.request_timeout_secs);
        self.jpeg_quality = parsed(&lookup, "LOOKOUT_JPEG_QUALITY", self.jpeg_quality).clamp(1, 100);
    }

    pub fn constraints(&self) -> Constraints {
        Constraints {
            device: self.camera_device.clone(),
            width: self.frame_width,
            height: self.frame_height,
        }
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable setting");
                current
            }
        },
        None => current,
    }
}
