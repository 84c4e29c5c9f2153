//! Tracker configuration
//!
//! Loaded from a JSON file, with per-field defaults and a few environment
//! overrides for the listening ports and camera index.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Which frame source the pipeline opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Physical camera via nokhwa
    Native,
    /// Synthetic moving gradient
    TestPattern,
}

impl Default for SourceKind {
    fn default() -> Self {
        if cfg!(feature = "native-camera") {
            SourceKind::Native
        } else {
            SourceKind::TestPattern
        }
    }
}

/// Capture device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub source: SourceKind,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 1280,
            height: 720,
            fps: 30,
            source: SourceKind::default(),
        }
    }
}

impl CameraConfig {
    /// Resolution as reported by `get_config`, e.g. `1280x720`
    pub fn resolution_label(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Virtual camera output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualCameraConfig {
    pub enabled: bool,
    /// Device node of the loopback device
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Fail `start_tracking` when the device cannot be opened
    pub required: bool,
}

impl Default for VirtualCameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: PathBuf::from("/dev/video10"),
            width: 1280,
            height: 720,
            fps: 30,
            required: false,
        }
    }
}

/// MJPEG preview server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,
    pub jpeg_quality: u8,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            jpeg_quality: 95,
        }
    }
}

/// WebSocket event server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub host: String,
    pub port: u16,
    /// Seconds between server pings; 0 disables liveness checks
    pub ping_interval_secs: u64,
    /// Stop tracking when the last subscriber disconnects
    pub stop_when_idle: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 50836,
            ping_interval_secs: 10,
            stop_when_idle: false,
        }
    }
}

/// Model settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Default avatar model reported to clients
    pub default: String,
    /// ONNX face detector; no detector runs when unset
    pub detector_path: Option<PathBuf>,
    pub score_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default: "Haru".to_string(),
            detector_path: None,
            score_threshold: 0.7,
            iou_threshold: 0.3,
        }
    }
}

/// Complete tracker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub camera: CameraConfig,
    pub virtual_camera: VirtualCameraConfig,
    pub stream: StreamConfig,
    pub events: EventsConfig,
    pub model: ModelConfig,
}

impl TrackerConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("FaceTracker");
            p.push("config.json");
            p
        })
    }

    /// Parse a config file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve the configuration: explicit path, then the default location,
    /// then built-in defaults. Environment overrides and validation apply to
    /// all three.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => {
                    tracing::info!("Loading config from {}", path.display());
                    Self::load_from_file(&path)?
                }
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FACE_TRACKER_*` overrides using the given lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("FACE_TRACKER_STREAM_PORT") {
            self.stream.port = parse_env("FACE_TRACKER_STREAM_PORT", &value)?;
        }
        if let Some(value) = lookup("FACE_TRACKER_EVENTS_PORT") {
            self.events.port = parse_env("FACE_TRACKER_EVENTS_PORT", &value)?;
        }
        if let Some(value) = lookup("FACE_TRACKER_CAMERA_INDEX") {
            self.camera.index = parse_env("FACE_TRACKER_CAMERA_INDEX", &value)?;
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("camera.width", self.camera.width),
            ("camera.height", self.camera.height),
            ("camera.fps", self.camera.fps),
            ("virtual_camera.width", self.virtual_camera.width),
            ("virtual_camera.height", self.virtual_camera.height),
            ("virtual_camera.fps", self.virtual_camera.fps),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(ConfigError::Invalid {
                field: "stream.jpeg_quality",
                reason: format!("{} is outside 1..=100", self.stream.jpeg_quality),
            });
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field: key,
        reason: e.to_string(),
    })
}
