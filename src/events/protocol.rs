//! WebSocket protocol definitions
//!
//! JSON message types for client-server communication. Inbound commands are
//! decoded once into [`Command`]; anything that does not decode is ignored.

use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::detection::DetectionResult;

/// Commands sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Start the capture pipeline
    StartTracking,
    /// Stop the capture pipeline
    StopTracking,
    /// Select the avatar model; stored for other components
    SetModel { path: String },
    /// Request the current configuration
    GetConfig,
}

impl Command {
    /// Decode a text frame; `None` for unknown commands and malformed JSON
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str::<Command>(text) {
            Ok(command) => Some(command),
            Err(e) => {
                tracing::debug!("Ignoring unrecognised message ({}): {}", e, text);
                None
            }
        }
    }
}

/// Events broadcast from server to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// Faces found in one captured frame
    FaceData(DetectionResult),
    /// Frames processed per second over the last window
    Fps(f64),
    /// A command from this client was rejected
    Error(String),
}

impl Event {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Camera section of the `get_config` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfoReply {
    pub resolution: String,
    pub fps: u32,
}

/// Model section of the `get_config` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfoReply {
    pub default: String,
}

/// Synchronous reply to `get_config`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigReply {
    pub camera: CameraInfoReply,
    pub model: ModelInfoReply,
}

impl ConfigReply {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            camera: CameraInfoReply {
                resolution: config.camera.resolution_label(),
                fps: config.camera.fps,
            },
            model: ModelInfoReply {
                default: config.model.default.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Region;
    use serde_json::json;

    #[test]
    fn test_parse_known_commands() {
        assert_eq!(Command::parse(r#"{"command": "start_tracking"}"#), Some(Command::StartTracking));
        assert_eq!(Command::parse(r#"{"command": "stop_tracking"}"#), Some(Command::StopTracking));
        assert_eq!(Command::parse(r#"{"command": "get_config"}"#), Some(Command::GetConfig));
        assert_eq!(
            Command::parse(r#"{"command": "set_model", "path": "models/Haru/Haru.model3.json"}"#),
            Some(Command::SetModel {
                path: "models/Haru/Haru.model3.json".to_string()
            })
        );
    }

    #[test]
    fn test_extra_fields_are_tolerated() {
        assert_eq!(
            Command::parse(r#"{"command": "start_tracking", "camera": 1}"#),
            Some(Command::StartTracking)
        );
    }

    #[test]
    fn test_unknown_and_malformed_messages_are_ignored() {
        assert_eq!(Command::parse(r#"{"command": "reboot"}"#), None);
        assert_eq!(Command::parse(r#"{"command": "set_model"}"#), None);
        assert_eq!(Command::parse(r#"{"cmd": "start_tracking"}"#), None);
        assert_eq!(Command::parse("not json"), None);
    }

    #[test]
    fn test_event_wire_format() {
        let region = Region::from_box(10, 10, 50, 60, 640, 480).unwrap();
        let event = Event::FaceData(DetectionResult::new(vec![region]));
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "face_data",
                "data": [{"x": 10, "y": 10, "width": 50, "height": 60, "center_x": 35, "center_y": 40}]
            })
        );

        let value: serde_json::Value =
            serde_json::from_str(&Event::Fps(29.5).to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "fps", "data": 29.5}));

        let value: serde_json::Value =
            serde_json::from_str(&Event::FaceData(DetectionResult::empty()).to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "face_data", "data": []}));
    }

    #[test]
    fn test_config_reply_shape() {
        let mut config = TrackerConfig::default();
        config.model.default = "Hiyori".to_string();
        let value = serde_json::to_value(ConfigReply::from_config(&config)).unwrap();
        assert_eq!(
            value,
            json!({"camera": {"resolution": "1280x720", "fps": 30}, "model": {"default": "Hiyori"}})
        );
    }
}
