//! Face Tracker Library
//!
//! Captures camera frames, detects faces, and fans each frame out to
//! WebSocket event subscribers, an MJPEG preview stream and a virtual camera.

pub mod camera;
pub mod config;
pub mod detection;
pub mod events;
pub mod frame;
pub mod pipeline;
pub mod stream;
pub mod telemetry;
pub mod virtual_camera;

pub use camera::{CaptureError, FrameSource, TestPatternSource};
pub use config::{ConfigError, TrackerConfig};
pub use detection::{DetectionResult, DetectionStage, FaceDetector, Region};
pub use events::{CommandHandler, EventHub, EventServer, ModelSelection};
pub use frame::{Frame, SharedFrame};
pub use pipeline::{DeviceProvider, PipelineError, PipelineState, PipelineSupervisor, SystemDevices};
pub use stream::{LatestFrame, StreamSink};
pub use virtual_camera::{VirtualCamera, VirtualCameraError};
