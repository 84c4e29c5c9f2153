//! Virtual camera output
//!
//! Mirrors pipeline frames to an OS-level virtual webcam so other
//! applications can select it as a camera. On Linux this is a v4l2loopback
//! device; other platforms report the device as unavailable.

use crate::config::VirtualCameraConfig;
use crate::frame::Frame;

#[cfg(target_os = "linux")]
pub mod v4l2;

#[cfg(target_os = "linux")]
pub use v4l2::V4l2Loopback;

/// Virtual camera errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VirtualCameraError {
    /// The device could not be opened or has failed since
    #[error("virtual camera unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Platform-agnostic virtual camera interface
pub trait VirtualCamera: Send {
    /// Resize the frame to the device resolution and push it to the device
    fn write(&mut self, frame: &Frame) -> Result<(), VirtualCameraError>;

    /// Release the device handle; idempotent
    fn close(&mut self);

    /// Whether the device handle is still held
    fn is_open(&self) -> bool;

    /// Get the technology name for logs
    fn technology_name(&self) -> &'static str;
}

/// Get the platform-specific technology name.
#[cfg(target_os = "linux")]
pub fn platform_technology_name() -> &'static str {
    "v4l2loopback"
}

#[cfg(not(target_os = "linux"))]
pub fn platform_technology_name() -> &'static str {
    "Virtual Camera"
}

/// Open the platform virtual camera described by `config`
#[cfg(target_os = "linux")]
pub fn open(config: &VirtualCameraConfig) -> Result<Box<dyn VirtualCamera>, VirtualCameraError> {
    Ok(Box::new(V4l2Loopback::open(config)?))
}

#[cfg(not(target_os = "linux"))]
pub fn open(_config: &VirtualCameraConfig) -> Result<Box<dyn VirtualCamera>, VirtualCameraError> {
    Err(VirtualCameraError::DeviceUnavailable(format!(
        "{} output is not supported on this platform",
        platform_technology_name()
    )))
}
