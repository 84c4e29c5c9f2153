//! Device acquisition for a pipeline run

use crate::camera::{CaptureError, FrameSource, TestPatternSource};
use crate::config::{CameraConfig, ModelConfig, SourceKind, VirtualCameraConfig};
use crate::detection::{FaceDetector, NoFaceDetector};
use crate::virtual_camera::{self, VirtualCamera, VirtualCameraError};

/// Opens the devices a pipeline run needs
///
/// Called by the supervisor on every `start()`; each call must return fresh
/// handles.
pub trait DeviceProvider: Send + Sync {
    fn open_source(&self, config: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError>;

    fn open_virtual_camera(
        &self,
        config: &VirtualCameraConfig,
    ) -> Result<Box<dyn VirtualCamera>, VirtualCameraError>;

    /// Never fails; falls back to a detector that finds nothing
    fn detector(&self, config: &ModelConfig) -> Box<dyn FaceDetector>;
}

/// Real camera, platform virtual camera and configured detector
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDevices;

impl DeviceProvider for SystemDevices {
    fn open_source(&self, config: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
        match config.source {
            SourceKind::TestPattern => Ok(Box::new(TestPatternSource::new(
                config.width,
                config.height,
                config.fps,
            ))),
            #[cfg(feature = "native-camera")]
            SourceKind::Native => Ok(Box::new(crate::camera::NativeCamera::open(config)?)),
            #[cfg(not(feature = "native-camera"))]
            SourceKind::Native => Err(CaptureError::DeviceError(
                "built without native camera support (enable the `native-camera` feature)".to_string(),
            )),
        }
    }

    fn open_virtual_camera(
        &self,
        config: &VirtualCameraConfig,
    ) -> Result<Box<dyn VirtualCamera>, VirtualCameraError> {
        virtual_camera::open(config)
    }

    fn detector(&self, config: &ModelConfig) -> Box<dyn FaceDetector> {
        let Some(path) = config.detector_path.as_deref() else {
            tracing::info!("No detector model configured, face detection disabled");
            return Box::new(NoFaceDetector);
        };

        load_detector(path, config)
    }
}

#[cfg(feature = "onnx")]
fn load_detector(path: &std::path::Path, config: &ModelConfig) -> Box<dyn FaceDetector> {
    match crate::detection::UltraFaceDetector::load(path, config.score_threshold, config.iou_threshold) {
        Ok(detector) => Box::new(detector),
        Err(e) => {
            tracing::warn!("Face detection disabled: {}", e);
            Box::new(NoFaceDetector)
        }
    }
}

#[cfg(not(feature = "onnx"))]
fn load_detector(path: &std::path::Path, _config: &ModelConfig) -> Box<dyn FaceDetector> {
    tracing::warn!(
        "Detector model {} ignored: built without the `onnx` feature",
        path.display()
    );
    Box::new(NoFaceDetector)
}
