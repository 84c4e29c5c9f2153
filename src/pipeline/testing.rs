//! Stub devices for lifecycle tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::DeviceProvider;
use crate::camera::{CaptureError, FrameSource};
use crate::config::{CameraConfig, ModelConfig, VirtualCameraConfig};
use crate::detection::{FaceDetector, Region};
use crate::frame::Frame;
use crate::virtual_camera::{VirtualCamera, VirtualCameraError};

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Counters shared by every device a [`StubDevices`] hands out
#[derive(Debug, Default)]
pub struct DeviceLedger {
    sources_opened: AtomicUsize,
    sources_released: AtomicUsize,
    frames_acquired: AtomicUsize,
    virtual_cameras_opened: AtomicUsize,
    virtual_cameras_closed: AtomicUsize,
    frames_mirrored: AtomicUsize,
}

impl DeviceLedger {
    pub fn sources_opened(&self) -> usize {
        self.sources_opened.load(Ordering::SeqCst)
    }

    pub fn sources_open(&self) -> usize {
        self.sources_opened() - self.sources_released.load(Ordering::SeqCst)
    }

    pub fn frames_acquired(&self) -> usize {
        self.frames_acquired.load(Ordering::SeqCst)
    }

    pub fn virtual_cameras_opened(&self) -> usize {
        self.virtual_cameras_opened.load(Ordering::SeqCst)
    }

    pub fn virtual_cameras_open(&self) -> usize {
        self.virtual_cameras_opened() - self.virtual_cameras_closed.load(Ordering::SeqCst)
    }

    pub fn frames_mirrored(&self) -> usize {
        self.frames_mirrored.load(Ordering::SeqCst)
    }
}

/// Configurable stand-ins for the camera, virtual camera and detector
#[derive(Debug, Default)]
pub struct StubDevices {
    pub fail_source: bool,
    pub fail_virtual_camera: bool,
    /// Virtual camera writes that succeed before the device fails
    pub virtual_camera_fails_after: Option<usize>,
    /// Acquire calls (counted from 1) that report a device error
    pub source_errors: Option<Range<u64>>,
    /// Time the detector spends on every frame
    pub detector_delay: Option<Duration>,
    pub ledger: Arc<DeviceLedger>,
}

impl StubDevices {
    pub fn ledger(&self) -> Arc<DeviceLedger> {
        self.ledger.clone()
    }

    /// Faces the stub detector reports for a `width`x`height` frame
    pub fn faces(width: u32, height: u32) -> Vec<Region> {
        [(4, 4, 10, 12), (30, 8, 9, 11)]
            .into_iter()
            .filter_map(|(x, y, w, h)| Region::from_box(x, y, w, h, width, height))
            .collect()
    }
}

impl DeviceProvider for StubDevices {
    fn open_source(&self, config: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
        if self.fail_source {
            return Err(CaptureError::DeviceError("stub camera unplugged".to_string()));
        }
        self.ledger.sources_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubSource {
            width: config.width,
            height: config.height,
            sequence: 0,
            errors: self.source_errors.clone(),
            released: false,
            ledger: self.ledger.clone(),
        }))
    }

    fn open_virtual_camera(
        &self,
        _config: &VirtualCameraConfig,
    ) -> Result<Box<dyn VirtualCamera>, VirtualCameraError> {
        if self.fail_virtual_camera {
            return Err(VirtualCameraError::DeviceUnavailable(
                "stub loopback missing".to_string(),
            ));
        }
        self.ledger.virtual_cameras_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubVirtualCamera {
            open: true,
            writes_left: self.virtual_camera_fails_after,
            ledger: self.ledger.clone(),
        }))
    }

    fn detector(&self, _config: &ModelConfig) -> Box<dyn FaceDetector> {
        Box::new(StubDetector {
            delay: self.detector_delay,
        })
    }
}

/// Solid frames every 2 ms, with a `NoFrame` miss every fifth call
struct StubSource {
    width: u32,
    height: u32,
    sequence: u64,
    errors: Option<Range<u64>>,
    released: bool,
    ledger: Arc<DeviceLedger>,
}

impl FrameSource for StubSource {
    fn acquire(&mut self) -> Result<Frame, CaptureError> {
        if self.released {
            return Err(CaptureError::DeviceError("released".to_string()));
        }
        self.sequence += 1;
        std::thread::sleep(Duration::from_millis(2));
        if self.errors.as_ref().is_some_and(|r| r.contains(&self.sequence)) {
            return Err(CaptureError::DeviceError("stub camera stalled".to_string()));
        }
        if self.sequence % 5 == 0 {
            return Err(CaptureError::NoFrame);
        }
        self.ledger.frames_acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Frame::solid(self.width, self.height, [90, 120, 150], self.sequence))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.ledger.sources_released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn name(&self) -> String {
        "stub camera".to_string()
    }
}

struct StubVirtualCamera {
    open: bool,
    writes_left: Option<usize>,
    ledger: Arc<DeviceLedger>,
}

impl VirtualCamera for StubVirtualCamera {
    fn write(&mut self, _frame: &Frame) -> Result<(), VirtualCameraError> {
        if !self.open {
            return Err(VirtualCameraError::DeviceUnavailable("closed".to_string()));
        }
        if let Some(left) = self.writes_left.as_mut() {
            if *left == 0 {
                return Err(VirtualCameraError::DeviceUnavailable("stub device gone".to_string()));
            }
            *left -= 1;
        }
        self.ledger.frames_mirrored.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.ledger.virtual_cameras_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn technology_name(&self) -> &'static str {
        "stub"
    }
}

struct StubDetector {
    delay: Option<Duration>,
}

impl FaceDetector for StubDetector {
    fn detect(&mut self, frame: &Frame) -> Vec<Region> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        StubDevices::faces(frame.width(), frame.height())
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}
