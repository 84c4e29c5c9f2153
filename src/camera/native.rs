//! Physical camera capture using nokhwa
//!
//! The nokhwa handle is opened and driven on a dedicated capture thread.
//! Frames are handed to `acquire()` over a small bounded channel; when the
//! consumer falls behind, the oldest queued frame is discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution,
};
use nokhwa::Camera;

use super::{CaptureError, FailureStreak, FrameSource, GrabFailure, ACQUIRE_TIMEOUT};
use crate::config::CameraConfig;
use crate::frame::Frame;

/// How long `open()` waits for the device to report ready
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames buffered between the capture thread and the pipeline
const FRAME_QUEUE_DEPTH: usize = 2;

/// Pause between failed grabs
const GRAB_RETRY: Duration = Duration::from_millis(10);

/// Failed grabs in a row before the capture thread exits (about 2 s)
const MAX_GRAB_FAILURES: u32 = 200;

/// Information about an available camera
#[derive(Clone, Debug)]
pub struct CameraInfo {
    /// Camera index
    pub index: u32,
    /// Camera name
    pub name: String,
}

/// List available cameras
pub fn list_cameras() -> Vec<CameraInfo> {
    match nokhwa::query(ApiBackend::Auto) {
        Ok(camera_list) => camera_list
            .iter()
            .enumerate()
            .map(|(idx, info)| CameraInfo {
                index: idx as u32,
                name: info.human_name().to_string(),
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate cameras: {:?}", e);
            Vec::new()
        }
    }
}

/// Opened device description sent back from the capture thread
struct OpenedDevice {
    name: String,
    width: u32,
    height: u32,
}

/// Camera capture backed by a nokhwa device
pub struct NativeCamera {
    frames: Receiver<Frame>,
    running: Arc<AtomicBool>,
    thread_handle: Option<std::thread::JoinHandle<()>>,
    name: String,
    width: u32,
    height: u32,
}

impl NativeCamera {
    /// Open the configured camera
    ///
    /// Blocks until the device is streaming or has failed to open.
    pub fn open(config: &CameraConfig) -> Result<Self, CaptureError> {
        let (frame_tx, frame_rx) = crossbeam_channel::bounded::<Frame>(FRAME_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<OpenedDevice, String>>(1);
        let running = Arc::new(AtomicBool::new(true));

        let running_clone = running.clone();
        let drain_rx = frame_rx.clone();
        let config = config.clone();

        let thread_handle = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || {
                Self::capture_thread(config, frame_tx, drain_rx, ready_tx, running_clone);
            })
            .map_err(|e| CaptureError::DeviceError(format!("Failed to spawn capture thread: {}", e)))?;

        let opened = match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(opened)) => opened,
            Ok(Err(message)) => {
                let _ = thread_handle.join();
                return Err(CaptureError::DeviceError(message));
            }
            Err(_) => {
                running.store(false, Ordering::Release);
                return Err(CaptureError::DeviceError(
                    "Timed out waiting for camera to open".to_string(),
                ));
            }
        };

        tracing::info!(
            "Camera opened: {} ({}x{})",
            opened.name,
            opened.width,
            opened.height
        );

        Ok(Self {
            frames: frame_rx,
            running,
            thread_handle: Some(thread_handle),
            name: opened.name,
            width: opened.width,
            height: opened.height,
        })
    }

    /// Try the requested format first, then progressively looser requests
    fn open_device(config: &CameraConfig) -> Result<Camera, String> {
        let index = CameraIndex::Index(config.index);

        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                Resolution::new(config.width, config.height),
                FrameFormat::MJPEG,
                config.fps,
            ),
        ));
        match Camera::new(index.clone(), requested) {
            Ok(c) => return Ok(c),
            Err(e) => tracing::warn!("Failed to open camera with requested format: {:?}", e),
        }

        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::HighestResolution(
            Resolution::new(config.width, config.height),
        ));
        match Camera::new(index.clone(), requested) {
            Ok(c) => return Ok(c),
            Err(e) => tracing::warn!("Failed with HighestResolution: {:?}", e),
        }

        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
        Camera::new(index, requested)
            .map_err(|e| format!("Failed to open camera {} with all format attempts: {:?}", config.index, e))
    }

    /// Camera capture thread
    fn capture_thread(
        config: CameraConfig,
        frames: Sender<Frame>,
        drain: Receiver<Frame>,
        ready: Sender<Result<OpenedDevice, String>>,
        running: Arc<AtomicBool>,
    ) {
        tracing::info!("Starting camera capture thread (camera {})", config.index);

        let mut camera = match Self::open_device(&config) {
            Ok(c) => c,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        if let Err(e) = camera.open_stream() {
            let _ = ready.send(Err(format!("Failed to open camera stream: {:?}", e)));
            return;
        }

        let opened = OpenedDevice {
            name: camera.info().human_name().to_string(),
            width: camera.resolution().width(),
            height: camera.resolution().height(),
        };
        if ready.send(Ok(opened)).is_err() {
            // open() gave up waiting
            let _ = camera.stop_stream();
            return;
        }

        let mut sequence: u64 = 0;
        let mut failures = FailureStreak::new(MAX_GRAB_FAILURES);

        // Exiting drops `frames`, which `acquire()` reports as a device error
        while running.load(Ordering::Acquire) {
            let buffer = match camera.frame() {
                Ok(buffer) => {
                    let streak = failures.succeed();
                    if streak > 0 {
                        tracing::info!("Camera recovered after {} failed grabs", streak);
                    }
                    buffer
                }
                Err(e) => {
                    match failures.fail() {
                        GrabFailure::First => tracing::warn!("Failed to capture frame: {:?}", e),
                        GrabFailure::Repeated => {}
                        GrabFailure::Exhausted => {
                            tracing::error!(
                                "Camera gave no frame in {} attempts, giving up: {:?}",
                                MAX_GRAB_FAILURES,
                                e
                            );
                            break;
                        }
                    }
                    std::thread::sleep(GRAB_RETRY);
                    continue;
                }
            };

            let image = match buffer.decode_image::<RgbFormat>() {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!("Failed to decode frame: {:?}", e);
                    continue;
                }
            };

            let frame = Frame::new(
                image.into_raw(),
                buffer.resolution().width(),
                buffer.resolution().height(),
                sequence,
            );
            sequence = sequence.wrapping_add(1);

            // Keep the newest frames: drop the oldest when the queue is full
            match frames.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => {
                    let _ = drain.try_recv();
                    let _ = frames.try_send(frame);
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }

        if let Err(e) = camera.stop_stream() {
            tracing::warn!("Failed to stop camera stream: {:?}", e);
        }
        tracing::info!("Camera capture thread stopped");
    }
}

impl FrameSource for NativeCamera {
    fn acquire(&mut self) -> Result<Frame, CaptureError> {
        if self.thread_handle.is_none() {
            return Err(CaptureError::DeviceError("camera released".to_string()));
        }
        match self.frames.recv_timeout(ACQUIRE_TIMEOUT) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::NoFrame),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::DeviceError(
                "capture thread stopped".to_string(),
            )),
        }
    }

    fn release(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Camera released: {}", self.name);
        }
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl Drop for NativeCamera {
    fn drop(&mut self) {
        self.release();
    }
}
