//! Frame sources
//!
//! A [`FrameSource`] owns exclusive access to a capture device and hands out
//! one frame per `acquire()` call. The physical camera backend lives in
//! `native` (feature `native-camera`); the synthetic test pattern is always
//! available.

use std::time::{Duration, Instant};

use crate::frame::{Frame, CHANNELS};

#[cfg(feature = "native-camera")]
pub mod native;

#[cfg(feature = "native-camera")]
pub use native::{list_cameras, CameraInfo, NativeCamera};

/// Longest time `acquire()` may block before reporting `NoFrame`
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// Capture errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// Nothing ready yet; retry later
    #[error("no frame available")]
    NoFrame,
    /// Device missing, busy, or failed
    #[error("capture device error: {0}")]
    DeviceError(String),
}

/// What a capture thread should do after a failed grab
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabFailure {
    /// First failure of a streak; worth a log line
    First,
    /// Still failing; retry quietly
    Repeated,
    /// Too many in a row; give the device up
    Exhausted,
}

/// Consecutive grab failures, bounded by `limit`
#[derive(Debug)]
pub struct FailureStreak {
    count: u32,
    limit: u32,
}

impl FailureStreak {
    pub fn new(limit: u32) -> Self {
        Self { count: 0, limit }
    }

    pub fn fail(&mut self) -> GrabFailure {
        self.count = self.count.saturating_add(1);
        if self.count >= self.limit {
            GrabFailure::Exhausted
        } else if self.count == 1 {
            GrabFailure::First
        } else {
            GrabFailure::Repeated
        }
    }

    /// End the streak, returning how long it was
    pub fn succeed(&mut self) -> u32 {
        std::mem::take(&mut self.count)
    }
}

/// A source of camera frames
///
/// Configuration is fixed at construction. Implementations must make
/// `release()` idempotent.
pub trait FrameSource: Send {
    /// Produce the next frame, blocking at most [`ACQUIRE_TIMEOUT`]
    fn acquire(&mut self) -> Result<Frame, CaptureError>;

    /// Release the device
    fn release(&mut self);

    /// Negotiated resolution
    fn resolution(&self) -> (u32, u32);

    /// Human-readable device name for logs
    fn name(&self) -> String;
}

/// Synthetic source producing a moving colour gradient at a fixed rate
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_interval: Duration,
    next_due: Instant,
    sequence: u64,
    released: bool,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            frame_interval: Duration::from_secs(1) / fps.max(1),
            next_due: Instant::now(),
            sequence: 0,
            released: false,
        }
    }

    fn render(&self) -> Vec<u8> {
        let shift = (self.sequence % 256) as u32;
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * CHANNELS);
        for y in 0..self.height {
            let g = (y * 255 / self.height.max(1)) as u8;
            for x in 0..self.width {
                let r = ((x * 255 / self.width.max(1) + shift) % 256) as u8;
                data.extend_from_slice(&[r, g, 128]);
            }
        }
        data
    }
}

impl FrameSource for TestPatternSource {
    fn acquire(&mut self) -> Result<Frame, CaptureError> {
        if self.released {
            return Err(CaptureError::DeviceError("test pattern released".to_string()));
        }

        let now = Instant::now();
        if now < self.next_due {
            let wait = self.next_due - now;
            if wait > ACQUIRE_TIMEOUT {
                std::thread::sleep(ACQUIRE_TIMEOUT);
                return Err(CaptureError::NoFrame);
            }
            std::thread::sleep(wait);
        }

        self.next_due = Instant::now() + self.frame_interval;
        let frame = Frame::new(self.render(), self.width, self.height, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }

    fn release(&mut self) {
        self.released = true;
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn name(&self) -> String {
        "Test pattern".to_string()
    }
}
