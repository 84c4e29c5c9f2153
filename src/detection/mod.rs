//! Face detection stage
//!
//! Detectors are pluggable behind [`FaceDetector`]. [`DetectionStage`] wraps
//! whichever detector is loaded and guarantees that every region it reports
//! lies inside the frame it was detected on.

use serde::Serialize;

use crate::frame::Frame;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::UltraFaceDetector;

/// Detector construction errors
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Detector model not found: {0}")]
    ModelNotFound(String),
    #[error("Failed to load detector: {0}")]
    Load(String),
}

/// Axis-aligned face region in frame pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub center_x: u32,
    pub center_y: u32,
}

impl Region {
    /// Build a region from a raw box, clamped to a `frame_width` x
    /// `frame_height` frame
    ///
    /// Returns `None` when nothing of the box remains inside the frame.
    pub fn from_box(
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<Self> {
        let (fw, fh) = (frame_width as i64, frame_height as i64);
        let left = x.clamp(0, fw);
        let top = y.clamp(0, fh);
        let right = x.saturating_add(width.max(0)).clamp(0, fw);
        let bottom = y.saturating_add(height.max(0)).clamp(0, fh);

        if right <= left || bottom <= top {
            return None;
        }

        let (x, y) = (left as u32, top as u32);
        let (width, height) = ((right - left) as u32, (bottom - top) as u32);
        Some(Self {
            x,
            y,
            width,
            height,
            center_x: x + width / 2,
            center_y: y + height / 2,
        })
    }

    /// Whether the region lies entirely within a frame of the given size
    pub fn fits_within(&self, frame_width: u32, frame_height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x as u64 + self.width as u64 <= frame_width as u64
            && self.y as u64 + self.height as u64 <= frame_height as u64
    }
}

/// Regions found in one frame, in detector order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DetectionResult {
    regions: Vec<Region>,
}

impl DetectionResult {
    pub fn new(regions: Vec<Region>) -> Self {
        Self { regions }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// A face detection backend
///
/// Implementations may keep model state between frames, hence `&mut self`.
pub trait FaceDetector: Send {
    /// Detect faces in a well-formed frame
    fn detect(&mut self, frame: &Frame) -> Vec<Region>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Detector used when no model is configured
#[derive(Debug, Default)]
pub struct NoFaceDetector;

impl FaceDetector for NoFaceDetector {
    fn detect(&mut self, _frame: &Frame) -> Vec<Region> {
        Vec::new()
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Runs a detector and enforces the in-frame invariant on its output
pub struct DetectionStage {
    detector: Box<dyn FaceDetector>,
}

impl DetectionStage {
    pub fn new(detector: Box<dyn FaceDetector>) -> Self {
        Self { detector }
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    /// Detect faces, degrading to an empty result for malformed frames
    pub fn detect(&mut self, frame: &Frame) -> DetectionResult {
        if !frame.is_well_formed() {
            tracing::debug!(
                sequence = frame.sequence(),
                "Skipping detection on malformed frame"
            );
            return DetectionResult::empty();
        }

        let (w, h) = (frame.width(), frame.height());
        let regions = self
            .detector
            .detect(frame)
            .into_iter()
            .filter_map(|r| {
                if r.fits_within(w, h) {
                    Some(r)
                } else {
                    Region::from_box(r.x as i64, r.y as i64, r.width as i64, r.height as i64, w, h)
                }
            })
            .collect();
        DetectionResult::new(regions)
    }
}
