//! ONNX face detector
//!
//! Runs an Ultra-Light-Fast-Generic-Face-Detector style model (RFB-320 /
//! slim-320) through ONNX Runtime. The model takes a 1x3x240x320 RGB tensor
//! normalised to `(p - 127) / 128` and produces per-anchor scores
//! `[1, N, 2]` and normalised corner boxes `[1, N, 4]`.

use std::path::Path;

use ndarray::Array4;

use super::{DetectorError, FaceDetector, Region};
use crate::frame::{Frame, CHANNELS};

const INPUT_WIDTH: u32 = 320;
const INPUT_HEIGHT: u32 = 240;

/// Upper bound on candidates kept before NMS
const MAX_CANDIDATES: usize = 200;

/// A scored candidate box in normalised coordinates
#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// ONNX Runtime backed face detector
pub struct UltraFaceDetector {
    session: ort::session::Session,
    score_threshold: f32,
    iou_threshold: f32,
}

impl UltraFaceDetector {
    /// Load the model at `path`
    pub fn load(path: &Path, score_threshold: f32, iou_threshold: f32) -> Result<Self, DetectorError> {
        if !path.exists() {
            return Err(DetectorError::ModelNotFound(path.display().to_string()));
        }

        ort::init()
            .with_name("FaceTracker")
            .commit()
            .map_err(|e| DetectorError::Load(format!("Failed to initialize ORT: {}", e)))?;

        let session = ort::session::Session::builder()
            .map_err(|e| DetectorError::Load(format!("Failed to create session builder: {}", e)))?
            .with_intra_threads(2)
            .map_err(|e| DetectorError::Load(format!("Failed to set threads: {}", e)))?
            .commit_from_file(path)
            .map_err(|e| DetectorError::Load(format!("Failed to load face model: {}", e)))?;

        tracing::info!("Loaded face detector from {:?}", path);

        Ok(Self {
            session,
            score_threshold,
            iou_threshold,
        })
    }

    /// Resize to the model input and convert to normalised CHW floats
    fn preprocess(frame: &Frame) -> Vec<f32> {
        let mut output = vec![0.0f32; (INPUT_WIDTH * INPUT_HEIGHT * 3) as usize];
        let channel_stride = (INPUT_WIDTH * INPUT_HEIGHT) as usize;

        let x_ratio = frame.width() as f32 / INPUT_WIDTH as f32;
        let y_ratio = frame.height() as f32 / INPUT_HEIGHT as f32;
        let data = frame.data();

        for y in 0..INPUT_HEIGHT {
            for x in 0..INPUT_WIDTH {
                let src_x = (x as f32 * x_ratio) as u32;
                let src_y = (y as f32 * y_ratio) as u32;
                let src_idx = (src_y as usize * frame.width() as usize + src_x as usize) * CHANNELS;

                if src_idx + 2 < data.len() {
                    let pixel_idx = (y * INPUT_WIDTH + x) as usize;
                    for c in 0..3 {
                        output[c * channel_stride + pixel_idx] =
                            (data[src_idx + c] as f32 - 127.0) / 128.0;
                    }
                }
            }
        }

        output
    }

    fn run(&mut self, frame: &Frame) -> Result<Vec<Region>, String> {
        let input = Self::preprocess(frame);
        let input_array = Array4::from_shape_vec(
            (1, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize),
            input,
        )
        .map_err(|e| format!("Failed to create input array: {}", e))?;

        let input_tensor = ort::value::Tensor::from_array(input_array)
            .map_err(|e| format!("Failed to create tensor: {}", e))?;

        let outputs = self
            .session
            .run(ort::inputs![input_tensor])
            .map_err(|e| format!("Inference failed: {}", e))?;

        let mut iter = outputs.iter();
        let scores = iter.next().ok_or("Model produced no score output")?;
        let boxes = iter.next().ok_or("Model produced no box output")?;

        let (_shape, scores) = scores
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("Failed to extract scores: {}", e))?;
        let (_shape, boxes) = boxes
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("Failed to extract boxes: {}", e))?;

        let candidates = decode(scores, boxes, self.score_threshold);
        let kept = non_max_suppression(candidates, self.iou_threshold);

        let (fw, fh) = (frame.width() as f32, frame.height() as f32);
        Ok(kept
            .iter()
            .filter_map(|c| {
                let x = (c.x1 * fw).floor() as i64;
                let y = (c.y1 * fh).floor() as i64;
                let w = ((c.x2 - c.x1) * fw).round() as i64;
                let h = ((c.y2 - c.y1) * fh).round() as i64;
                Region::from_box(x, y, w, h, frame.width(), frame.height())
            })
            .collect())
    }
}

/// Pair per-anchor face scores with their boxes, keeping those above threshold
fn decode(scores: &[f32], boxes: &[f32], threshold: f32) -> Vec<Candidate> {
    let anchors = (scores.len() / 2).min(boxes.len() / 4);
    let mut candidates: Vec<Candidate> = (0..anchors)
        .filter_map(|i| {
            let score = scores[i * 2 + 1];
            (score >= threshold).then(|| Candidate {
                score,
                x1: boxes[i * 4].clamp(0.0, 1.0),
                y1: boxes[i * 4 + 1].clamp(0.0, 1.0),
                x2: boxes[i * 4 + 2].clamp(0.0, 1.0),
                y2: boxes[i * 4 + 3].clamp(0.0, 1.0),
            })
        })
        .collect();
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates.truncate(MAX_CANDIDATES);
    candidates
}

/// Greedy hard NMS over score-sorted candidates
fn non_max_suppression(candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

impl FaceDetector for UltraFaceDetector {
    fn detect(&mut self, frame: &Frame) -> Vec<Region> {
        match self.run(frame) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!("Face detection error: {}", e);
                Vec::new()
            }
        }
    }

    fn name(&self) -> &'static str {
        "ultraface-onnx"
    }
}
