//! The capture loop
//!
//! Runs on its own OS thread for one pipeline run. Each cycle acquires a
//! frame, hands it to the detection worker, then fans the same frame out to
//! the event hub, the virtual camera and the stream slot. While detection is
//! in flight the loop keeps polling the run flag, so a slow detector never
//! holds the devices past `stop()`. No delivery happens once the flag clears.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::camera::{CaptureError, FrameSource, ACQUIRE_TIMEOUT};
use crate::detection::{DetectionResult, DetectionStage};
use crate::events::{Event, EventHub};
use crate::frame::SharedFrame;
use crate::stream::LatestFrame;
use crate::telemetry::ThroughputMeter;
use crate::virtual_camera::VirtualCamera;

/// Pause after `NoFrame` before asking the source again
pub const NO_FRAME_BACKOFF: Duration = Duration::from_millis(5);

/// Pause after a device error before retrying the source
pub const DEVICE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Longest the loop waits on the detector between run flag checks
pub const DETECTION_POLL: Duration = ACQUIRE_TIMEOUT;

/// Devices owned by the loop for the length of a run
pub struct RunResources {
    pub source: Box<dyn FrameSource>,
    pub virtual_camera: Option<Box<dyn VirtualCamera>>,
}

impl RunResources {
    /// Release the source, then the virtual camera
    pub fn release(mut self) {
        self.source.release();
        if let Some(mut camera) = self.virtual_camera.take() {
            camera.close();
        }
    }
}

/// Outcome of waiting on the detection worker
enum Verdict {
    Done(DetectionResult),
    Stopped,
    WorkerGone,
}

/// Face detection on its own thread
///
/// At most one frame is in flight. Dropping the worker closes its input; the
/// thread exits after finishing the frame it holds.
pub struct DetectionWorker {
    frames: Sender<SharedFrame>,
    results: Receiver<DetectionResult>,
    detector_name: &'static str,
}

impl DetectionWorker {
    pub fn spawn(mut stage: DetectionStage) -> std::io::Result<Self> {
        let (frames_tx, frames_rx) = crossbeam_channel::bounded::<SharedFrame>(1);
        let (results_tx, results_rx) = crossbeam_channel::bounded(1);
        let detector_name = stage.detector_name();

        // Detached: the thread ends on its own once the input closes
        let _ = std::thread::Builder::new()
            .name("face-detection".to_string())
            .spawn(move || {
                for frame in frames_rx.iter() {
                    if results_tx.send(stage.detect(&frame)).is_err() {
                        break;
                    }
                }
                tracing::debug!("Detection worker stopped");
            })?;

        Ok(Self {
            frames: frames_tx,
            results: results_rx,
            detector_name,
        })
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector_name
    }

    /// Submit `frame` and wait for its result while `running` holds
    fn detect(&self, frame: &SharedFrame, running: &AtomicBool) -> Verdict {
        if self.frames.send(frame.clone()).is_err() {
            return Verdict::WorkerGone;
        }
        loop {
            match self.results.recv_timeout(DETECTION_POLL) {
                Ok(result) => return Verdict::Done(result),
                Err(RecvTimeoutError::Timeout) => {
                    if !running.load(Ordering::Acquire) {
                        return Verdict::Stopped;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Verdict::WorkerGone,
            }
        }
    }
}

/// Per-run capture loop state
pub struct CaptureLoop {
    pub resources: RunResources,
    pub detection: DetectionWorker,
    pub stream: Arc<LatestFrame>,
    pub events: Arc<EventHub>,
    pub running: Arc<AtomicBool>,
}

impl CaptureLoop {
    /// Run until the flag clears, then hand the devices back
    ///
    /// If nobody is waiting for them any more, the loop releases them itself.
    pub fn run(self, handback: Sender<RunResources>) {
        let CaptureLoop {
            mut resources,
            detection,
            stream,
            events,
            running,
        } = self;

        let source_name = resources.source.name();
        tracing::info!(
            source = %source_name,
            detector = detection.detector_name(),
            mirroring = resources.virtual_camera.is_some(),
            "Capture loop started"
        );

        let mut detection = Some(detection);
        let mut meter = ThroughputMeter::new(Instant::now());
        let mut mirroring = resources.virtual_camera.is_some();
        let mut device_failing = false;
        let mut frames: u64 = 0;

        while running.load(Ordering::Acquire) {
            let frame: SharedFrame = match resources.source.acquire() {
                Ok(frame) => {
                    if device_failing {
                        tracing::info!(source = %source_name, "Capture device recovered");
                        device_failing = false;
                    }
                    Arc::new(frame)
                }
                Err(CaptureError::NoFrame) => {
                    tracing::trace!("No frame ready");
                    std::thread::sleep(NO_FRAME_BACKOFF);
                    continue;
                }
                Err(CaptureError::DeviceError(message)) => {
                    if !device_failing {
                        tracing::error!(source = %source_name, "Capture failed: {}", message);
                        events.publish(&Event::Error(message));
                        device_failing = true;
                    }
                    std::thread::sleep(DEVICE_RETRY_BACKOFF);
                    continue;
                }
            };

            let verdict = match detection.as_ref() {
                Some(worker) => worker.detect(&frame, &running),
                None => Verdict::Done(DetectionResult::empty()),
            };
            let detections = match verdict {
                Verdict::Done(result) => result,
                Verdict::Stopped => break,
                Verdict::WorkerGone => {
                    tracing::error!("Detection worker exited, continuing without detection");
                    detection = None;
                    DetectionResult::empty()
                }
            };

            if !running.load(Ordering::Acquire) {
                break;
            }

            events.publish(&Event::FaceData(detections));

            if mirroring {
                if let Some(camera) = resources.virtual_camera.as_mut() {
                    if let Err(e) = camera.write(&frame) {
                        tracing::warn!(
                            "{} write failed, mirroring disabled for this run: {}",
                            camera.technology_name(),
                            e
                        );
                        camera.close();
                        mirroring = false;
                    }
                }
            }

            let latency = frame.captured_at().elapsed();
            stream.publish(frame);
            frames += 1;

            if let Some(fps) = meter.record(Instant::now()) {
                tracing::trace!(?latency, "Capture throughput {:.1} fps", fps);
                events.publish(&Event::Fps(fps));
            }
        }

        tracing::info!(frames, "Capture loop stopped");

        if let Err(unclaimed) = handback.send(resources) {
            tracing::warn!("Supervisor stopped waiting, releasing devices from the capture thread");
            unclaimed.into_inner().release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{FaceDetector, Region};
    use crate::frame::Frame;

    struct SlowDetector(Duration);

    impl FaceDetector for SlowDetector {
        fn detect(&mut self, frame: &Frame) -> Vec<Region> {
            std::thread::sleep(self.0);
            Region::from_box(0, 0, 4, 4, frame.width(), frame.height())
                .into_iter()
                .collect()
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    fn frame() -> SharedFrame {
        Arc::new(Frame::solid(16, 16, [0, 0, 0], 1))
    }

    #[test]
    fn test_worker_returns_detections() {
        let worker =
            DetectionWorker::spawn(DetectionStage::new(Box::new(SlowDetector(Duration::ZERO)))).unwrap();
        assert_eq!(worker.detector_name(), "slow");

        let running = AtomicBool::new(true);
        for _ in 0..3 {
            match worker.detect(&frame(), &running) {
                Verdict::Done(result) => assert_eq!(result.len(), 1),
                _ => panic!("expected a detection result"),
            }
        }
    }

    #[test]
    fn test_cleared_flag_abandons_slow_detection() {
        let worker = DetectionWorker::spawn(DetectionStage::new(Box::new(SlowDetector(
            Duration::from_secs(2),
        ))))
        .unwrap();

        let running = AtomicBool::new(false);
        let begun = Instant::now();
        assert!(matches!(worker.detect(&frame(), &running), Verdict::Stopped));
        assert!(begun.elapsed() < Duration::from_secs(1));
    }
}
