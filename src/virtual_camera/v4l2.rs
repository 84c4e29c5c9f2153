//! v4l2loopback output for Linux.
//!
//! Writes raw RGB24 frames to a loopback device node created with
//! `modprobe v4l2loopback devices=1 video_nr=10 card_label="Face Tracker" exclusive_caps=1`.
//! The device must already be configured for RGB24 at the sink resolution
//! (e.g. `v4l2loopback-ctl set-caps /dev/video10 "RGB3:1280x720"`); this
//! sink only writes frames.

#![cfg(target_os = "linux")]

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::{VirtualCamera, VirtualCameraError};
use crate::config::VirtualCameraConfig;
use crate::frame::Frame;

/// Loopback device writer
pub struct V4l2Loopback {
    /// Open device node; `None` once closed or failed
    device: Option<File>,
    path: PathBuf,
    width: u32,
    height: u32,
    /// Minimum spacing between frames written to the device
    frame_interval: Duration,
    last_write: Option<Instant>,
    frames_written: u64,
}

impl V4l2Loopback {
    /// Open the configured device node for writing
    pub fn open(config: &VirtualCameraConfig) -> Result<Self, VirtualCameraError> {
        let device = OpenOptions::new()
            .write(true)
            .open(&config.device)
            .map_err(|e| {
                VirtualCameraError::DeviceUnavailable(format!(
                    "failed to open {}: {}",
                    config.device.display(),
                    e
                ))
            })?;

        tracing::info!(
            "v4l2loopback: writing to {} ({}x{} @ {} fps)",
            config.device.display(),
            config.width,
            config.height,
            config.fps
        );

        Ok(Self {
            device: Some(device),
            path: config.device.clone(),
            width: config.width,
            height: config.height,
            frame_interval: Duration::from_secs(1) / config.fps.max(1),
            last_write: None,
            frames_written: 0,
        })
    }

    /// Frames pushed to the device so far
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl VirtualCamera for V4l2Loopback {
    fn write(&mut self, frame: &Frame) -> Result<(), VirtualCameraError> {
        let Some(device) = self.device.as_mut() else {
            return Err(VirtualCameraError::DeviceUnavailable(format!(
                "{} is closed",
                self.path.display()
            )));
        };

        // The device runs at a fixed rate; frames arriving faster are skipped
        let now = Instant::now();
        if let Some(last) = self.last_write {
            if now.duration_since(last) < self.frame_interval {
                return Ok(());
            }
        }

        let scaled = frame.resized(self.width, self.height);
        if let Err(e) = device.write_all(scaled.data()) {
            self.device = None;
            return Err(VirtualCameraError::DeviceUnavailable(format!(
                "write to {} failed: {}",
                self.path.display(),
                e
            )));
        }

        self.last_write = Some(now);
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            tracing::info!(
                "v4l2loopback: closed {} after {} frames",
                self.path.display(),
                self.frames_written
            );
        }
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn technology_name(&self) -> &'static str {
        "v4l2loopback"
    }
}

impl Drop for V4l2Loopback {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_device(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "face-tracker-{}-{}.raw",
            name,
            std::process::id()
        ));
        File::create(&path).unwrap();
        path
    }

    fn config_for(path: PathBuf, fps: u32) -> VirtualCameraConfig {
        VirtualCameraConfig {
            device: path,
            width: 4,
            height: 2,
            fps,
            ..VirtualCameraConfig::default()
        }
    }

    #[test]
    fn test_writes_resized_rgb_frames() {
        let path = scratch_device("resize");
        let mut sink = V4l2Loopback::open(&config_for(path.clone(), 1000)).unwrap();
        sink.write(&Frame::solid(16, 8, [9, 8, 7], 0)).unwrap();
        sink.close();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 4 * 2 * 3);
        assert!(written.chunks(3).all(|p| p == [9, 8, 7]));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_frames_faster_than_device_rate_are_skipped() {
        let path = scratch_device("pacing");
        let mut sink = V4l2Loopback::open(&config_for(path.clone(), 1)).unwrap();
        for i in 0..5 {
            sink.write(&Frame::solid(4, 2, [1, 2, 3], i)).unwrap();
        }
        assert_eq!(sink.frames_written(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let config = config_for(PathBuf::from("/nonexistent/video99"), 30);
        assert!(matches!(
            V4l2Loopback::open(&config),
            Err(VirtualCameraError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_close_is_idempotent_and_write_after_close_fails() {
        let path = scratch_device("close");
        let mut sink = V4l2Loopback::open(&config_for(path.clone(), 30)).unwrap();
        sink.close();
        sink.close();
        assert!(!sink.is_open());
        assert!(sink.write(&Frame::solid(4, 2, [0, 0, 0], 0)).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
