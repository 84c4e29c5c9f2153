//! Pipeline lifecycle
//!
//! [`PipelineSupervisor`] owns every device and server a tracking run needs
//! and exposes `start()`/`stop()` as the only way to change them. The state is
//! `Running` exactly while a run holds its frame source, virtual camera and
//! stream server.

pub mod capture;
pub mod devices;

#[cfg(test)]
pub(crate) mod testing;

pub use capture::{CaptureLoop, DetectionWorker, RunResources, NO_FRAME_BACKOFF};
pub use devices::{DeviceProvider, SystemDevices};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use crate::camera::CaptureError;
use crate::config::TrackerConfig;
use crate::detection::DetectionStage;
use crate::events::EventHub;
use crate::stream::{StreamError, StreamSink};
use crate::virtual_camera::{VirtualCamera, VirtualCameraError};

/// Longest `stop()` waits for the capture loop to hand its devices back
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
}

/// Lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("tracking is already running")]
    AlreadyRunning,
    #[error("tracking is not running")]
    NotRunning,
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    VirtualCamera(#[from] VirtualCameraError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Everything held while `Running`
struct ActiveRun {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    handback: crossbeam_channel::Receiver<RunResources>,
    stream: StreamSink,
}

/// Starts and stops the capture pipeline as one unit
pub struct PipelineSupervisor {
    config: TrackerConfig,
    devices: Arc<dyn DeviceProvider>,
    events: Arc<EventHub>,
    runtime: Handle,
    /// Serialises `start()`/`stop()`; `Some` while a run is active
    run: Mutex<Option<ActiveRun>>,
    state: RwLock<PipelineState>,
}

impl PipelineSupervisor {
    /// `runtime` hosts the stream server tasks
    pub fn new(
        config: TrackerConfig,
        devices: Arc<dyn DeviceProvider>,
        events: Arc<EventHub>,
        runtime: Handle,
    ) -> Self {
        Self {
            config,
            devices,
            events,
            runtime,
            run: Mutex::new(None),
            state: RwLock::new(PipelineState::Idle),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// Address the preview stream is served on
    pub fn stream_address(&self) -> Result<SocketAddr, PipelineError> {
        self.run
            .lock()
            .as_ref()
            .and_then(|run| run.stream.local_addr())
            .ok_or(PipelineError::NotRunning)
    }

    /// Acquire every device and launch the capture loop
    ///
    /// Blocks while devices open; call it outside async code.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut run = self.run.lock();
        if run.is_some() {
            tracing::warn!("Start requested while tracking is already running");
            return Err(PipelineError::AlreadyRunning);
        }

        let mut source = self.devices.open_source(&self.config.camera)?;
        let (width, height) = source.resolution();
        tracing::info!("Opened {} at {}x{}", source.name(), width, height);

        let virtual_camera = match self.open_virtual_camera() {
            Ok(camera) => camera,
            Err(e) => {
                source.release();
                return Err(e.into());
            }
        };

        let mut stream = StreamSink::new(self.config.stream.clone(), self.runtime.clone());
        if let Err(e) = stream.start() {
            RunResources {
                source,
                virtual_camera,
            }
            .release();
            return Err(e.into());
        }

        let resources = RunResources {
            source,
            virtual_camera,
        };
        let detection = match DetectionWorker::spawn(DetectionStage::new(
            self.devices.detector(&self.config.model),
        )) {
            Ok(worker) => worker,
            Err(e) => {
                resources.release();
                stream.stop();
                return Err(PipelineError::Spawn(e));
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let (handback_tx, handback_rx) = crossbeam_channel::bounded(1);
        let capture = CaptureLoop {
            resources,
            detection,
            stream: stream.publisher(),
            events: self.events.clone(),
            running: running.clone(),
        };

        let thread = match std::thread::Builder::new()
            .name("capture-loop".to_string())
            .spawn(move || capture.run(handback_tx))
        {
            Ok(thread) => thread,
            Err(e) => {
                // The closure and the devices it captured are dropped with the error
                stream.stop();
                return Err(PipelineError::Spawn(e));
            }
        };

        *run = Some(ActiveRun {
            running,
            thread,
            handback: handback_rx,
            stream,
        });
        *self.state.write() = PipelineState::Running;
        tracing::info!("Tracking started");
        Ok(())
    }

    /// `None` when mirroring is disabled or the device is optional and missing
    fn open_virtual_camera(&self) -> Result<Option<Box<dyn VirtualCamera>>, VirtualCameraError> {
        let config = &self.config.virtual_camera;
        if !config.enabled {
            return Ok(None);
        }
        match self.devices.open_virtual_camera(config) {
            Ok(camera) => {
                tracing::info!("Virtual camera ready ({})", camera.technology_name());
                Ok(Some(camera))
            }
            Err(e) if config.required => Err(e),
            Err(e) => {
                tracing::warn!("Continuing without virtual camera: {}", e);
                Ok(None)
            }
        }
    }

    /// Stop the capture loop and release every device; no-op when idle
    ///
    /// Returns whether a run was stopped. Blocks for at most
    /// [`SHUTDOWN_TIMEOUT`] plus the stream server's own shutdown bound, so
    /// call it outside async code.
    pub fn stop(&self) -> bool {
        let mut run = self.run.lock();
        let Some(active) = run.take() else {
            tracing::debug!("Stop requested while idle");
            return false;
        };

        *self.state.write() = PipelineState::Idle;
        active.running.store(false, Ordering::Release);

        let ActiveRun {
            thread,
            handback,
            mut stream,
            ..
        } = active;

        match handback.recv_timeout(SHUTDOWN_TIMEOUT) {
            Ok(resources) => {
                resources.release();
                if thread.join().is_err() {
                    tracing::error!("Capture thread panicked during shutdown");
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "Capture loop did not stop within {:?}; it will release its devices on exit",
                    SHUTDOWN_TIMEOUT
                );
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                tracing::error!("Capture thread exited without returning its devices");
                let _ = thread.join();
            }
        }

        stream.stop();
        tracing::info!("Tracking stopped");
        true
    }
}

impl Drop for PipelineSupervisor {
    fn drop(&mut self) {
        if let Some(active) = self.run.get_mut().take() {
            // Let the loop wind down and release its own devices
            active.running.store(false, Ordering::Release);
        }
    }
}
