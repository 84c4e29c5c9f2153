//! Face Tracker - Main Entry Point
//!
//! Serves tracking control and face events on a WebSocket, the camera preview
//! as MJPEG over HTTP, and mirrors frames to a virtual camera while tracking.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::watch;

use face_tracker::config::TrackerConfig;
use face_tracker::events::{CommandHandler, EventHub, EventServer, ModelSelection};
use face_tracker::pipeline::{PipelineSupervisor, SystemDevices};
use face_tracker::telemetry::{init_logging, LogConfig};

const USAGE: &str = "Usage: face-tracker [--config PATH] [--log-file PATH] [--list-cameras] [--autostart]";

/// Command-line options
#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
    log_file: Option<PathBuf>,
    list_cameras: bool,
    autostart: bool,
    help: bool,
}

impl Options {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut options = Options::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args.next().context("--config needs a path")?;
                    options.config = Some(PathBuf::from(path));
                }
                "--log-file" => {
                    let path = args.next().context("--log-file needs a path")?;
                    options.log_file = Some(PathBuf::from(path));
                }
                "--list-cameras" => options.list_cameras = true,
                "--autostart" => options.autostart = true,
                "-h" | "--help" => options.help = true,
                other => bail!("unknown argument {:?}\n{}", other, USAGE),
            }
        }
        Ok(options)
    }
}

#[cfg(feature = "native-camera")]
fn print_cameras() {
    let cameras = face_tracker::camera::list_cameras();
    if cameras.is_empty() {
        println!("No cameras found");
    }
    for camera in cameras {
        println!("{}: {}", camera.index, camera.name);
    }
}

#[cfg(not(feature = "native-camera"))]
fn print_cameras() {
    println!("Built without native camera support; only the test pattern source is available");
}

fn main() -> anyhow::Result<()> {
    let options = Options::parse(env::args().skip(1))?;
    if options.help {
        println!("{}", USAGE);
        return Ok(());
    }

    let log_config = LogConfig {
        file_enabled: options.log_file.is_some(),
        file_path: options.log_file.clone(),
        ..LogConfig::default()
    };
    let _log_guard = init_logging(&log_config).context("failed to initialize logging")?;

    if options.list_cameras {
        print_cameras();
        return Ok(());
    }

    let config = TrackerConfig::load(options.config.as_deref()).context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera.resolution_label(),
        fps = config.camera.fps,
        stream_port = config.stream.port,
        events_port = config.events.port,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("face-tracker")
        .build()
        .context("failed to build async runtime")?;

    let hub = Arc::new(EventHub::new());
    let supervisor = Arc::new(PipelineSupervisor::new(
        config.clone(),
        Arc::new(SystemDevices),
        hub.clone(),
        runtime.handle().clone(),
    ));
    let handler = CommandHandler::new(supervisor.clone(), Arc::new(ModelSelection::new()));

    let server = runtime
        .block_on(EventServer::bind(&config.events, hub, handler))
        .context("failed to start event server")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = runtime.spawn(server.run(shutdown_rx));

    if options.autostart {
        match supervisor.start() {
            Ok(()) => {
                if let Ok(addr) = supervisor.stream_address() {
                    tracing::info!("Preview at http://{}/", addr);
                }
            }
            Err(e) => tracing::error!("Autostart failed: {}", e),
        }
    }

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    supervisor.stop();
    let _ = shutdown_tx.send(true);
    if let Err(e) = runtime.block_on(server_task) {
        tracing::warn!("Event server task failed: {}", e);
    }

    Ok(())
}
