//! MJPEG preview stream
//!
//! An axum server that answers `GET /` (and `/stream.mjpg`) with an unbounded
//! `multipart/x-mixed-replace` response. Every connection reads the shared
//! [`LatestFrame`] slot, JPEG-encodes each new frame and writes it as one
//! part. A connection ends only when the peer goes away, encoding fails or
//! the sink is stopped.

pub mod slot;

pub use slot::{FrameSubscriber, LatestFrame};

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use crate::config::StreamConfig;
use crate::frame::{Frame, SharedFrame};

/// Multipart boundary token
pub const BOUNDARY: &str = "frame";

/// Upper bound on how long `stop()` waits for the server task
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Stream server errors
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to bind stream server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// JPEG encoding failure; ends the affected connection only
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("frame buffer does not match {width}x{height} RGB")]
    Malformed { width: u32, height: u32 },
    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
    #[error("encoder task failed: {0}")]
    Task(String),
}

/// Encode a frame as JPEG
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, EncodeError> {
    if !frame.is_well_formed() {
        return Err(EncodeError::Malformed {
            width: frame.width(),
            height: frame.height(),
        });
    }
    let mut jpeg = Vec::with_capacity(frame.data().len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode(
        frame.data(),
        frame.width(),
        frame.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(jpeg)
}

/// Wrap an encoded JPEG as one multipart part
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut payload = Vec::with_capacity(header.len() + jpeg.len() + 2);
    payload.extend_from_slice(header.as_bytes());
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

/// Resolve once the shutdown flag is set (or its sender is gone)
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Shared state behind the HTTP handlers
#[derive(Clone)]
struct StreamState {
    latest: Arc<LatestFrame>,
    shutdown: watch::Receiver<bool>,
    quality: u8,
    connections: Arc<AtomicUsize>,
}

/// One streaming connection; logs and uncounts itself when dropped
struct StreamCursor {
    frames: FrameSubscriber,
    shutdown: watch::Receiver<bool>,
    quality: u8,
    peer: SocketAddr,
    connections: Arc<AtomicUsize>,
    parts_sent: u64,
}

impl StreamCursor {
    /// Wait for the next frame and encode it; `None` ends the response
    async fn next_part(&mut self) -> Option<Bytes> {
        let frame = tokio::select! {
            frame = self.frames.next() => frame?,
            _ = stopped(&mut self.shutdown) => return None,
        };

        let quality = self.quality;
        let encoded = tokio::task::spawn_blocking(move || encode_jpeg(&frame, quality))
            .await
            .unwrap_or_else(|e| Err(EncodeError::Task(e.to_string())));

        match encoded {
            Ok(jpeg) => {
                self.parts_sent += 1;
                Some(multipart_chunk(&jpeg))
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, "Closing stream connection: {}", e);
                None
            }
        }
    }
}

impl Drop for StreamCursor {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(
            peer = %self.peer,
            parts = self.parts_sent,
            "Stream connection closed"
        );
    }
}

/// Stream the MJPEG feed over a multipart response
async fn stream_handler(
    State(state): State<StreamState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    state.connections.fetch_add(1, Ordering::AcqRel);
    tracing::debug!(peer = %peer, "Stream connection accepted");

    let cursor = StreamCursor {
        frames: state.latest.subscribe(),
        shutdown: state.shutdown.clone(),
        quality: state.quality,
        peer,
        connections: state.connections.clone(),
        parts_sent: 0,
    };

    let parts = futures_util::stream::unfold(cursor, |mut cursor| async move {
        let chunk = cursor.next_part().await?;
        Some((Ok::<Bytes, Infallible>(chunk), cursor))
    });

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
            ),
            (header::CACHE_CONTROL, "no-cache, no-store".to_string()),
            (header::PRAGMA, "no-cache".to_string()),
        ],
        Body::from_stream(parts),
    )
}

/// A running server instance
struct RunningServer {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    done: crossbeam_channel::Receiver<()>,
    local_addr: SocketAddr,
}

/// Pull-based preview stream sink
///
/// `start()` binds the listener and spawns the accept loop on the given
/// runtime; `publish()` replaces the frame every connection reads.
pub struct StreamSink {
    config: StreamConfig,
    runtime: Handle,
    latest: Arc<LatestFrame>,
    connections: Arc<AtomicUsize>,
    server: Option<RunningServer>,
}

impl StreamSink {
    pub fn new(config: StreamConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            latest: Arc::new(LatestFrame::new()),
            connections: Arc::new(AtomicUsize::new(0)),
            server: None,
        }
    }

    /// Bind and start serving
    ///
    /// Starting an already started sink returns the existing address.
    pub fn start(&mut self) -> Result<SocketAddr, StreamError> {
        if let Some(server) = &self.server {
            return Ok(server.local_addr);
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let bind_err = |source| StreamError::Bind {
            addr: addr.clone(),
            source,
        };

        let std_listener =
            std::net::TcpListener::bind((self.config.host.as_str(), self.config.port)).map_err(bind_err)?;
        std_listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = std_listener.local_addr().map_err(bind_err)?;

        let _guard = self.runtime.enter();
        let listener = tokio::net::TcpListener::from_std(std_listener).map_err(bind_err)?;

        // Fresh slot per run so new viewers never see a stale frame
        self.latest = Arc::new(LatestFrame::new());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = StreamState {
            latest: self.latest.clone(),
            shutdown: shutdown_rx.clone(),
            quality: self.config.jpeg_quality,
            connections: self.connections.clone(),
        };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new()
            .route("/", get(stream_handler))
            .route("/stream.mjpg", get(stream_handler))
            .with_state(state)
            .layer(cors);

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let mut server_shutdown = shutdown_rx;
        let task = self.runtime.spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { stopped(&mut server_shutdown).await })
            .await;
            if let Err(e) = result {
                tracing::error!("Stream server error: {}", e);
            }
            let _ = done_tx.send(());
        });

        tracing::info!("Streaming server started at http://{}", local_addr);

        self.server = Some(RunningServer {
            shutdown: shutdown_tx,
            task,
            done: done_rx,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Handle the capture loop publishes through
    pub fn publisher(&self) -> Arc<LatestFrame> {
        self.latest.clone()
    }

    /// Replace the shared frame
    pub fn publish(&self, frame: SharedFrame) {
        self.latest.publish(frame);
    }

    /// Address the server is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr)
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.server.is_some()
    }

    /// Currently open stream connections
    #[cfg(test)]
    pub(crate) fn active_connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// End every connection and stop the server, waiting at most
    /// [`SHUTDOWN_TIMEOUT`]; idempotent
    ///
    /// Blocks the calling thread, so call it outside async code (or from
    /// `spawn_blocking`).
    pub fn stop(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };

        let _ = server.shutdown.send(true);
        match server.done.recv_timeout(SHUTDOWN_TIMEOUT) {
            Ok(()) => tracing::info!("Streaming server stopped"),
            Err(_) => {
                tracing::warn!(
                    "Streaming server did not stop within {:?}, aborting",
                    SHUTDOWN_TIMEOUT
                );
                server.task.abort();
            }
        }
    }
}

impl Drop for StreamSink {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            let _ = server.shutdown.send(true);
            server.task.abort();
        }
    }
}
