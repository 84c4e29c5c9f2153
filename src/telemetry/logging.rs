//! Logging setup
//!
//! Console output by default, an optional log file written through a
//! non-blocking appender, and JSON lines for log aggregation.

use std::fs::File;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Keeps the file writer flushing; hold it until exit
pub use tracing_appender::non_blocking::WorkerGuard as LogGuard;

/// Filter variable checked before `RUST_LOG`
pub const LOG_ENV: &str = "FACE_TRACKER_LOG";

/// Set to `json` for JSON console output
pub const LOG_FORMAT_ENV: &str = "FACE_TRACKER_LOG_FORMAT";

/// Logging setup failures
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to create log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Where and how to log
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub console_enabled: bool,
    /// Also write to `file_path` (default `face-tracker.log`)
    pub file_enabled: bool,
    pub file_path: Option<PathBuf>,
    pub json_format: bool,
    /// Filter used when neither env variable is set
    pub default_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: None,
            json_format: false,
            default_level: "info".to_string(),
        }
    }
}

impl LogConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(&self.default_level))
    }

    fn wants_json(&self, format_env: Option<String>) -> bool {
        format_env
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(self.json_format)
    }

    fn log_path(&self) -> PathBuf {
        self.file_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("face-tracker.log"))
    }
}

/// Install the global subscriber
///
/// Returns the file writer guard when file logging is on.
pub fn init_logging(config: &LogConfig) -> Result<Option<LogGuard>, LogError> {
    let json = config.wants_json(std::env::var(LOG_FORMAT_ENV).ok());

    let (file_layer, guard) = if config.file_enabled {
        let path = config.log_path();
        let file = File::create(&path).map_err(|source| LogError::File {
            path: path.clone(),
            source,
        })?;
        let (writer, guard): (_, WorkerGuard) = tracing_appender::non_blocking(file);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // Thread names tell the capture loop apart from runtime workers
    let console_text = (config.console_enabled && !json)
        .then(|| fmt::layer().with_thread_names(true).compact());
    let console_json = (config.console_enabled && json).then(|| {
        fmt::layer()
            .json()
            .with_thread_names(true)
            .with_current_span(false)
    });

    tracing_subscriber::registry()
        .with(config.filter())
        .with(file_layer)
        .with(console_text)
        .with(console_json)
        .try_init()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        json,
        file = ?config.file_enabled.then(|| config.log_path()),
        "Logging initialized"
    );

    Ok(guard)
}
