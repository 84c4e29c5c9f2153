//! Telemetry and logging infrastructure
//!
//! Provides structured logging with tracing and the per-second throughput meter.

pub mod logging;
pub mod throughput;

pub use logging::{init_logging, LogConfig, LogError, LogGuard};
pub use throughput::ThroughputMeter;
