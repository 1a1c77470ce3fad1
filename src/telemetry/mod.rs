//! Telemetry for the serving runtime.
//!
//! Structured logging plus bounded sliding-window metrics with a
//! Prometheus text export. All output is stderr or IPC; the core opens
//! no network listeners.

mod logging;
mod metrics;
pub mod prometheus;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    BatchSnapshot, LatencySnapshot, MetricsCollector, MetricsSnapshot, ThroughputSnapshot,
};
