//! Metrics module for Prometheus-based monitoring.
//!
//! Job outcomes, run durations, in-flight counts, stall recoveries and
//! throttle waits, all labeled by queue.
//!
//! # Example
//!
//! ```ignore
//! use relayq::metrics::{init_metrics, export_metrics};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, REGISTRY, STALLED_RECOVERED, THROTTLE_WAITS,
};
