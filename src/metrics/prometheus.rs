//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by relayq and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all relayq metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finished runs, labeled by queue and resulting status
/// (succeeded, failed, retrying).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Run duration in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Runs currently executing, labeled by queue.
pub static JOBS_IN_PROGRESS: OnceLock<GaugeVec> = OnceLock::new();

/// Jobs moved back to `waiting` by the stall check, labeled by queue.
pub static STALLED_RECOVERED: OnceLock<CounterVec> = OnceLock::new();

/// Times a queue paused fetching because its throttle window was full.
pub static THROTTLE_WAITS: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before this is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("relayq_jobs_total", "Total number of finished job runs"),
        &["queue", "status"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "relayq_job_duration_seconds",
            "Job run duration in seconds",
        )
        .buckets(vec![0.005, 0.05, 0.25, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["queue"],
    )?;

    let jobs_in_progress = GaugeVec::new(
        Opts::new(
            "relayq_jobs_in_progress",
            "Number of jobs currently being processed",
        ),
        &["queue"],
    )?;

    let stalled_recovered = CounterVec::new(
        Opts::new(
            "relayq_stalled_recovered_total",
            "Total jobs recovered from stalled workers",
        ),
        &["queue"],
    )?;

    let throttle_waits = CounterVec::new(
        Opts::new(
            "relayq_throttle_waits_total",
            "Total times a queue waited for its throttle window",
        ),
        &["queue"],
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(stalled_recovered.clone()))?;
    registry.register(Box::new(throttle_waits.clone()))?;

    // Later calls keep the first set of metrics.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = STALLED_RECOVERED.set(stalled_recovered);
    let _ = THROTTLE_WAITS.set(throttle_waits);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
