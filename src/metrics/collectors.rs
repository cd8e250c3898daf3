//! Metric recording for queue operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with one method per
//! event the queue engine reports. Every method is a no-op until
//! [`init_metrics`](super::init_metrics) has run.

use std::time::Duration;

use super::prometheus::{
    JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, STALLED_RECOVERED, THROTTLE_WAITS,
};

/// Records queue metrics, labeled by queue name.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished run.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue the job ran on
    /// * `status` - Resulting job status (`succeeded`, `failed`, `retrying`)
    /// * `duration` - Time from dispatch to settlement
    pub fn record_job(&self, queue: &str, status: &str, duration: Duration) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[queue, status]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[queue])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            queue = queue,
            status = status,
            duration_ms = duration.as_millis() as u64,
            "Recorded job metric"
        );
    }

    pub fn inc_jobs_in_progress(&self, queue: &str) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.with_label_values(&[queue]).inc();
        }
    }

    pub fn dec_jobs_in_progress(&self, queue: &str) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.with_label_values(&[queue]).dec();
        }
    }

    /// Record jobs recovered by a stall check.
    pub fn record_stalled(&self, queue: &str, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(stalled) = STALLED_RECOVERED.get() {
            stalled.with_label_values(&[queue]).inc_by(count as f64);
        }
    }

    pub fn record_throttle_wait(&self, queue: &str) {
        if let Some(waits) = THROTTLE_WAITS.get() {
            waits.with_label_values(&[queue]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_record_job() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_job("collector-test", "succeeded", Duration::from_millis(20));
        collector.record_job("collector-test", "failed", Duration::from_millis(5));

        if let Some(jobs) = JOBS_TOTAL.get() {
            let count = jobs
                .with_label_values(&["collector-test", "succeeded"])
                .get();
            assert!(count >= 1.0);
        }
    }

    #[test]
    fn test_jobs_in_progress() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.inc_jobs_in_progress("progress-test");
        collector.inc_jobs_in_progress("progress-test");
        collector.dec_jobs_in_progress("progress-test");

        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            assert_eq!(gauge.with_label_values(&["progress-test"]).get(), 1.0);
        }
    }

    #[test]
    fn test_record_stalled_ignores_zero() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_stalled("stall-test", 0);
        collector.record_stalled("stall-test", 3);
        collector.record_throttle_wait("stall-test");

        if let Some(stalled) = STALLED_RECOVERED.get() {
            assert_eq!(stalled.with_label_values(&["stall-test"]).get(), 3.0);
        }
    }
}
