//! Metrics sink handed to each component at construction.

use metrics::{counter, gauge, histogram};

/// Where the engine reports its counters and gauges.
pub trait MetricsSink: Send + Sync {
    /// One processed notification, labelled by outcome (`succeeded`, `retried`, ...).
    fn record_refresh(&self, outcome: &str, duration_secs: f64);

    /// Versions evicted by a retention policy run.
    fn record_eviction(&self, policy: &str, count: u64);

    /// Projects with drift found by a reconciliation run.
    fn record_mismatches(&self, count: u64);

    /// Current number of pending notifications.
    fn record_queue_depth(&self, depth: usize);

    /// One scheduled job run.
    fn record_schedule_run(&self, schedule: &str, success: bool);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_refresh(&self, _outcome: &str, _duration_secs: f64) {}
    fn record_eviction(&self, _policy: &str, _count: u64) {}
    fn record_mismatches(&self, _count: u64) {}
    fn record_queue_depth(&self, _depth: usize) {}
    fn record_schedule_run(&self, _schedule: &str, _success: bool) {}
}

/// Emits through the `metrics` facade; whichever recorder the binary
/// installs receives the values.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

impl MetricsSink for FacadeMetrics {
    fn record_refresh(&self, outcome: &str, duration_secs: f64) {
        counter!("depot_notifications_processed_total", "outcome" => outcome.to_string())
            .increment(1);
        histogram!("depot_refresh_duration_seconds", "outcome" => outcome.to_string())
            .record(duration_secs);
    }

    fn record_eviction(&self, policy: &str, count: u64) {
        counter!("depot_versions_evicted_total", "policy" => policy.to_string()).increment(count);
    }

    fn record_mismatches(&self, count: u64) {
        gauge!("depot_version_mismatches").set(count as f64);
    }

    fn record_queue_depth(&self, depth: usize) {
        gauge!("depot_notification_queue_depth").set(depth as f64);
    }

    fn record_schedule_run(&self, schedule: &str, success: bool) {
        let status = if success { "success" } else { "failure" };
        counter!("depot_schedule_runs_total", "schedule" => schedule.to_string(), "status" => status.to_string())
            .increment(1);
    }
}
