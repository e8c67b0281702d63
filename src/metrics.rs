//! Metrics collection for batch runs
//!
//! Prometheus-compatible counters for unit outcomes and external step
//! durations. Metrics live in the default registry; [`gather_metrics`] renders
//! them in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    /// Units processed, by pipeline and outcome
    static ref UNITS: IntCounterVec = register_int_counter_vec!(
        "neurobatch_units_total",
        "Total number of work units processed",
        &["pipeline", "outcome"]
    ).unwrap();

    /// Wall time of whole units
    static ref UNIT_DURATION: HistogramVec = register_histogram_vec!(
        "neurobatch_unit_duration_seconds",
        "Work unit duration in seconds",
        &["pipeline"],
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0, 43200.0]
    ).unwrap();

    /// Wall time of single external commands
    static ref STEP_DURATION: HistogramVec = register_histogram_vec!(
        "neurobatch_step_duration_seconds",
        "External step duration in seconds",
        &["program"],
        vec![0.1, 1.0, 10.0, 60.0, 300.0, 1800.0, 7200.0, 43200.0]
    ).unwrap();

    /// Failed external commands
    static ref STEP_FAILURES: IntCounterVec = register_int_counter_vec!(
        "neurobatch_step_failures_total",
        "Total number of failed external steps",
        &["program"]
    ).unwrap();

    /// Units currently holding a worker slot
    static ref ACTIVE_UNITS: IntGauge = register_int_gauge!(
        "neurobatch_active_units",
        "Number of work units currently running"
    ).unwrap();
}

/// A unit acquired a worker slot
pub fn unit_started() {
    ACTIVE_UNITS.inc();
}

/// A unit released its worker slot
pub fn unit_finished() {
    ACTIVE_UNITS.dec();
}

/// Metrics recorder scoped to one pipeline
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pipeline: String,
}

impl PipelineMetrics {
    /// Create a recorder for `pipeline`
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
        }
    }

    /// Record a unit's outcome label and duration
    pub fn record_unit(&self, outcome: &str, duration_secs: f64) {
        UNITS.with_label_values(&[&self.pipeline, outcome]).inc();
        UNIT_DURATION
            .with_label_values(&[&self.pipeline])
            .observe(duration_secs);
    }

    /// Record a unit that was skipped as already complete
    pub fn record_skipped(&self, count: usize) {
        UNITS
            .with_label_values(&[&self.pipeline, "skipped"])
            .inc_by(count as u64);
    }

    /// Record one external step
    pub fn record_step(&self, program: &str, success: bool, duration_secs: f64) {
        STEP_DURATION
            .with_label_values(&[program])
            .observe(duration_secs);
        if !success {
            STEP_FAILURES.with_label_values(&[program]).inc();
        }
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer
    #[inline]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in seconds
    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Export metrics in Prometheus text format
pub fn gather_metrics() -> crate::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_metrics() {
        let metrics = PipelineMetrics::new("metrics_test_pipeline");
        metrics.record_unit("succeeded", 1.5);
        metrics.record_skipped(2);
        metrics.record_step("metrics_test_tool", false, 0.2);

        let text = gather_metrics().unwrap();
        assert!(text.contains("neurobatch_units_total"));
        assert!(text.contains("metrics_test_pipeline"));
        assert!(text.contains("neurobatch_step_failures_total"));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_secs() >= 0.005);
    }
}
