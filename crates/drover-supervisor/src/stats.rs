//! Concrete stats sinks.
//!
//! The consumer core only speaks [`StatsSink`]; these are the two shipped
//! backends. Anything heavier (statsd, a time-series database) plugs in the
//! same way from the embedding application.

use std::time::Duration;

use drover_common::StatsSink;

/// Emits every stat as a structured debug log line.
#[derive(Debug, Default)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn incr(&self, measurement: &str, counter: &str) {
        tracing::debug!(measurement, counter, "incr");
    }

    fn timing(&self, measurement: &str, name: &str, duration: Duration) {
        tracing::debug!(measurement, name, duration_ms = duration.as_millis() as u64, "timing");
    }

    fn gauge(&self, measurement: &str, name: &str, value: f64) {
        tracing::debug!(measurement, name, value, "gauge");
    }
}

/// Forwards to the `metrics` facade. The measurement and counter names ride
/// as labels so one exporter configuration covers every group.
#[derive(Debug, Default)]
pub struct MetricsSink;

impl StatsSink for MetricsSink {
    fn incr(&self, measurement: &str, counter: &str) {
        metrics::counter!(
            "drover_events_total",
            "measurement" => measurement.to_string(),
            "counter" => counter.to_string()
        )
        .increment(1);
    }

    fn timing(&self, measurement: &str, name: &str, duration: Duration) {
        metrics::histogram!(
            "drover_duration_seconds",
            "measurement" => measurement.to_string(),
            "name" => name.to_string()
        )
        .record(duration.as_secs_f64());
    }

    fn gauge(&self, measurement: &str, name: &str, value: f64) {
        metrics::gauge!(
            "drover_gauge",
            "measurement" => measurement.to_string(),
            "name" => name.to_string()
        )
        .set(value);
    }
}
