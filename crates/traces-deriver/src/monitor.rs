// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self telemetry of the derivation pipeline.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

use crate::define::{RecordType, MONITORING_NAMESPACE};

struct Metrics {
    registry: Registry,
    accumulator_exceeded: IntCounterVec,
    accumulator_added_series: IntCounterVec,
    accumulator_series: IntGaugeVec,
    accumulator_gc_duration: Histogram,
    accumulator_publish_duration: Histogram,
    limiter_exceeded: IntCounterVec,
    limiter_series: IntGaugeVec,
    handled_spans: IntCounterVec,
    queue_dropped: IntCounterVec,
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help).namespace(MONITORING_NAMESPACE), labels)
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntGaugeVec> {
    IntGaugeVec::new(Opts::new(name, help).namespace(MONITORING_NAMESPACE), labels)
}

fn histogram(name: &str, help: &str) -> prometheus::Result<Histogram> {
    Histogram::with_opts(HistogramOpts::new(name, help).namespace(MONITORING_NAMESPACE))
}

impl Metrics {
    fn build() -> prometheus::Result<Self> {
        let metrics = Self {
            registry: Registry::new(),
            accumulator_exceeded: counter_vec(
                "accumulator_series_exceeded_total",
                "Observations rejected by the accumulator series caps",
                &["data_id"],
            )?,
            accumulator_added_series: counter_vec(
                "accumulator_added_series_total",
                "New series created by the accumulator",
                &["data_id"],
            )?,
            accumulator_series: gauge_vec(
                "accumulator_series_count",
                "Live series tracked by the accumulator",
                &["data_id"],
            )?,
            accumulator_gc_duration: histogram(
                "accumulator_gc_duration_seconds",
                "Duration of one accumulator gc pass",
            )?,
            accumulator_publish_duration: histogram(
                "accumulator_publish_duration_seconds",
                "Duration of one accumulator publish pass",
            )?,
            limiter_exceeded: counter_vec(
                "series_limiter_exceeded_total",
                "Series rejected by the series limiter",
                &["data_id"],
            )?,
            limiter_series: gauge_vec(
                "series_limiter_series_count",
                "Live series tracked by the series limiter",
                &["data_id"],
            )?,
            handled_spans: counter_vec(
                "traces_deriver_handled_spans_total",
                "Spans matched by a traces deriver operation",
                &["processor", "operation"],
            )?,
            queue_dropped: counter_vec(
                "record_queue_dropped_total",
                "Records dropped because the record queue was full",
                &["record_type"],
            )?,
        };

        metrics.registry.register(Box::new(metrics.accumulator_exceeded.clone()))?;
        metrics.registry.register(Box::new(metrics.accumulator_added_series.clone()))?;
        metrics.registry.register(Box::new(metrics.accumulator_series.clone()))?;
        metrics.registry.register(Box::new(metrics.accumulator_gc_duration.clone()))?;
        metrics
            .registry
            .register(Box::new(metrics.accumulator_publish_duration.clone()))?;
        metrics.registry.register(Box::new(metrics.limiter_exceeded.clone()))?;
        metrics.registry.register(Box::new(metrics.limiter_series.clone()))?;
        metrics.registry.register(Box::new(metrics.handled_spans.clone()))?;
        metrics.registry.register(Box::new(metrics.queue_dropped.clone()))?;
        Ok(metrics)
    }
}

lazy_static! {
    static ref METRICS: Option<Metrics> = match Metrics::build() {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!("Failed to register self telemetry: {e}");
            None
        }
    };
}

pub fn inc_accumulator_exceeded(data_id: i32) {
    if let Some(m) = METRICS.as_ref() {
        m.accumulator_exceeded
            .with_label_values(&[&data_id.to_string()])
            .inc();
    }
}

pub fn inc_accumulator_added_series(data_id: i32) {
    if let Some(m) = METRICS.as_ref() {
        m.accumulator_added_series
            .with_label_values(&[&data_id.to_string()])
            .inc();
    }
}

pub fn set_accumulator_series(data_id: i32, count: usize) {
    if let Some(m) = METRICS.as_ref() {
        m.accumulator_series
            .with_label_values(&[&data_id.to_string()])
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }
}

/// Drops the series gauge of a released stream.
pub fn remove_accumulator_series(data_id: i32) {
    if let Some(m) = METRICS.as_ref() {
        // absent when the stream never reported
        let _ = m
            .accumulator_series
            .remove_label_values(&[&data_id.to_string()]);
    }
}

pub fn observe_accumulator_gc(seconds: f64) {
    if let Some(m) = METRICS.as_ref() {
        m.accumulator_gc_duration.observe(seconds);
    }
}

pub fn observe_accumulator_publish(seconds: f64) {
    if let Some(m) = METRICS.as_ref() {
        m.accumulator_publish_duration.observe(seconds);
    }
}

pub fn inc_limiter_exceeded(data_id: i32) {
    if let Some(m) = METRICS.as_ref() {
        m.limiter_exceeded
            .with_label_values(&[&data_id.to_string()])
            .inc();
    }
}

pub fn set_limiter_series(data_id: i32, count: usize) {
    if let Some(m) = METRICS.as_ref() {
        m.limiter_series
            .with_label_values(&[&data_id.to_string()])
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }
}

pub fn remove_limiter_series(data_id: i32) {
    if let Some(m) = METRICS.as_ref() {
        let _ = m.limiter_series.remove_label_values(&[&data_id.to_string()]);
    }
}

pub fn add_handled_spans(processor: &str, operation: &str, n: u64) {
    if n == 0 {
        return;
    }
    if let Some(m) = METRICS.as_ref() {
        m.handled_spans
            .with_label_values(&[processor, operation])
            .inc_by(n);
    }
}

pub fn inc_queue_dropped(record_type: RecordType) {
    if let Some(m) = METRICS.as_ref() {
        m.queue_dropped
            .with_label_values(&[record_type.as_str()])
            .inc();
    }
}

/// Renders every registered metric in the Prometheus text format.
#[must_use]
pub fn encode_text() -> String {
    let Some(m) = METRICS.as_ref() else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&m.registry.gather(), &mut buf) {
        warn!("Failed to encode self telemetry: {e}");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_text_output() {
        inc_accumulator_exceeded(424_242);
        inc_queue_dropped(RecordType::MetricsDerived);
        let text = encode_text();
        assert!(text.contains("telemetry_collector_accumulator_series_exceeded_total"));
        assert!(text.contains("data_id=\"424242\""));
        assert!(text.contains("record_type=\"metrics.derived\""));
    }

    #[test]
    fn test_added_series_counter_name() {
        inc_accumulator_added_series(515_151);
        let text = encode_text();
        assert!(text.contains("telemetry_collector_accumulator_added_series_total{data_id=\"515151\"} 1"));
        assert!(!text.contains("accumulator_added_total"));
    }

    #[test]
    fn test_released_series_gauges_are_removed() {
        set_accumulator_series(737_373, 5);
        set_limiter_series(737_374, 2);
        let text = encode_text();
        assert!(text.contains("data_id=\"737373\""));
        assert!(text.contains("data_id=\"737374\""));

        remove_accumulator_series(737_373);
        remove_limiter_series(737_374);
        remove_limiter_series(737_375);
        let text = encode_text();
        assert!(!text.contains("data_id=\"737373\""));
        assert!(!text.contains("data_id=\"737374\""));
    }
}
