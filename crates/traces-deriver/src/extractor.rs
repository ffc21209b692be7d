// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw duration samples gated by the series limiter.

use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::metrics::v1::{
    metric, number_data_point, Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics,
};
use opentelemetry_proto::tonic::trace::v1::Span;

use crate::config::ExtractorConfig;
use crate::errors::Creation;
use crate::labels::{hash_from_map, Dimensions};
use crate::otel;
use crate::serieslimiter::SeriesLimiter;

pub struct DurationExtractor {
    conf: ExtractorConfig,
    limiter: SeriesLimiter,
}

impl DurationExtractor {
    /// # Errors
    ///
    /// Fails when called outside of a tokio runtime.
    pub fn new(conf: ExtractorConfig) -> Result<Self, Creation> {
        let limiter = SeriesLimiter::new(conf.max_series, conf.gc_interval)?;
        Ok(Self { conf, limiter })
    }

    #[must_use]
    pub fn metric_name(&self) -> &str {
        &self.conf.metric_name
    }

    /// Whether the series of `dims` may be emitted for `data_id`.
    #[must_use]
    pub fn admit(&self, data_id: i32, dims: &Dimensions) -> bool {
        self.limiter.set(data_id, hash_from_map(dims))
    }

    /// Duration data point of `span` labelled with `dims`.
    #[must_use]
    pub fn extract(&self, span: &Span, dims: Dimensions) -> NumberDataPoint {
        let mut attributes: Vec<KeyValue> = dims
            .into_iter()
            .map(|(key, value)| KeyValue {
                key,
                value: Some(AnyValue {
                    value: Some(any_value::Value::StringValue(value)),
                }),
            })
            .collect();
        attributes.sort_unstable_by(|a, b| a.key.cmp(&b.key));

        #[allow(clippy::cast_precision_loss)]
        let duration = otel::span_duration_nanos(span) as f64;
        NumberDataPoint {
            attributes,
            start_time_unix_nano: span.start_time_unix_nano,
            time_unix_nano: span.end_time_unix_nano,
            value: Some(number_data_point::Value::AsDouble(duration)),
            ..Default::default()
        }
    }

    /// Wraps extracted points into one gauge batch.
    #[must_use]
    pub fn batch(&self, points: Vec<NumberDataPoint>) -> ResourceMetrics {
        ResourceMetrics {
            scope_metrics: vec![ScopeMetrics {
                metrics: vec![Metric {
                    name: self.conf.metric_name.clone(),
                    data: Some(metric::Data::Gauge(Gauge { data_points: points })),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    pub async fn stop(&self) {
        self.limiter.stop().await;
    }
}
