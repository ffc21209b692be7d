// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use opentelemetry_proto::tonic::metrics::v1::NumberDataPoint;
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use tracing::debug;

use crate::accumulator::Accumulator;
use crate::config::{Config, ConfigHandler, OperationType};
use crate::define::{PublishFn, Record, RecordData, RecordType, RequestType};
use crate::errors::ConfigError;
use crate::extractor::DurationExtractor;
use crate::matcher::DimensionMatcher;
use crate::monitor;
use crate::otel;

/// Dimension carrying the application name of accumulated series.
pub const APP_NAME_DIMENSION: &str = "app_name";

/// Routes matching spans into the accumulator and the duration extractor of
/// one configuration.
pub struct Operator {
    name: String,
    matcher: DimensionMatcher,
    accumulator: Option<Accumulator>,
    extractor: Option<DurationExtractor>,
}

impl Operator {
    /// Builds the lookup tables and starts the derivation backends the
    /// configuration asks for.
    ///
    /// # Errors
    ///
    /// Fails on invalid configurations and outside of a tokio runtime.
    pub fn new(
        name: &str,
        config: &Config,
        publish: Option<PublishFn>,
    ) -> Result<Self, ConfigError> {
        let handler = ConfigHandler::new(config)?;
        let accumulator = handler
            .accumulator_config()
            .map(|conf| Accumulator::new(conf.clone(), publish))
            .transpose()?;
        let extractor = handler
            .extractor_config()
            .map(|conf| DurationExtractor::new(conf.clone()))
            .transpose()?;

        Ok(Self {
            name: name.to_string(),
            matcher: DimensionMatcher::new(handler),
            accumulator,
            extractor,
        })
    }

    #[must_use]
    pub fn accumulator(&self) -> Option<&Accumulator> {
        self.accumulator.as_ref()
    }

    #[must_use]
    pub fn extractor(&self) -> Option<&DurationExtractor> {
        self.extractor.as_ref()
    }

    /// Feeds every matching span of a traces record into the configured
    /// backends. Returns the raw duration samples as a derived metrics record
    /// when any were extracted.
    #[must_use]
    pub fn operate(&self, record: &Record) -> Option<Record> {
        let RecordData::Traces(batches) = &record.data else {
            return None;
        };
        let data_id = record.token.metrics_data_id;

        let mut points = Vec::new();
        for &op in self.matcher.handler().types() {
            let handled = match op.stat_kind() {
                Some(_) => self.accumulate(op, batches, data_id, &record.token.app_name),
                None => self.extract(op, batches, data_id, &mut points),
            };
            monitor::add_handled_spans(&self.name, op.as_str(), handled);
        }

        let extractor = self.extractor.as_ref()?;
        if points.is_empty() {
            return None;
        }
        Some(Record {
            record_type: RecordType::MetricsDerived,
            request_type: RequestType::Derived,
            token: record.token.clone(),
            data: RecordData::Metrics(vec![extractor.batch(points)]),
        })
    }

    fn accumulate(
        &self,
        op: OperationType,
        batches: &[ResourceSpans],
        data_id: i32,
        app_name: &str,
    ) -> u64 {
        let Some(accumulator) = self.accumulator.as_ref() else {
            return 0;
        };
        let mut handled = 0;
        for rs in batches {
            let resource = otel::resource_attributes(rs);
            let resource_dims = self.matcher.match_resource(op, resource);
            for ss in &rs.scope_spans {
                for span in &ss.spans {
                    let Some(mut dims) = self.matcher.match_span(op, resource, span) else {
                        continue;
                    };
                    dims.extend(resource_dims.clone());
                    dims.insert(APP_NAME_DIMENSION.to_string(), app_name.to_string());

                    #[allow(clippy::cast_precision_loss)]
                    let duration = otel::span_duration_nanos(span) as f64;
                    if accumulator.accumulate(data_id, &dims, duration) {
                        handled += 1;
                    }
                }
            }
        }
        handled
    }

    fn extract(
        &self,
        op: OperationType,
        batches: &[ResourceSpans],
        data_id: i32,
        points: &mut Vec<NumberDataPoint>,
    ) -> u64 {
        let Some(extractor) = self.extractor.as_ref() else {
            return 0;
        };
        let mut handled = 0;
        for rs in batches {
            let resource = otel::resource_attributes(rs);
            let resource_dims = self.matcher.match_resource(op, resource);
            for ss in &rs.scope_spans {
                for span in &ss.spans {
                    let Some(mut dims) = self.matcher.match_span(op, resource, span) else {
                        continue;
                    };
                    dims.extend(resource_dims.clone());
                    if !extractor.admit(data_id, &dims) {
                        debug!(
                            "Operator dropped {} series for data id {data_id}: limit reached",
                            extractor.metric_name()
                        );
                        continue;
                    }
                    points.push(extractor.extract(span, dims));
                    handled += 1;
                }
            }
        }
        handled
    }

    /// Stops the background tasks of the accumulator and the extractor.
    pub async fn clean(&self) {
        if let Some(accumulator) = self.accumulator.as_ref() {
            accumulator.stop().await;
        }
        if let Some(extractor) = self.extractor.as_ref() {
            extractor.stop().await;
        }
    }
}
