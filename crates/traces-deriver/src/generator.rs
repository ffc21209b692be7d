// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synthetic trace batches.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::span::SpanKind;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use rand::distributions::Alphanumeric;
use rand::Rng;

const RANDOM_VALUE_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct TracesOptions {
    pub span_count: usize,
    pub span_kind: SpanKind,
    pub span_name: String,
    pub span_duration: Duration,
    pub attributes: HashMap<String, String>,
    pub resources: HashMap<String, String>,
    /// Span attributes receiving a random value per span.
    pub random_attributes: Vec<String>,
    /// Resource attributes receiving a random value per batch.
    pub random_resources: Vec<String>,
}

impl Default for TracesOptions {
    fn default() -> Self {
        Self {
            span_count: 1,
            span_kind: SpanKind::Internal,
            span_name: "generated".to_string(),
            span_duration: Duration::from_millis(100),
            attributes: HashMap::new(),
            resources: HashMap::new(),
            random_attributes: Vec::new(),
            random_resources: Vec::new(),
        }
    }
}

pub struct TracesGenerator {
    opts: TracesOptions,
}

fn string_kv(key: &str, value: String) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value)),
        }),
    }
}

fn random_string(rng: &mut impl Rng) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(RANDOM_VALUE_LEN)
        .map(char::from)
        .collect()
}

fn random_bytes<const N: usize>(rng: &mut impl Rng) -> Vec<u8> {
    let mut bytes = [0u8; N];
    rng.fill(&mut bytes[..]);
    bytes.to_vec()
}

impl TracesGenerator {
    #[must_use]
    pub fn new(opts: TracesOptions) -> Self {
        Self { opts }
    }

    fn attributes(
        fixed: &HashMap<String, String>,
        random: &[String],
        rng: &mut impl Rng,
    ) -> Vec<KeyValue> {
        let mut attrs: Vec<KeyValue> = fixed
            .iter()
            .map(|(k, v)| string_kv(k, v.clone()))
            .collect();
        attrs.extend(random.iter().map(|k| string_kv(k, random_string(&mut *rng))));
        attrs
    }

    /// One resource batch holding `span_count` spans ending now.
    #[must_use]
    pub fn generate(&self) -> Vec<ResourceSpans> {
        let mut rng = rand::thread_rng();
        let end = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let start = end.saturating_sub(
            u64::try_from(self.opts.span_duration.as_nanos()).unwrap_or(u64::MAX),
        );
        let trace_id = random_bytes::<16>(&mut rng);

        let spans = (0..self.opts.span_count)
            .map(|_| Span {
                trace_id: trace_id.clone(),
                span_id: random_bytes::<8>(&mut rng),
                name: self.opts.span_name.clone(),
                kind: self.opts.span_kind as i32,
                start_time_unix_nano: start,
                end_time_unix_nano: end,
                attributes: Self::attributes(
                    &self.opts.attributes,
                    &self.opts.random_attributes,
                    &mut rng,
                ),
                ..Default::default()
            })
            .collect();

        vec![ResourceSpans {
            resource: Some(Resource {
                attributes: Self::attributes(
                    &self.opts.resources,
                    &self.opts.random_resources,
                    &mut rng,
                ),
                ..Default::default()
            }),
            scope_spans: vec![ScopeSpans {
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }]
    }
}
