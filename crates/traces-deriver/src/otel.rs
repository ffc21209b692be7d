// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read accessors over the OpenTelemetry span model.

use std::fmt::Write as _;

use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::trace::v1::span::SpanKind;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, Span};

/// Renders scalar attribute values. Empty strings and composite values
/// render as `None`.
#[must_use]
pub fn any_value_to_string(value: &AnyValue) -> Option<String> {
    match value.value.as_ref()? {
        any_value::Value::StringValue(s) if s.is_empty() => None,
        any_value::Value::StringValue(s) => Some(s.clone()),
        any_value::Value::BoolValue(b) => Some(b.to_string()),
        any_value::Value::IntValue(i) => Some(i.to_string()),
        any_value::Value::DoubleValue(d) => Some(d.to_string()),
        any_value::Value::BytesValue(b) if b.is_empty() => None,
        any_value::Value::BytesValue(b) => Some(hex(b)),
        any_value::Value::ArrayValue(_) | any_value::Value::KvlistValue(_) => None,
    }
}

/// Looks `key` up among `attributes` and renders its value.
#[must_use]
pub fn attribute(attributes: &[KeyValue], key: &str) -> Option<String> {
    attributes
        .iter()
        .find(|kv| kv.key == key)
        .and_then(|kv| kv.value.as_ref())
        .and_then(any_value_to_string)
}

#[must_use]
pub fn resource_attributes(rs: &ResourceSpans) -> &[KeyValue] {
    rs.resource
        .as_ref()
        .map_or(&[][..], |r| r.attributes.as_slice())
}

/// Calls `f` for every span of every batch with the attributes of the
/// resource the span belongs to.
pub fn foreach_spans<'a, F>(batches: &'a [ResourceSpans], mut f: F)
where
    F: FnMut(&'a [KeyValue], &'a Span),
{
    for rs in batches {
        let resource = resource_attributes(rs);
        for ss in &rs.scope_spans {
            for span in &ss.spans {
                f(resource, span);
            }
        }
    }
}

#[must_use]
pub fn span_count(batches: &[ResourceSpans]) -> usize {
    batches
        .iter()
        .flat_map(|rs| rs.scope_spans.iter())
        .map(|ss| ss.spans.len())
        .sum()
}

/// Span duration in nanoseconds. A span ending before it starts lasts `0`.
#[must_use]
pub fn span_duration_nanos(span: &Span) -> u64 {
    span.end_time_unix_nano
        .saturating_sub(span.start_time_unix_nano)
}

/// Protobuf name of a span kind, `SPAN_KIND_UNSPECIFIED` for unknown values.
#[must_use]
pub fn span_kind_name(kind: i32) -> &'static str {
    SpanKind::try_from(kind)
        .unwrap_or(SpanKind::Unspecified)
        .as_str_name()
}

/// Parses a span kind name, accepting both `SPAN_KIND_CLIENT` and `client`.
#[must_use]
pub fn parse_span_kind(name: &str) -> Option<SpanKind> {
    SpanKind::from_str_name(name).or_else(|| {
        let full = format!("SPAN_KIND_{}", name.to_ascii_uppercase());
        SpanKind::from_str_name(&full)
    })
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Span fields addressable by name in rule configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    SpanName,
    Kind,
    TraceId,
    SpanId,
    ParentSpanId,
    TraceState,
    StatusCode,
    StatusMessage,
}

impl Method {
    pub const ALL: [Method; 8] = [
        Method::SpanName,
        Method::Kind,
        Method::TraceId,
        Method::SpanId,
        Method::ParentSpanId,
        Method::TraceState,
        Method::StatusCode,
        Method::StatusMessage,
    ];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Method::SpanName => "span_name",
            Method::Kind => "kind",
            Method::TraceId => "trace_id",
            Method::SpanId => "span_id",
            Method::ParentSpanId => "parent_span_id",
            Method::TraceState => "trace_state",
            Method::StatusCode => "status.code",
            Method::StatusMessage => "status.message",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Value of the field on `span`. Kind and status code render numerically.
    #[must_use]
    pub fn extract(&self, span: &Span) -> Option<String> {
        match self {
            Method::SpanName => non_empty(&span.name),
            Method::Kind => Some(span.kind.to_string()),
            Method::TraceId => (!span.trace_id.is_empty()).then(|| hex(&span.trace_id)),
            Method::SpanId => (!span.span_id.is_empty()).then(|| hex(&span.span_id)),
            Method::ParentSpanId => {
                (!span.parent_span_id.is_empty()).then(|| hex(&span.parent_span_id))
            }
            Method::TraceState => non_empty(&span.trace_state),
            Method::StatusCode => Some(span.status.as_ref().map_or(0, |s| s.code).to_string()),
            Method::StatusMessage => span.status.as_ref().and_then(|s| non_empty(&s.message)),
        }
    }
}
