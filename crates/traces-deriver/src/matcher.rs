// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use opentelemetry_proto::tonic::common::v1::KeyValue;
use opentelemetry_proto::tonic::trace::v1::Span;

use crate::config::{ConfigHandler, Extraction, FieldRef, OperationType};
use crate::labels::Dimensions;
use crate::otel;

/// Selects the rule applying to a span and extracts its dimensions.
#[derive(Debug)]
pub struct DimensionMatcher {
    handler: ConfigHandler,
}

impl DimensionMatcher {
    #[must_use]
    pub fn new(handler: ConfigHandler) -> Self {
        Self { handler }
    }

    #[must_use]
    pub fn handler(&self) -> &ConfigHandler {
        &self.handler
    }

    /// Dimensions of `span` for operation `op`.
    ///
    /// The predicate keys configured for the span kind are tried in order and
    /// the first one resolving to a value selects its rule. Without such a key
    /// the kind's default rule applies. `None` when no rule applies.
    #[must_use]
    pub fn match_span(
        &self,
        op: OperationType,
        resource: &[KeyValue],
        span: &Span,
    ) -> Option<Dimensions> {
        let rules = self
            .handler
            .kind_rules(op, otel::span_kind_name(span.kind))?;

        let extraction = rules
            .predicates
            .iter()
            .find(|(key, _)| resolve(key, resource, span).is_some())
            .map(|(_, extraction)| extraction)
            .or(rules.default.as_ref())?;
        Some(extract(extraction, span))
    }

    /// Resource level dimensions of operation `op`.
    #[must_use]
    pub fn match_resource(&self, op: OperationType, resource: &[KeyValue]) -> Dimensions {
        self.handler
            .resource_keys(op)
            .iter()
            .filter_map(|key| otel::attribute(resource, key).map(|v| (key.clone(), v)))
            .collect()
    }
}

fn resolve(field: &FieldRef, resource: &[KeyValue], span: &Span) -> Option<String> {
    match field {
        FieldRef::Resource(key) => otel::attribute(resource, key),
        FieldRef::Attribute(key) => otel::attribute(&span.attributes, key),
        FieldRef::Method(m) => m.extract(span),
    }
}

fn extract(extraction: &Extraction, span: &Span) -> Dimensions {
    let mut dims = Dimensions::with_capacity(extraction.attributes.len() + extraction.methods.len());
    for key in &extraction.attributes {
        if let Some(v) = otel::attribute(&span.attributes, key) {
            dims.insert(key.clone(), v);
        }
    }
    for m in &extraction.methods {
        if let Some(v) = m.extract(span) {
            dims.insert(m.name().to_string(), v);
        }
    }
    dims
}
