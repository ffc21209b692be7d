// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rule configuration of the traces deriver.
//!
//! Each operation names a derivation (`type`), the metric it produces and the
//! rules selecting which spans feed it and which dimensions they carry:
//!
//! ```yaml
//! operations:
//!   - type: duration
//!     metric_name: bk_apm_duration
//!     max_series: 10000
//!     gc_interval: 1h
//!     rules:
//!       - kind: SPAN_KIND_CLIENT
//!         predicate_key: attributes.http.method
//!         dimensions:
//!           - kind
//!           - span_name
//!           - attributes.http.uri
//!           - resource.service.name
//!   - type: bucket
//!     metric_name: bk_apm_duration_bucket
//!     publish_interval: 1m
//!     buckets: [0.01, 0.05, 0.1, 0.5, 1, 2, 5]
//!     rules:
//!       - kind: ""
//!         dimensions: [span_name, resource.service.name]
//! ```
//!
//! [`ConfigHandler`] turns the document into lookup tables so the per-span path
//! never parses field references.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::accumulator::{self, StatKind};
use crate::errors::ConfigError;
use crate::otel::{self, Method};

pub const DEFAULT_EXTRACTOR_MAX_SERIES: usize = 100_000;
pub const DEFAULT_EXTRACTOR_GC_INTERVAL: Duration = Duration::from_secs(60 * 60);

const RESOURCE_PREFIX: &str = "resource.";
const ATTRIBUTES_PREFIX: &str = "attributes.";

/// Golden-signal operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Duration,
    Count,
    Min,
    Max,
    Delta,
    DeltaDuration,
    Sum,
    Bucket,
}

impl OperationType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duration => "duration",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Delta => "delta",
            Self::DeltaDuration => "delta_duration",
            Self::Sum => "sum",
            Self::Bucket => "bucket",
        }
    }

    /// Statistic published by the accumulator, `None` for the raw extractor.
    #[must_use]
    pub fn stat_kind(&self) -> Option<StatKind> {
        match self {
            Self::Duration => None,
            Self::Count => Some(StatKind::Count),
            Self::Min => Some(StatKind::Min),
            Self::Max => Some(StatKind::Max),
            Self::Delta => Some(StatKind::Delta),
            Self::DeltaDuration => Some(StatKind::DeltaDuration),
            Self::Sum => Some(StatKind::Sum),
            Self::Bucket => Some(StatKind::Bucket),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub operations: Vec<OperationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationConfig {
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    pub metric_name: String,
    #[serde(default)]
    pub max_series: usize,
    #[serde(default, with = "humantime_serde")]
    pub gc_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub publish_interval: Option<Duration>,
    #[serde(default)]
    pub buckets: Vec<f64>,
    #[serde(default)]
    pub max_series_growth_rate: usize,
    #[serde(default)]
    pub align_publish: Option<bool>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub predicate_key: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
}

impl Config {
    /// Decodes a processor configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Decode`] for documents not matching the schema.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Reference to a span or resource field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldRef {
    Resource(String),
    Attribute(String),
    Method(Method),
}

impl FieldRef {
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownField`] for references that name neither a
    /// prefixed attribute nor a known span field.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        if let Some(key) = s.strip_prefix(RESOURCE_PREFIX).filter(|k| !k.is_empty()) {
            return Ok(Self::Resource(key.to_string()));
        }
        if let Some(key) = s.strip_prefix(ATTRIBUTES_PREFIX).filter(|k| !k.is_empty()) {
            return Ok(Self::Attribute(key.to_string()));
        }
        Method::parse(s)
            .map(Self::Method)
            .ok_or_else(|| ConfigError::UnknownField(s.to_string()))
    }
}

/// Dimensions extracted from a span once a rule is selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub attributes: Vec<String>,
    pub methods: Vec<Method>,
}

impl Extraction {
    fn add(&mut self, field: &FieldRef) {
        match field {
            FieldRef::Attribute(key) if !self.attributes.contains(key) => {
                self.attributes.push(key.clone());
            }
            FieldRef::Method(m) if !self.methods.contains(m) => self.methods.push(*m),
            _ => {}
        }
    }
}

/// Rules of one (operation type, span kind) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindRules {
    /// Explicit predicate keys, in rule order.
    pub predicates: Vec<(FieldRef, Extraction)>,
    /// Rule without predicate key.
    pub default: Option<Extraction>,
}

/// Settings of the limiter-gated raw duration extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorConfig {
    pub metric_name: String,
    pub max_series: usize,
    pub gc_interval: Duration,
}

/// Precomputed lookup tables of a [`Config`].
#[derive(Debug, Default)]
pub struct ConfigHandler {
    types: Vec<OperationType>,
    rules: HashMap<OperationType, HashMap<String, KindRules>>,
    resource_keys: HashMap<OperationType, Vec<String>>,
    accumulator: Option<accumulator::Config>,
    extractor: Option<ExtractorConfig>,
}

impl ConfigHandler {
    /// # Errors
    ///
    /// Fails on the first invalid operation: empty metric name, non-finite
    /// bucket, second accumulated or duration operation, unknown field
    /// reference or span kind.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let mut handler = Self::default();
        let mut accumulated: Option<OperationType> = None;

        for (index, op) in config.operations.iter().enumerate() {
            if op.metric_name.is_empty() {
                return Err(ConfigError::EmptyMetricName { index });
            }
            if let Some(value) = op.buckets.iter().copied().find(|b| !b.is_finite()) {
                return Err(ConfigError::InvalidBucket { index, value });
            }

            match op.operation_type.stat_kind() {
                Some(kind) => {
                    if let Some(first) = accumulated {
                        return Err(ConfigError::DuplicateAccumulator {
                            first: first.as_str().to_string(),
                            second: op.operation_type.as_str().to_string(),
                        });
                    }
                    accumulated = Some(op.operation_type);
                    handler.accumulator = Some(accumulator::Config {
                        metric_name: op.metric_name.clone(),
                        max_series: op.max_series,
                        gc_interval: op.gc_interval.unwrap_or_default(),
                        publish_interval: op.publish_interval.unwrap_or_default(),
                        buckets: op.buckets.clone(),
                        kind,
                        max_series_growth_rate: op.max_series_growth_rate,
                        align_publish: op.align_publish.unwrap_or(true),
                    });
                }
                None => {
                    if handler.extractor.is_some() {
                        return Err(ConfigError::DuplicateExtractor);
                    }
                    handler.extractor = Some(ExtractorConfig {
                        metric_name: op.metric_name.clone(),
                        max_series: if op.max_series == 0 {
                            DEFAULT_EXTRACTOR_MAX_SERIES
                        } else {
                            op.max_series
                        },
                        gc_interval: op
                            .gc_interval
                            .filter(|d| !d.is_zero())
                            .unwrap_or(DEFAULT_EXTRACTOR_GC_INTERVAL),
                    });
                }
            }

            handler.add_rules(op)?;
            handler.types.push(op.operation_type);
        }
        Ok(handler)
    }

    fn add_rules(&mut self, op: &OperationConfig) -> Result<(), ConfigError> {
        let by_kind = self.rules.entry(op.operation_type).or_default();
        let resource_keys = self.resource_keys.entry(op.operation_type).or_default();

        for rule in &op.rules {
            let kind = if rule.kind.is_empty() {
                String::new()
            } else {
                otel::parse_span_kind(&rule.kind)
                    .ok_or_else(|| ConfigError::UnknownSpanKind(rule.kind.clone()))?
                    .as_str_name()
                    .to_string()
            };

            let mut extraction = Extraction::default();
            for dim in &rule.dimensions {
                let field = FieldRef::parse(dim)?;
                if let FieldRef::Resource(key) = &field {
                    if !resource_keys.contains(key) {
                        resource_keys.push(key.clone());
                    }
                }
                extraction.add(&field);
            }

            let kind_rules = by_kind.entry(kind).or_default();
            if rule.predicate_key.is_empty() {
                let default = kind_rules.default.get_or_insert_with(Extraction::default);
                merge(default, extraction);
                continue;
            }

            let predicate = FieldRef::parse(&rule.predicate_key)?;
            match kind_rules.predicates.iter_mut().find(|(p, _)| *p == predicate) {
                Some((_, existing)) => merge(existing, extraction),
                None => kind_rules.predicates.push((predicate, extraction)),
            }
        }
        Ok(())
    }

    /// Operation types in configuration order.
    #[must_use]
    pub fn types(&self) -> &[OperationType] {
        &self.types
    }

    /// Rules applying to spans of `kind` (protobuf name) for `op`. Kinds
    /// without explicit rules fall back to the wildcard rules.
    #[must_use]
    pub fn kind_rules(&self, op: OperationType, kind: &str) -> Option<&KindRules> {
        let by_kind = self.rules.get(&op)?;
        by_kind.get(kind).or_else(|| by_kind.get(""))
    }

    /// Resource attribute keys extracted for `op`.
    #[must_use]
    pub fn resource_keys(&self, op: OperationType) -> &[String] {
        self.resource_keys.get(&op).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn accumulator_config(&self) -> Option<&accumulator::Config> {
        self.accumulator.as_ref()
    }

    #[must_use]
    pub fn extractor_config(&self) -> Option<&ExtractorConfig> {
        self.extractor.as_ref()
    }
}

fn merge(into: &mut Extraction, from: Extraction) {
    for key in from.attributes {
        into.add(&FieldRef::Attribute(key));
    }
    for m in from.methods {
        into.add(&FieldRef::Method(m));
    }
}
