// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types. Only construction and configuration surface rich errors; the
//! per-span path reports admission failures through booleans.

/// Failure to build a component that owns background tasks.
#[derive(Debug, thiserror::Error)]
pub enum Creation {
    #[error("{component} must be created from within a tokio runtime")]
    NoRuntime { component: &'static str },
}

/// Malformed processor configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to decode config: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("operation {index} has an empty metric_name")]
    EmptyMetricName { index: usize },

    #[error("operation {index} has a non-finite bucket boundary: {value}")]
    InvalidBucket { index: usize, value: f64 },

    #[error("only one accumulated operation is allowed, found {first} and {second}")]
    DuplicateAccumulator { first: String, second: String },

    #[error("only one duration operation is allowed")]
    DuplicateExtractor,

    #[error("unknown field reference '{0}'")]
    UnknownField(String),

    #[error("unknown span kind '{0}'")]
    UnknownSpanKind(String),

    #[error(transparent)]
    Creation(#[from] Creation),
}

/// Failure while processing a record.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("record type {expected} carries {actual} data")]
    MismatchedData {
        expected: &'static str,
        actual: &'static str,
    },
}
