// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Derives aggregated metric series from trace spans.
//!
//! Spans flow through the [`processor::TracesDeriver`] processor. For every
//! configured operation, the [`matcher`] picks the rule that applies to a span
//! and extracts its dimensions; the [`operator`] then routes the span duration
//! either into the [`accumulator`] (aggregated statistic series published on a
//! timer) or through the [`serieslimiter`] into a raw metric batch returned
//! alongside the input record.
//!
//! Both paths are bounded: every metric stream (a destination data id) caps the
//! number of distinct dimension sets it tracks, and stale series are garbage
//! collected in the background.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod accumulator;
pub mod config;
pub mod define;
pub mod errors;
pub mod extractor;
pub mod generator;
pub mod labels;
pub mod labelstore;
pub mod matcher;
pub mod monitor;
pub mod operator;
pub mod otel;
pub mod processor;
pub mod serieslimiter;
mod util;
