// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector configuration.
//!
//! Values are layered: built-in defaults, then the YAML file, then
//! `COLLECTOR_*` environment variables (nested keys separated by `__`, e.g.
//! `COLLECTOR_TOKEN__APP_NAME`).
//!
//! ```yaml
//! log_level: debug
//! queue_capacity: 1000
//! token:
//!   metrics_data_id: 1001
//!   traces_data_id: 1002
//!   app_name: shop
//! processors:
//!   - name: traces_deriver/duration
//!     config:
//!       operations:
//!         - type: duration
//!           metric_name: bk_apm_duration
//!           rules:
//!             - kind: SPAN_KIND_CLIENT
//!               predicate_key: attributes.http.method
//!               dimensions: [span_name, attributes.http.uri]
//! generator:
//!   interval: 5s
//!   span_count: 10
//!   span_kind: SPAN_KIND_CLIENT
//!   attributes:
//!     http.method: GET
//!   random_attributes: [http.uri]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use traces_deriver::define::Token;

pub const CONFIG_PATH_ENV: &str = "COLLECTOR_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "collector.yaml";
const ENV_PREFIX: &str = "COLLECTOR_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub log_level: String,
    pub queue_capacity: usize,
    pub token: TokenConfig,
    pub processors: Vec<ProcessorConfig>,
    pub generator: Option<GeneratorConfig>,
    /// Period of the self telemetry dump, disabled when unset.
    #[serde(with = "humantime_serde")]
    pub telemetry_interval: Option<Duration>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            queue_capacity: 1000,
            token: TokenConfig::default(),
            processors: Vec::new(),
            generator: None,
            telemetry_interval: None,
        }
    }
}

/// Destination of the records fed by the generator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub metrics_data_id: i32,
    pub traces_data_id: i32,
    pub logs_data_id: i32,
    pub biz_id: i32,
    pub app_name: String,
}

impl From<&TokenConfig> for Token {
    fn from(t: &TokenConfig) -> Self {
        Token {
            original: String::new(),
            metrics_data_id: t.metrics_data_id,
            traces_data_id: t.traces_data_id,
            logs_data_id: t.logs_data_id,
            biz_id: t.biz_id,
            app_name: t.app_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// `<kind>` or `<kind>/<instance>`.
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ProcessorConfig {
    #[must_use]
    pub fn kind(&self) -> &str {
        self.name.split('/').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub span_count: usize,
    pub span_kind: String,
    pub span_name: String,
    pub attributes: HashMap<String, String>,
    pub resources: HashMap<String, String>,
    pub random_attributes: Vec<String>,
    pub random_resources: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            span_count: 1,
            span_kind: "SPAN_KIND_INTERNAL".to_string(),
            span_name: "generated".to_string(),
            attributes: HashMap::new(),
            resources: HashMap::new(),
            random_attributes: Vec::new(),
            random_resources: Vec::new(),
        }
    }
}

/// Loads the configuration at `path`. A missing file leaves the defaults and
/// environment overrides in place.
///
/// # Errors
///
/// Returns the figment error for malformed files or values.
pub fn load(path: &Path) -> Result<CollectorConfig, figment::Error> {
    Figment::from(Serialized::defaults(CollectorConfig::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]).split("__"))
        .extract()
}
