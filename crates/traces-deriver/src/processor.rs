// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The `traces_deriver` processor.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{error, info};

use crate::config::Config;
use crate::define::{PublishFn, Record, RecordData, RecordType};
use crate::errors::{ConfigError, ProcessError};
use crate::operator::Operator;

pub const PROCESSOR_NAME: &str = "traces_deriver";

/// A stage of the record pipeline.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the processor produces derived records.
    fn is_derived(&self) -> bool;

    fn is_pre_check(&self) -> bool {
        false
    }

    /// Processes `record` in place. A returned record is derived data to be
    /// re-injected into the pipeline.
    ///
    /// # Errors
    ///
    /// Fails when the record payload does not match its declared type.
    fn process(&self, record: &mut Record) -> Result<Option<Record>, ProcessError>;

    /// Applies a new configuration.
    async fn reload(&self, config: serde_json::Value) -> Result<(), ConfigError>;

    /// Releases background resources.
    async fn clean(&self);
}

pub struct TracesDeriver {
    name: String,
    publish: Option<PublishFn>,
    main_config: RwLock<serde_json::Value>,
    operator: RwLock<Arc<Operator>>,
}

impl TracesDeriver {
    /// # Errors
    ///
    /// Fails on invalid configurations and outside of a tokio runtime.
    pub fn new(
        name: &str,
        config: serde_json::Value,
        publish: Option<PublishFn>,
    ) -> Result<Self, ConfigError> {
        let operator = Operator::new(name, &Config::from_value(config.clone())?, publish.clone())?;
        Ok(Self {
            name: name.to_string(),
            publish,
            main_config: RwLock::new(config),
            operator: RwLock::new(Arc::new(operator)),
        })
    }

    #[must_use]
    pub fn main_config(&self) -> serde_json::Value {
        self.main_config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn operator(&self) -> Arc<Operator> {
        Arc::clone(&self.operator.read().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl Processor for TracesDeriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_derived(&self) -> bool {
        true
    }

    fn process(&self, record: &mut Record) -> Result<Option<Record>, ProcessError> {
        if record.record_type != RecordType::Traces {
            return Ok(None);
        }
        if !matches!(record.data, RecordData::Traces(_)) {
            return Err(ProcessError::MismatchedData {
                expected: RecordType::Traces.as_str(),
                actual: record.data.kind(),
            });
        }
        Ok(self.operator().operate(record))
    }

    async fn reload(&self, config: serde_json::Value) -> Result<(), ConfigError> {
        let operator = Config::from_value(config.clone())
            .and_then(|c| Operator::new(&self.name, &c, self.publish.clone()));
        let operator = match operator {
            Ok(operator) => Arc::new(operator),
            Err(e) => {
                error!("Failed to reload processor {}: {e}", self.name);
                return Err(e);
            }
        };

        let old = std::mem::replace(
            &mut *self.operator.write().unwrap_or_else(PoisonError::into_inner),
            operator,
        );
        *self
            .main_config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
        old.clean().await;
        info!("Processor {} reloaded", self.name);
        Ok(())
    }

    async fn clean(&self) {
        self.operator().clean().await;
    }
}
