// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod exporter;
mod logger;
mod pipeline;

use std::{env, path::PathBuf, sync::Arc};

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use traces_deriver::{
    define::{Record, RecordData, RecordQueue, RecordType, RequestType, Token},
    generator::{TracesGenerator, TracesOptions},
    monitor, otel,
    processor::{Processor, TracesDeriver, PROCESSOR_NAME},
};

use crate::config::{CollectorConfig, GeneratorConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use crate::pipeline::Pipeline;

fn init_logger(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .event_format(logger::Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn build_processors(config: &CollectorConfig, queue: &RecordQueue) -> Vec<Arc<dyn Processor>> {
    let mut processors: Vec<Arc<dyn Processor>> = Vec::new();
    for p in &config.processors {
        if p.kind() != PROCESSOR_NAME {
            warn!("Unknown processor {}, skipping", p.name);
            continue;
        }
        match TracesDeriver::new(&p.name, p.config.clone(), Some(queue.publisher())) {
            Ok(deriver) => {
                info!("Processor {} started", p.name);
                processors.push(Arc::new(deriver));
            }
            Err(e) => error!("Failed to create processor {}: {e}", p.name),
        }
    }
    processors
}

/// Pushes a synthetic traces record into the queue every generator interval.
async fn feed(
    generator: GeneratorConfig,
    token: Token,
    queue: RecordQueue,
    cancel: CancellationToken,
) {
    let Some(span_kind) = otel::parse_span_kind(&generator.span_kind) else {
        error!("Unknown generator span kind {}", generator.span_kind);
        return;
    };
    let traces = TracesGenerator::new(TracesOptions {
        span_count: generator.span_count,
        span_kind,
        span_name: generator.span_name,
        attributes: generator.attributes,
        resources: generator.resources,
        random_attributes: generator.random_attributes,
        random_resources: generator.random_resources,
        ..Default::default()
    });

    let mut ticker = interval_at(Instant::now(), generator.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                queue.push(Record {
                    record_type: RecordType::Traces,
                    request_type: RequestType::Grpc,
                    token: token.clone(),
                    data: RecordData::Traces(traces.generate()),
                });
            }
        }
    }
}

async fn dump_telemetry(period: std::time::Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => info!("Self telemetry:\n{}", monitor::encode_text()),
        }
    }
}

#[tokio::main]
pub async fn main() {
    let path = env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let loaded = config::load(&path);
    init_logger(loaded.as_ref().map_or("info", |c| c.log_level.as_str()));

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration from {}: {e}", path.display());
            return;
        }
    };
    debug!("Loaded configuration from {}", path.display());

    let (queue, mut rx) = RecordQueue::new(config.queue_capacity);
    let processors = build_processors(&config, &queue);
    if processors.is_empty() {
        warn!("No processor configured, records are exported untouched");
    }
    let pipeline = Pipeline::new(processors, queue.clone());

    let cancel = CancellationToken::new();
    if let Some(generator) = config.generator.clone() {
        tokio::spawn(feed(
            generator,
            Token::from(&config.token),
            queue.clone(),
            cancel.child_token(),
        ));
    }
    if let Some(period) = config.telemetry_interval {
        tokio::spawn(dump_telemetry(period, cancel.child_token()));
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
        }
        info!("Shutting down collector");
        shutdown.cancel();
    });

    info!("Collector started");
    pipeline.run(&mut rx, cancel).await;
    pipeline.clean().await;
    debug!("Self telemetry at shutdown:\n{}", monitor::encode_text());
}
