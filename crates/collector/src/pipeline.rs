// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record pipeline.
//!
//! Every record runs through the configured processors in order and then
//! reaches the exporter. Records a processor derives are pushed onto the
//! [`RecordQueue`] and come back through [`Pipeline::run`] as
//! [`RequestType::Derived`] records, which skip the deriving processors.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn};
use traces_deriver::define::{Record, RecordQueue, RequestType};
use traces_deriver::processor::Processor;

use crate::exporter::LogExporter;

pub struct Pipeline {
    processors: Vec<Arc<dyn Processor>>,
    queue: RecordQueue,
    exporter: LogExporter,
}

impl Pipeline {
    #[must_use]
    pub fn new(processors: Vec<Arc<dyn Processor>>, queue: RecordQueue) -> Self {
        Self {
            processors,
            queue,
            exporter: LogExporter::new(),
        }
    }

    #[must_use]
    pub fn exporter(&self) -> &LogExporter {
        &self.exporter
    }

    pub fn handle(&self, mut record: Record) {
        let derived = record.request_type == RequestType::Derived;
        record.unwrap_derived();

        for processor in &self.processors {
            if derived && processor.is_derived() {
                continue;
            }
            let span = info_span!("processor", processor = %processor.name());
            let _entered = span.enter();
            match processor.process(&mut record) {
                Ok(Some(output)) => self.queue.push(output),
                Ok(None) => {}
                Err(e) => {
                    warn!("Processor failed on {} record: {e}", record.record_type);
                    return;
                }
            }
        }
        self.exporter.export(&record);
    }

    /// Handles queued records until `cancel` fires or every sender is gone.
    /// Records still queued at cancellation are drained first.
    pub async fn run(&self, rx: &mut mpsc::Receiver<Record>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                record = rx.recv() => match record {
                    Some(record) => self.handle(record),
                    None => {
                        debug!("Record queue closed, stopping pipeline");
                        return;
                    }
                },
            }
        }
        while let Ok(record) = rx.try_recv() {
            self.handle(record);
        }
        debug!("Pipeline stopped");
    }

    pub async fn clean(&self) {
        for processor in &self.processors {
            processor.clean().await;
        }
    }
}
