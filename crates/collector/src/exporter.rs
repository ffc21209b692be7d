// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::debug;
use traces_deriver::define::{Record, RecordData, RecordType};
use traces_deriver::otel;

/// Terminal stage of the pipeline. Logs every record and keeps a running
/// item count per record type.
#[derive(Default)]
pub struct LogExporter {
    exported: Mutex<HashMap<RecordType, u64>>,
}

fn item_count(data: &RecordData) -> usize {
    match data {
        RecordData::Traces(batches) => otel::span_count(batches),
        RecordData::Metrics(batches) => batches
            .iter()
            .flat_map(|rm| &rm.scope_metrics)
            .map(|sm| sm.metrics.len())
            .sum(),
        RecordData::Logs(batches) => batches
            .iter()
            .flat_map(|rl| &rl.scope_logs)
            .map(|sl| sl.log_records.len())
            .sum(),
        RecordData::MetricV2(samples) => samples.len(),
    }
}

impl LogExporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(&self, record: &Record) {
        let items = item_count(&record.data);
        debug!(
            "Exporting {items} {} items to data id {} ({})",
            record.record_type,
            record.token.data_id(record.record_type),
            record.request_type
        );
        *self
            .exported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(record.record_type)
            .or_default() += items as u64;
    }

    #[must_use]
    pub fn exported(&self, record_type: RecordType) -> u64 {
        self.exported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&record_type)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use traces_deriver::define::{MetricV2, RequestType, Token};

    #[test]
    fn test_counts_items_per_type() {
        let exporter = LogExporter::new();
        let sample = MetricV2 {
            metrics: HashMap::from([("bk_apm_count".to_string(), 1.0)]),
            timestamp: 0,
            dimension: HashMap::new(),
        };
        let record = Record {
            record_type: RecordType::MetricV2,
            request_type: RequestType::Derived,
            token: Token::default(),
            data: RecordData::MetricV2(vec![sample.clone(), sample]),
        };
        exporter.export(&record);
        exporter.export(&record);
        assert_eq!(exporter.exported(RecordType::MetricV2), 4);
        assert_eq!(exporter.exported(RecordType::Traces), 0);
    }
}
