// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Records exchanged between processors.
//!
//! A [`Record`] carries one batch of telemetry together with the token that
//! identifies its destination data ids. Processors that derive new data (for
//! example metric series computed from spans) produce records tagged with
//! [`RequestType::Derived`] which are pushed back into the pipeline through a
//! [`RecordQueue`] instead of being returned to the original caller.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use opentelemetry_proto::tonic::logs::v1::ResourceLogs;
use opentelemetry_proto::tonic::metrics::v1::ResourceMetrics;
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::monitor;

/// Namespace of the collector's own metrics.
pub const MONITORING_NAMESPACE: &str = "telemetry_collector";

pub type PublishFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Sink receiving records produced outside of the request path. The returned
/// future completes once the sink accepted the record, so a slow sink delays
/// the next publication instead of losing it.
pub type PublishFn = Arc<dyn Fn(Record) -> PublishFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum RecordType {
    #[display("undefined")]
    Undefined,
    #[display("traces")]
    Traces,
    #[display("metrics")]
    Metrics,
    #[display("logs")]
    Logs,
    #[display("traces.derived")]
    TracesDerived,
    #[display("metrics.derived")]
    MetricsDerived,
    #[display("logs.derived")]
    LogsDerived,
    #[display("metricv2")]
    MetricV2,
}

impl RecordType {
    const DERIVED_SUFFIX: &'static str = ".derived";

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Traces => "traces",
            Self::Metrics => "metrics",
            Self::Logs => "logs",
            Self::TracesDerived => "traces.derived",
            Self::MetricsDerived => "metrics.derived",
            Self::LogsDerived => "logs.derived",
            Self::MetricV2 => "metricv2",
        }
    }

    /// Parses a record type name and reports whether it names a derived type.
    /// Unknown names map to [`RecordType::Undefined`].
    #[must_use]
    pub fn parse(s: &str) -> (Self, bool) {
        let rtype = match s {
            "traces" => Self::Traces,
            "metrics" => Self::Metrics,
            "logs" => Self::Logs,
            "traces.derived" => Self::TracesDerived,
            "metrics.derived" => Self::MetricsDerived,
            "logs.derived" => Self::LogsDerived,
            "metricv2" => Self::MetricV2,
            _ => Self::Undefined,
        };
        (rtype, s.ends_with(Self::DERIVED_SUFFIX))
    }

    #[must_use]
    pub fn is_derived(&self) -> bool {
        matches!(
            self,
            Self::TracesDerived | Self::MetricsDerived | Self::LogsDerived
        )
    }
}

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum RequestType {
    #[display("http")]
    Http,
    #[display("grpc")]
    Grpc,
    #[display("derived")]
    Derived,
}

/// Destination identifiers resolved for a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Token {
    pub original: String,
    pub metrics_data_id: i32,
    pub traces_data_id: i32,
    pub logs_data_id: i32,
    pub biz_id: i32,
    pub app_name: String,
}

impl Token {
    #[must_use]
    pub fn biz_app(&self) -> String {
        format!("{}-{}", self.biz_id, self.app_name)
    }

    /// Data id a record of the given type is routed to, `-1` when the type has
    /// no destination.
    #[must_use]
    pub fn data_id(&self, rtype: RecordType) -> i32 {
        match rtype {
            RecordType::Traces | RecordType::TracesDerived => self.traces_data_id,
            RecordType::Metrics | RecordType::MetricsDerived | RecordType::MetricV2 => {
                self.metrics_data_id
            }
            RecordType::Logs | RecordType::LogsDerived => self.logs_data_id,
            RecordType::Undefined => -1,
        }
    }
}

/// Flat metric sample: several named values sharing one timestamp (ms) and
/// one dimension set.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricV2 {
    pub metrics: HashMap<String, f64>,
    pub timestamp: i64,
    pub dimension: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordData {
    Traces(Vec<ResourceSpans>),
    Metrics(Vec<ResourceMetrics>),
    Logs(Vec<ResourceLogs>),
    MetricV2(Vec<MetricV2>),
}

impl RecordData {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Traces(_) => "traces",
            Self::Metrics(_) => "metrics",
            Self::Logs(_) => "logs",
            Self::MetricV2(_) => "metricv2",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub record_type: RecordType,
    pub request_type: RequestType,
    pub token: Token,
    pub data: RecordData,
}

impl Record {
    /// Maps a derived record type back onto its base type so the record can be
    /// handled by the base pipeline.
    pub fn unwrap_derived(&mut self) {
        self.record_type = match self.record_type {
            RecordType::TracesDerived => RecordType::Traces,
            RecordType::MetricsDerived => RecordType::Metrics,
            RecordType::LogsDerived => RecordType::Logs,
            other => other,
        };
    }
}

/// Bounded queue used to push records back into the pipeline.
///
/// [`RecordQueue::push`] is for the request path and never waits: a full
/// queue drops the record. [`RecordQueue::publisher`] is for background
/// publication and waits for room instead, since accumulated windows are
/// reset once published and cannot be produced again.
#[derive(Clone)]
pub struct RecordQueue {
    tx: mpsc::Sender<Record>,
}

impl RecordQueue {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn push(&self, record: Record) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                monitor::inc_queue_dropped(record.record_type);
                warn!(
                    "Record queue full, dropping {} record for data id {}",
                    record.record_type,
                    record.token.data_id(record.record_type)
                );
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                debug!(
                    "Record queue closed, discarding {} record",
                    record.record_type
                );
            }
        }
    }

    /// Wraps the queue into a [`PublishFn`] waiting for queue capacity.
    #[must_use]
    pub fn publisher(&self) -> PublishFn {
        let tx = self.tx.clone();
        Arc::new(move |record: Record| -> PublishFuture {
            let tx = tx.clone();
            Box::pin(async move {
                if let Err(mpsc::error::SendError(record)) = tx.send(record).await {
                    debug!(
                        "Record queue closed, discarding {} record",
                        record.record_type
                    );
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn metricv2_record(record_type: RecordType) -> Record {
        Record {
            record_type,
            request_type: RequestType::Derived,
            token: Token {
                metrics_data_id: 1001,
                ..Default::default()
            },
            data: RecordData::MetricV2(vec![]),
        }
    }

    #[test]
    fn test_parse_record_type() {
        assert_eq!(RecordType::parse("traces"), (RecordType::Traces, false));
        assert_eq!(
            RecordType::parse("metrics.derived"),
            (RecordType::MetricsDerived, true)
        );
        assert_eq!(RecordType::parse("nope"), (RecordType::Undefined, false));
        assert_eq!(
            RecordType::parse("profiles.derived"),
            (RecordType::Undefined, true)
        );
    }

    #[test]
    fn test_record_type_display_matches_as_str() {
        for rtype in [
            RecordType::Undefined,
            RecordType::Traces,
            RecordType::Metrics,
            RecordType::Logs,
            RecordType::TracesDerived,
            RecordType::MetricsDerived,
            RecordType::LogsDerived,
            RecordType::MetricV2,
        ] {
            assert_eq!(rtype.to_string(), rtype.as_str());
            assert_eq!(RecordType::parse(rtype.as_str()).0, rtype);
        }
    }

    #[test]
    fn test_unwrap_derived() {
        let mut record = metricv2_record(RecordType::TracesDerived);
        record.unwrap_derived();
        assert_eq!(record.record_type, RecordType::Traces);

        let mut record = metricv2_record(RecordType::MetricV2);
        record.unwrap_derived();
        assert_eq!(record.record_type, RecordType::MetricV2);
    }

    #[test]
    fn test_token_data_id() {
        let token = Token {
            metrics_data_id: 1,
            traces_data_id: 2,
            logs_data_id: 3,
            biz_id: 2,
            app_name: "demo".to_string(),
            ..Default::default()
        };
        assert_eq!(token.data_id(RecordType::MetricsDerived), 1);
        assert_eq!(token.data_id(RecordType::MetricV2), 1);
        assert_eq!(token.data_id(RecordType::Traces), 2);
        assert_eq!(token.data_id(RecordType::LogsDerived), 3);
        assert_eq!(token.data_id(RecordType::Undefined), -1);
        assert_eq!(token.biz_app(), "2-demo");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_queue_drops_when_full() {
        let (queue, mut rx) = RecordQueue::new(1);
        queue.push(metricv2_record(RecordType::MetricV2));
        queue.push(metricv2_record(RecordType::MetricV2));

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
        assert!(logs_contain("Record queue full, dropping metricv2 record for data id 1001"));
    }

    #[tokio::test]
    async fn test_publisher_waits_for_capacity() {
        let (queue, mut rx) = RecordQueue::new(1);
        let publish = queue.publisher();
        publish(metricv2_record(RecordType::MetricV2)).await;

        let pending = tokio::spawn(publish(metricv2_record(RecordType::MetricsDerived)));
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert_eq!(rx.recv().await.unwrap().record_type, RecordType::MetricV2);
        pending.await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().record_type,
            RecordType::MetricsDerived
        );
    }

    #[tokio::test]
    async fn test_publisher_discards_when_closed() {
        let (queue, rx) = RecordQueue::new(1);
        drop(rx);
        queue.publisher()(metricv2_record(RecordType::MetricV2)).await;
    }
}
