// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::StatKind;
use crate::define::{MetricV2, Record, RecordData, RecordType, RequestType, Token};
use crate::labels::{hash_from_map, Dimensions};
use crate::labelstore::Storage;
use crate::monitor;
use crate::util::{duration_millis, now_millis};

/// Samples per published record.
pub const PUBLISH_BATCH_SIZE: usize = 5000;

const UPDATE_METRICS_INTERVAL: Duration = Duration::from_secs(5);

const NANOS_PER_SECOND: f64 = 1e9;

/// Running statistics of one series.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Stats {
    pub(crate) prev: f64,
    pub(crate) curr: f64,
    pub(crate) min: f64,
    pub(crate) max: f64,
    pub(crate) curr_sum: f64,
    pub(crate) prev_sum: f64,
    pub(crate) buckets: Vec<u64>,
    pub(crate) updated_ms: i64,
}

impl Stats {
    fn new(buckets: usize) -> Self {
        Self {
            prev: 0.0,
            curr: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            curr_sum: 0.0,
            prev_sum: 0.0,
            buckets: vec![0; buckets],
            updated_ms: 0,
        }
    }
}

/// Output of one statistic kind for one series.
#[derive(Debug, PartialEq)]
pub(crate) enum Snapshot {
    Value(f64),
    Buckets(Vec<u64>),
    Empty,
}

impl StatKind {
    /// Reads the statistic out of `stats`. Min, Max, Delta and DeltaDuration
    /// reset their window; Count, Sum and Bucket leave the state untouched.
    pub(crate) fn snapshot(self, stats: &mut Stats) -> Snapshot {
        let value = match self {
            Self::Min => {
                if stats.min == f64::INFINITY {
                    return Snapshot::Empty;
                }
                std::mem::replace(&mut stats.min, f64::INFINITY)
            }
            Self::Max => {
                if stats.max == f64::NEG_INFINITY {
                    return Snapshot::Empty;
                }
                std::mem::replace(&mut stats.max, f64::NEG_INFINITY)
            }
            Self::Delta => {
                let delta = stats.curr - stats.prev;
                stats.prev = stats.curr;
                if delta < 0.0 {
                    f64::NAN
                } else {
                    delta
                }
            }
            Self::DeltaDuration => {
                let delta = stats.curr_sum - stats.prev_sum;
                stats.prev_sum = stats.curr_sum;
                if delta < 0.0 {
                    f64::NAN
                } else {
                    delta
                }
            }
            Self::Count => stats.curr,
            Self::Sum => stats.curr_sum,
            Self::Bucket => return Snapshot::Buckets(stats.buckets.clone()),
        };

        if value.is_nan() {
            Snapshot::Empty
        } else {
            Snapshot::Value(value)
        }
    }
}

#[derive(Default)]
pub(crate) struct RecorderState {
    pub(crate) stats: HashMap<u64, Stats>,
    pub(crate) exceeded: u64,
    pub(crate) series_growth: usize,
}

/// Statistics of one metric stream.
pub(crate) struct Recorder {
    metric_name: String,
    data_id: i32,
    max_series: usize,
    max_series_growth_rate: usize,
    gc_interval: Duration,
    // nanoseconds, ascending, last is +Inf
    bounds: Vec<f64>,
    le_labels: Vec<String>,
    storage: Storage,
    pub(crate) state: RwLock<RecorderState>,
    stopped: AtomicBool,
}

pub(crate) struct RecorderOptions<'a> {
    pub(crate) metric_name: &'a str,
    pub(crate) data_id: i32,
    pub(crate) max_series: usize,
    pub(crate) max_series_growth_rate: usize,
    pub(crate) gc_interval: Duration,
    pub(crate) buckets: &'a [f64],
}

impl Recorder {
    pub(crate) fn new(opts: &RecorderOptions<'_>) -> Self {
        let mut buckets: Vec<f64> = opts
            .buckets
            .iter()
            .copied()
            .filter(|b| b.is_finite())
            .collect();
        buckets.sort_by(f64::total_cmp);
        buckets.dedup();

        let mut bounds: Vec<f64> = buckets.iter().map(|b| b * NANOS_PER_SECOND).collect();
        bounds.push(f64::INFINITY);
        let mut le_labels: Vec<String> = buckets.iter().map(ToString::to_string).collect();
        le_labels.push("+Inf".to_string());

        Self {
            metric_name: opts.metric_name.to_string(),
            data_id: opts.data_id,
            max_series: opts.max_series,
            max_series_growth_rate: opts.max_series_growth_rate,
            gc_interval: opts.gc_interval,
            bounds,
            le_labels,
            storage: Storage::new(),
            state: RwLock::new(RecorderState::default()),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn data_id(&self) -> i32 {
        self.data_id
    }

    fn limit_growth_rate(&self) -> bool {
        self.max_series_growth_rate > 0
    }

    /// Records `value` for the series identified by `dims`.
    pub(crate) fn set(&self, dims: &Dimensions, value: f64) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let hash = hash_from_map(dims);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.stats.len() >= self.max_series {
            state.exceeded += 1;
            drop(state);
            monitor::inc_accumulator_exceeded(self.data_id);
            debug!("Accumulator got exceeded series labels: {dims:?}");
            return false;
        }

        let state = &mut *state;
        let stats = match state.stats.entry(hash) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                if self.limit_growth_rate() {
                    state.series_growth += 1;
                    if state.series_growth > self.max_series_growth_rate {
                        state.exceeded += 1;
                        monitor::inc_accumulator_exceeded(self.data_id);
                        debug!("Accumulator growth rate exceeded, series labels: {dims:?}");
                        return false;
                    }
                }
                monitor::inc_accumulator_added_series(self.data_id);
                entry.insert(Stats::new(self.bounds.len()))
            }
        };

        stats.curr += 1.0;
        stats.curr_sum += value;
        if stats.max < value {
            stats.max = value;
        }
        if stats.min > value {
            stats.min = value;
        }
        for (bound, count) in self.bounds.iter().zip(stats.buckets.iter_mut()) {
            if *bound >= value {
                *count += 1;
            }
        }
        stats.updated_ms = now_millis();

        if !self.storage.exist(hash) {
            self.storage.set_if(hash, dims);
        }
        true
    }

    pub(crate) fn total(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
            .len()
    }

    pub(crate) fn exceeded(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .exceeded
    }

    pub(crate) fn reset_growth_rate(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .series_growth = 0;
    }

    /// Drops series not updated within the gc interval.
    pub(crate) fn clean(&self) {
        let now = now_millis();
        let gc_interval_ms = duration_millis(self.gc_interval);

        let stale: Vec<u64> = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
            .iter()
            .filter(|(_, s)| now - s.updated_ms > gc_interval_ms)
            .map(|(h, _)| *h)
            .collect();

        for hash in stale {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            // may have been touched since the scan
            if state
                .stats
                .get(&hash)
                .is_some_and(|s| now - s.updated_ms > gc_interval_ms)
            {
                state.stats.remove(&hash);
                self.storage.del(hash);
            }
        }
    }

    /// Lazily produces the records of one statistic kind.
    pub(crate) fn batches(&self, kind: StatKind) -> MetricBatches<'_> {
        let keys: Vec<u64> = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
            .keys()
            .copied()
            .collect();
        MetricBatches {
            recorder: self,
            kind,
            keys: keys.into_iter(),
            timestamp: now_millis(),
        }
    }

    fn snapshot_into(&self, kind: StatKind, hash: u64, timestamp: i64, out: &mut Vec<MetricV2>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let Some(stats) = state.stats.get_mut(&hash) else {
            return;
        };
        let Some(labels) = self.storage.get(hash) else {
            return;
        };

        match kind.snapshot(stats) {
            Snapshot::Empty => {}
            Snapshot::Value(value) => out.push(MetricV2 {
                metrics: HashMap::from([(self.metric_name.clone(), value)]),
                timestamp,
                dimension: labels,
            }),
            Snapshot::Buckets(counts) => {
                for (le, count) in self.le_labels.iter().zip(counts) {
                    let mut dimension = labels.clone();
                    dimension.insert("le".to_string(), le.clone());
                    #[allow(clippy::cast_precision_loss)]
                    let value = count as f64;
                    out.push(MetricV2 {
                        metrics: HashMap::from([(self.metric_name.clone(), value)]),
                        timestamp,
                        dimension,
                    });
                }
            }
        }
    }

    fn record(&self, data: Vec<MetricV2>) -> Record {
        Record {
            record_type: RecordType::MetricV2,
            request_type: RequestType::Derived,
            token: Token {
                metrics_data_id: self.data_id,
                ..Default::default()
            },
            data: RecordData::MetricV2(data),
        }
    }

    /// Marks the recorder stopped and releases its series.
    fn release(&self) {
        self.stopped.store(true, Ordering::Release);
        self.storage.clean();
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = RecorderState::default();
        monitor::remove_accumulator_series(self.data_id);
    }
}

/// Records of one statistic kind, [`PUBLISH_BATCH_SIZE`] samples at most each.
///
/// The per-series lock is only held while one series is snapshotted so
/// observations interleave with a long publish pass.
pub(crate) struct MetricBatches<'a> {
    recorder: &'a Recorder,
    kind: StatKind,
    keys: std::vec::IntoIter<u64>,
    timestamp: i64,
}

impl Iterator for MetricBatches<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let mut batch = Vec::new();
        for hash in self.keys.by_ref() {
            self.recorder
                .snapshot_into(self.kind, hash, self.timestamp, &mut batch);
            if batch.len() >= PUBLISH_BATCH_SIZE {
                break;
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(self.recorder.record(batch))
        }
    }
}

/// Refreshes the series gauge until cancelled, then releases the recorder.
pub(crate) async fn update_metrics(recorder: Arc<Recorder>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(UPDATE_METRICS_INTERVAL);
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                recorder.release();
                return;
            }
            _ = ticker.tick() => {
                monitor::set_accumulator_series(recorder.data_id, recorder.total());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(pairs: &[(&str, &str)]) -> Dimensions {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn recorder(max_series: usize, growth: usize, buckets: &[f64]) -> Recorder {
        Recorder::new(&RecorderOptions {
            metric_name: "test_metric",
            data_id: 1001,
            max_series,
            max_series_growth_rate: growth,
            gc_interval: Duration::from_secs(60),
            buckets,
        })
    }

    fn values(records: Vec<Record>) -> Vec<MetricV2> {
        records
            .into_iter()
            .flat_map(|r| match r.data {
                RecordData::MetricV2(samples) => samples,
                other => panic!("unexpected data {}", other.kind()),
            })
            .collect()
    }

    #[test]
    fn test_snapshot_resets_windowed_kinds() {
        let r = recorder(100, 0, &[2.0, 5.0, 10.0, 15.0]);
        let lbs1 = dims(&[("label1", "value1")]);
        let lbs2 = dims(&[("label2", "value2")]);
        assert!(r.set(&lbs1, 1.0));
        assert!(r.set(&lbs1, 11.0));
        assert!(r.set(&lbs2, 2.0));
        assert!(r.set(&lbs2, 12.0));

        assert_eq!(values(r.batches(StatKind::Max).collect()).len(), 2);
        assert_eq!(values(r.batches(StatKind::Min).collect()).len(), 2);
        assert_eq!(values(r.batches(StatKind::Delta).collect()).len(), 2);

        for stats in r.state.read().unwrap().stats.values() {
            assert_eq!(stats.max, f64::NEG_INFINITY);
            assert_eq!(stats.min, f64::INFINITY);
            assert_eq!(stats.prev, stats.curr);
        }

        // nothing observed since the reset
        assert!(values(r.batches(StatKind::Min).collect()).is_empty());
        assert!(r.set(&lbs1, 10.0));
        let min = values(r.batches(StatKind::Min).collect());
        assert_eq!(min.len(), 1);
        assert_eq!(min[0].metrics["test_metric"], 10.0);
    }

    #[test]
    fn test_delta_twice_is_zero_and_negative_is_omitted() {
        let r = recorder(10, 0, &[]);
        let lbs = dims(&[("service", "api")]);
        for v in [1.0, 2.0, 3.0] {
            assert!(r.set(&lbs, v));
        }

        let first = values(r.batches(StatKind::Delta).collect());
        assert_eq!(first[0].metrics["test_metric"], 3.0);
        let second = values(r.batches(StatKind::Delta).collect());
        assert_eq!(second[0].metrics["test_metric"], 0.0);

        for stats in r.state.write().unwrap().stats.values_mut() {
            stats.prev = stats.curr + 5.0;
            stats.prev_sum = stats.curr_sum + 5.0;
        }
        assert!(values(r.batches(StatKind::Delta).collect()).is_empty());
        assert!(values(r.batches(StatKind::DeltaDuration).collect()).is_empty());
    }

    #[test]
    fn test_bucket_boundaries_are_inclusive() {
        let r = recorder(10, 0, &[0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]);
        let lbs = dims(&[("service", "api")]);
        assert!(r.set(&lbs, 0.3 * 1e9));

        let samples = values(r.batches(StatKind::Bucket).collect());
        assert_eq!(samples.len(), 8);
        let by_le: HashMap<String, f64> = samples
            .iter()
            .map(|s| (s.dimension["le"].clone(), s.metrics["test_metric"]))
            .collect();
        for le in ["0.01", "0.05", "0.1"] {
            assert_eq!(by_le[le], 0.0, "le={le}");
        }
        for le in ["0.5", "1", "2", "5", "+Inf"] {
            assert_eq!(by_le[le], 1.0, "le={le}");
        }
        assert!(samples.iter().all(|s| s.dimension["service"] == "api"));
    }

    #[test]
    fn test_growth_rate_caps_new_series_only() {
        let r = recorder(100, 2, &[]);
        let a = dims(&[("k", "a")]);
        let b = dims(&[("k", "b")]);
        let c = dims(&[("k", "c")]);

        assert!(r.set(&a, 1.0));
        assert!(r.set(&b, 1.0));
        assert!(!r.set(&c, 1.0));
        // existing series keep updating
        assert!(r.set(&a, 2.0));
        assert_eq!(r.exceeded(), 1);
        assert_eq!(r.total(), 2);

        r.reset_growth_rate();
        assert!(r.set(&c, 1.0));
        assert_eq!(r.total(), 3);
    }

    #[test]
    fn test_rejected_observation_leaves_state_untouched() {
        let r = recorder(1, 0, &[]);
        let a = dims(&[("k", "a")]);
        let b = dims(&[("k", "b")]);
        assert!(r.set(&a, 1.0));
        let before = r.state.read().unwrap().stats.clone();

        assert!(!r.set(&b, 5.0));
        assert!(!r.set(&a, 5.0));
        assert_eq!(r.state.read().unwrap().stats, before);
        assert_eq!(r.exceeded(), 2);
    }

    #[test]
    fn test_batches_split_at_batch_size() {
        let r = recorder(PUBLISH_BATCH_SIZE * 2, 0, &[]);
        for i in 0..PUBLISH_BATCH_SIZE + 10 {
            assert!(r.set(&dims(&[("i", &i.to_string())]), 1.0));
        }
        let records: Vec<Record> = r.batches(StatKind::Count).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type, RecordType::MetricV2);
        assert_eq!(records[0].request_type, RequestType::Derived);
        assert_eq!(records[0].token.metrics_data_id, 1001);
        assert_eq!(values(records).len(), PUBLISH_BATCH_SIZE + 10);
    }

    #[test]
    fn test_clean_drops_stale_series() {
        let r = recorder(10, 0, &[]);
        let a = dims(&[("k", "a")]);
        let b = dims(&[("k", "b")]);
        assert!(r.set(&a, 1.0));
        assert!(r.set(&b, 1.0));
        let hash_a = hash_from_map(&a);
        r.state
            .write()
            .unwrap()
            .stats
            .get_mut(&hash_a)
            .unwrap()
            .updated_ms -= 61_000;

        r.clean();
        assert_eq!(r.total(), 1);
        assert!(!r.storage.exist(hash_a));
        assert!(r.storage.exist(hash_from_map(&b)));
    }

    #[test]
    fn test_release_drops_series_gauge() {
        let r = Recorder::new(&RecorderOptions {
            metric_name: "test_metric",
            data_id: 838_383,
            max_series: 10,
            max_series_growth_rate: 0,
            gc_interval: Duration::from_secs(60),
            buckets: &[],
        });
        let lbs = dims(&[("k", "a")]);
        assert!(r.set(&lbs, 1.0));
        monitor::set_accumulator_series(r.data_id(), r.total());
        let gauge = "accumulator_series_count{data_id=\"838383\"} 1";
        assert!(monitor::encode_text().contains(gauge));

        r.release();
        assert!(!r.set(&lbs, 1.0));
        assert_eq!(r.total(), 0);
        assert!(!monitor::encode_text().contains("accumulator_series_count{data_id=\"838383\"}"));
    }
}
