// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregated statistic series keyed by dimension set.
//!
//! Every metric stream (destination data id) owns a [`recorder::Recorder`]
//! holding running statistics per distinct dimension set. The accumulator runs
//! three background loops on the runtime it was created on:
//!
//! * gc, every half gc interval, dropping series not updated for longer than
//!   the gc interval;
//! * publish, every publish interval (optionally aligned to the wall-clock
//!   minute), snapshotting the configured statistic into derived records;
//! * growth-rate reset, every minute, when a growth-rate cap is configured.
//!
//! Each recorder additionally runs a small updater task refreshing its series
//! gauge. [`Accumulator::stop`] cancels and awaits all of them.

mod recorder;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::define::PublishFn;
use crate::errors::Creation;
use crate::labels::Dimensions;
use crate::monitor;
use crate::util::{now_millis, runtime_handle};

pub use recorder::PUBLISH_BATCH_SIZE;
use recorder::{Recorder, RecorderOptions};

pub const DEFAULT_MAX_SERIES: usize = 100_000;
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(60);
/// Prometheus default histogram buckets, in seconds.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const GROWTH_RATE_RESET_INTERVAL: Duration = Duration::from_secs(60);

/// Statistic published by an accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StatKind {
    Min,
    Max,
    Delta,
    DeltaDuration,
    #[default]
    Count,
    Sum,
    Bucket,
}

impl StatKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Delta => "delta",
            Self::DeltaDuration => "delta_duration",
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Bucket => "bucket",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub metric_name: String,
    pub max_series: usize,
    pub gc_interval: Duration,
    pub publish_interval: Duration,
    /// Histogram boundaries in seconds.
    pub buckets: Vec<f64>,
    pub kind: StatKind,
    /// New series admitted per stream and minute, `0` disables the cap.
    pub max_series_growth_rate: usize,
    /// Delay the first publication to the next wall-clock minute.
    pub align_publish: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metric_name: String::new(),
            max_series: 0,
            gc_interval: Duration::ZERO,
            publish_interval: Duration::ZERO,
            buckets: Vec::new(),
            kind: StatKind::default(),
            max_series_growth_rate: 0,
            align_publish: true,
        }
    }
}

impl Config {
    /// Fills unset fields with their defaults.
    pub fn validate(&mut self) {
        if self.max_series == 0 {
            self.max_series = DEFAULT_MAX_SERIES;
        }
        if self.gc_interval.is_zero() {
            self.gc_interval = DEFAULT_GC_INTERVAL;
        }
        if self.publish_interval.is_zero() {
            self.publish_interval = DEFAULT_PUBLISH_INTERVAL;
        }
        if self.buckets.is_empty() {
            self.buckets = DEFAULT_BUCKETS.to_vec();
        }
    }
}

struct Shared {
    conf: Config,
    recorders: RwLock<HashMap<i32, Arc<Recorder>>>,
    publish: Option<PublishFn>,
}

impl Shared {
    fn recorders(&self) -> Vec<Arc<Recorder>> {
        self.recorders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    async fn do_publish(&self) {
        let Some(publish) = self.publish.as_ref() else {
            return;
        };
        let start = Instant::now();
        for recorder in self.recorders() {
            for record in recorder.batches(self.conf.kind) {
                publish(record).await;
            }
            debug!(
                "Accumulator got data id {}, series {}",
                recorder.data_id(),
                recorder.total()
            );
        }
        monitor::observe_accumulator_publish(start.elapsed().as_secs_f64());
    }

    fn do_gc(&self) {
        let start = Instant::now();
        for recorder in self.recorders() {
            recorder.clean();
        }
        monitor::observe_accumulator_gc(start.elapsed().as_secs_f64());
    }

    fn reset_growth_rate(&self) {
        for recorder in self.recorders() {
            recorder.reset_growth_rate();
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn gc_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = ticker(shared.conf.gc_interval / 2);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => shared.do_gc(),
        }
    }
}

/// Time left until the next wall-clock minute.
fn until_next_minute(now_ms: i64) -> Duration {
    const MINUTE_MS: i64 = 60_000;
    let left = MINUTE_MS - now_ms.rem_euclid(MINUTE_MS);
    Duration::from_millis(u64::try_from(left).unwrap_or(0))
}

async fn publish_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    if shared.conf.align_publish {
        let wait = until_next_minute(now_millis());
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(wait) => {}
        }
    }

    let mut ticker = ticker(shared.conf.publish_interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        // the sink may wait for room, stop must not
        tokio::select! {
            () = cancel.cancelled() => return,
            () = shared.do_publish() => {}
        }
    }
}

async fn growth_rate_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = ticker(GROWTH_RATE_RESET_INTERVAL);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => shared.reset_growth_rate(),
        }
    }
}

pub struct Accumulator {
    shared: Arc<Shared>,
    handle: Handle,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Accumulator {
    /// Creates an accumulator and starts its background loops. Defaults are
    /// applied to unset config fields. Without `publish` nothing is published.
    ///
    /// # Errors
    ///
    /// Fails when called outside of a tokio runtime.
    pub fn new(mut conf: Config, publish: Option<PublishFn>) -> Result<Self, Creation> {
        let handle = runtime_handle("accumulator")?;
        conf.validate();
        debug!("Accumulator config: {conf:?}");

        let shared = Arc::new(Shared {
            conf,
            recorders: RwLock::new(HashMap::new()),
            publish,
        });
        let cancel = CancellationToken::new();

        let mut tasks = vec![handle.spawn(gc_loop(Arc::clone(&shared), cancel.child_token()))];
        if shared.conf.max_series_growth_rate > 0 {
            tasks.push(handle.spawn(growth_rate_loop(
                Arc::clone(&shared),
                cancel.child_token(),
            )));
        }
        if shared.publish.is_some() {
            tasks.push(handle.spawn(publish_loop(Arc::clone(&shared), cancel.child_token())));
        }
        info!(
            "Accumulator started for metric {} ({})",
            shared.conf.metric_name,
            shared.conf.kind.as_str()
        );

        Ok(Self {
            shared,
            handle,
            cancel,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.conf
    }

    /// Records `value` for `dims` in stream `data_id`. Returns false when the
    /// observation is rejected by a series cap or the accumulator is stopped.
    pub fn accumulate(&self, data_id: i32, dims: &Dimensions, value: f64) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        match self.recorder(data_id) {
            Some(recorder) => recorder.set(dims, value),
            None => false,
        }
    }

    fn recorder(&self, data_id: i32) -> Option<Arc<Recorder>> {
        if let Some(recorder) = self
            .shared
            .recorders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&data_id)
        {
            return Some(Arc::clone(recorder));
        }

        let mut recorders = self
            .shared
            .recorders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        let recorder = recorders.entry(data_id).or_insert_with(|| {
            let conf = &self.shared.conf;
            let recorder = Arc::new(Recorder::new(&RecorderOptions {
                metric_name: &conf.metric_name,
                data_id,
                max_series: conf.max_series,
                max_series_growth_rate: conf.max_series_growth_rate,
                gc_interval: conf.gc_interval,
                buckets: &conf.buckets,
            }));
            let task = self.handle.spawn(recorder::update_metrics(
                Arc::clone(&recorder),
                self.cancel.child_token(),
            ));
            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task);
            recorder
        });
        Some(Arc::clone(recorder))
    }

    /// Rejected observations per stream.
    #[must_use]
    pub fn exceeded(&self) -> HashMap<i32, u64> {
        self.shared
            .recorders()
            .iter()
            .map(|r| (r.data_id(), r.exceeded()))
            .collect()
    }

    #[must_use]
    pub fn series_count(&self, data_id: i32) -> usize {
        self.shared
            .recorders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&data_id)
            .map_or(0, |r| r.total())
    }

    /// Cancels every background task and waits for them to exit. Stream state
    /// is released once this returns. Calling it again is a no-op.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Accumulator task ended abnormally: {e}");
            }
        }
        self.shared
            .recorders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(
            "Accumulator stopped for metric {}",
            self.shared.conf.metric_name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::define::{MetricV2, PublishFuture, Record, RecordData};
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    fn random_dims(n: usize) -> Dimensions {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|i| {
                let value: String = (&mut rng)
                    .sample_iter(&Alphanumeric)
                    .take(12)
                    .map(char::from)
                    .collect();
                (format!("key{i}"), value)
            })
            .collect()
    }

    fn config(max_series: usize, gc_interval: Duration, publish_interval: Duration) -> Config {
        Config {
            metric_name: "bk_apm_count".to_string(),
            max_series,
            gc_interval,
            publish_interval,
            align_publish: false,
            ..Default::default()
        }
    }

    fn collector() -> (PublishFn, Arc<Mutex<Vec<Record>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&records);
        let publish: PublishFn = Arc::new(move |r: Record| -> PublishFuture {
            sink.lock().unwrap().push(r);
            Box::pin(async {})
        });
        (publish, records)
    }

    fn samples(records: &[Record]) -> Vec<MetricV2> {
        records
            .iter()
            .flat_map(|r| match &r.data {
                RecordData::MetricV2(samples) => samples.clone(),
                other => panic!("unexpected data {}", other.kind()),
            })
            .collect()
    }

    #[test]
    fn test_validate_config() {
        let mut conf = Config::default();
        conf.validate();
        assert_eq!(conf.buckets, DEFAULT_BUCKETS.to_vec());
        assert_eq!(conf.max_series, 100_000);
        assert_eq!(conf.gc_interval, Duration::from_secs(3600));
        assert_eq!(conf.publish_interval, Duration::from_secs(60));
        assert!(conf.align_publish);
    }

    #[test]
    fn test_requires_runtime() {
        let err = Accumulator::new(Config::default(), None).err();
        assert!(matches!(err, Some(Creation::NoRuntime { .. })));
    }

    #[tokio::test]
    async fn test_accumulator_exceeded() {
        let acc = Accumulator::new(
            config(10, Duration::from_secs(3600), Duration::from_secs(60)),
            None,
        )
        .unwrap();
        for i in 0..100 {
            for id in [1001, 1002] {
                acc.accumulate(id, &random_dims(6), f64::from(i));
            }
        }
        let exceeded = acc.exceeded();
        acc.stop().await;
        assert_eq!(exceeded[&1001], 90);
        assert_eq!(exceeded[&1002], 90);
    }

    #[tokio::test]
    async fn test_accumulator_not_exceeded() {
        let acc = Accumulator::new(
            config(10, Duration::from_secs(3600), Duration::from_secs(60)),
            None,
        )
        .unwrap();
        for i in 0..10 {
            for id in [1001, 1002] {
                assert!(acc.accumulate(id, &random_dims(6), f64::from(i)));
            }
        }
        let exceeded = acc.exceeded();
        acc.stop().await;
        assert_eq!(exceeded[&1001], 0);
        assert_eq!(exceeded[&1002], 0);
    }

    #[tokio::test]
    async fn test_accumulator_gc_ok() {
        let acc = Accumulator::new(
            config(10, Duration::from_millis(250), Duration::from_secs(1)),
            None,
        )
        .unwrap();
        for i in 0..20 {
            for id in [1001, 1002] {
                acc.accumulate(id, &random_dims(6), f64::from(i));
            }
            if i == 9 {
                let exceeded = acc.exceeded();
                assert_eq!(exceeded[&1001], 0);
                assert_eq!(exceeded[&1002], 0);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        let exceeded = acc.exceeded();
        acc.stop().await;
        assert_eq!(exceeded[&1001], 0);
        assert_eq!(exceeded[&1002], 0);
    }

    #[tokio::test]
    async fn test_accumulator_gc_not_yet() {
        let acc = Accumulator::new(
            config(10, Duration::from_secs(1), Duration::from_secs(1)),
            None,
        )
        .unwrap();
        for i in 0..20 {
            for id in [1001, 1002] {
                acc.accumulate(id, &random_dims(6), f64::from(i));
            }
            if i == 9 {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
        let exceeded = acc.exceeded();
        acc.stop().await;
        assert_eq!(exceeded[&1001], 10);
        assert_eq!(exceeded[&1002], 10);
    }

    async fn publish_once(kind: StatKind) -> Vec<MetricV2> {
        let (publish, records) = collector();
        let acc = Accumulator::new(
            Config {
                metric_name: "bk_apm_metric".to_string(),
                kind,
                ..config(10, Duration::from_secs(60), Duration::from_secs(3600))
            },
            Some(publish),
        )
        .unwrap();

        let dims = random_dims(3);
        for v in [0.1, 0.2, 0.3, 0.4, 0.5, 1.0] {
            assert!(acc.accumulate(1001, &dims, v * 1e9));
        }
        acc.shared.do_publish().await;
        acc.stop().await;

        let records = records.lock().unwrap();
        assert!(records
            .iter()
            .all(|r| r.token.metrics_data_id == 1001));
        samples(&records)
    }

    fn first_value(samples: &[MetricV2]) -> f64 {
        samples[0].metrics["bk_apm_metric"]
    }

    #[tokio::test]
    async fn test_publish_count() {
        let s = publish_once(StatKind::Count).await;
        assert_eq!(s.len(), 1);
        assert_eq!(first_value(&s), 6.0);
    }

    #[tokio::test]
    async fn test_publish_delta() {
        let s = publish_once(StatKind::Delta).await;
        assert_eq!(s.len(), 1);
        assert_eq!(first_value(&s), 6.0);
    }

    #[tokio::test]
    async fn test_publish_delta_duration() {
        let s = publish_once(StatKind::DeltaDuration).await;
        assert_eq!(s.len(), 1);
        assert!((first_value(&s) - 2.5e9).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_publish_min() {
        let s = publish_once(StatKind::Min).await;
        assert_eq!(s.len(), 1);
        assert_eq!(first_value(&s), 1e8);
    }

    #[tokio::test]
    async fn test_publish_max() {
        let s = publish_once(StatKind::Max).await;
        assert_eq!(s.len(), 1);
        assert_eq!(first_value(&s), 1e9);
    }

    #[tokio::test]
    async fn test_publish_sum() {
        let s = publish_once(StatKind::Sum).await;
        assert_eq!(s.len(), 1);
        assert!((first_value(&s) - 2.5e9).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_publish_bucket() {
        let s = publish_once(StatKind::Bucket).await;
        assert_eq!(s.len(), 12);
        assert!(s.iter().all(|m| m.dimension.contains_key("le")));
        let inf = s.iter().find(|m| m.dimension["le"] == "+Inf").unwrap();
        assert_eq!(inf.metrics["bk_apm_metric"], 6.0);
    }

    #[tokio::test]
    async fn test_publish_loop_emits_records() {
        let (publish, records) = collector();
        let acc = Accumulator::new(
            Config {
                kind: StatKind::Delta,
                ..config(10, Duration::from_secs(60), Duration::from_millis(250))
            },
            Some(publish),
        )
        .unwrap();

        let dims = random_dims(6);
        for i in 0..10 {
            acc.accumulate(1001, &dims, f64::from(i));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        acc.stop().await;

        let records = records.lock().unwrap();
        let first = samples(&records[..1]);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].metrics["bk_apm_count"], 10.0);
        assert_eq!(first[0].dimension, dims);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let acc = Accumulator::new(
            config(10, Duration::from_secs(60), Duration::from_secs(60)),
            None,
        )
        .unwrap();
        assert!(acc.accumulate(1, &random_dims(2), 1.0));
        acc.stop().await;
        acc.stop().await;
        assert!(!acc.accumulate(1, &random_dims(2), 1.0));
        assert_eq!(acc.series_count(1), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_accumulate_loses_no_observation() {
        const TASKS: usize = 8;
        const PER_TASK: usize = 1000;

        let acc = Arc::new(
            Accumulator::new(
                config(3, Duration::from_secs(3600), Duration::from_secs(60)),
                None,
            )
            .unwrap(),
        );
        let dims: Arc<Vec<Dimensions>> = Arc::new((0..5).map(|_| random_dims(4)).collect());

        let workers: Vec<_> = (0..TASKS)
            .map(|t| {
                let acc = Arc::clone(&acc);
                let dims = Arc::clone(&dims);
                tokio::spawn(async move {
                    for i in 0..PER_TASK {
                        acc.accumulate(1001, &dims[(t + i) % dims.len()], 1.0);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        let recorder = Arc::clone(&acc.shared.recorders.read().unwrap()[&1001]);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let counted: u64 = recorder
            .state
            .read()
            .unwrap()
            .stats
            .values()
            .map(|s| s.curr as u64)
            .sum();
        let exceeded = acc.exceeded()[&1001];
        let series = acc.series_count(1001);
        acc.stop().await;

        assert_eq!(series, 3);
        assert_eq!(counted + exceeded, (TASKS * PER_TASK) as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_growth_rate_loop_readmits_new_series() {
        let acc = Accumulator::new(
            Config {
                max_series_growth_rate: 1,
                ..config(10, Duration::from_secs(3600), Duration::from_secs(60))
            },
            None,
        )
        .unwrap();
        let (a, b) = (random_dims(2), random_dims(2));

        assert!(acc.accumulate(1001, &a, 1.0));
        assert!(!acc.accumulate(1001, &b, 1.0));
        assert!(acc.accumulate(1001, &a, 1.0));

        tokio::time::sleep(GROWTH_RATE_RESET_INTERVAL + Duration::from_millis(10)).await;
        assert!(acc.accumulate(1001, &b, 1.0));
        assert!(!acc.accumulate(1001, &random_dims(2), 1.0));
        assert_eq!(acc.series_count(1001), 2);
        acc.stop().await;
    }

    #[test]
    fn test_until_next_minute() {
        assert_eq!(until_next_minute(0), Duration::from_secs(60));
        assert_eq!(until_next_minute(61_500), Duration::from_millis(58_500));
        assert_eq!(until_next_minute(119_999), Duration::from_millis(1));
        assert_eq!(until_next_minute(120_000), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aligned_publish_waits_for_next_minute() {
        let publish_interval = Duration::from_secs(1);
        let (publish, records) = collector();
        let aligned = until_next_minute(now_millis());
        let acc = Accumulator::new(
            Config {
                align_publish: true,
                ..config(10, Duration::from_secs(3600), publish_interval)
            },
            Some(publish),
        )
        .unwrap();
        assert!(acc.accumulate(1001, &random_dims(2), 1.0));

        // first tick lands one interval after the minute boundary
        tokio::time::sleep((aligned + publish_interval).saturating_sub(Duration::from_millis(50)))
            .await;
        assert!(records.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!records.lock().unwrap().is_empty());
        acc.stop().await;
    }
}
