// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-stream admission gate bounding the number of distinct series.
//!
//! Every stream (destination data id) keeps the hashes it has admitted along
//! with the last time each was seen. A background task per stream evicts
//! hashes that were not seen for longer than the gc interval, which frees
//! room for new series.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::Creation;
use crate::monitor;
use crate::util::{duration_millis, now_millis, runtime_handle};

struct LimiterRecorder {
    data_id: i32,
    max_series: usize,
    series: RwLock<HashMap<u64, i64>>,
    exceeded: AtomicU64,
}

impl LimiterRecorder {
    fn set(&self, hash: u64) -> bool {
        let now = now_millis();
        let mut series = self.series.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(seen) = series.get_mut(&hash) {
            *seen = now;
            return true;
        }
        if series.len() >= self.max_series {
            drop(series);
            self.exceeded.fetch_add(1, Ordering::Relaxed);
            monitor::inc_limiter_exceeded(self.data_id);
            debug!(
                "Series limiter rejected hash {hash} for data id {}: {} series reached",
                self.data_id, self.max_series
            );
            return false;
        }
        series.insert(hash, now);
        true
    }

    fn len(&self) -> usize {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn gc(&self, gc_interval_ms: i64) {
        let now = now_millis();
        let stale: Vec<u64> = self
            .series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, seen)| now - **seen > gc_interval_ms)
            .map(|(hash, _)| *hash)
            .collect();

        for hash in stale {
            let mut series = self.series.write().unwrap_or_else(PoisonError::into_inner);
            // refreshed since the scan
            if series.get(&hash).is_some_and(|seen| now - *seen > gc_interval_ms) {
                series.remove(&hash);
            }
        }
        monitor::set_limiter_series(self.data_id, self.len());
    }
}

async fn gc_loop(recorder: Arc<LimiterRecorder>, gc_interval: Duration, cancel: CancellationToken) {
    let period = gc_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let gc_interval_ms = duration_millis(gc_interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => recorder.gc(gc_interval_ms),
        }
    }
    monitor::remove_limiter_series(recorder.data_id);
}

pub struct SeriesLimiter {
    max_series: usize,
    gc_interval: Duration,
    recorders: RwLock<HashMap<i32, Arc<LimiterRecorder>>>,
    handle: Handle,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SeriesLimiter {
    /// Creates a limiter admitting at most `max_series` hashes per stream.
    ///
    /// # Errors
    ///
    /// Fails when called outside of a tokio runtime.
    pub fn new(max_series: usize, gc_interval: Duration) -> Result<Self, Creation> {
        Ok(Self {
            max_series,
            gc_interval,
            recorders: RwLock::new(HashMap::new()),
            handle: runtime_handle("series limiter")?,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Admits `hash` for `data_id`. Known hashes are always admitted and have
    /// their last-seen time refreshed; unknown hashes are admitted only while
    /// the stream is below its cap.
    pub fn set(&self, data_id: i32, hash: u64) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        match self.recorder(data_id) {
            Some(recorder) => recorder.set(hash),
            None => false,
        }
    }

    fn recorder(&self, data_id: i32) -> Option<Arc<LimiterRecorder>> {
        if let Some(recorder) = self
            .recorders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&data_id)
        {
            return Some(Arc::clone(recorder));
        }

        let mut recorders = self
            .recorders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        let recorder = recorders.entry(data_id).or_insert_with(|| {
            let recorder = Arc::new(LimiterRecorder {
                data_id,
                max_series: self.max_series,
                series: RwLock::new(HashMap::new()),
                exceeded: AtomicU64::new(0),
            });
            let task = self.handle.spawn(gc_loop(
                Arc::clone(&recorder),
                self.gc_interval,
                self.cancel.child_token(),
            ));
            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task);
            debug!("Series limiter created recorder for data id {data_id}");
            recorder
        });
        Some(Arc::clone(recorder))
    }

    /// Rejected admissions per stream.
    #[must_use]
    pub fn exceeded(&self) -> HashMap<i32, u64> {
        self.recorders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, r)| (*id, r.exceeded.load(Ordering::Relaxed)))
            .collect()
    }

    #[must_use]
    pub fn series_count(&self, data_id: i32) -> usize {
        self.recorders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&data_id)
            .map_or(0, |r| r.len())
    }

    /// Stops every eviction task and releases the tracked series. Calling it
    /// again is a no-op.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Series limiter gc task ended abnormally: {e}");
            }
        }
        self.recorders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
