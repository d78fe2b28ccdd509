//! 📊 MetricsAggregator: the supervisor's abacus.
//!
//! Workers shout `{count, elapsed}` every few milliseconds. This struct adds it
//! all up, keeps a short ring of per-second throughput samples for the tuner,
//! and remembers how each worker has been behaving lately so the stability guard
//! knows who to blame.
//!
//! 🔒 Owned by exactly one supervisor task and only ever touched through `&mut self`.
//! No locks, no atomics, no drama. Message passing already serialized everything.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::common::WorkerId;

/// 📋 What the supervisor knows about one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    /// 📦 records this worker has reported, lifetime
    pub records: u64,
    /// 🚀 records/sec from its most recent report
    pub throughput: f64,
    /// 💀 send errors it has reported, lifetime
    pub errors: u64,
    pub last_update: Instant,
}

/// 📊 Global counters plus a bounded throughput history.
#[derive(Debug)]
pub struct MetricsAggregator {
    total_sent: u64,
    /// 🪣 records ingested since the last sample was taken
    window_count: u64,
    window_started: Instant,
    samples: VecDeque<f64>,
    history_size: usize,
    started: Instant,
    last_report: Option<Instant>,
    workers: HashMap<WorkerId, WorkerStats>,
}

impl MetricsAggregator {
    pub fn new(history_size: usize, now: Instant) -> Self {
        // -- 🧯 a zero-sized ring would make rolling_average meaningless; floor it at one
        let history_size = history_size.max(1);
        Self {
            total_sent: 0,
            window_count: 0,
            window_started: now,
            samples: VecDeque::with_capacity(history_size),
            history_size,
            started: now,
            last_report: None,
            workers: HashMap::new(),
        }
    }

    /// ➕ Fold one worker report into the totals.
    pub fn ingest(&mut self, worker_id: WorkerId, count: u64, elapsed: Duration, now: Instant) {
        self.total_sent += count;
        self.window_count += count;
        self.last_report = Some(now);

        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 { count as f64 / secs } else { 0.0 };
        let stats = self.workers.entry(worker_id).or_insert(WorkerStats {
            records: 0,
            throughput: 0.0,
            errors: 0,
            last_update: now,
        });
        stats.records += count;
        stats.throughput = throughput;
        stats.last_update = now;
    }

    /// 💀 Count send errors against a worker without touching throughput.
    pub fn record_errors(&mut self, worker_id: WorkerId, errors: u64, now: Instant) {
        let stats = self.workers.entry(worker_id).or_insert(WorkerStats {
            records: 0,
            throughput: 0.0,
            errors: 0,
            last_update: now,
        });
        stats.errors += errors;
    }

    /// ⏱️ Close the current window: normalise it to records/sec and push it
    /// into the history ring. Returns the sample.
    pub fn record_sample(&mut self, now: Instant) -> f64 {
        let secs = now.duration_since(self.window_started).as_secs_f64();
        let rate = if secs > 0.0 {
            self.window_count as f64 / secs
        } else {
            0.0
        };
        self.push_sample(rate);
        self.window_count = 0;
        self.window_started = now;
        rate
    }

    /// 🔄 Push a per-second sample. The oldest one falls off when the ring is full.
    pub fn push_sample(&mut self, sample: f64) {
        if self.samples.len() == self.history_size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// 📈 Mean of the buffered samples, `None` until there is at least one.
    pub fn rolling_average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn last_report(&self) -> Option<Instant> {
        self.last_report
    }

    /// 🐢 Lifetime average, records/sec.
    pub fn overall_rate(&self, now: Instant) -> f64 {
        let secs = now.duration_since(self.started).as_secs_f64();
        if secs > 0.0 {
            self.total_sent as f64 / secs
        } else {
            0.0
        }
    }

    pub fn worker(&self, worker_id: WorkerId) -> Option<&WorkerStats> {
        self.workers.get(&worker_id)
    }

    /// 🗑️ Forget a worker. Its records stay in `total_sent`; only the per-worker row goes.
    pub fn remove_worker(&mut self, worker_id: WorkerId) {
        self.workers.remove(&worker_id);
    }

    /// 🩺 Is this worker misbehaving? Too many errors, or silent and stalled.
    pub fn is_elevated(
        &self,
        worker_id: WorkerId,
        error_threshold: u64,
        stale_after: Duration,
        now: Instant,
    ) -> bool {
        match self.workers.get(&worker_id) {
            Some(stats) => {
                stats.errors > error_threshold
                    || (stats.throughput == 0.0
                        && now.duration_since(stats.last_update) > stale_after)
            }
            // 🤷 never reported at all: not elevated, just shy
            None => false,
        }
    }

    /// 🏁 Order candidates worst-first: most errors, then lowest throughput.
    /// Workers without a row sort as zero errors and zero throughput.
    pub fn rank_worst(&self, candidates: &mut [WorkerId]) {
        let key = |id: &WorkerId| {
            self.workers
                .get(id)
                .map(|s| (s.errors, s.throughput))
                .unwrap_or((0, 0.0))
        };
        candidates.sort_by(|a, b| {
            let (a_errors, a_throughput) = key(a);
            let (b_errors, b_throughput) = key(b);
            b_errors
                .cmp(&a_errors)
                .then(a_throughput.total_cmp(&b_throughput))
                .then(a.cmp(b))
        });
    }
}
