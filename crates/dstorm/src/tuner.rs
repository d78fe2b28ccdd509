//! 🎚️ AutoTuner: a thermostat for throughput.
//!
//! Every `period` after a `warmup`, it looks at the rolling average and picks a
//! strategy by watermark:
//!
//! ```text
//!   avg < low   → add workers, scaled to the gap, capped per tick
//!   avg < mid   → grow batch size, add a few workers
//!   avg < high  → nudge batch size and pool depth, add one worker
//!   avg ≥ high  → done. tuning stops forever. go home.
//! ```
//!
//! 🧯 With the stability guard on, a pool where too many workers look sick is
//! shrunk instead, whatever the throughput says. Sick workers do not get
//! promoted because the numbers looked good for a second.
//!
//! The tuner never touches workers itself. It hands the supervisor a
//! [`TuningDecision`] and the supervisor does the hiring and firing.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::app_config::TuningConfig;
use crate::common::WorkerId;
use crate::metrics::MetricsAggregator;

/// 📝 What the supervisor should do this tick. Discarded once applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningDecision {
    /// ➕➖ workers to add (positive) or retire (negative)
    pub worker_delta: i64,
    pub batch_size: usize,
    pub pool_depth: usize,
}

/// 📐 The pool as the supervisor currently runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShape {
    pub workers: usize,
    pub batch_size: usize,
    pub pool_depth: usize,
}

#[derive(Debug)]
pub struct AutoTuner {
    config: TuningConfig,
    iterations: u32,
    finished: bool,
    next_tick: Instant,
}

impl AutoTuner {
    pub fn new(config: TuningConfig, start: Instant) -> Self {
        let next_tick = start + Duration::from_millis(config.warmup_ms);
        Self {
            finished: !config.enabled,
            config,
            iterations: 0,
            next_tick,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// ⏰ When the next tick is due, or `None` once tuning is over.
    pub fn next_tick(&self) -> Option<Instant> {
        (!self.finished).then_some(self.next_tick)
    }

    /// 🔄 Run one tick if it is due. Reads the supervisor's metrics, never writes them.
    pub fn tick(
        &mut self,
        now: Instant,
        metrics: &MetricsAggregator,
        active: &[WorkerId],
        shape: PoolShape,
    ) -> Option<TuningDecision> {
        if self.finished || now < self.next_tick {
            return None;
        }
        self.next_tick = now + Duration::from_millis(self.config.period_ms.max(1));

        let unstable = if self.config.stability_guard {
            let stale_after = Duration::from_millis(self.config.stale_after_ms);
            active
                .iter()
                .filter(|id| {
                    metrics.is_elevated(**id, self.config.error_indicator_threshold, stale_after, now)
                })
                .count()
        } else {
            0
        };
        let average = metrics.rolling_average()?;
        self.evaluate(average, unstable, shape)
    }

    /// 🧠 The policy itself, free of clocks and channels.
    pub fn evaluate(
        &mut self,
        average: f64,
        unstable: usize,
        shape: PoolShape,
    ) -> Option<TuningDecision> {
        if self.finished {
            return None;
        }
        let c = &self.config;

        if c.stability_guard && unstable > 0 {
            let unstable_floor = ((shape.workers as f64) * c.unstable_fraction).ceil().max(1.0) as usize;
            if unstable >= unstable_floor && shape.workers > c.min_workers {
                let wanted = ((shape.workers as f64) * c.shrink_fraction).ceil() as usize;
                let removable = wanted.min(shape.workers - c.min_workers);
                let decision = TuningDecision {
                    worker_delta: -(removable as i64),
                    batch_size: ((shape.batch_size as f64 * c.shrink_factor) as usize)
                        .max(c.min_batch_size),
                    pool_depth: ((shape.pool_depth as f64 * c.shrink_factor) as usize)
                        .max(c.min_pool_depth),
                };
                warn!(
                    unstable,
                    workers = shape.workers,
                    removing = removable,
                    "⚠️ pool looks unstable, shrinking"
                );
                return Some(decision);
            }
        }

        if average >= c.high_watermark {
            info!(average, "✅ tuning complete: high watermark reached");
            self.finished = true;
            return None;
        }
        if self.iterations >= c.max_iterations {
            info!(iterations = self.iterations, "🏁 tuning iteration cap reached");
            self.finished = true;
            return None;
        }
        self.iterations += 1;

        let headroom = c.max_workers.saturating_sub(shape.workers);
        let decision = if average < c.low_watermark {
            let gap = c.high_watermark - average;
            let wanted = (gap / c.gap_per_worker.max(1.0)).ceil() as usize;
            let add = wanted.clamp(c.min_add_per_tick, c.max_add_per_tick.max(c.min_add_per_tick));
            TuningDecision {
                worker_delta: add.min(headroom) as i64,
                batch_size: shape.batch_size,
                pool_depth: shape.pool_depth,
            }
        } else if average < c.mid_watermark {
            TuningDecision {
                worker_delta: c.mid_add_workers.min(headroom) as i64,
                batch_size: grow(shape.batch_size, c.mid_batch_growth, c.max_batch_size),
                pool_depth: shape.pool_depth,
            }
        } else {
            TuningDecision {
                worker_delta: 1usize.min(headroom) as i64,
                batch_size: grow(shape.batch_size, c.fine_growth, c.max_batch_size),
                pool_depth: grow_ceil(shape.pool_depth, c.fine_growth, c.max_pool_depth),
            }
        };
        debug!(
            average,
            iteration = self.iterations,
            worker_delta = decision.worker_delta,
            batch_size = decision.batch_size,
            pool_depth = decision.pool_depth,
            "🎚️ tuning decision"
        );

        let unchanged = decision.worker_delta == 0
            && decision.batch_size == shape.batch_size
            && decision.pool_depth == shape.pool_depth;
        (!unchanged).then_some(decision)
    }
}

// -- 📈 multiplicative growth capped at `max`; never shrinks what was already there
fn grow(value: usize, factor: f64, max: usize) -> usize {
    let grown = (value as f64 * factor).round() as usize;
    grown.min(max).max(value.min(max))
}

// -- 📈 same, rounded up, so a pool depth of 2 still moves at ×1.1
fn grow_ceil(value: usize, factor: f64, max: usize) -> usize {
    let grown = (value as f64 * factor).ceil() as usize;
    grown.min(max).max(value.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::{Preset, ProducerConfig};

    fn the_config() -> TuningConfig {
        TuningConfig {
            enabled: true,
            warmup_ms: 5000,
            period_ms: 3000,
            max_iterations: 5,
            min_workers: 4,
            max_workers: 10,
            ..ProducerConfig::from_preset(Preset::Balanced).tuning
        }
    }

    fn the_shape(workers: usize) -> PoolShape {
        PoolShape {
            workers,
            batch_size: 10_000,
            pool_depth: 8,
        }
    }

    #[test]
    fn the_one_where_a_big_gap_hires_a_crowd_but_not_past_the_cap() {
        let mut the_tuner = AutoTuner::new(the_config(), Instant::now());
        // 📉 900k short at 100k per worker wants 9, the tick caps at 8, headroom caps at 2
        let the_decision = the_tuner.evaluate(100_000.0, 0, the_shape(8));
        assert_eq!(
            the_decision,
            Some(TuningDecision {
                worker_delta: 2,
                batch_size: 10_000,
                pool_depth: 8,
            })
        );
    }

    #[test]
    fn the_one_where_each_watermark_picks_its_own_strategy() {
        let mut the_tuner = AutoTuner::new(the_config(), Instant::now());
        let the_mid = the_tuner.evaluate(500_000.0, 0, the_shape(4)).expect("🎚️ mid band tunes");
        assert_eq!(the_mid.worker_delta, 2);
        assert_eq!(the_mid.batch_size, 12_000);
        assert_eq!(the_mid.pool_depth, 8);

        let the_fine = the_tuner.evaluate(800_000.0, 0, the_shape(4)).expect("🎚️ fine band tunes");
        assert_eq!(the_fine.worker_delta, 1);
        assert_eq!(the_fine.batch_size, 11_000);
        assert_eq!(the_fine.pool_depth, 9);
    }

    #[test]
    fn the_one_where_the_high_watermark_ends_tuning_forever() {
        let mut the_tuner = AutoTuner::new(the_config(), Instant::now());
        assert_eq!(the_tuner.evaluate(1_200_000.0, 0, the_shape(4)), None);
        assert!(the_tuner.is_finished());
        // 💤 even a terrible number afterwards changes nothing
        assert_eq!(the_tuner.evaluate(10.0, 0, the_shape(4)), None);
        assert_eq!(the_tuner.next_tick(), None);
    }

    #[test]
    fn the_one_where_the_iteration_cap_stops_the_oscillation() {
        let mut the_tuner = AutoTuner::new(the_config(), Instant::now());
        for _ in 0..5 {
            assert!(the_tuner.evaluate(500_000.0, 0, the_shape(4)).is_some());
        }
        assert_eq!(the_tuner.evaluate(500_000.0, 0, the_shape(4)), None);
        assert!(the_tuner.is_finished());
        assert_eq!(the_tuner.iterations(), 5);
    }

    #[test]
    fn the_one_where_the_pool_never_leaves_its_bounds() {
        let the_config = the_config();
        for workers in the_config.min_workers..=the_config.max_workers {
            for average in [0.0, 450_000.0, 900_000.0] {
                for unstable in [0, 1, workers] {
                    let mut the_tuner = AutoTuner::new(the_config.clone(), Instant::now());
                    if let Some(decision) = the_tuner.evaluate(average, unstable, the_shape(workers)) {
                        let after = workers as i64 + decision.worker_delta;
                        assert!(after <= the_config.max_workers as i64, "{workers} + {decision:?}");
                        assert!(after >= the_config.min_workers as i64, "{workers} + {decision:?}");
                        assert!(decision.batch_size >= the_config.min_batch_size);
                        assert!(decision.batch_size <= the_config.max_batch_size);
                    }
                }
            }
        }
    }

    #[test]
    fn the_one_where_a_sick_pool_shrinks_whatever_the_throughput() {
        let mut the_tuner = AutoTuner::new(the_config(), Instant::now());
        let the_decision = the_tuner
            .evaluate(2_000_000.0, 1, the_shape(10))
            .expect("🧯 the guard should fire");
        assert_eq!(the_decision.worker_delta, -2);
        assert_eq!(the_decision.batch_size, 9000);
        assert_eq!(the_decision.pool_depth, 7);
        // ✅ shrinking is not a growth iteration
        assert_eq!(the_tuner.iterations(), 0);
        assert!(!the_tuner.is_finished());
    }

    #[test]
    fn the_one_where_nothing_happens_during_warmup() {
        let the_start = Instant::now();
        let mut the_tuner = AutoTuner::new(the_config(), the_start);
        let mut the_metrics = MetricsAggregator::new(5, the_start);
        the_metrics.push_sample(10.0);
        let the_active = [1, 2, 3, 4];
        assert_eq!(
            the_tuner.tick(the_start + Duration::from_secs(1), &the_metrics, &the_active, the_shape(4)),
            None
        );
        assert_eq!(the_tuner.iterations(), 0);
        let the_decision =
            the_tuner.tick(the_start + Duration::from_secs(6), &the_metrics, &the_active, the_shape(4));
        assert!(the_decision.is_some());
        assert_eq!(the_tuner.next_tick(), Some(the_start + Duration::from_secs(9)));
    }

    #[test]
    fn the_one_where_a_disabled_tuner_is_born_finished() {
        let mut the_config = the_config();
        the_config.enabled = false;
        let the_tuner = AutoTuner::new(the_config, Instant::now());
        assert!(the_tuner.is_finished());
    }
}
