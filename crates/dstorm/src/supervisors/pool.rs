//! 🏊 The PoolSupervisor: hires producer workers, counts what they send,
//! lets the tuner resize the pool, and turns the lights off at the end.
//!
//! 🔒 Sole owner of the worker registry and the [`MetricsAggregator`]. Every
//! worker report arrives as a [`WorkerEvent`] on one channel and is folded in
//! by this task alone, so no update is ever lost or half-applied.
//!
//! 🛑 Shutdown is cooperative with a deadline: every worker is told to stop,
//! and whoever has not left by `shutdown_timeout` gets aborted.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_channel::{Receiver, Sender};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::workers::{self, ProducerSettings, ProducerWorker, WorkerHandle};
use super::{ExitStatus, Outcome, WorkerControl, WorkerEvent, schedule_respawn, sleep_until_or_never};
use crate::app_config::ProducerConfig;
use crate::backends::Broker;
use crate::codec::Codec;
use crate::common::WorkerId;
use crate::metrics::MetricsAggregator;
use crate::progress::{StatusBoard, StatusSnapshot, Watermarks, final_report, format_number};
use crate::tuner::{AutoTuner, PoolShape, TuningDecision};

/// 🧾 How a producer run went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub total_sent: u64,
    pub elapsed: Duration,
    pub outcome: Outcome,
}

/// 🏊 Spawns, watches, restarts, retunes and finally stops the producer workers.
#[derive(Debug)]
pub struct PoolSupervisor<B: Broker + Clone> {
    config: ProducerConfig,
    broker: B,
    codec: Arc<dyn Codec>,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,
    workers: HashMap<WorkerId, WorkerHandle>,
    /// 💤 dead workers waiting out `restart_delay`; they still count toward the pool size
    pending_respawns: HashSet<WorkerId>,
    next_id: WorkerId,
    metrics: MetricsAggregator,
    tuner: AutoTuner,
    batch_size: usize,
    pool_depth: usize,
    shutting_down: bool,
    force_deadline: Option<Instant>,
    watermarks: Watermarks,
    board: StatusBoard,
}

impl<B: Broker + Clone> PoolSupervisor<B> {
    pub fn new(config: ProducerConfig, broker: B, codec: Arc<dyn Codec>) -> Self {
        let now = Instant::now();
        let (events_tx, events_rx) = async_channel::unbounded();
        let watermarks = Watermarks::from(&config.tuning);
        Self {
            metrics: MetricsAggregator::new(config.tuning.history_size, now),
            tuner: AutoTuner::new(config.tuning.clone(), now),
            batch_size: config.batch_size,
            pool_depth: config.pool_depth,
            board: StatusBoard::new(config.target_records, watermarks),
            watermarks,
            config,
            broker,
            codec,
            events_tx,
            events_rx,
            workers: HashMap::new(),
            pending_respawns: HashSet::new(),
            next_id: 0,
            shutting_down: false,
            force_deadline: None,
        }
    }

    /// 🧵 Spawn one worker with the latest tuned shape and add it to the registry.
    fn spawn_worker(&mut self, worker_id: WorkerId) {
        let (control_tx, control_rx) = workers::control_channel();
        let settings = ProducerSettings::from_config(&self.config, self.batch_size, self.pool_depth);
        match ProducerWorker::new(
            worker_id,
            self.broker.clone(),
            settings,
            Arc::clone(&self.codec),
            control_rx,
            self.events_tx.clone(),
        ) {
            Ok(worker) => {
                let handle = workers::start(worker, control_tx, self.events_tx.clone());
                self.workers.insert(worker_id, handle);
                debug!(
                    worker_id,
                    batch_size = self.batch_size,
                    pool_depth = self.pool_depth,
                    "🧵 worker spawned"
                );
            }
            Err(err) => {
                error!(worker_id, "💀 could not build worker: {err:#}");
                self.respawn_later(worker_id);
            }
        }
    }

    fn respawn_later(&mut self, worker_id: WorkerId) {
        self.pending_respawns.insert(worker_id);
        schedule_respawn(self.events_tx.clone(), worker_id, self.config.restart_delay());
    }

    fn start_pool(&mut self) {
        info!(
            workers = self.config.worker_count,
            batch_size = self.batch_size,
            pool_depth = self.pool_depth,
            target = self.config.target_records,
            "🚀 starting producer pool"
        );
        for _ in 0..self.config.worker_count {
            let worker_id = self.next_id;
            self.next_id += 1;
            self.spawn_worker(worker_id);
        }
    }

    fn active_workers(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, handle)| !handle.retiring)
            .map(|(worker_id, _)| *worker_id)
            .collect()
    }

    /// 🛑 Tell every worker to stop and arm the force-exit timer. Returns how
    /// many shutdown messages went out; a second call sends none.
    pub fn initiate_shutdown(&mut self, now: Instant) -> usize {
        if self.shutting_down {
            return 0;
        }
        self.shutting_down = true;
        self.force_deadline = Some(now + self.config.shutdown_timeout());
        let told = self
            .workers
            .values()
            .filter(|handle| handle.tell(WorkerControl::Shutdown))
            .count();
        info!(
            workers = told,
            timeout_ms = self.config.shutdown_timeout_ms,
            "🛑 shutting down the producer pool"
        );
        told
    }

    /// 🎚️ Grow, shrink and reshape the pool as the tuner asked.
    ///
    /// Shrinking cancels pending respawns first, then retires the worst
    /// performers: most errors, then the lowest throughput. Survivors get the
    /// new shape; newcomers are born with it.
    pub fn apply_tuning(&mut self, decision: TuningDecision) {
        if decision.worker_delta < 0 {
            let mut retire = decision.worker_delta.unsigned_abs() as usize;
            let cancelled: Vec<WorkerId> = self.pending_respawns.iter().copied().take(retire).collect();
            for worker_id in cancelled {
                self.pending_respawns.remove(&worker_id);
                retire -= 1;
                info!(worker_id, "🪓 cancelling respawn");
            }
            let mut candidates = self.active_workers();
            self.metrics.rank_worst(&mut candidates);
            for worker_id in candidates.into_iter().take(retire) {
                if let Some(handle) = self.workers.get_mut(&worker_id) {
                    handle.retiring = true;
                    handle.tell(WorkerControl::Shutdown);
                    info!(worker_id, "🪓 retiring worker");
                }
            }
        }

        if decision.batch_size != self.batch_size || decision.pool_depth != self.pool_depth {
            self.batch_size = decision.batch_size;
            self.pool_depth = decision.pool_depth;
            let update = WorkerControl::UpdateConfig {
                batch_size: self.batch_size,
                pool_depth: self.pool_depth,
            };
            for handle in self.workers.values().filter(|handle| !handle.retiring) {
                handle.tell(update);
            }
        }

        for _ in 0..decision.worker_delta.max(0) {
            let worker_id = self.next_id;
            self.next_id += 1;
            self.spawn_worker(worker_id);
        }
        info!(
            delta = decision.worker_delta,
            workers = self.active_workers().len(),
            batch_size = self.batch_size,
            pool_depth = self.pool_depth,
            "🎚️ tuning applied"
        );
    }

    fn check_target(&mut self, now: Instant) {
        let target = self.config.target_records;
        if self.shutting_down || target == 0 || self.metrics.total_sent() < target {
            return;
        }
        let runtime = now.duration_since(self.metrics.started());
        info!(
            total = self.metrics.total_sent(),
            runtime_secs = runtime.as_secs_f64(),
            "🎯 target of {} records reached at {} rec/s overall",
            format_number(target),
            format_number(self.metrics.overall_rate(now) as u64)
        );
        self.initiate_shutdown(now);
    }

    fn on_exit(&mut self, worker_id: WorkerId, status: ExitStatus) {
        let retiring = self
            .workers
            .remove(&worker_id)
            .is_some_and(|handle| handle.retiring);
        self.metrics.remove_worker(worker_id);
        match status {
            ExitStatus::Failed(reason) if !self.shutting_down && !retiring => {
                warn!(
                    worker_id,
                    restart_in_ms = self.config.restart_delay_ms,
                    "🔁 worker died, respawning: {reason}"
                );
                self.respawn_later(worker_id);
            }
            ExitStatus::Failed(reason) => debug!(worker_id, "👋 worker left with an error: {reason}"),
            ExitStatus::Clean => debug!(worker_id, "👋 worker left"),
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        let now = Instant::now();
        match event {
            WorkerEvent::Status { worker_id, state } => debug!(worker_id, ?state, "🚦 worker status"),
            WorkerEvent::Metrics {
                worker_id,
                count,
                elapsed,
            } => {
                self.metrics.ingest(worker_id, count, elapsed, now);
                self.check_target(now);
            }
            WorkerEvent::Error {
                worker_id,
                count,
                last,
            } => {
                self.metrics.record_errors(worker_id, count, now);
                if last.kind.is_transient_connection() {
                    warn!(worker_id, errors = count, "🔌 connection trouble: {last}");
                } else {
                    debug!(worker_id, errors = count, "💀 send errors: {last}");
                }
            }
            WorkerEvent::Fatal { worker_id, error } => {
                error!(worker_id, "💀 worker hit a fatal error: {error}");
            }
            WorkerEvent::Intake { worker_id, .. } => {
                debug!(worker_id, "🤷 intake report on the producer channel, ignoring");
            }
            WorkerEvent::Exited { worker_id, status } => self.on_exit(worker_id, status),
            WorkerEvent::Respawn { worker_id } => self.on_respawn(worker_id),
        }
    }

    fn on_respawn(&mut self, worker_id: WorkerId) {
        // -- 🪓 a respawn the tuner cancelled in the meantime is no longer wanted
        if !self.pending_respawns.remove(&worker_id)
            || self.shutting_down
            || self.workers.contains_key(&worker_id)
        {
            return;
        }
        let active = self.active_workers().len();
        if self.config.tuning.enabled && active >= self.config.tuning.max_workers {
            info!(
                worker_id,
                active,
                max_workers = self.config.tuning.max_workers,
                "🚫 pool already full, skipping respawn"
            );
            return;
        }
        info!(worker_id, "🧵 respawning worker");
        self.spawn_worker(worker_id);
    }

    fn pool_shape(&self) -> PoolShape {
        PoolShape {
            workers: self.active_workers().len() + self.pending_respawns.len(),
            batch_size: self.batch_size,
            pool_depth: self.pool_depth,
        }
    }

    fn on_status_tick(&mut self) {
        let now = Instant::now();
        let current_rate = self.metrics.record_sample(now);
        self.board.update(StatusSnapshot {
            current_rate,
            total: self.metrics.total_sent(),
            overall_rate: self.metrics.overall_rate(now),
            workers: self.workers.len(),
            elapsed: now.duration_since(self.metrics.started()),
        });
    }

    fn on_tuner_tick(&mut self) {
        let active = self.active_workers();
        let shape = self.pool_shape();
        if let Some(decision) = self.tuner.tick(Instant::now(), &self.metrics, &active, shape) {
            self.apply_tuning(decision);
        }
    }

    fn finalize(&self, outcome: Outcome) -> RunSummary {
        let elapsed = Instant::now().duration_since(self.metrics.started());
        let total_sent = self.metrics.total_sent();
        self.board.finish();
        info!(
            ?outcome,
            "🏁 producer pool finished\n{}",
            final_report(total_sent, elapsed, &self.watermarks)
        );
        RunSummary {
            total_sent,
            elapsed,
            outcome,
        }
    }

    fn force_exit(&mut self) -> RunSummary {
        warn!(
            stragglers = self.workers.len(),
            "💀 graceful shutdown timed out, aborting whoever is left"
        );
        for (_, handle) in self.workers.drain() {
            handle.join.abort();
        }
        self.finalize(Outcome::ForcedTimeout)
    }

    /// 🚀 Run the pool until the target is reached or `shutdown` resolves, then
    /// drain it. Ends `Graceful` once the last worker has exited, or
    /// `ForcedTimeout` if the timer beat them to it.
    pub async fn run<F>(mut self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()> + Send,
    {
        self.start_pool();
        tokio::pin!(shutdown);

        let status_interval = self.config.status_interval();
        let mut status_tick =
            tokio::time::interval_at(Instant::now() + status_interval, status_interval);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.shutting_down && self.workers.is_empty() {
                return Ok(self.finalize(Outcome::Graceful));
            }
            let tuner_due = if self.shutting_down {
                None
            } else {
                self.tuner.next_tick()
            };
            let force_deadline = self.force_deadline;

            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    // -- the supervisor holds a sender itself, so this is a broken invariant, not a shutdown
                    Err(_) => bail!("💀 the worker event channel closed under the supervisor"),
                },
                _ = status_tick.tick() => self.on_status_tick(),
                _ = sleep_until_or_never(tuner_due) => self.on_tuner_tick(),
                _ = &mut shutdown, if !self.shutting_down => {
                    info!("🛑 shutdown requested");
                    self.initiate_shutdown(Instant::now());
                }
                _ = sleep_until_or_never(force_deadline) => return Ok(self.force_exit()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::Preset;
    use crate::backends::BlackholeBroker;
    use crate::codec::JsonCodec;
    use crate::supervisors::scripted::{Script, ScriptedBroker};

    fn the_config(worker_count: usize) -> ProducerConfig {
        let mut config = ProducerConfig::from_preset(Preset::Baseline);
        config.worker_count = worker_count;
        config.batch_size = 10;
        config.pool_depth = 2;
        config.target_records = 0;
        config.report_interval_ms = 1;
        config.status_interval_ms = 50;
        config.yield_every_batches = 1;
        config.max_in_flight = 1;
        config.restart_delay_ms = 100;
        config.shutdown_timeout_ms = 500;
        config.tuning.enabled = false;
        config
    }

    fn the_codec() -> Arc<dyn Codec> {
        Arc::new(JsonCodec)
    }

    #[tokio::test]
    async fn the_one_where_the_target_ends_the_run_and_every_record_is_counted() {
        let mut the_config = the_config(2);
        the_config.batch_size = 100;
        the_config.target_records = 10_000;
        the_config.shutdown_timeout_ms = 10_000;
        let the_broker = BlackholeBroker::default();
        let the_supervisor = PoolSupervisor::new(the_config, the_broker.clone(), the_codec());

        let the_summary = the_supervisor
            .run(futures::future::pending())
            .await
            .expect("💀 the run itself should not fail");

        assert_eq!(the_summary.outcome, Outcome::Graceful);
        assert!(the_summary.total_sent >= 10_000);
        assert_eq!(the_summary.total_sent, the_broker.messages_swallowed());
    }

    #[tokio::test]
    async fn the_one_where_shutdown_is_announced_exactly_once_per_worker() {
        let the_broker = ScriptedBroker::new(Script {
            hanging_connect: true,
            ..Script::default()
        });
        let mut the_supervisor = PoolSupervisor::new(the_config(4), the_broker, the_codec());
        the_supervisor.start_pool();

        assert_eq!(the_supervisor.initiate_shutdown(Instant::now()), 4);
        assert_eq!(the_supervisor.initiate_shutdown(Instant::now()), 0, "idempotent");
        assert!(the_supervisor.force_deadline.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_stuck_workers_lose_to_the_force_exit_timer() {
        let the_broker = ScriptedBroker::new(Script {
            hanging_connect: true,
            ..Script::default()
        });
        let the_supervisor = PoolSupervisor::new(the_config(2), the_broker, the_codec());
        let the_start = Instant::now();

        let the_summary = the_supervisor
            .run(async {})
            .await
            .expect("💀 a forced exit is still a result");

        assert_eq!(the_summary.outcome, Outcome::ForcedTimeout);
        assert_eq!(the_summary.total_sent, 0);
        assert!(Instant::now().duration_since(the_start) >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_failed_connect_is_respawned_after_the_delay() {
        let the_broker = ScriptedBroker::new(Script {
            failing_connects: 1,
            ..Script::default()
        });
        let the_supervisor = PoolSupervisor::new(the_config(1), the_broker.clone(), the_codec());

        let the_summary = the_supervisor
            .run(tokio::time::sleep(Duration::from_millis(350)))
            .await
            .expect("💀 the run itself should not fail");

        assert_eq!(the_summary.outcome, Outcome::Graceful);
        assert_eq!(the_broker.connect_calls(), 2, "one failure, one respawn");
        assert!(the_summary.total_sent > 0);
        assert_eq!(the_summary.total_sent, the_broker.sent_messages());
    }

    #[tokio::test]
    async fn the_one_where_shrinking_retires_the_noisiest_worker() {
        let the_broker = ScriptedBroker::new(Script {
            hanging_connect: true,
            ..Script::default()
        });
        let mut the_supervisor = PoolSupervisor::new(the_config(3), the_broker, the_codec());
        the_supervisor.start_pool();
        let now = Instant::now();
        the_supervisor.metrics.ingest(0, 100, Duration::from_millis(10), now);
        the_supervisor.metrics.ingest(2, 100, Duration::from_millis(10), now);
        the_supervisor.metrics.record_errors(1, 20, now);

        the_supervisor.apply_tuning(TuningDecision {
            worker_delta: -1,
            batch_size: 10,
            pool_depth: 2,
        });
        assert!(the_supervisor.workers[&1].retiring);
        assert_eq!(the_supervisor.active_workers().len(), 2);

        the_supervisor.apply_tuning(TuningDecision {
            worker_delta: 2,
            batch_size: 20,
            pool_depth: 3,
        });
        assert_eq!(the_supervisor.workers.len(), 5);
        assert_eq!(the_supervisor.active_workers().len(), 4);
        assert_eq!(the_supervisor.batch_size, 20);
        assert_eq!(the_supervisor.next_id, 5);
    }

    #[tokio::test]
    async fn the_one_where_a_pending_respawn_still_takes_up_a_seat() {
        let the_broker = ScriptedBroker::new(Script {
            hanging_connect: true,
            ..Script::default()
        });
        let mut the_config = the_config(2);
        the_config.tuning.enabled = true;
        the_config.tuning.max_workers = 2;
        let mut the_supervisor = PoolSupervisor::new(the_config, the_broker, the_codec());
        the_supervisor.start_pool();

        the_supervisor.handle_event(WorkerEvent::Exited {
            worker_id: 0,
            status: ExitStatus::Failed("connect refused".to_string()),
        });
        assert_eq!(the_supervisor.active_workers().len(), 1);
        assert_eq!(the_supervisor.pool_shape().workers, 2, "the dead worker is coming back");

        // 🧵 something filled the seat before the delay ran out
        the_supervisor.apply_tuning(TuningDecision {
            worker_delta: 1,
            batch_size: 10,
            pool_depth: 2,
        });
        the_supervisor.handle_event(WorkerEvent::Respawn { worker_id: 0 });
        assert_eq!(the_supervisor.active_workers().len(), 2);
        assert!(!the_supervisor.workers.contains_key(&0));
        assert!(the_supervisor.pending_respawns.is_empty());

        // 🪓 a shrink eats the pending respawn before any live worker
        the_supervisor.handle_event(WorkerEvent::Exited {
            worker_id: 1,
            status: ExitStatus::Failed("connect refused".to_string()),
        });
        the_supervisor.apply_tuning(TuningDecision {
            worker_delta: -1,
            batch_size: 10,
            pool_depth: 2,
        });
        assert!(the_supervisor.pending_respawns.is_empty());
        assert_eq!(the_supervisor.active_workers(), vec![2]);
        the_supervisor.handle_event(WorkerEvent::Respawn { worker_id: 1 });
        assert!(!the_supervisor.workers.contains_key(&1), "a cancelled respawn stays cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_growth_and_respawn_together_stay_under_max_workers() {
        let the_broker = ScriptedBroker::new(Script {
            failing_connects: 1,
            ..Script::default()
        });
        let mut the_config = the_config(2);
        the_config.restart_delay_ms = 2000;
        the_config.tuning.enabled = true;
        the_config.tuning.min_workers = 1;
        the_config.tuning.max_workers = 2;
        the_config.tuning.warmup_ms = 100;
        the_config.tuning.period_ms = 100;
        let the_supervisor = PoolSupervisor::new(the_config, the_broker.clone(), the_codec());

        let the_summary = the_supervisor
            .run(tokio::time::sleep(Duration::from_millis(3000)))
            .await
            .expect("💀 the run itself should not fail");

        assert_eq!(the_summary.outcome, Outcome::Graceful);
        // ✅ two at the start, one respawn, and the tuner never hired a third
        assert_eq!(the_broker.connect_calls(), 3);
    }
}
