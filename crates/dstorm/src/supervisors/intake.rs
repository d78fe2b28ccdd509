//! 📥 The IntakeSupervisor: the producer pool's quieter sibling.
//!
//! Runs one consumer worker per configured slot, each with its own
//! subscription and its own sink handle. Workers keep their buffers to
//! themselves; only counters travel up here. Dead workers are respawned after
//! the restart delay, and shutdown gets the same bounded drain as the producers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_channel::{Receiver, Sender};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::workers::{self, ConsumerSettings, ConsumerWorker, WorkerHandle};
use super::{
    ExitStatus, IntakeReport, Outcome, WorkerControl, WorkerEvent, schedule_respawn,
    sleep_until_or_never,
};
use crate::app_config::ConsumerConfig;
use crate::backends::{Broker, PointSink};
use crate::codec::Codec;
use crate::common::WorkerId;
use crate::progress::format_number;

/// 🧾 How an intake run went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeSummary {
    /// 📬 messages received, decoded or not
    pub total_consumed: u64,
    /// 🚽 points the sink confirmed
    pub total_flushed: u64,
    /// 🗑️ messages that would not decode
    pub skipped: u64,
    pub flush_failures: u64,
    pub elapsed: Duration,
    pub outcome: Outcome,
}

#[derive(Debug)]
pub struct IntakeSupervisor<B: Broker + Clone, S: PointSink + Clone> {
    config: ConsumerConfig,
    broker: B,
    sink: S,
    codec: Arc<dyn Codec>,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,
    workers: HashMap<WorkerId, WorkerHandle>,
    started: Instant,
    total_consumed: u64,
    total_flushed: u64,
    skipped: u64,
    flush_failures: u64,
    shutting_down: bool,
    force_deadline: Option<Instant>,
}

impl<B: Broker + Clone, S: PointSink + Clone> IntakeSupervisor<B, S> {
    pub fn new(config: ConsumerConfig, broker: B, sink: S, codec: Arc<dyn Codec>) -> Self {
        let (events_tx, events_rx) = async_channel::unbounded();
        Self {
            config,
            broker,
            sink,
            codec,
            events_tx,
            events_rx,
            workers: HashMap::new(),
            started: Instant::now(),
            total_consumed: 0,
            total_flushed: 0,
            skipped: 0,
            flush_failures: 0,
            shutting_down: false,
            force_deadline: None,
        }
    }

    fn spawn_worker(&mut self, worker_id: WorkerId) {
        let (control_tx, control_rx) = workers::control_channel();
        let worker = ConsumerWorker::new(
            worker_id,
            self.broker.clone(),
            ConsumerSettings::from_config(&self.config),
            self.sink.clone(),
            Arc::clone(&self.codec),
            control_rx,
            self.events_tx.clone(),
        );
        let handle = workers::start(worker, control_tx, self.events_tx.clone());
        self.workers.insert(worker_id, handle);
        debug!(worker_id, "🧵 consumer spawned");
    }

    /// 🛑 Same contract as the producer pool: idempotent, returns how many workers were told.
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
        info!(workers = told, "🛑 shutting down the intake pool");
        told
    }

    fn on_report(&mut self, worker_id: WorkerId, report: IntakeReport) {
        match report {
            IntakeReport::BatchProcessed {
                count,
                skipped,
                elapsed,
                buffered,
            } => {
                self.total_consumed += count as u64;
                self.skipped += skipped as u64;
                debug!(
                    worker_id,
                    count,
                    skipped,
                    elapsed_ms = elapsed.as_millis() as u64,
                    buffered,
                    "📦 batch processed"
                );
            }
            IntakeReport::Flushed { points, elapsed } => {
                self.total_flushed += points as u64;
                debug!(
                    worker_id,
                    points,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "🚽 flushed"
                );
            }
            IntakeReport::FlushFailed { retained, trimmed } => {
                self.flush_failures += 1;
                warn!(worker_id, retained, trimmed, "⚠️ flush failed, points kept for the next try");
            }
            IntakeReport::Health {
                buffered,
                total_flushed,
            } => {
                info!(
                    worker_id,
                    buffered,
                    total_flushed,
                    "💓 consumer health: {} points flushed so far",
                    format_number(total_flushed)
                );
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Intake { worker_id, report } => self.on_report(worker_id, report),
            WorkerEvent::Status { worker_id, state } => debug!(worker_id, ?state, "🚦 consumer status"),
            WorkerEvent::Fatal { worker_id, error } => {
                error!(worker_id, "💀 consumer hit a fatal error: {error}");
            }
            WorkerEvent::Exited { worker_id, status } => {
                self.workers.remove(&worker_id);
                match status {
                    ExitStatus::Failed(reason) if !self.shutting_down => {
                        warn!(
                            worker_id,
                            restart_in_ms = self.config.restart_delay_ms,
                            "🔁 consumer died, respawning: {reason}"
                        );
                        schedule_respawn(self.events_tx.clone(), worker_id, self.config.restart_delay());
                    }
                    ExitStatus::Failed(reason) => debug!(worker_id, "👋 consumer left with an error: {reason}"),
                    ExitStatus::Clean => debug!(worker_id, "👋 consumer left"),
                }
            }
            WorkerEvent::Respawn { worker_id } => {
                if !self.shutting_down && !self.workers.contains_key(&worker_id) {
                    info!(worker_id, "🧵 respawning consumer");
                    self.spawn_worker(worker_id);
                }
            }
            WorkerEvent::Metrics { worker_id, .. } | WorkerEvent::Error { worker_id, .. } => {
                debug!(worker_id, "🤷 producer report on the intake channel, ignoring");
            }
        }
    }

    fn finalize(&mut self, outcome: Outcome) -> IntakeSummary {
        let summary = IntakeSummary {
            total_consumed: self.total_consumed,
            total_flushed: self.total_flushed,
            skipped: self.skipped,
            flush_failures: self.flush_failures,
            elapsed: Instant::now().duration_since(self.started),
            outcome,
        };
        info!(
            consumed = summary.total_consumed,
            flushed = summary.total_flushed,
            skipped = summary.skipped,
            flush_failures = summary.flush_failures,
            ?outcome,
            "🏁 intake pool finished"
        );
        summary
    }

    /// 🚀 Consume until `shutdown` resolves, then drain every worker's buffer into the sink.
    pub async fn run<F>(mut self, shutdown: F) -> Result<IntakeSummary>
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            workers = self.config.worker_count,
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            flush_threshold = self.config.flush_threshold,
            "📥 starting intake pool"
        );
        self.started = Instant::now();
        for worker_id in 0..self.config.worker_count as WorkerId {
            self.spawn_worker(worker_id);
        }
        tokio::pin!(shutdown);

        loop {
            if self.shutting_down && self.workers.is_empty() {
                return Ok(self.finalize(Outcome::Graceful));
            }
            let force_deadline = self.force_deadline;
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(_) => bail!("💀 the consumer event channel closed under the supervisor"),
                },
                _ = &mut shutdown, if !self.shutting_down => {
                    info!("🛑 intake shutdown requested");
                    self.initiate_shutdown(Instant::now());
                }
                _ = sleep_until_or_never(force_deadline) => {
                    warn!(stragglers = self.workers.len(), "💀 intake shutdown timed out, aborting whoever is left");
                    for (_, handle) in self.workers.drain() {
                        handle.join.abort();
                    }
                    return Ok(self.finalize(Outcome::ForcedTimeout));
                }
            }
        }
    }
}
