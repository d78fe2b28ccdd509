//! 🎬 *[a pool of batches sits on the rack. a connection hums.]*
//! *[the worker grabs a batch, throws it at the broker, and does not look back.]*
//!
//! 🚀 The ProducerWorker: one connection, one rack of pre-built batches, one
//! tight loop. Sends are fire-and-forget; their completions pile up in a bounded
//! in-flight queue that gets swept between sends, so failures are still seen
//! without ever waiting on the happy path.
//!
//! 🧯 Too many failures and the worker backs off until a deadline. If the
//! failures smell like a dead connection it also reconnects, one attempt at a
//! time, forever, until somebody tells it to stop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender, TryRecvError};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::Worker;
use crate::app_config::{BackoffConfig, GenerationConfig, ProducerConfig};
use crate::backends::{Broker, BrokerError, ProducerConnection, SendCompletion};
use crate::batch_factory::BatchFactory;
use crate::codec::Codec;
use crate::common::{Batch, RecordTemplate, WorkerId};
use crate::supervisors::{WorkerControl, WorkerEvent, WorkerState};

/// 🔧 Everything a producer worker needs to know, frozen at spawn.
#[derive(Debug, Clone)]
pub(in crate::supervisors) struct ProducerSettings {
    pub topic: String,
    pub client_id: String,
    pub batch_size: usize,
    pub pool_depth: usize,
    pub report_interval: Duration,
    pub yield_every_batches: usize,
    pub max_in_flight: usize,
    pub backoff: BackoffConfig,
    pub generation: GenerationConfig,
}

impl ProducerSettings {
    /// 🎛️ Worker settings from the pool config, with the supervisor's current tuned shape.
    pub fn from_config(config: &ProducerConfig, batch_size: usize, pool_depth: usize) -> Self {
        Self {
            topic: config.topic.clone(),
            client_id: config.client_id.clone(),
            batch_size,
            pool_depth,
            report_interval: config.report_interval(),
            yield_every_batches: config.yield_every_batches,
            max_in_flight: config.max_in_flight.max(1),
            backoff: config.backoff.clone(),
            generation: config.generation.clone(),
        }
    }
}

/// 🚀 One producing worker. Owns its connection and its batches outright.
#[derive(Debug)]
pub(in crate::supervisors) struct ProducerWorker<B: Broker> {
    id: WorkerId,
    broker: B,
    settings: ProducerSettings,
    factory: BatchFactory,
    connection: Option<B::Producer>,
    pool: Vec<Arc<Batch>>,
    index: usize,
    pending_config: Option<(usize, usize)>,
    in_flight: FuturesUnordered<SendCompletion>,
    batches_sent: u64,
    unreported: u64,
    last_report: Instant,
    errors_since_report: u64,
    last_error: Option<BrokerError>,
    error_count: u32,
    backoff_until: Option<Instant>,
    reconnecting: bool,
    shutting_down: bool,
    state: WorkerState,
    control: Receiver<WorkerControl>,
    events: Sender<WorkerEvent>,
}

impl<B: Broker> ProducerWorker<B> {
    pub fn new(
        id: WorkerId,
        broker: B,
        settings: ProducerSettings,
        codec: Arc<dyn Codec>,
        control: Receiver<WorkerControl>,
        events: Sender<WorkerEvent>,
    ) -> Result<Self> {
        let template = RecordTemplate {
            identifier: format!("{}-{}", settings.client_id, id),
            ..RecordTemplate::default()
        };
        let mut factory = BatchFactory::new(&settings.generation, template, codec)
            .with_context(|| format!("💀 worker {id} could not build its batch factory"))?;
        let pool = factory
            .build_pool(settings.batch_size, settings.pool_depth)
            .with_context(|| format!("💀 worker {id} could not build its batch pool"))?;
        Ok(Self {
            id,
            broker,
            settings,
            factory,
            connection: None,
            pool,
            index: 0,
            pending_config: None,
            in_flight: FuturesUnordered::new(),
            batches_sent: 0,
            unreported: 0,
            last_report: Instant::now(),
            errors_since_report: 0,
            last_error: None,
            error_count: 0,
            backoff_until: None,
            reconnecting: false,
            shutting_down: false,
            state: WorkerState::Connecting,
            control,
            events,
        })
    }

    async fn emit(&mut self, event: WorkerEvent) {
        if self.events.send(event).await.is_err() {
            // -- 🔚 nobody is listening; a worker without a supervisor has no reason to go on
            self.shutting_down = true;
        }
    }

    async fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            self.state = state;
            self.emit(WorkerEvent::Status {
                worker_id: self.id,
                state,
            })
            .await;
        }
    }

    fn apply_control(&mut self, message: WorkerControl) {
        match message {
            WorkerControl::Shutdown => self.shutting_down = true,
            WorkerControl::UpdateConfig {
                batch_size,
                pool_depth,
            } => self.pending_config = Some((batch_size, pool_depth)),
        }
    }

    // -- 📮 drain the control channel without waiting; only ever called at loop boundaries
    fn poll_control(&mut self) {
        loop {
            match self.control.try_recv() {
                Ok(message) => self.apply_control(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    self.shutting_down = true;
                    break;
                }
            }
        }
    }

    /// 💤 Wait until `deadline`, still listening for control messages.
    async fn pause_until(&mut self, deadline: Instant) {
        while !self.shutting_down {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                message = self.control.recv() => match message {
                    Ok(message) => self.apply_control(message),
                    Err(_) => self.shutting_down = true,
                },
            }
        }
    }

    /// 🔧 Rebuild the pool. Only called between iterations, never mid-send.
    fn reconfigure(&mut self, batch_size: usize, pool_depth: usize) -> Result<()> {
        self.pool = self
            .factory
            .build_pool(batch_size, pool_depth)
            .with_context(|| format!("💀 worker {} could not rebuild its batch pool", self.id))?;
        self.index = 0;
        self.settings.batch_size = batch_size;
        self.settings.pool_depth = pool_depth;
        info!(worker_id = self.id, batch_size, pool_depth, "🔧 worker reconfigured");
        Ok(())
    }

    /// 🔄 Round-robin: hand out the current slot and move on.
    fn next_slot(&mut self) -> usize {
        let slot = self.index;
        self.index = (self.index + 1) % self.pool.len();
        slot
    }

    fn send_next(&mut self) -> Result<()> {
        if self.connection.is_none() {
            return Ok(());
        }
        let slot = self.next_slot();
        // -- 🎨 refresh in place only when nobody else holds the batch; a batch still
        // -- referenced by an in-flight send goes out again as it is, never copied
        if self.factory.is_dynamic() {
            if let Some(batch) = Arc::get_mut(&mut self.pool[slot]) {
                self.factory.refresh_slot(batch)?;
            }
        }
        let batch = Arc::clone(&self.pool[slot]);
        self.unreported += batch.len() as u64;
        if let Some(connection) = self.connection.as_mut() {
            self.in_flight.push(connection.send(&self.settings.topic, batch));
        }
        Ok(())
    }

    // -- 🧹 look at whatever completions are ready, wait for none of them
    fn sweep_completions(&mut self) {
        let now = Instant::now();
        while let Some(Some(result)) = self.in_flight.next().now_or_never() {
            if let Err(err) = result {
                self.on_send_error(err, now);
            }
        }
    }

    /// 💀 Count a failed send; back off past the ceiling and reconnect if the
    /// connection looks gone.
    fn on_send_error(&mut self, err: BrokerError, now: Instant) {
        self.error_count += 1;
        self.errors_since_report += 1;
        if self.error_count > self.settings.backoff.max_errors {
            let in_backoff = self.backoff_until.is_some_and(|deadline| now < deadline);
            if !in_backoff {
                let deadline = now + self.settings.backoff.backoff();
                warn!(
                    worker_id = self.id,
                    errors = self.error_count,
                    backoff_ms = self.settings.backoff.backoff_ms,
                    "🧯 too many send errors, backing off: {err}"
                );
                self.backoff_until = Some(deadline);
                self.error_count = 0;
            }
            if err.kind.is_transient_connection() && self.request_reconnect() {
                info!(worker_id = self.id, "🔌 connection looks gone, reconnect scheduled");
            }
        }
        self.last_error = Some(err);
    }

    /// 🔒 Ask for a reconnect. `false` if one is already pending or running.
    fn request_reconnect(&mut self) -> bool {
        if self.reconnecting {
            return false;
        }
        self.reconnecting = true;
        true
    }

    /// 🔁 One reconnect attempt: drop the old connection, wait, connect. On
    /// failure the flag stays up and the loop tries again.
    async fn reconnect(&mut self) {
        self.set_state(WorkerState::Reconnecting).await;
        self.sweep_completions();
        if !self.in_flight.is_empty() {
            debug!(
                worker_id = self.id,
                abandoned = self.in_flight.len(),
                "🗑️ dropping completions from the old connection"
            );
            self.in_flight.clear();
        }
        if let Some(mut old) = self.connection.take() {
            if let Err(err) = old.disconnect().await {
                debug!(worker_id = self.id, "🔌 disconnect before reconnect failed: {err}");
            }
        }

        let deadline = Instant::now() + self.settings.backoff.reconnect_backoff();
        self.pause_until(deadline).await;
        if self.shutting_down {
            return;
        }

        match self.broker.connect(&self.settings.client_id).await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.reconnecting = false;
                self.error_count = 0;
                info!(worker_id = self.id, "✅ reconnected");
                self.set_state(WorkerState::Running).await;
            }
            Err(err) => {
                warn!(
                    worker_id = self.id,
                    retry_in_ms = self.settings.backoff.reconnect_backoff_ms,
                    "🔁 reconnect failed, trying again: {err}"
                );
            }
        }
    }

    async fn maybe_report(&mut self, now: Instant) {
        if now.duration_since(self.last_report) >= self.settings.report_interval {
            self.report(now).await;
        }
    }

    /// 📊 Send `{count, elapsed}` upward and start counting from zero.
    async fn report(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_report);
        if self.unreported > 0 {
            let count = std::mem::take(&mut self.unreported);
            self.emit(WorkerEvent::Metrics {
                worker_id: self.id,
                count,
                elapsed,
            })
            .await;
        }
        if self.errors_since_report > 0 {
            let count = std::mem::take(&mut self.errors_since_report);
            if let Some(last) = self.last_error.clone() {
                self.emit(WorkerEvent::Error {
                    worker_id: self.id,
                    count,
                    last,
                })
                .await;
            }
        }
        self.last_report = now;
    }

    async fn finish(mut self) -> Result<()> {
        self.set_state(WorkerState::ShuttingDown).await;
        self.sweep_completions();
        if !self.in_flight.is_empty() {
            debug!(
                worker_id = self.id,
                in_flight = self.in_flight.len(),
                "🗑️ leaving unfinished sends behind"
            );
        }
        self.report(Instant::now()).await;
        if let Some(mut connection) = self.connection.take() {
            if let Err(err) = connection.disconnect().await {
                warn!(worker_id = self.id, "⚠️ disconnect on shutdown failed: {err}");
            }
        }
        debug!(worker_id = self.id, batches = self.batches_sent, "👋 producer worker done");
        Ok(())
    }
}

#[async_trait]
impl<B: Broker> Worker for ProducerWorker<B> {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn run(mut self) -> Result<()> {
        self.set_state(WorkerState::Connecting).await;
        match self.broker.connect(&self.settings.client_id).await {
            Ok(connection) => self.connection = Some(connection),
            Err(err) => {
                error!(worker_id = self.id, "💀 connect failed: {err}");
                self.emit(WorkerEvent::Fatal {
                    worker_id: self.id,
                    error: err.to_string(),
                })
                .await;
                return Err(err).with_context(|| format!("💀 worker {} could not connect", self.id));
            }
        }
        self.set_state(WorkerState::Running).await;
        self.last_report = Instant::now();

        loop {
            self.poll_control();
            if self.shutting_down {
                break;
            }
            if let Some((batch_size, pool_depth)) = self.pending_config.take() {
                self.reconfigure(batch_size, pool_depth)?;
            }
            if self.reconnecting {
                self.reconnect().await;
                continue;
            }
            if let Some(deadline) = self.backoff_until {
                if Instant::now() < deadline {
                    self.set_state(WorkerState::Backoff).await;
                    self.pause_until(deadline).await;
                    continue;
                }
                self.backoff_until = None;
                self.set_state(WorkerState::Running).await;
            }

            self.send_next()?;
            self.sweep_completions();
            if self.in_flight.len() >= self.settings.max_in_flight {
                // -- 🚧 the in-flight queue is full: wait for exactly one completion
                if let Some(Err(err)) = self.in_flight.next().await {
                    self.on_send_error(err, Instant::now());
                }
            }

            self.batches_sent += 1;
            let yield_every = self.settings.yield_every_batches as u64;
            if yield_every > 0 && self.batches_sent % yield_every == 0 {
                tokio::task::yield_now().await;
            }
            self.maybe_report(Instant::now()).await;
        }

        self.finish().await
    }
}
