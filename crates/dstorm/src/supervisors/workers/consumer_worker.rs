//! 🎬 *[a delivery lands. somewhere, a sink waits.]*
//! *[the clock on the wall reads 2:47am.]*
//!
//! 🗑️ The ConsumerWorker: patient, tireless, and deeply unbothered by the chaos
//! happening upstream. It receives deliveries, decodes them into its buffer,
//! marks them consumed, and flushes when the buffer is full or the timer says so.
//!
//! ⚠️ The read position moves as soon as a delivery is buffered, before the
//! sink has confirmed anything. A crash between the two loses whatever was
//! sitting in the buffer. Known trade, kept on purpose.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::Worker;
use crate::app_config::ConsumerConfig;
use crate::backends::{Broker, ConsumerConnection, PointSink};
use crate::codec::Codec;
use crate::common::WorkerId;
use crate::consumer_buffer::{ConsumerBuffer, FlushOutcome};
use crate::supervisors::{IntakeReport, WorkerControl, WorkerEvent, WorkerState};

#[derive(Debug, Clone)]
pub(in crate::supervisors) struct ConsumerSettings {
    pub topic: String,
    pub group_id: String,
    pub client_id: String,
    pub flush_threshold: usize,
    pub flush_interval: Duration,
    pub health_interval: Duration,
    pub decode_parallelism: usize,
}

impl ConsumerSettings {
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            group_id: config.group_id.clone(),
            client_id: config.client_id.clone(),
            flush_threshold: config.flush_threshold,
            flush_interval: config.flush_interval(),
            health_interval: config.health_interval(),
            decode_parallelism: config.decode_parallelism(),
        }
    }
}

/// 📥 One consuming worker with its own subscription, buffer and sink handle.
#[derive(Debug)]
pub(in crate::supervisors) struct ConsumerWorker<B: Broker, S> {
    id: WorkerId,
    broker: B,
    settings: ConsumerSettings,
    buffer: ConsumerBuffer<S>,
    control: Receiver<WorkerControl>,
    events: Sender<WorkerEvent>,
}

impl<B: Broker, S: PointSink> ConsumerWorker<B, S> {
    pub fn new(
        id: WorkerId,
        broker: B,
        settings: ConsumerSettings,
        sink: S,
        codec: Arc<dyn Codec>,
        control: Receiver<WorkerControl>,
        events: Sender<WorkerEvent>,
    ) -> Self {
        let buffer = ConsumerBuffer::new(
            sink,
            codec,
            settings.flush_threshold,
            settings.decode_parallelism,
        );
        Self {
            id,
            broker,
            settings,
            buffer,
            control,
            events,
        }
    }

    async fn emit(&mut self, event: WorkerEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn report(&mut self, report: IntakeReport) -> bool {
        self.emit(WorkerEvent::Intake {
            worker_id: self.id,
            report,
        })
        .await
    }

    async fn status(&mut self, state: WorkerState) -> bool {
        self.emit(WorkerEvent::Status {
            worker_id: self.id,
            state,
        })
        .await
    }

    /// 🚽 Flush and tell the supervisor how it went.
    async fn flush(&mut self) -> bool {
        match self.buffer.flush().await {
            FlushOutcome::Empty => true,
            FlushOutcome::Flushed { points, elapsed } => {
                self.report(IntakeReport::Flushed { points, elapsed }).await
            }
            FlushOutcome::Failed { retained, trimmed } => {
                self.report(IntakeReport::FlushFailed { retained, trimmed })
                    .await
            }
        }
    }
}

#[async_trait]
impl<B: Broker, S: PointSink> Worker for ConsumerWorker<B, S> {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn run(mut self) -> Result<()> {
        self.status(WorkerState::Connecting).await;
        let mut consumer = match self
            .broker
            .subscribe(
                &self.settings.group_id,
                &self.settings.topic,
                &self.settings.client_id,
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(worker_id = self.id, "💀 subscribe failed: {err}");
                self.emit(WorkerEvent::Fatal {
                    worker_id: self.id,
                    error: err.to_string(),
                })
                .await;
                return Err(err)
                    .with_context(|| format!("💀 consumer {} could not subscribe", self.id));
            }
        };
        self.status(WorkerState::Running).await;
        info!(
            worker_id = self.id,
            topic = %self.settings.topic,
            group_id = %self.settings.group_id,
            "📥 consumer subscribed"
        );

        let mut flush_tick = tokio::time::interval_at(
            Instant::now() + self.settings.flush_interval,
            self.settings.flush_interval,
        );
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health_tick = tokio::time::interval_at(
            Instant::now() + self.settings.health_interval,
            self.settings.health_interval,
        );
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut failure = None;
        loop {
            tokio::select! {
                message = self.control.recv() => match message {
                    Ok(WorkerControl::Shutdown) | Err(_) => break,
                    Ok(WorkerControl::UpdateConfig { .. }) => {
                        debug!(worker_id = self.id, "🤷 consumers have no batch pool to resize");
                    }
                },
                delivery = consumer.next_delivery() => match delivery {
                    Ok(Some(delivery)) => {
                        let started = Instant::now();
                        let last_offset = delivery.last_offset;
                        let outcome = self.buffer.ingest_batch(delivery.messages).await?;
                        // -- ⚠️ committed before the flush; see the module docs
                        if let Err(err) = consumer.resolve_offset(last_offset).await {
                            warn!(worker_id = self.id, "⚠️ could not resolve offset {last_offset}: {err}");
                        }
                        if let Err(err) = consumer.heartbeat().await {
                            debug!(worker_id = self.id, "💓 heartbeat failed: {err}");
                        }
                        let alive = self
                            .report(IntakeReport::BatchProcessed {
                                count: outcome.decoded + outcome.skipped,
                                skipped: outcome.skipped,
                                elapsed: started.elapsed(),
                                buffered: self.buffer.len(),
                            })
                            .await;
                        if !alive {
                            break;
                        }
                        if self.buffer.should_flush() && !self.flush().await {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!(worker_id = self.id, "🏁 subscription ended");
                        break;
                    }
                    Err(err) if err.kind.is_transient_connection() => {
                        failure = Some(err);
                        break;
                    }
                    Err(err) => {
                        warn!(worker_id = self.id, "⚠️ delivery failed: {err}");
                    }
                },
                _ = flush_tick.tick() => {
                    if !self.flush().await {
                        break;
                    }
                }
                _ = health_tick.tick() => {
                    let report = IntakeReport::Health {
                        buffered: self.buffer.len(),
                        total_flushed: self.buffer.flushed_count(),
                    };
                    if !self.report(report).await {
                        break;
                    }
                }
            }
        }

        self.status(WorkerState::ShuttingDown).await;
        let flushed_before = self.buffer.flushed_count();
        let total_flushed = self.buffer.close().await?;
        if total_flushed > flushed_before {
            self.report(IntakeReport::Flushed {
                points: (total_flushed - flushed_before) as usize,
                elapsed: Duration::ZERO,
            })
            .await;
        }
        if let Err(err) = consumer.disconnect().await {
            warn!(worker_id = self.id, "⚠️ disconnect on shutdown failed: {err}");
        }
        match failure {
            Some(err) => Err(err).with_context(|| {
                format!("💀 consumer {} lost its connection to the broker", self.id)
            }),
            None => {
                debug!(worker_id = self.id, total_flushed, "👋 consumer worker done");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryBroker, InMemorySink, ProducerConnection};
    use crate::codec::JsonCodec;
    use crate::common::{Batch, Message, RecordTemplate};
    use crate::supervisors::workers::control_channel;

    fn the_settings(threshold: usize) -> ConsumerSettings {
        ConsumerSettings {
            topic: "t".to_string(),
            group_id: "g".to_string(),
            client_id: "c".to_string(),
            flush_threshold: threshold,
            flush_interval: Duration::from_millis(100),
            health_interval: Duration::from_secs(10),
            decode_parallelism: 2,
        }
    }

    fn the_batch(n: usize) -> Arc<Batch> {
        let the_template = RecordTemplate::default();
        let messages = (0..n)
            .map(|i| {
                Message::from(
                    JsonCodec
                        .encode(&the_template.stamp(i as u64))
                        .expect("💀 encoding a template record cannot fail"),
                )
            })
            .collect();
        Arc::new(Batch::new(messages))
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_deliveries_are_committed_then_flushed() {
        let the_broker = InMemoryBroker::new(16);
        let the_sink = InMemorySink::default();
        let (the_control, control_rx) = control_channel();
        let (events_tx, the_events) = async_channel::unbounded();
        let the_worker = ConsumerWorker::new(
            1,
            the_broker.clone(),
            the_settings(5),
            the_sink.clone(),
            Arc::new(JsonCodec),
            control_rx,
            events_tx,
        );
        let the_task = tokio::spawn(the_worker.run());

        let mut the_producer = the_broker.connect("p").await.expect("🔌 in-memory connect");
        the_producer
            .send("t", the_batch(3))
            .await
            .expect("📤 room in the queue");
        the_producer
            .send("t", the_batch(4))
            .await
            .expect("📤 room in the queue");

        tokio::time::sleep(Duration::from_millis(10)).await;
        // ✅ 7 ≥ threshold of 5: the size trigger fired, offsets are committed
        assert_eq!(the_sink.flushed_count().await, 7);
        assert_eq!(the_broker.committed_offset("g", "t"), Some(6));

        the_producer
            .send("t", the_batch(2))
            .await
            .expect("📤 room in the queue");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(the_sink.flushed_count().await, 7);
        // ⏰ below threshold, so it waits for the timer
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(the_sink.flushed_count().await, 9);

        the_control.send(WorkerControl::Shutdown).await.expect("📮 worker is listening");
        the_task
            .await
            .expect("💀 worker task should not panic")
            .expect("💀 worker should exit cleanly");

        let the_processed: usize = std::iter::from_fn(|| the_events.try_recv().ok())
            .map(|event| match event {
                WorkerEvent::Intake {
                    report: IntakeReport::BatchProcessed { count, .. },
                    ..
                } => count,
                _ => 0,
            })
            .sum();
        assert_eq!(the_processed, 9);
    }

    #[tokio::test]
    async fn the_one_where_shutdown_flushes_the_leftovers() {
        let the_broker = InMemoryBroker::new(16);
        let the_sink = InMemorySink::default();
        let (the_control, control_rx) = control_channel();
        let (events_tx, _the_events) = async_channel::unbounded();
        let mut the_settings = the_settings(1000);
        the_settings.flush_interval = Duration::from_secs(3600);
        let the_worker = ConsumerWorker::new(
            1,
            the_broker.clone(),
            the_settings,
            the_sink.clone(),
            Arc::new(JsonCodec),
            control_rx,
            events_tx,
        );
        let the_task = tokio::spawn(the_worker.run());

        let mut the_producer = the_broker.connect("p").await.expect("🔌 in-memory connect");
        the_producer
            .send("t", the_batch(3))
            .await
            .expect("📤 room in the queue");
        // 💤 give the consumer a moment to pick it up
        while the_broker.queued_batches("t") > 0 {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;

        the_control.send(WorkerControl::Shutdown).await.expect("📮 worker is listening");
        the_task
            .await
            .expect("💀 worker task should not panic")
            .expect("💀 worker should exit cleanly");
        assert_eq!(the_sink.flushed_count().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_health_check_reports_on_schedule() {
        let the_broker = InMemoryBroker::new(16);
        let the_sink = InMemorySink::default();
        let (the_control, control_rx) = control_channel();
        let (events_tx, the_events) = async_channel::unbounded();
        let mut the_settings = the_settings(1000);
        the_settings.flush_interval = Duration::from_secs(3600);
        the_settings.health_interval = Duration::from_millis(50);
        let the_worker = ConsumerWorker::new(
            1,
            the_broker.clone(),
            the_settings,
            the_sink.clone(),
            Arc::new(JsonCodec),
            control_rx,
            events_tx,
        );
        let the_task = tokio::spawn(the_worker.run());

        let mut the_producer = the_broker.connect("p").await.expect("🔌 in-memory connect");
        the_producer
            .send("t", the_batch(3))
            .await
            .expect("📤 room in the queue");
        tokio::time::sleep(Duration::from_millis(120)).await;

        the_control.send(WorkerControl::Shutdown).await.expect("📮 worker is listening");
        the_task
            .await
            .expect("💀 worker task should not panic")
            .expect("💀 worker should exit cleanly");

        let the_checkups: Vec<(usize, u64)> = std::iter::from_fn(|| the_events.try_recv().ok())
            .filter_map(|event| match event {
                WorkerEvent::Intake {
                    worker_id: 1,
                    report: IntakeReport::Health {
                        buffered,
                        total_flushed,
                    },
                } => Some((buffered, total_flushed)),
                _ => None,
            })
            .collect();
        // 💓 at 50ms and 100ms: three points waiting, nothing flushed yet
        assert_eq!(the_checkups, vec![(3, 0), (3, 0)]);
    }
}
