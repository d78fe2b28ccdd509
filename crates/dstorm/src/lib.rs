//! 🌩️ dstorm: a load harness that throws synthetic tweets at a message queue
//! as fast as it will take them, and an intake pool that catches them on the
//! other side and pours them into a time-series sink.
//!
//! 🚀 Three ways in:
//!   - [`run_producer`]: the adaptive producer pool against the configured broker
//!   - [`run_consumer`]: the intake pool against the configured broker and sink
//!   - [`run_pipeline`]: both, in one process, over a shared in-memory broker
//!
//! All three stop on SIGINT/SIGTERM. The producer also stops on its own once the
//! target record count has been sent. 🦆

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tracing::{info, warn};

pub mod app_config;
pub mod backends;
pub mod batch_factory;
pub mod codec;
pub mod common;
pub mod consumer_buffer;
pub mod metrics;
mod progress;
pub mod shutdown;
pub mod supervisors;
pub mod tuner;

pub use supervisors::{IntakeSummary, Outcome, RunSummary};

use crate::app_config::AppConfig;
use crate::backends::{BrokerBackend, BrokerConfig, InMemoryBroker, SinkBackend};
use crate::codec::{Codec, JsonCodec};
use crate::shutdown::{ShutdownCoordinator, shutdown_signal};
use crate::supervisors::{IntakeSupervisor, PoolSupervisor};

// -- 🛑 resolves on the first signal; if the handlers cannot be installed, never
async fn until_signalled() {
    if let Err(err) = shutdown_signal().await {
        warn!("⚠️ signal handlers unavailable, only the target can end this run: {err:#}");
        futures::future::pending::<()>().await;
    }
}

/// 🚀 Run the producer pool until the target is reached or a signal arrives.
pub async fn run_producer(app_config: AppConfig) -> Result<RunSummary> {
    let broker = BrokerBackend::from_config(&app_config.broker);
    let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
    PoolSupervisor::new(app_config.producer, broker, codec)
        .run(until_signalled())
        .await
        .context("💀 the producer pool fell over")
}

/// 📥 Run the intake pool until a signal arrives.
pub async fn run_consumer(app_config: AppConfig) -> Result<IntakeSummary> {
    if app_config.broker == BrokerConfig::Blackhole {
        warn!("🕳️ consuming from the blackhole broker; nothing will ever arrive");
    }
    let broker = BrokerBackend::from_config(&app_config.broker);
    let sink = SinkBackend::from_config(&app_config.sink).context("💀 could not build the sink")?;
    let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
    IntakeSupervisor::new(app_config.consumer, broker, sink, codec)
        .run(until_signalled())
        .await
        .context("💀 the intake pool fell over")
}

/// 🔁 Producer and intake pools in one process over a shared in-memory broker.
///
/// The intake pool keeps going after the producers stop, until the topic is
/// empty or the consumer shutdown timeout runs out, so the tail end of the run
/// still reaches the sink.
pub async fn run_pipeline(app_config: AppConfig) -> Result<(RunSummary, IntakeSummary)> {
    let capacity = match app_config.broker {
        BrokerConfig::InMemory { capacity } => capacity,
        BrokerConfig::Blackhole => {
            warn!("🕳️ pipeline mode needs a broker that delivers; using an in-memory one instead");
            1024
        }
    };
    let broker = InMemoryBroker::new(capacity);
    let sink = SinkBackend::from_config(&app_config.sink).context("💀 could not build the sink")?;
    let codec: Arc<dyn Codec> = Arc::new(JsonCodec);

    let stop_producers = ShutdownCoordinator::new();
    let stop_consumers = ShutdownCoordinator::new();
    let listener = {
        let stop_producers = stop_producers.clone();
        let stop_consumers = stop_consumers.clone();
        tokio::spawn(async move {
            until_signalled().await;
            stop_producers.trigger();
            stop_consumers.trigger();
        })
    };

    let topic = app_config.producer.topic.clone();
    if topic != app_config.consumer.topic {
        warn!(
            producer_topic = %topic,
            consumer_topic = %app_config.consumer.topic,
            "⚠️ producer and consumer topics differ; the intake pool will sit idle"
        );
    }
    let drain_timeout = app_config.consumer.shutdown_timeout();
    info!(topic = %topic, capacity, "🔁 starting pipeline over an in-memory broker");

    let producers = PoolSupervisor::new(app_config.producer, broker.clone(), Arc::clone(&codec));
    let intake = IntakeSupervisor::new(app_config.consumer, broker.clone(), sink, codec);

    let producing = async {
        let summary = producers.run(stop_producers.wait()).await;
        wait_for_drain(&broker, &topic, drain_timeout).await;
        stop_consumers.trigger();
        summary
    };
    let (produced, consumed) = tokio::join!(producing, intake.run(stop_consumers.wait()));
    listener.abort();

    Ok((
        produced.context("💀 the producer pool fell over")?,
        consumed.context("💀 the intake pool fell over")?,
    ))
}

// -- 💤 poll until the topic is empty, or give up at the deadline
async fn wait_for_drain(broker: &InMemoryBroker, topic: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while broker.queued_batches(topic) > 0 {
        if Instant::now() >= deadline {
            warn!(
                left_behind = broker.queued_batches(topic),
                "⚠️ intake did not drain the topic in time"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::Preset;
    use crate::backends::{Broker, ProducerConnection};
    use crate::common::Batch;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn the_one_where_the_pipeline_delivers_what_it_sends() {
        let mut the_config = AppConfig::from_preset(Preset::Baseline);
        the_config.broker = BrokerConfig::InMemory { capacity: 4096 };
        the_config.producer.worker_count = 2;
        the_config.producer.batch_size = 100;
        the_config.producer.pool_depth = 2;
        the_config.producer.target_records = 5_000;
        the_config.producer.max_in_flight = 1;
        the_config.producer.yield_every_batches = 1;
        the_config.producer.report_interval_ms = 5;
        the_config.producer.status_interval_ms = 50;
        the_config.consumer.worker_count = 2;
        the_config.consumer.flush_threshold = 500;
        the_config.consumer.flush_interval_ms = 20;

        let (the_run, the_intake) = run_pipeline(the_config)
            .await
            .expect("💀 the pipeline should finish on its own");

        assert_eq!(the_run.outcome, Outcome::Graceful);
        assert_eq!(the_intake.outcome, Outcome::Graceful);
        assert!(the_run.total_sent >= 5_000);
        assert_eq!(the_intake.total_consumed, the_run.total_sent);
        assert_eq!(the_intake.total_flushed, the_intake.total_consumed);
        assert_eq!(the_intake.skipped, 0);
    }

    #[tokio::test]
    async fn the_one_where_drain_gives_up_at_the_deadline() {
        let the_broker = InMemoryBroker::new(4);
        let mut the_producer = the_broker.connect("p").await.expect("🔌 in-memory connect");
        the_producer
            .send("stuck", Arc::new(Batch::default()))
            .await
            .expect("📤 room in the queue");

        let the_start = Instant::now();
        wait_for_drain(&the_broker, "stuck", Duration::from_millis(60)).await;
        assert!(the_start.elapsed() >= Duration::from_millis(60));
        assert_eq!(the_broker.queued_batches("stuck"), 1);
    }
}
