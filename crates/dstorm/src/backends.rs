//! 🔌 Backends: where the real I/O happens (or is convincingly faked).
//!
//! 🚰 Brokers take batches in and hand deliveries out. Sinks take points and
//! write them somewhere a dashboard can find them. The engine only ever talks to
//! the traits in this file; which concrete backend answers is a config decision.
//!
//! 🎭 Same casting-agency pattern all the way down: trait → concrete impls →
//! enum dispatcher → `from_config` resolver.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::common::{Batch, Message, Point};

pub mod blackhole;
pub mod in_mem;
pub mod influx;

pub use blackhole::BlackholeBroker;
pub use in_mem::{InMemoryBroker, InMemorySink};
pub use influx::{InfluxSink, InfluxSinkConfig};

// ===== Errors =====

/// 🏷️ What kind of bad day the broker is having.
///
/// Classification comes from the connection primitive itself, so nobody has
/// to grep error strings for "Connection error" ever again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerErrorKind {
    Connection,
    Timeout,
    NotConnected,
    BrokerUnavailable,
    /// 🚧 the broker is alive but full; back off, don't reconnect
    QueueFull,
    Rejected,
    Other,
}

impl BrokerErrorKind {
    /// 🔌 Errors a fresh connection might cure.
    pub fn is_transient_connection(self) -> bool {
        matches!(
            self,
            BrokerErrorKind::Connection
                | BrokerErrorKind::Timeout
                | BrokerErrorKind::NotConnected
                | BrokerErrorKind::BrokerUnavailable
        )
    }
}

/// 💀 A broker failure with a kind you can `match` on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("broker error ({kind:?}): {message}")]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ===== Broker side =====

/// 🎫 The completion of a fire-and-forget send. Nobody awaits it in the hot
/// loop; it sits in the worker's in-flight queue until a sweep looks at it.
pub type SendCompletion = BoxFuture<'static, Result<(), BrokerError>>;

/// 📬 One batch of messages handed to a consumer, plus the offset of its last message.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub messages: Vec<Message>,
    pub last_offset: u64,
}

/// 🏢 A message broker that hands out connections.
#[async_trait]
pub trait Broker: std::fmt::Debug + Send + Sync + 'static {
    type Producer: ProducerConnection;
    type Consumer: ConsumerConnection;

    /// 🔌 Open a producer connection. Any retrying is the broker's business, not ours.
    async fn connect(&self, client_id: &str) -> Result<Self::Producer, BrokerError>;

    /// 📥 Join `group_id` and start receiving deliveries from `topic`.
    async fn subscribe(
        &self,
        group_id: &str,
        topic: &str,
        client_id: &str,
    ) -> Result<Self::Consumer, BrokerError>;
}

/// 📤 The producer half of a connection.
#[async_trait]
pub trait ProducerConnection: std::fmt::Debug + Send + 'static {
    /// 🚀 Issue a send and return immediately; the completion reports how it went.
    fn send(&mut self, topic: &str, batch: Arc<Batch>) -> SendCompletion;

    async fn disconnect(&mut self) -> Result<(), BrokerError>;
}

/// 📥 The consumer half of a connection.
#[async_trait]
pub trait ConsumerConnection: std::fmt::Debug + Send + 'static {
    /// 📬 Wait for the next delivery. `None` means the subscription is over.
    /// Must be cancel-safe: it races a flush timer in the consumer loop.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError>;

    /// ✅ Mark everything up to and including `offset` as consumed.
    async fn resolve_offset(&mut self, offset: u64) -> Result<(), BrokerError>;

    async fn heartbeat(&mut self) -> Result<(), BrokerError>;

    async fn disconnect(&mut self) -> Result<(), BrokerError>;
}

/// ⚙️ Which broker to talk to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrokerConfig {
    /// 🧠 bounded in-process topics; `capacity` is in batches
    InMemory {
        #[serde(default = "default_in_memory_capacity")]
        capacity: usize,
    },
    /// 🕳️ accepts everything, delivers nothing
    Blackhole,
}

fn default_in_memory_capacity() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig::Blackhole
    }
}

/// 🎭 The many faces of a broker.
#[derive(Debug, Clone)]
pub enum BrokerBackend {
    InMemory(InMemoryBroker),
    Blackhole(BlackholeBroker),
}

impl BrokerBackend {
    pub fn from_config(config: &BrokerConfig) -> Self {
        match config {
            BrokerConfig::InMemory { capacity } => {
                BrokerBackend::InMemory(InMemoryBroker::new(*capacity))
            }
            BrokerConfig::Blackhole => BrokerBackend::Blackhole(BlackholeBroker::default()),
        }
    }
}

#[derive(Debug)]
pub enum ProducerBackend {
    InMemory(in_mem::InMemoryProducer),
    Blackhole(blackhole::BlackholeProducer),
}

#[derive(Debug)]
pub enum ConsumerBackend {
    InMemory(in_mem::InMemoryConsumer),
    Blackhole(blackhole::BlackholeConsumer),
}

#[async_trait]
impl Broker for BrokerBackend {
    type Producer = ProducerBackend;
    type Consumer = ConsumerBackend;

    async fn connect(&self, client_id: &str) -> Result<ProducerBackend, BrokerError> {
        match self {
            BrokerBackend::InMemory(b) => b.connect(client_id).await.map(ProducerBackend::InMemory),
            BrokerBackend::Blackhole(b) => b.connect(client_id).await.map(ProducerBackend::Blackhole),
        }
    }

    async fn subscribe(
        &self,
        group_id: &str,
        topic: &str,
        client_id: &str,
    ) -> Result<ConsumerBackend, BrokerError> {
        match self {
            BrokerBackend::InMemory(b) => b
                .subscribe(group_id, topic, client_id)
                .await
                .map(ConsumerBackend::InMemory),
            BrokerBackend::Blackhole(b) => b
                .subscribe(group_id, topic, client_id)
                .await
                .map(ConsumerBackend::Blackhole),
        }
    }
}

#[async_trait]
impl ProducerConnection for ProducerBackend {
    fn send(&mut self, topic: &str, batch: Arc<Batch>) -> SendCompletion {
        match self {
            ProducerBackend::InMemory(p) => p.send(topic, batch),
            ProducerBackend::Blackhole(p) => p.send(topic, batch),
        }
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        match self {
            ProducerBackend::InMemory(p) => p.disconnect().await,
            ProducerBackend::Blackhole(p) => p.disconnect().await,
        }
    }
}

#[async_trait]
impl ConsumerConnection for ConsumerBackend {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        match self {
            ConsumerBackend::InMemory(c) => c.next_delivery().await,
            ConsumerBackend::Blackhole(c) => c.next_delivery().await,
        }
    }

    async fn resolve_offset(&mut self, offset: u64) -> Result<(), BrokerError> {
        match self {
            ConsumerBackend::InMemory(c) => c.resolve_offset(offset).await,
            ConsumerBackend::Blackhole(c) => c.resolve_offset(offset).await,
        }
    }

    async fn heartbeat(&mut self) -> Result<(), BrokerError> {
        match self {
            ConsumerBackend::InMemory(c) => c.heartbeat().await,
            ConsumerBackend::Blackhole(c) => c.heartbeat().await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        match self {
            ConsumerBackend::InMemory(c) => c.disconnect().await,
            ConsumerBackend::Blackhole(c) => c.disconnect().await,
        }
    }
}

// ===== Sink side =====

/// 🕳️ A time-series sink.
///
/// # Contract
/// - `write_points` stages points; nothing is durable until `flush` succeeds.
/// - a failed `flush` drops whatever was staged; the caller still holds its own copy.
/// - `close` MUST be called. Skipping it is a bug. It is also considered rude.
#[async_trait]
pub trait PointSink: std::fmt::Debug + Send + 'static {
    async fn write_points(&mut self, points: &[Point]) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// ⚙️ Which sink to write to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum SinkConfig {
    #[default]
    InMemory,
    Influx(InfluxSinkConfig),
}

/// 🎭 The many faces of a sink. Cloning hands out a fresh writer for another
/// worker; in-memory clones all land in the same shared vault.
#[derive(Debug, Clone)]
pub enum SinkBackend {
    InMemory(InMemorySink),
    Influx(InfluxSink),
}

impl SinkBackend {
    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        Ok(match config {
            SinkConfig::InMemory => SinkBackend::InMemory(InMemorySink::default()),
            SinkConfig::Influx(influx) => SinkBackend::Influx(InfluxSink::new(influx.clone())?),
        })
    }
}

#[async_trait]
impl PointSink for SinkBackend {
    async fn write_points(&mut self, points: &[Point]) -> Result<()> {
        match self {
            SinkBackend::InMemory(sink) => sink.write_points(points).await,
            SinkBackend::Influx(sink) => sink.write_points(points).await,
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            SinkBackend::InMemory(sink) => sink.flush().await,
            SinkBackend::Influx(sink) => sink.flush().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            SinkBackend::InMemory(sink) => sink.close().await,
            SinkBackend::Influx(sink) => sink.close().await,
        }
    }
}
