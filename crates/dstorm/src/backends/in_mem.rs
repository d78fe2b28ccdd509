//! # Previously, on dstorm...
//!
//! 🎬 The benchmark needed a broker. The broker needed a datacenter. The
//! datacenter needed a budget. The budget said no. So the broker moved into RAM.
//!
//! `in_mem` provides an in-process [`Broker`] and [`PointSink`]:
//! - [`InMemoryBroker`]: one bounded queue per topic, shared by every connection
//!   cloned from the same broker. Consumers of a topic compete for deliveries,
//!   which is exactly what a consumer group does, minus the rebalancing drama.
//! - [`InMemorySink`]: points land in an `Arc<Mutex<Vec<_>>>` so callers can
//!   inspect what arrived. It also has an outage switch, for rehearsing disasters.
//!
//! ✅ No network calls. No disk I/O. Just vibes and heap memory. 🦆

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_channel::{Receiver, Sender, TrySendError};
use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, trace};

use crate::backends::{
    Broker, BrokerError, BrokerErrorKind, ConsumerConnection, Delivery, PointSink,
    ProducerConnection, SendCompletion,
};
use crate::common::{Batch, Point};

/// 🧠 A broker whose whole cluster fits in a `HashMap`.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    /// 📏 per-topic queue capacity, in batches
    capacity: usize,
    topics: Mutex<HashMap<String, Topic>>,
    /// ✅ committed offsets per (group, topic)
    committed: Mutex<HashMap<(String, String), u64>>,
}

#[derive(Debug, Clone)]
struct Topic {
    tx: Sender<Arc<Batch>>,
    rx: Receiver<Arc<Batch>>,
    /// 🔢 messages handed to consumers so far; the next offset to assign
    delivered: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                capacity: capacity.max(1),
                topics: Mutex::new(HashMap::new()),
                committed: Mutex::new(HashMap::new()),
            }),
        }
    }

    // -- 🏗️ topics appear the first time anyone mentions them, like gossip
    fn topic(&self, name: &str) -> Result<Topic, BrokerError> {
        let mut topics = self
            .inner
            .topics
            .lock()
            .map_err(|_| BrokerError::new(BrokerErrorKind::BrokerUnavailable, "topic registry poisoned"))?;
        let topic = topics.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = async_channel::bounded(self.inner.capacity);
            Topic {
                tx,
                rx,
                delivered: Arc::new(AtomicU64::new(0)),
            }
        });
        Ok(topic.clone())
    }

    /// 📊 Batches currently waiting in `topic`.
    pub fn queued_batches(&self, topic: &str) -> usize {
        self.topic(topic).map(|t| t.rx.len()).unwrap_or_default()
    }

    /// ✅ Highest offset `group_id` has resolved on `topic`, if any.
    pub fn committed_offset(&self, group_id: &str, topic: &str) -> Option<u64> {
        self.inner
            .committed
            .lock()
            .ok()?
            .get(&(group_id.to_string(), topic.to_string()))
            .copied()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Producer = InMemoryProducer;
    type Consumer = InMemoryConsumer;

    async fn connect(&self, client_id: &str) -> Result<InMemoryProducer, BrokerError> {
        debug!(client_id, "🔌 in-memory producer connected");
        Ok(InMemoryProducer {
            broker: self.clone(),
            senders: HashMap::new(),
            connected: true,
        })
    }

    async fn subscribe(
        &self,
        group_id: &str,
        topic: &str,
        client_id: &str,
    ) -> Result<InMemoryConsumer, BrokerError> {
        debug!(client_id, group_id, topic, "📥 in-memory consumer subscribed");
        Ok(InMemoryConsumer {
            broker: self.clone(),
            group_id: group_id.to_string(),
            topic_name: topic.to_string(),
            topic: self.topic(topic)?,
            connected: true,
        })
    }
}

/// 📤 Producer connection into an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryProducer {
    broker: InMemoryBroker,
    /// 🗂️ cached per-topic senders so the hot path skips the registry lock
    senders: HashMap<String, Sender<Arc<Batch>>>,
    connected: bool,
}

#[async_trait]
impl ProducerConnection for InMemoryProducer {
    fn send(&mut self, topic: &str, batch: Arc<Batch>) -> SendCompletion {
        if !self.connected {
            return futures::future::ready(Err(BrokerError::new(
                BrokerErrorKind::NotConnected,
                "producer is not connected",
            )))
            .boxed();
        }
        let sender = match self.senders.get(topic) {
            Some(sender) => sender.clone(),
            None => match self.broker.topic(topic) {
                Ok(t) => {
                    self.senders.insert(topic.to_string(), t.tx.clone());
                    t.tx
                }
                Err(err) => return futures::future::ready(Err(err)).boxed(),
            },
        };
        // -- 🚀 the queue either has room right now or it doesn't. no waiting in line.
        let outcome = match sender.try_send(batch) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BrokerError::new(
                BrokerErrorKind::QueueFull,
                format!("topic '{topic}' is full"),
            )),
            Err(TrySendError::Closed(_)) => Err(BrokerError::new(
                BrokerErrorKind::BrokerUnavailable,
                format!("topic '{topic}' is closed"),
            )),
        };
        futures::future::ready(outcome).boxed()
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.connected = false;
        self.senders.clear();
        Ok(())
    }
}

/// 📥 Consumer connection out of an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group_id: String,
    topic_name: String,
    topic: Topic,
    connected: bool,
}

#[async_trait]
impl ConsumerConnection for InMemoryConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        if !self.connected {
            return Err(BrokerError::new(
                BrokerErrorKind::NotConnected,
                "consumer is not connected",
            ));
        }
        let Ok(batch) = self.topic.rx.recv().await else {
            return Ok(None);
        };
        let count = batch.len() as u64;
        let first = self.topic.delivered.fetch_add(count, Ordering::Relaxed);
        trace!(count, first, "📬 in-memory delivery");
        Ok(Some(Delivery {
            messages: batch.messages.clone(),
            last_offset: (first + count).saturating_sub(1),
        }))
    }

    async fn resolve_offset(&mut self, offset: u64) -> Result<(), BrokerError> {
        let mut committed = self
            .broker
            .inner
            .committed
            .lock()
            .map_err(|_| BrokerError::new(BrokerErrorKind::BrokerUnavailable, "offset registry poisoned"))?;
        let entry = committed
            .entry((self.group_id.clone(), self.topic_name.clone()))
            .or_insert(offset);
        *entry = (*entry).max(offset);
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<(), BrokerError> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::new(BrokerErrorKind::NotConnected, "consumer is not connected"))
        }
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.connected = false;
        Ok(())
    }
}

/// 📦 A sink that never forgets.
///
/// Clones share the same vault, so one handle can be kept for assertions while
/// the others are handed to consumer workers.
#[derive(Debug, Default, Clone)]
pub struct InMemorySink {
    /// 🔒 the evidence locker: everything that was successfully flushed
    flushed: Arc<tokio::sync::Mutex<Vec<Point>>>,
    /// 📝 staged since the last flush; per handle, never shared
    staged: Vec<Point>,
    flush_calls: Arc<AtomicUsize>,
    /// 🔥 when set, every flush fails. disaster rehearsal, not a lifestyle.
    failing: Arc<AtomicBool>,
}

impl InMemorySink {
    /// 🔥 Make every subsequent flush fail (or stop failing).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn flush_calls(&self) -> usize {
        self.flush_calls.load(Ordering::SeqCst)
    }

    pub async fn flushed_points(&self) -> Vec<Point> {
        self.flushed.lock().await.clone()
    }

    pub async fn flushed_count(&self) -> usize {
        self.flushed.lock().await.len()
    }
}

#[async_trait]
impl PointSink for InMemorySink {
    async fn write_points(&mut self, points: &[Point]) -> Result<()> {
        self.staged.extend_from_slice(points);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flush_calls.fetch_add(1, Ordering::SeqCst);
        let staged = std::mem::take(&mut self.staged);
        if self.failing.load(Ordering::SeqCst) {
            bail!(
                "💀 in-memory sink is in outage mode; {} staged points dropped on the floor",
                staged.len()
            );
        }
        self.flushed.lock().await.extend(staged);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // 🗑️ nothing to release. we live in RAM. the OS will tidy up.
        Ok(())
    }
}
