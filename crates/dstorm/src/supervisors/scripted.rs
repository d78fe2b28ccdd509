//! 🎭 A broker that does exactly what the test script says, plus a batch
//! maker for tests that need real payloads. Test-only.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use crate::backends::blackhole::BlackholeConsumer;
use crate::backends::{Broker, BrokerError, BrokerErrorKind, ProducerConnection, SendCompletion};
use crate::codec::{Codec, JsonCodec};
use crate::common::{Batch, Message, RecordTemplate};

/// 🐦 `n` encoded template records, ready to push through a broker.
pub(crate) fn tweet_batch(n: usize) -> Arc<Batch> {
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

/// 📜 The script.
#[derive(Debug, Clone)]
pub(crate) struct Script {
    /// 💀 the first N connect attempts fail
    pub failing_connects: usize,
    /// 💤 every connect attempt waits forever
    pub hanging_connect: bool,
    /// 💀 the first N subscribe attempts fail
    pub failing_subscribes: usize,
    /// 💀 the first N sends fail
    pub failing_sends: usize,
    pub always_fail_sends: bool,
    pub fail_kind: BrokerErrorKind,
    /// ⏱️ how long a send takes to complete
    pub send_latency: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            failing_connects: 0,
            hanging_connect: false,
            failing_subscribes: 0,
            failing_sends: 0,
            always_fail_sends: false,
            fail_kind: BrokerErrorKind::Rejected,
            send_latency: Duration::from_millis(1),
        }
    }
}

/// 📊 What actually happened.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub connect_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
    pub send_calls: AtomicUsize,
    /// 📦 messages in sends that were going to succeed
    pub sent_messages: AtomicU64,
    pub last_batch_len: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedBroker {
    script: Script,
    pub tally: Arc<Tally>,
}

impl ScriptedBroker {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            tally: Arc::new(Tally::default()),
        }
    }

    pub fn connect_calls(&self) -> usize {
        self.tally.connect_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.tally.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> usize {
        self.tally.send_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.tally.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn sent_messages(&self) -> u64 {
        self.tally.sent_messages.load(Ordering::SeqCst)
    }

    pub fn last_batch_len(&self) -> usize {
        self.tally.last_batch_len.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    type Producer = ScriptedProducer;
    type Consumer = BlackholeConsumer;

    async fn connect(&self, _client_id: &str) -> Result<ScriptedProducer, BrokerError> {
        let attempt = self.tally.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.hanging_connect {
            futures::future::pending::<()>().await;
        }
        if attempt < self.script.failing_connects {
            return Err(BrokerError::new(BrokerErrorKind::Connection, "scripted connect failure"));
        }
        Ok(ScriptedProducer {
            script: self.script.clone(),
            tally: Arc::clone(&self.tally),
        })
    }

    async fn subscribe(
        &self,
        _group_id: &str,
        _topic: &str,
        _client_id: &str,
    ) -> Result<BlackholeConsumer, BrokerError> {
        let attempt = self.tally.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.script.failing_subscribes {
            return Err(BrokerError::new(BrokerErrorKind::Connection, "scripted subscribe failure"));
        }
        Ok(BlackholeConsumer)
    }
}

#[derive(Debug)]
pub(crate) struct ScriptedProducer {
    script: Script,
    tally: Arc<Tally>,
}

#[async_trait]
impl ProducerConnection for ScriptedProducer {
    fn send(&mut self, _topic: &str, batch: Arc<Batch>) -> SendCompletion {
        let attempt = self.tally.send_calls.fetch_add(1, Ordering::SeqCst);
        self.tally.last_batch_len.store(batch.len(), Ordering::SeqCst);
        let fail = self.script.always_fail_sends || attempt < self.script.failing_sends;
        if !fail {
            self.tally
                .sent_messages
                .fetch_add(batch.len() as u64, Ordering::SeqCst);
        }
        let kind = self.script.fail_kind;
        let latency = self.script.send_latency;
        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if fail {
                Err(BrokerError::new(kind, "scripted send failure"))
            } else {
                Ok(())
            }
        }
        .boxed()
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.tally.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
