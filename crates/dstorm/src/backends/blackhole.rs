//! 🕳️ The Blackhole broker: every send succeeds, nothing ever comes back.
//!
//! Useful for measuring how fast the engine itself can go when the network is
//! infinitely patient. Event horizon included at no extra charge. 🦆

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;

use crate::backends::{
    Broker, BrokerError, BrokerErrorKind, ConsumerConnection, Delivery, ProducerConnection,
    SendCompletion,
};
use crate::common::Batch;

#[derive(Debug, Clone, Default)]
pub struct BlackholeBroker {
    swallowed: Arc<AtomicU64>,
}

impl BlackholeBroker {
    /// 📊 Messages that crossed the event horizon so far.
    pub fn messages_swallowed(&self) -> u64 {
        self.swallowed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for BlackholeBroker {
    type Producer = BlackholeProducer;
    type Consumer = BlackholeConsumer;

    async fn connect(&self, _client_id: &str) -> Result<BlackholeProducer, BrokerError> {
        Ok(BlackholeProducer {
            swallowed: Arc::clone(&self.swallowed),
            connected: true,
        })
    }

    async fn subscribe(
        &self,
        _group_id: &str,
        _topic: &str,
        _client_id: &str,
    ) -> Result<BlackholeConsumer, BrokerError> {
        Ok(BlackholeConsumer)
    }
}

#[derive(Debug)]
pub struct BlackholeProducer {
    swallowed: Arc<AtomicU64>,
    connected: bool,
}

#[async_trait]
impl ProducerConnection for BlackholeProducer {
    fn send(&mut self, _topic: &str, batch: Arc<Batch>) -> SendCompletion {
        if !self.connected {
            return futures::future::ready(Err(BrokerError::new(
                BrokerErrorKind::NotConnected,
                "blackhole producer is not connected",
            )))
            .boxed();
        }
        self.swallowed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        futures::future::ready(Ok(())).boxed()
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.connected = false;
        Ok(())
    }
}

/// 💤 Waits forever. Nothing escapes a blackhole, least of all a delivery.
#[derive(Debug)]
pub struct BlackholeConsumer;

#[async_trait]
impl ConsumerConnection for BlackholeConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        futures::future::pending().await
    }

    async fn resolve_offset(&mut self, _offset: u64) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}
