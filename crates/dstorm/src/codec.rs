//! 🔤 Codec: bytes in, records out, and vice versa.
//!
//! The record wire format is somebody else's problem in the grand scheme of
//! things, so it hides behind a tiny trait. The only implementation speaks JSON
//! because serde_json is already in the building and nobody wanted to argue. 🦆

use anyhow::{Context, Result};

use crate::common::Record;

/// 🔄 Encode/decode contract. Must be cheap to share across decode tasks.
pub trait Codec: std::fmt::Debug + Send + Sync + 'static {
    fn encode(&self, record: &Record) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Record>;
}

/// 📜 JSON, one object per message.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, record: &Record) -> Result<Vec<u8>> {
        serde_json::to_vec(record).context("💀 Record refused to become JSON")
    }

    fn decode(&self, bytes: &[u8]) -> Result<Record> {
        serde_json::from_slice(bytes).context("💀 Message is not a record we recognise")
    }
}
