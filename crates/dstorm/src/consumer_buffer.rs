//! 🪣 ConsumerBuffer: decode, accumulate, flush. Repeat until somebody says stop.
//!
//! Inbound deliveries are split into chunks and decoded concurrently. Decoded
//! points pile up here until the consumer loop decides it is time (size or clock),
//! then they go to the sink in one write.
//!
//! 🔥 When the sink is down the buffer keeps its points for the next attempt,
//! but it will not grow forever: past twice the flush threshold the oldest
//! points are dropped until exactly one threshold's worth remains. Memory
//! beats completeness here.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backends::PointSink;
use crate::codec::Codec;
use crate::common::{Message, Point};

// -- 🧮 below this many messages, spawning decode tasks costs more than it saves
const MIN_PARALLEL_DECODE: usize = 512;

/// 📬 How one delivery went through the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub decoded: usize,
    /// 🗑️ messages that did not decode and were skipped
    pub skipped: usize,
}

/// 🚽 How a flush attempt went.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// 💤 nothing to flush, the sink was never called
    Empty,
    Flushed { points: usize, elapsed: Duration },
    /// 🔥 the sink said no; `retained` points are still buffered after dropping `trimmed`
    Failed { retained: usize, trimmed: usize },
}

/// 🪣 One consumer worker's pending points and the sink they are headed for.
#[derive(Debug)]
pub struct ConsumerBuffer<S> {
    sink: S,
    codec: Arc<dyn Codec>,
    points: Vec<Point>,
    threshold: usize,
    parallelism: usize,
    flushed_count: u64,
    skipped_count: u64,
}

impl<S: PointSink> ConsumerBuffer<S> {
    pub fn new(sink: S, codec: Arc<dyn Codec>, threshold: usize, parallelism: usize) -> Self {
        Self {
            sink,
            codec,
            points: Vec::with_capacity(threshold),
            threshold: threshold.max(1),
            parallelism: parallelism.max(1),
            flushed_count: 0,
            skipped_count: 0,
        }
    }

    /// 📥 Decode a delivery and append its points. Order across chunks is not kept.
    pub async fn ingest_batch(&mut self, messages: Vec<Message>) -> Result<IngestOutcome> {
        let total = messages.len();
        let mut decoded = Vec::with_capacity(total);

        if self.parallelism == 1 || total < MIN_PARALLEL_DECODE {
            decode_chunk(self.codec.as_ref(), &messages, &mut decoded);
        } else {
            let chunk_size = total.div_ceil(self.parallelism);
            let mut handles = Vec::with_capacity(self.parallelism);
            let mut remaining = messages;
            while !remaining.is_empty() {
                let rest = remaining.split_off(chunk_size.min(remaining.len()));
                let chunk = std::mem::replace(&mut remaining, rest);
                let codec = Arc::clone(&self.codec);
                handles.push(tokio::spawn(async move {
                    let mut points = Vec::with_capacity(chunk.len());
                    decode_chunk(codec.as_ref(), &chunk, &mut points);
                    points
                }));
            }
            for joined in futures::future::join_all(handles).await {
                decoded.extend(joined.context("💀 a decode task panicked mid-chunk")?);
            }
        }

        let outcome = IngestOutcome {
            decoded: decoded.len(),
            skipped: total - decoded.len(),
        };
        if outcome.skipped > 0 {
            warn!(skipped = outcome.skipped, "⚠️ skipped undecodable messages");
        }
        self.skipped_count += outcome.skipped as u64;
        self.points.append(&mut decoded);
        Ok(outcome)
    }

    /// 📏 Has the buffer reached its size trigger?
    pub fn should_flush(&self) -> bool {
        self.points.len() >= self.threshold
    }

    /// 🚽 Hand everything to the sink. Never fails outward; failures are logged
    /// and the buffer is trimmed instead.
    pub async fn flush(&mut self) -> FlushOutcome {
        if self.points.is_empty() {
            return FlushOutcome::Empty;
        }
        let started = Instant::now();
        let result = match self.sink.write_points(&self.points).await {
            Ok(()) => self.sink.flush().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                let points = self.points.len();
                self.points.clear();
                self.flushed_count += points as u64;
                let elapsed = started.elapsed();
                debug!(points, elapsed_ms = elapsed.as_millis() as u64, "✅ flushed to sink");
                FlushOutcome::Flushed { points, elapsed }
            }
            Err(err) => {
                let trimmed = self.trim();
                warn!(
                    retained = self.points.len(),
                    trimmed,
                    "🔥 sink flush failed, keeping the buffer: {err:#}"
                );
                FlushOutcome::Failed {
                    retained: self.points.len(),
                    trimmed,
                }
            }
        }
    }

    // -- ✂️ over twice the threshold: drop the oldest so exactly `threshold` remain
    fn trim(&mut self) -> usize {
        if self.points.len() > self.threshold * 2 {
            let excess = self.points.len() - self.threshold;
            self.points.drain(..excess);
            excess
        } else {
            0
        }
    }

    /// 🏁 Last flush, then close the sink. Returns the lifetime flushed count.
    pub async fn close(&mut self) -> Result<u64> {
        if let FlushOutcome::Failed { retained, .. } = self.flush().await {
            warn!(retained, "💀 final flush failed; these points are not coming with us");
        }
        self.sink.close().await.context("💀 the sink would not close quietly")?;
        Ok(self.flushed_count)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn flushed_count(&self) -> u64 {
        self.flushed_count
    }

    pub fn skipped_count(&self) -> u64 {
        self.skipped_count
    }
}

fn decode_chunk(codec: &dyn Codec, messages: &[Message], out: &mut Vec<Point>) {
    for message in messages {
        match codec.decode(message) {
            Ok(record) => out.push(Point::from_record(&record)),
            Err(err) => debug!("🗑️ skipping undecodable message: {err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemorySink;
    use crate::codec::JsonCodec;
    use crate::common::RecordTemplate;

    fn the_messages(n: usize) -> Vec<Message> {
        let the_template = RecordTemplate::default();
        (0..n)
            .map(|i| {
                let bytes = JsonCodec
                    .encode(&the_template.stamp(i as u64))
                    .expect("💀 encoding a template record cannot fail");
                Message::from(bytes)
            })
            .collect()
    }

    fn the_buffer(sink: &InMemorySink, threshold: usize) -> ConsumerBuffer<InMemorySink> {
        ConsumerBuffer::new(sink.clone(), Arc::new(JsonCodec), threshold, 4)
    }

    #[tokio::test]
    async fn the_one_where_an_empty_flush_never_bothers_the_sink() {
        let the_sink = InMemorySink::default();
        let mut the_buffer = the_buffer(&the_sink, 10);
        assert_eq!(the_buffer.flush().await, FlushOutcome::Empty);
        assert_eq!(the_sink.flush_calls(), 0);
    }

    #[tokio::test]
    async fn the_one_where_garbage_is_skipped_and_the_rest_lands() -> Result<()> {
        let the_sink = InMemorySink::default();
        let mut the_buffer = the_buffer(&the_sink, 10);
        let mut the_batch = the_messages(3);
        the_batch.insert(1, Message::from(&b"{not json"[..]));

        let the_outcome = the_buffer.ingest_batch(the_batch).await?;
        assert_eq!(the_outcome, IngestOutcome { decoded: 3, skipped: 1 });
        assert!(!the_buffer.should_flush());

        assert!(matches!(the_buffer.flush().await, FlushOutcome::Flushed { points: 3, .. }));
        assert!(the_buffer.is_empty());
        assert_eq!(the_buffer.flushed_count(), 3);
        assert_eq!(the_sink.flushed_count().await, 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_big_deliveries_decode_in_parallel_chunks() -> Result<()> {
        let the_sink = InMemorySink::default();
        let mut the_buffer = the_buffer(&the_sink, 1000);
        let the_outcome = the_buffer.ingest_batch(the_messages(2001)).await?;
        assert_eq!(the_outcome.decoded, 2001);
        assert_eq!(the_buffer.len(), 2001);
        assert!(the_buffer.should_flush());
        Ok(())
    }

    // -- 🕰️ record i is stamped at millisecond i, so age is easy to read back
    fn the_aged_messages(n: usize) -> Vec<Message> {
        let the_template = RecordTemplate::default();
        (0..n)
            .map(|i| {
                let mut the_record = the_template.stamp(i as u64);
                the_record.timestamp_ms = i as u64;
                let bytes = JsonCodec
                    .encode(&the_record)
                    .expect("💀 encoding a template record cannot fail");
                Message::from(bytes)
            })
            .collect()
    }

    #[tokio::test]
    async fn the_one_where_an_outage_trims_the_oldest_down_to_threshold() -> Result<()> {
        let the_sink = InMemorySink::default();
        the_sink.set_failing(true);
        let mut the_buffer = the_buffer(&the_sink, 10);
        the_buffer.ingest_batch(the_aged_messages(25)).await?;

        let the_outcome = the_buffer.flush().await;
        assert_eq!(the_outcome, FlushOutcome::Failed { retained: 10, trimmed: 15 });
        assert_eq!(the_buffer.len(), 10);
        assert_eq!(the_buffer.flushed_count(), 0);

        // 🩹 the sink recovers and the survivors go through
        the_sink.set_failing(false);
        assert!(matches!(the_buffer.flush().await, FlushOutcome::Flushed { points: 10, .. }));
        let the_survivors: Vec<u64> = the_sink
            .flushed_points()
            .await
            .iter()
            .map(|point| point.timestamp_ms)
            .collect();
        assert_eq!(the_survivors, (15..25).collect::<Vec<u64>>(), "the oldest 15 went first");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_small_outage_keeps_every_point() -> Result<()> {
        let the_sink = InMemorySink::default();
        the_sink.set_failing(true);
        let mut the_buffer = the_buffer(&the_sink, 10);
        the_buffer.ingest_batch(the_messages(20)).await?;
        assert_eq!(the_buffer.flush().await, FlushOutcome::Failed { retained: 20, trimmed: 0 });
        Ok(())
    }
}
