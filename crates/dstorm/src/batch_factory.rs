//! 🏭 BatchFactory: the assembly line that stamps out reusable batches.
//!
//! Two modes, same contract (exactly `batch_size` messages, every time):
//! - **static**: encode one record, clone the `Arc` `batch_size` times. Costs
//!   one serialization per batch and delivers all the variety of a fax machine.
//! - **dynamic**: pre-encode a bounded pool of tweet-ish variants, then sample
//!   each slot from it. Sentiment follows a fixed mix or swings per batch.
//!
//! Workers ask for a whole pool at spawn and on every reconfigure, then cycle
//! through it round-robin. The factory never touches a batch after handing it over,
//! except through [`BatchFactory::refresh_slot`], which the owning worker calls.

use std::sync::Arc;

use anyhow::{Result, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::app_config::{GenerationConfig, GenerationMode, SentimentMix};
use crate::codec::Codec;
use crate::common::{Batch, Message, Record, RecordTemplate, Sentiment, now_millis};

// 📝 sentence templates per sentiment; `{brand}` and `{word}` get filled in
const POSITIVE_TEMPLATES: &[&str] = &["{brand} is {word}!", "I {verb} {brand}!"];
const NEGATIVE_TEMPLATES: &[&str] = &[
    "{brand} tastes {word}",
    "Why does {brand} have to be so {word}?",
];
const NEUTRAL_TEMPLATES: &[&str] = &[
    "Just tried {brand}, feeling {word}",
    "Drinking {brand} today, it's {word}",
];

const POSITIVE_ADJ: &[&str] = &["awesome", "great", "fantastic", "delicious", "amazing"];
const POSITIVE_VERB: &[&str] = &["love", "enjoy", "adore", "appreciate"];
const NEGATIVE_ADJ: &[&str] = &["awful", "terrible", "gross", "disappointing", "bad"];
const NEUTRAL_ADJ: &[&str] = &["okay", "fine", "normal", "average", "meh"];

/// 🏭 Builds batches for one worker. Not shared: each worker owns its factory.
#[derive(Debug)]
pub struct BatchFactory {
    mode: GenerationMode,
    template: RecordTemplate,
    codec: Arc<dyn Codec>,
    sentiment: SentimentMix,
    /// 🎨 pre-encoded variants, bucketed by sentiment (positive, negative, neutral)
    variants: [Vec<Message>; 3],
    rng: StdRng,
    seq: u64,
}

impl BatchFactory {
    pub fn new(
        generation: &GenerationConfig,
        template: RecordTemplate,
        codec: Arc<dyn Codec>,
    ) -> Result<Self> {
        Self::with_rng(generation, template, codec, StdRng::from_os_rng())
    }

    /// 🎲 Same as [`BatchFactory::new`] with a reproducible random stream.
    pub fn with_seed(
        generation: &GenerationConfig,
        template: RecordTemplate,
        codec: Arc<dyn Codec>,
        seed: u64,
    ) -> Result<Self> {
        Self::with_rng(generation, template, codec, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        generation: &GenerationConfig,
        template: RecordTemplate,
        codec: Arc<dyn Codec>,
        rng: StdRng,
    ) -> Result<Self> {
        let mut factory = Self {
            mode: generation.mode,
            template: RecordTemplate {
                brand: generation.brand.clone(),
                ..template
            },
            codec,
            sentiment: generation.sentiment.clone(),
            variants: [Vec::new(), Vec::new(), Vec::new()],
            rng,
            seq: 0,
        };
        if factory.mode == GenerationMode::Dynamic {
            factory.build_variants(generation.variant_pool_size)?;
        }
        Ok(factory)
    }

    // -- 🎨 dynamic mode's bag of tricks, generated once per factory
    fn build_variants(&mut self, pool_size: usize) -> Result<()> {
        if pool_size == 0 {
            bail!("💀 variant pool size must be positive");
        }
        // 📏 in fixed mode the pool itself carries the distribution; volatile starts even
        let weights = match self.sentiment {
            SentimentMix::Fixed {
                positive,
                negative,
                neutral,
            } => normalise(positive, negative, neutral)?,
            SentimentMix::Volatile { .. } => [1.0 / 3.0; 3],
        };
        for _ in 0..pool_size {
            let sentiment = draw_sentiment(&mut self.rng, weights);
            let record = self.variant_record(sentiment);
            let encoded: Message = Arc::from(self.codec.encode(&record)?);
            self.variants[bucket(sentiment)].push(encoded);
        }
        Ok(())
    }

    fn variant_record(&mut self, sentiment: Sentiment) -> Record {
        self.seq += 1;
        let (templates, words): (&[&str], &[&str]) = match sentiment {
            Sentiment::Positive => (POSITIVE_TEMPLATES, POSITIVE_ADJ),
            Sentiment::Negative => (NEGATIVE_TEMPLATES, NEGATIVE_ADJ),
            Sentiment::Neutral => (NEUTRAL_TEMPLATES, NEUTRAL_ADJ),
        };
        let pattern = templates[self.rng.random_range(0..templates.len())];
        let text = pattern
            .replace("{brand}", &self.template.brand)
            .replace("{word}", words[self.rng.random_range(0..words.len())])
            .replace("{verb}", POSITIVE_VERB[self.rng.random_range(0..POSITIVE_VERB.len())]);
        Record {
            id: format!("{}-{}", self.template.identifier, self.seq),
            timestamp_ms: now_millis(),
            brand: self.template.brand.clone(),
            sentiment,
            text,
            value: self.rng.random::<f64>() * 100.0,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.mode == GenerationMode::Dynamic
    }

    /// 📦 Produce one batch of exactly `batch_size` serialized records.
    pub fn produce(&mut self, batch_size: usize) -> Result<Batch> {
        if batch_size == 0 {
            bail!("💀 batch size must be positive");
        }
        match self.mode {
            GenerationMode::Static => {
                self.seq += 1;
                let record = self.template.stamp(self.seq);
                let encoded: Message = Arc::from(self.codec.encode(&record)?);
                Ok(Batch::new(vec![encoded; batch_size]))
            }
            GenerationMode::Dynamic => {
                let weights = self.batch_weights();
                let mut messages = Vec::with_capacity(batch_size);
                for _ in 0..batch_size {
                    let sentiment = draw_sentiment(&mut self.rng, weights);
                    messages.push(self.sample_variant(sentiment));
                }
                Ok(Batch::new(messages))
            }
        }
    }

    /// 🗂️ Produce `pool_depth` batches for round-robin reuse.
    pub fn build_pool(&mut self, batch_size: usize, pool_depth: usize) -> Result<Vec<Arc<Batch>>> {
        if pool_depth == 0 {
            bail!("💀 pool depth must be positive");
        }
        (0..pool_depth)
            .map(|_| self.produce(batch_size).map(Arc::new))
            .collect()
    }

    /// 🔄 Swap one random slot for a freshly encoded record. Dynamic mode only;
    /// static batches stay byte-identical on purpose.
    pub fn refresh_slot(&mut self, batch: &mut Batch) -> Result<()> {
        if self.mode != GenerationMode::Dynamic || batch.is_empty() {
            return Ok(());
        }
        let slot = self.rng.random_range(0..batch.len());
        let weights = self.batch_weights();
        let sentiment = draw_sentiment(&mut self.rng, weights);
        let record = self.variant_record(sentiment);
        batch.messages[slot] = Arc::from(self.codec.encode(&record)?);
        Ok(())
    }

    // -- 🌪️ fixed mode: the pool already has the mix baked in, sample evenly.
    // -- volatile mode: roll fresh, skewed weights for every batch.
    fn batch_weights(&mut self) -> [f64; 3] {
        match self.sentiment {
            SentimentMix::Fixed { .. } => {
                let total: usize = self.variants.iter().map(Vec::len).sum();
                let total = total.max(1) as f64;
                [
                    self.variants[0].len() as f64 / total,
                    self.variants[1].len() as f64 / total,
                    self.variants[2].len() as f64 / total,
                ]
            }
            SentimentMix::Volatile { volatility } => {
                let v = volatility.clamp(0.0, 1.0);
                let positive = self.rng.random::<f64>() * v + (1.0 - v) * 0.33;
                let negative =
                    self.rng.random::<f64>() * (1.0 - positive) * v + (1.0 - v) * 0.33;
                let neutral = (1.0 - positive - negative).max(0.0);
                [positive, negative, neutral]
            }
        }
    }

    fn sample_variant(&mut self, sentiment: Sentiment) -> Message {
        let wanted = &self.variants[bucket(sentiment)];
        let source = if wanted.is_empty() {
            // 🤷 nobody of that mood in the pool; take the first bucket that has anyone
            self.variants
                .iter()
                .find(|v| !v.is_empty())
                .unwrap_or(wanted)
        } else {
            wanted
        };
        // ✅ the pool is never empty in dynamic mode (build_variants bails on size 0)
        let index = self.rng.random_range(0..source.len());
        Arc::clone(&source[index])
    }
}

fn bucket(sentiment: Sentiment) -> usize {
    match sentiment {
        Sentiment::Positive => 0,
        Sentiment::Negative => 1,
        Sentiment::Neutral => 2,
    }
}

fn normalise(positive: f64, negative: f64, neutral: f64) -> Result<[f64; 3]> {
    let total = positive.max(0.0) + negative.max(0.0) + neutral.max(0.0);
    if total <= 0.0 {
        bail!("💀 sentiment distribution must sum to a non-zero value");
    }
    Ok([
        positive.max(0.0) / total,
        negative.max(0.0) / total,
        neutral.max(0.0) / total,
    ])
}

fn draw_sentiment(rng: &mut StdRng, weights: [f64; 3]) -> Sentiment {
    let total: f64 = weights.iter().sum();
    let roll = rng.random::<f64>() * total.max(f64::MIN_POSITIVE);
    if roll < weights[0] {
        Sentiment::Positive
    } else if roll < weights[0] + weights[1] {
        Sentiment::Negative
    } else {
        Sentiment::Neutral
    }
}
