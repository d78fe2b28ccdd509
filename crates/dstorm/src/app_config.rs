//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment. Layers, lowest priority first:
//!   1. the selected [`Preset`] (defaults for every producer knob)
//!   2. `DSTORM_*` environment variables, nested keys split on `__`
//!   3. the TOML file, if one was handed to us
//!
//! The old load rig had five copies of the producer with hand-tuned constants
//! sprinkled through each one. Here those copies are presets of one engine.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Value},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backends::{BrokerConfig, SinkConfig};

/// 📦 One struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 🎛️ which flavour of producer defaults to start from
    #[serde(default)]
    pub preset: Preset,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

/// 🎛️ Named bundles of producer defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// 🐢 a handful of workers, static batches, no autotuning
    Baseline,
    /// ⚖️ moderate batches, autotuning with the stability guard on
    #[default]
    Balanced,
    /// 🏎️ huge batches, deep pools, aggressive autotuning, no stability guard
    Turbo,
}

/// 🚀 Everything the producer pool needs to know about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub topic: String,
    pub client_id: String,
    #[serde(alias = "workers")]
    pub worker_count: usize,
    pub batch_size: usize,
    #[serde(alias = "max_buffered_batches")]
    pub pool_depth: usize,
    /// 🎯 records to send before the pool shuts itself down
    pub target_records: u64,
    pub restart_delay_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// 📡 how often each worker reports its counter upward
    pub report_interval_ms: u64,
    /// 📊 how often the supervisor samples throughput and redraws the status board
    pub status_interval_ms: u64,
    /// 🧘 yield to the scheduler after this many batches
    pub yield_every_batches: usize,
    /// 🛫 cap on unresolved send completions a worker keeps around
    pub max_in_flight: usize,
    pub generation: GenerationConfig,
    pub backoff: BackoffConfig,
    pub tuning: TuningConfig,
}

/// 🏭 How batches get their content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub mode: GenerationMode,
    /// 🎲 how many distinct record variants dynamic mode samples from
    pub variant_pool_size: usize,
    pub brand: String,
    pub sentiment: SentimentMix,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    /// 🪞 one record, cloned batch_size times
    #[default]
    Static,
    /// 🎨 each slot sampled from a pool of variants
    Dynamic,
}

/// 😀😐😠 Sentiment distribution for dynamic generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SentimentMix {
    /// 📏 user weights, normalised; they must not all be zero
    Fixed {
        positive: f64,
        negative: f64,
        neutral: f64,
    },
    /// 🌪️ per-batch skewed weights; 0.0 is calm, 1.0 is a comment section
    Volatile { volatility: f64 },
}

impl Default for SentimentMix {
    fn default() -> Self {
        SentimentMix::Fixed {
            positive: 0.33,
            negative: 0.33,
            neutral: 0.34,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            mode: GenerationMode::Static,
            variant_pool_size: 1000,
            brand: "SuperCoffee".to_string(),
            sentiment: SentimentMix::default(),
        }
    }
}

/// 🧯 Per-worker failure handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// 🔢 errors tolerated before the worker backs off
    pub max_errors: u32,
    pub backoff_ms: u64,
    /// 🔌 pause between reconnect attempts
    pub reconnect_backoff_ms: u64,
}

impl BackoffConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_errors: 50,
            backoff_ms: 5000,
            reconnect_backoff_ms: 2000,
        }
    }
}

/// 🎚️ The feedback loop's knobs. Throughput values are records per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub enabled: bool,
    pub warmup_ms: u64,
    pub period_ms: u64,
    pub max_iterations: u32,
    /// 📚 number of per-second samples in the rolling average
    pub history_size: usize,
    pub low_watermark: f64,
    pub mid_watermark: f64,
    pub high_watermark: f64,
    pub min_workers: usize,
    pub max_workers: usize,
    /// 📐 throughput one extra worker is expected to add; sizes growth below the low watermark
    pub gap_per_worker: f64,
    pub min_add_per_tick: usize,
    pub max_add_per_tick: usize,
    pub mid_add_workers: usize,
    pub mid_batch_growth: f64,
    pub fine_growth: f64,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub min_pool_depth: usize,
    pub max_pool_depth: usize,
    pub stability_guard: bool,
    /// ⚠️ fraction of unhealthy workers at which the pool counts as unstable
    pub unstable_fraction: f64,
    pub shrink_fraction: f64,
    pub shrink_factor: f64,
    /// 🚩 error reports after which a worker counts as unhealthy
    pub error_indicator_threshold: u64,
    /// 💤 a silent worker counts as unhealthy after this long
    pub stale_after_ms: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        ProducerConfig::from_preset(Preset::Balanced).tuning
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self::from_preset(Preset::Balanced)
    }
}

// -- 🧮 how many cores do we get to boss around? four if the OS is being coy.
pub(crate) fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl ProducerConfig {
    /// 🎛️ Build the full producer config for a preset.
    pub fn from_preset(preset: Preset) -> Self {
        let cpus = available_cpus();
        let common = ProducerConfig {
            topic: "dataStorm-topic".to_string(),
            client_id: "dataStorm-producer".to_string(),
            worker_count: 4,
            batch_size: 8000,
            pool_depth: 4,
            target_records: 50_000_000,
            restart_delay_ms: 1000,
            shutdown_timeout_ms: 10_000,
            report_interval_ms: 20,
            status_interval_ms: 1000,
            yield_every_batches: 5,
            max_in_flight: 500,
            generation: GenerationConfig::default(),
            backoff: BackoffConfig::default(),
            tuning: TuningConfig {
                enabled: false,
                warmup_ms: 5000,
                period_ms: 3000,
                max_iterations: 5,
                history_size: 5,
                low_watermark: 400_000.0,
                mid_watermark: 700_000.0,
                high_watermark: 1_000_000.0,
                min_workers: 1,
                max_workers: 16,
                gap_per_worker: 100_000.0,
                min_add_per_tick: 1,
                max_add_per_tick: 8,
                mid_add_workers: 2,
                mid_batch_growth: 1.2,
                fine_growth: 1.1,
                min_batch_size: 1000,
                max_batch_size: 25_000,
                min_pool_depth: 2,
                max_pool_depth: 12,
                stability_guard: false,
                unstable_fraction: 0.1,
                shrink_fraction: 0.2,
                shrink_factor: 0.9,
                error_indicator_threshold: 10,
                stale_after_ms: 2000,
            },
        };

        match preset {
            Preset::Baseline => ProducerConfig {
                backoff: BackoffConfig {
                    max_errors: 100,
                    backoff_ms: 100,
                    reconnect_backoff_ms: 2000,
                },
                ..common
            },
            Preset::Balanced => ProducerConfig {
                worker_count: (cpus * 2).max(8),
                batch_size: 15_000,
                pool_depth: 8,
                yield_every_batches: 10,
                tuning: TuningConfig {
                    enabled: true,
                    min_workers: cpus.max(4),
                    max_workers: (cpus * 4).max(16),
                    min_batch_size: 5000,
                    min_pool_depth: 4,
                    stability_guard: true,
                    ..common.tuning
                },
                ..common
            },
            Preset::Turbo => ProducerConfig {
                worker_count: (cpus * 4).max(8),
                batch_size: 20_000,
                pool_depth: 16,
                restart_delay_ms: 500,
                report_interval_ms: 10,
                max_in_flight: 1000,
                backoff: BackoffConfig {
                    max_errors: 100,
                    backoff_ms: 100,
                    reconnect_backoff_ms: 1000,
                },
                tuning: TuningConfig {
                    enabled: true,
                    warmup_ms: 3000,
                    period_ms: 2000,
                    max_iterations: 3,
                    history_size: 3,
                    low_watermark: 500_000.0,
                    mid_watermark: 700_000.0,
                    min_workers: (cpus * 4).max(8),
                    max_workers: (cpus * 8).max(32),
                    gap_per_worker: 50_000.0,
                    min_add_per_tick: 4,
                    max_add_per_tick: 16,
                    mid_add_workers: 4,
                    mid_batch_growth: 1.5,
                    fine_growth: 1.2,
                    min_batch_size: 5000,
                    max_batch_size: 50_000,
                    min_pool_depth: 4,
                    max_pool_depth: 32,
                    ..common.tuning
                },
                ..common
            },
        }
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }

    /// 🔒 Reject combinations that would make the engine divide by zero or argue with itself.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 || self.batch_size == 0 || self.pool_depth == 0 {
            bail!(
                "💀 worker_count ({}), batch_size ({}) and pool_depth ({}) must all be positive. \
                 Zero workers sending zero-sized batches is technically very stable, but not useful.",
                self.worker_count,
                self.batch_size,
                self.pool_depth
            );
        }
        if self.generation.mode == GenerationMode::Dynamic && self.generation.variant_pool_size == 0 {
            bail!("💀 dynamic generation needs variant_pool_size > 0. Variety requires at least one option.");
        }
        match self.generation.sentiment {
            SentimentMix::Fixed {
                positive,
                negative,
                neutral,
            } => {
                if positive < 0.0 || negative < 0.0 || neutral < 0.0 || positive + negative + neutral <= 0.0 {
                    bail!("💀 fixed sentiment weights must be non-negative and sum to a non-zero value");
                }
            }
            SentimentMix::Volatile { volatility } => {
                if !(0.0..=1.0).contains(&volatility) {
                    bail!("💀 volatility must be within [0, 1], got {volatility}");
                }
            }
        }
        let t = &self.tuning;
        if t.min_workers == 0 || t.min_batch_size == 0 || t.min_pool_depth == 0 {
            bail!(
                "💀 tuning.min_workers ({}), tuning.min_batch_size ({}) and tuning.min_pool_depth ({}) \
                 must all be positive; the tuner is allowed to shrink all the way down to them",
                t.min_workers,
                t.min_batch_size,
                t.min_pool_depth
            );
        }
        for (knob, min, max) in [
            ("workers", t.min_workers, t.max_workers),
            ("batch_size", t.min_batch_size, t.max_batch_size),
            ("pool_depth", t.min_pool_depth, t.max_pool_depth),
        ] {
            if min > max {
                bail!("💀 tuning.min_{knob} ({min}) is above tuning.max_{knob} ({max})");
            }
        }
        // -- 🎯 the tuner only ever clamps inside these bounds, so the starting shape has to sit in them too
        if t.enabled {
            for (knob, value, min, max) in [
                ("worker_count", self.worker_count, t.min_workers, t.max_workers),
                ("batch_size", self.batch_size, t.min_batch_size, t.max_batch_size),
                ("pool_depth", self.pool_depth, t.min_pool_depth, t.max_pool_depth),
            ] {
                if !(min..=max).contains(&value) {
                    bail!("💀 {knob} ({value}) is outside the tuning range [{min}, {max}]");
                }
            }
        }
        if !(t.low_watermark <= t.mid_watermark && t.mid_watermark <= t.high_watermark) {
            bail!(
                "💀 watermarks must satisfy low <= mid <= high, got {} / {} / {}",
                t.low_watermark,
                t.mid_watermark,
                t.high_watermark
            );
        }
        if t.history_size == 0 {
            bail!("💀 tuning.history_size must be positive; an average of nothing is a philosophy, not a number");
        }
        Ok(())
    }
}

/// 📥 The intake side: consumers that decode, buffer and flush to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group_id: String,
    pub client_id: String,
    #[serde(alias = "workers")]
    pub worker_count: usize,
    /// 🚰 nominal flush size; the buffer never stays above twice this
    pub flush_threshold: usize,
    pub flush_interval_ms: u64,
    pub health_interval_ms: u64,
    pub restart_delay_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// 🧵 decode chunks per delivery; defaults to the number of cores
    pub decode_parallelism: Option<usize>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: "dataStorm-topic".to_string(),
            group_id: "brandpulse-consumer-group".to_string(),
            client_id: "brandpulse-consumer".to_string(),
            worker_count: available_cpus().min(4),
            flush_threshold: 5000,
            flush_interval_ms: 100,
            health_interval_ms: 10_000,
            restart_delay_ms: 1000,
            shutdown_timeout_ms: 15_000,
            decode_parallelism: None,
        }
    }
}

impl ConsumerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn decode_parallelism(&self) -> usize {
        self.decode_parallelism.unwrap_or_else(available_cpus).max(1)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 || self.flush_threshold == 0 {
            bail!(
                "💀 consumer worker_count ({}) and flush_threshold ({}) must be positive",
                self.worker_count,
                self.flush_threshold
            );
        }
        Ok(())
    }
}

impl AppConfig {
    /// 🎛️ A config whose producer section comes straight from `preset`.
    pub fn from_preset(preset: Preset) -> Self {
        Self {
            preset,
            producer: ProducerConfig::from_preset(preset),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.producer.validate()?;
        self.consumer.validate()
    }
}

/// 🏷️ Old key names, as (section, legacy, canonical).
const LEGACY_KEYS: &[(&str, &str, &str)] = &[
    ("producer", "workers", "worker_count"),
    ("producer", "max_buffered_batches", "pool_depth"),
    ("consumer", "workers", "worker_count"),
];

// -- 🏷️ the preset layer always carries the canonical names, so a legacy name left as-is
// -- would reach serde next to its canonical twin and get called a duplicate
fn with_legacy_keys_renamed(layer: Figment) -> figment::Result<Dict> {
    let mut dict: Dict = layer.extract()?;
    for (section, legacy, canonical) in LEGACY_KEYS {
        if let Some(Value::Dict(_, table)) = dict.get_mut(*section) {
            if let Some(value) = table.remove(*legacy) {
                table.entry((*canonical).to_string()).or_insert(value);
            }
        }
    }
    Ok(dict)
}

/// 🚀 Load the config from env vars, an optional TOML file, and the preset underneath both.
///
/// 📐 DESIGN NOTE:
///   - `config_file_name` None  → env vars only, on top of the preset.
///   - `config_file_name` Some  → env vars + TOML file, merged. TOML wins on conflicts.
///   - the preset is read first from those same layers, then used as the base layer.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let env_layer = Figment::from(Env::prefixed("DSTORM_").split("__"));
    let file_layer = config_file_name.map(|file_name| Figment::from(Toml::file(file_name)));
    let layered = match &file_layer {
        Some(file_layer) => env_layer.clone().merge(file_layer.clone()),
        None => env_layer.clone(),
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (DSTORM_*). \
             Check the TOML for typos; the cause below names the key that upset us.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (DSTORM_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    // 🎛️ the preset decides the defaults, so it has to be known before anything else
    let preset: Preset = match layered.find_value("preset") {
        Ok(_) => layered
            .extract_inner("preset")
            .context("💀 Unknown preset. Try baseline, balanced or turbo.")?,
        Err(_) => Preset::default(),
    };

    let mut figment = Figment::new()
        .merge(Serialized::default(
            "producer",
            ProducerConfig::from_preset(preset),
        ))
        .merge(Serialized::defaults(
            with_legacy_keys_renamed(env_layer).context(context_msg.clone())?,
        ));
    if let Some(file_layer) = file_layer {
        figment = figment.merge(Serialized::defaults(
            with_legacy_keys_renamed(file_layer).context(context_msg.clone())?,
        ));
    }
    let app_config: AppConfig = figment.extract().context(context_msg)?;

    app_config.validate()?;
    info!(
        preset = ?app_config.preset,
        workers = app_config.producer.worker_count,
        batch_size = app_config.producer.batch_size,
        pool_depth = app_config.producer.pool_depth,
        "✅ Configuration loaded"
    );
    Ok(app_config)
}
