//! 🏁 Benchmarks for the two hot paths that are not the network:
//! stamping out batches, and decoding them back into points.
//!
//! 🧪 `cargo bench --bench batch_factory_bench`

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use dstorm::app_config::{GenerationConfig, GenerationMode, SentimentMix};
use dstorm::backends::InMemorySink;
use dstorm::batch_factory::BatchFactory;
use dstorm::codec::{Codec, JsonCodec};
use dstorm::common::RecordTemplate;
use dstorm::consumer_buffer::ConsumerBuffer;

const BATCH_SIZES: &[usize] = &[1_000, 8_000, 20_000];

fn generation(mode: GenerationMode, sentiment: SentimentMix) -> GenerationConfig {
    GenerationConfig {
        mode,
        sentiment,
        ..GenerationConfig::default()
    }
}

fn bench_produce(c: &mut Criterion) {
    let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
    let flavours = [
        ("static", generation(GenerationMode::Static, SentimentMix::default())),
        ("dynamic_fixed", generation(GenerationMode::Dynamic, SentimentMix::default())),
        (
            "dynamic_volatile",
            generation(GenerationMode::Dynamic, SentimentMix::Volatile { volatility: 0.8 }),
        ),
    ];

    let mut group = c.benchmark_group("batch_factory_produce");
    for &batch_size in BATCH_SIZES {
        group.throughput(Throughput::Elements(batch_size as u64));
        for (name, config) in &flavours {
            let mut factory =
                BatchFactory::with_seed(config, RecordTemplate::default(), Arc::clone(&codec), 42)
                    .expect("💀 bench factory should build");
            group.bench_with_input(BenchmarkId::new(*name, batch_size), &batch_size, |b, &n| {
                b.iter(|| black_box(factory.produce(n).expect("💀 produce should not fail")));
            });
        }
    }
    group.finish();
}

fn bench_ingest(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("💀 bench runtime should start");
    let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
    let config = generation(GenerationMode::Dynamic, SentimentMix::default());
    let mut factory = BatchFactory::with_seed(&config, RecordTemplate::default(), Arc::clone(&codec), 7)
        .expect("💀 bench factory should build");

    let mut group = c.benchmark_group("consumer_buffer_ingest");
    for &batch_size in BATCH_SIZES {
        let messages = factory
            .produce(batch_size)
            .expect("💀 produce should not fail")
            .messages;
        group.throughput(Throughput::Elements(batch_size as u64));
        for parallelism in [1usize, 4] {
            group.bench_with_input(
                BenchmarkId::new(format!("parallelism_{parallelism}"), batch_size),
                &messages,
                |b, messages| {
                    b.to_async(&runtime).iter(|| async {
                        let mut buffer = ConsumerBuffer::new(
                            InMemorySink::default(),
                            Arc::clone(&codec),
                            50_000,
                            parallelism,
                        );
                        black_box(
                            buffer
                                .ingest_batch(messages.clone())
                                .await
                                .expect("💀 ingest should not fail"),
                        )
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_produce, bench_ingest);
criterion_main!(benches);
