//! Benchmarks for channel hand-off and policy dispatch
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use prodline::config::{ReworkConfig, StationConfig};
use prodline::pipeline::{AnyPolicy, BoundedChannel, PolicyContext};
use prodline::{Product, ProductState, ProductType, StageKind};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ITEMS: u64 = 10_000;

fn bench_single_thread_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_round_trip");
    group.throughput(Throughput::Elements(1));

    for capacity in [1usize, 20, 1000] {
        let channel = BoundedChannel::new(capacity);
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &channel, |b, ch| {
            b.iter(|| {
                ch.try_push(black_box(7u64)).ok();
                black_box(ch.try_pop().ok())
            })
        });
    }

    group.finish();
}

fn bench_cross_thread_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_cross_thread");
    group.throughput(Throughput::Elements(ITEMS));
    group.sample_size(20);

    for capacity in [1usize, 20, 256] {
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                b.iter(|| {
                    let channel = Arc::new(BoundedChannel::new(capacity));
                    let producer = {
                        let channel = Arc::clone(&channel);
                        thread::spawn(move || {
                            for i in 0..ITEMS {
                                let mut item = i;
                                loop {
                                    match channel.push(item, Duration::from_secs(1)) {
                                        Ok(()) => break,
                                        Err(err) => item = err.into_inner(),
                                    }
                                }
                            }
                        })
                    };

                    let mut sum = 0u64;
                    for _ in 0..ITEMS {
                        if let Ok(value) = channel.pop(Duration::from_secs(1)) {
                            sum += value;
                        }
                    }
                    producer.join().ok();
                    black_box(sum)
                })
            },
        );
    }

    group.finish();
}

fn bench_policy_dispatch(c: &mut Criterion) {
    let settings = StationConfig::new(0, 0, 0.0);
    let rework = ReworkConfig::default();
    let mut rng = StdRng::seed_from_u64(1);
    let mut policy = AnyPolicy::builtin(StageKind::Packaging);

    c.bench_function("packaging_policy", |b| {
        b.iter(|| {
            let mut product = Product::new(ProductType::Oven);
            product.set_state(ProductState::AtPackaging);
            let mut ctx = PolicyContext {
                stage: StageKind::Packaging,
                settings: &settings,
                rework: &rework,
                rng: &mut rng,
            };
            black_box(policy.process(&mut product, &mut ctx).ok())
        })
    });
}

criterion_group!(
    benches,
    bench_single_thread_round_trip,
    bench_cross_thread_handoff,
    bench_policy_dispatch
);
criterion_main!(benches);
