//! Performance benchmarks for the last-price cache.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lastprice::{
    Broadcaster, KeyFilter, LastPriceService, LatencyHistogram, ProducerId, ServiceConfig,
    SubscriberId, SystemClock, Timestamp,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn broadcaster() -> Broadcaster {
    Broadcaster::new(Arc::new(SystemClock))
}

/// Benchmark publish with nobody listening
fn bench_publish_no_subscribers(c: &mut Criterion) {
    let b = broadcaster();
    let payload = b"101.25".to_vec();

    c.bench_function("publish_no_subscribers", |bench| {
        bench.iter(|| {
            black_box(b.publish("AIR", payload.clone(), Timestamp(0)).unwrap());
        });
    });
}

/// Benchmark publish cost against fan-out width. Subscribers never drain, so
/// every offer after the first conflates.
fn bench_fanout_width(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout_width");

    for width in [1u64, 16, 64] {
        group.bench_with_input(BenchmarkId::new("subscribers", width), &width, |bench, &width| {
            let b = broadcaster();
            let attachments: Vec<_> = (1..=width)
                .map(|id| b.attach(SubscriberId(id), KeyFilter::All).unwrap())
                .collect();
            let payload = b"101.25".to_vec();

            bench.iter(|| {
                black_box(b.publish("AIR", payload.clone(), Timestamp(0)).unwrap());
            });
            drop(attachments);
        });
    }

    group.finish();
}

/// Benchmark attach with a populated store (snapshot plus reconcile)
fn bench_attach_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("attach_snapshot");

    for keys in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("keys", keys), &keys, |bench, &keys| {
            let b = broadcaster();
            for k in 0..keys {
                b.publish(format!("K{}", k), vec![0; 8], Timestamp(0)).unwrap();
            }
            let mut next = 0u64;

            bench.iter(|| {
                next += 1;
                let attachment = b.attach(SubscriberId(next), KeyFilter::All).unwrap();
                black_box(attachment.snapshot.len());
                b.detach(SubscriberId(next)).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark publish-to-consumer latency through a dispatch thread and a
/// channel sink, then report the delivery latency distribution.
fn bench_end_to_end_latency(c: &mut Criterion) {
    let histogram = Arc::new(LatencyHistogram::new());
    let service = LastPriceService::with_components(
        ServiceConfig::default(),
        Arc::new(SystemClock),
        histogram.clone(),
    )
    .unwrap();
    let feed = ProducerId::new("bench");
    let (handle, rx) = service.attach_channel(KeyFilter::keys(["AIR"])).unwrap();

    c.bench_function("end_to_end_latency", |bench| {
        bench.iter_custom(|iters| {
            let mut total = Duration::ZERO;
            for _ in 0..iters {
                let start = Instant::now();
                service
                    .publish(&feed, "AIR", b"101.25".to_vec(), Timestamp(0))
                    .unwrap();
                black_box(rx.recv().unwrap());
                total += start.elapsed();
            }
            total
        });
    });

    let summary = histogram.summary();
    eprintln!(
        "delivery latency: count={} p50={}ns p90={}ns p99={}ns p99.9={}ns max={}ns",
        summary.count,
        summary.p50_ns,
        summary.p90_ns,
        summary.p99_ns,
        summary.p999_ns,
        summary.max_ns
    );

    service.detach(handle.id()).unwrap();
    handle.join().unwrap();
}

criterion_group!(
    benches,
    bench_publish_no_subscribers,
    bench_fanout_width,
    bench_attach_snapshot,
    bench_end_to_end_latency,
);

criterion_main!(benches);
