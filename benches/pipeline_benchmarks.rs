use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pipeweld::prelude::*;
use pipeweld::processors::{MapProcessor, NoOpProcessor};
use pipeweld::util::collect;
use std::hint::black_box;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn bench_channel_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_throughput");
    let rt = runtime();

    for buffer_size in [0, 16, 256].iter() {
        group.throughput(Throughput::Elements(10_000));

        group.bench_with_input(
            BenchmarkId::new("send_pull", buffer_size),
            buffer_size,
            |b, &buffer_size| {
                b.iter(|| {
                    rt.block_on(async {
                        let (tx, rx) = channel::<u64>(ChannelConfig::default().buffer_size(buffer_size));
                        tokio::spawn(async move {
                            for i in 0..10_000 {
                                tx.send(i).await.unwrap();
                            }
                            tx.complete().unwrap();
                        });
                        black_box(collect(&rx).await.unwrap().len())
                    })
                })
            },
        );
    }

    group.finish();
}

fn bench_concurrent_stage(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_stage");
    let rt = runtime();

    for workers in [1, 4, 16].iter() {
        group.throughput(Throughput::Elements(5_000));

        for (name, ordering) in [("ordered", Ordering::Ordered), ("unordered", Ordering::Unordered)] {
            group.bench_with_input(BenchmarkId::new(name, workers), workers, |b, &workers| {
                b.iter(|| {
                    rt.block_on(async {
                        let upstream = VecSource::new((0..5_000u64).collect()).into_shared();
                        let config = ConcurrencyConfig::default()
                            .concurrency(workers)
                            .ordering(ordering)
                            .buffer_size(64);
                        let output = concurrent(upstream, config, || {
                            MapProcessor::new(|x: u64| black_box(x * 2))
                        })
                        .unwrap();
                        black_box(collect(&output).await.unwrap().len())
                    })
                })
            });
        }
    }

    group.finish();
}

fn bench_multicast(c: &mut Criterion) {
    let mut group = c.benchmark_group("multicast");
    let rt = runtime();

    for branches in [1, 2, 8].iter() {
        group.throughput(Throughput::Elements(2_000));

        group.bench_with_input(BenchmarkId::new("branches", branches), branches, |b, &branches| {
            b.iter(|| {
                rt.block_on(async {
                    let upstream = VecSource::new((0..2_000u64).collect()).into_shared();
                    let multicast = Multicast::with_config(upstream, ChannelConfig::default().buffer_size(32));
                    let handles: Vec<_> = (0..branches)
                        .map(|_| {
                            let branch = multicast.branch();
                            tokio::spawn(async move { collect(&branch).await.unwrap().len() })
                        })
                        .collect();
                    for handle in handles {
                        black_box(handle.await.unwrap());
                    }
                })
            })
        });
    }

    group.finish();
}

fn bench_flat_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("flat_map");
    let rt = runtime();

    group.bench_function("expand_x4", |b| {
        b.iter(|| {
            rt.block_on(async {
                let upstream = VecSource::new((0..1_000u64).collect()).into_shared();
                let config = ConcurrencyConfig::default().concurrency(4).buffer_size(64);
                let output = concurrent_flat_map(upstream, config, |x: u64, _| {
                    Ok(VecSource::new(vec![x; 4]))
                })
                .unwrap();
                black_box(collect(&output).await.unwrap().len())
            })
        })
    });

    group.bench_function("noop_stage", |b| {
        b.iter(|| {
            rt.block_on(async {
                let upstream = VecSource::new((0..1_000u64).collect()).into_shared();
                let output =
                    concurrent(upstream, ConcurrencyConfig::default(), NoOpProcessor::<u64>::new)
                        .unwrap();
                black_box(collect(&output).await.unwrap().len())
            })
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_channel_throughput,
    bench_concurrent_stage,
    bench_multicast,
    bench_flat_map
);
criterion_main!(benches);
