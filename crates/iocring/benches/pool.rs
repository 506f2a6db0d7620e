//! Operation pool throughput: acquire/release round trips, single-threaded
//! and with several threads hitting the same pool.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use iocring::config::PoolConfig;
use iocring::OperationPool;
use std::thread;

fn acquire_release(c: &mut Criterion) {
    let pool = OperationPool::new(PoolConfig::new());
    pool.prewarm(16);
    c.bench_function("pool/acquire_release", |b| {
        b.iter(|| {
            let op = pool.acquire();
            black_box(op.token());
            pool.release(op);
        })
    });
}

fn fresh_allocation(c: &mut Criterion) {
    c.bench_function("pool/new_operation", |b| {
        b.iter(|| black_box(iocring::CompletionOperation::new()))
    });
}

fn contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/contended");
    for threads in [2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &n| {
            let pool = OperationPool::new(PoolConfig::new());
            pool.prewarm(n * 2);
            b.iter(|| {
                thread::scope(|s| {
                    for _ in 0..n {
                        let pool = pool.clone();
                        s.spawn(move || {
                            for _ in 0..1_000 {
                                let op = pool.acquire();
                                pool.release(black_box(op));
                            }
                        });
                    }
                });
            })
        });
    }
    group.finish();
}

criterion_group!(benches, acquire_release, fresh_allocation, contended);
criterion_main!(benches);
