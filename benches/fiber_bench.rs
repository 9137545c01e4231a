//! Benchmarks for the fiber interpreter and its primitives.
//!
//! # Benchmark Categories
//!
//! 1. **Interpreter**: long `flat_map` and `fmap` chains in one fiber
//! 2. **Fibers**: fork/join cycles and concurrent fan-out
//! 3. **Queue**: producer/consumer throughput through a bounded queue
//! 4. **Ref**: contended atomic updates
//!
//! Every iteration runs a whole program with
//! [`Runtime::run_blocking_exit`], so the numbers include the hand-off to and
//! from the host runtime.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use lambars_fiber::prelude::*;
use std::convert::Infallible;
use std::hint::black_box;

// =============================================================================
// Interpreter
// =============================================================================

fn flat_map_chain(depth: usize) -> UIO<usize> {
    (0..depth).fold(UIO::pure(0), |effect, _| {
        effect.flat_map(|value| UIO::pure(value + 1))
    })
}

/// Benchmarks interpreter steps without any suspension.
fn benchmark_interpreter(criterion: &mut Criterion) {
    let runtime = default_runtime();
    let mut group = criterion.benchmark_group("fiber_interpreter");

    for depth in [10, 1_000, 100_000] {
        group.bench_with_input(
            BenchmarkId::new("flat_map_chain", depth),
            &depth,
            |bencher, &depth| {
                bencher.iter(|| black_box(runtime.run_blocking_exit(flat_map_chain(depth))));
            },
        );
        group.bench_with_input(BenchmarkId::new("fmap_chain", depth), &depth, |bencher, &depth| {
            bencher.iter(|| {
                let program = (0..depth).fold(UIO::pure(0_usize), |effect, _| {
                    effect.fmap(|value| value + 1)
                });
                black_box(runtime.run_blocking_exit(program))
            });
        });
    }

    group.finish();
}

// =============================================================================
// Fibers
// =============================================================================

/// Benchmarks the cost of forking and joining fibers.
fn benchmark_fibers(criterion: &mut Criterion) {
    let runtime = default_runtime();
    let mut group = criterion.benchmark_group("fiber_fork_join");

    group.bench_function("fork_join_single", |bencher| {
        bencher.iter(|| {
            let program: UIO<i32> = UIO::pure(1).fork().flat_map(|fiber| fiber.join());
            black_box(runtime.run_blocking_exit(program))
        });
    });

    for width in [10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::new("foreach_par", width), &width, |bencher, &width| {
            bencher.iter(|| {
                let program: UIO<Vec<usize>> = UIO::foreach_par(0..width, |n| UIO::pure(n * 2));
                black_box(runtime.run_blocking_exit(program))
            });
        });
    }

    group.finish();
}

// =============================================================================
// Queue
// =============================================================================

/// Benchmarks one producer and one consumer sharing a bounded queue.
fn benchmark_queue(criterion: &mut Criterion) {
    let runtime = default_runtime();
    let mut group = criterion.benchmark_group("fiber_queue");

    for items in [100_usize, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("bounded_16_throughput", items),
            &items,
            |bencher, &items| {
                bencher.iter(|| {
                    let program: UIO<usize> = Queue::<usize>::bounded(16).flat_map(move |queue| {
                        let producer = queue.clone();
                        UIO::foreach(0..items, move |n| producer.offer::<(), Infallible>(n))
                            .fork()
                            .flat_map(move |fiber| {
                                UIO::foreach(0..items, move |_| queue.take::<(), Infallible>())
                                    .flat_map(move |taken| fiber.join().fmap(move |_| taken.len()))
                            })
                    });
                    black_box(runtime.run_blocking_exit(program))
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// Ref
// =============================================================================

/// Benchmarks concurrent updates of a single reference.
fn benchmark_ref(criterion: &mut Criterion) {
    let runtime = default_runtime();
    let mut group = criterion.benchmark_group("fiber_ref");

    for fibers in [4_usize, 64] {
        group.bench_with_input(
            BenchmarkId::new("concurrent_update", fibers),
            &fibers,
            |bencher, &fibers| {
                bencher.iter(|| {
                    let program: UIO<u64> = Ref::<u64>::make(0).flat_map(move |counter| {
                        let workers = counter.clone();
                        UIO::foreach_par(0..fibers, move |_| {
                            let worker = workers.clone();
                            UIO::foreach(0..100, move |_| worker.update(|value| value + 1))
                        })
                        .then(counter.get())
                    });
                    black_box(runtime.run_blocking_exit(program))
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_interpreter,
    benchmark_fibers,
    benchmark_queue,
    benchmark_ref
);
criterion_main!(benches);
