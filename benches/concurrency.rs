//! Benchmarks for the scheduler turn loop, the channel fast path, the
//! event algebra's compile-and-commit discipline, and scope overhead.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use weft_runtime::channel::{get_op, put_op, Channel};
use weft_runtime::op::{always, choice, never, perform, try_perform};
use weft_runtime::{run, run_scope};

// ============================================================================
// Fiber spawn / run benchmarks
// ============================================================================

fn bench_spawn_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_latency");

    group.bench_function("run_single_fiber", |b| {
        b.iter(|| {
            run(|_scope| {
                black_box(42);
                Ok(())
            })
        })
    });

    // Raw OS thread spawn, for comparison against the fiber-per-thread
    // baton handoff's overhead.
    group.bench_function("std_thread_spawn_noop", |b| {
        b.iter(|| {
            let handle = thread::spawn(|| black_box(42));
            handle.join().unwrap()
        })
    });

    group.finish();
}

fn bench_spawn_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_throughput");

    for num_fibers in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*num_fibers as u64));

        group.bench_with_input(
            BenchmarkId::new("fibers_in_one_scope", num_fibers),
            num_fibers,
            |b, &n| {
                b.iter(|| {
                    run(move |scope| {
                        for i in 0..n {
                            scope
                                .clone()
                                .spawn(move || {
                                    black_box(i * 2);
                                    Ok(())
                                })
                                .unwrap();
                        }
                        Ok(())
                    })
                })
            },
        );
    }

    group.finish();
}

// ============================================================================
// Channel benchmarks
// ============================================================================

fn bench_channel_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_latency");

    group.bench_function("rendezvous_single_roundtrip", |b| {
        b.iter(|| {
            run(|scope| {
                let chan = Channel::<i32>::new(0);
                let c1 = chan.clone();
                scope
                    .clone()
                    .spawn(move || {
                        let _ = perform(put_op(c1, black_box(42)));
                        Ok(())
                    })
                    .unwrap();
                let c2 = chan;
                scope
                    .clone()
                    .spawn(move || {
                        let _ = perform(get_op(c2));
                        Ok(())
                    })
                    .unwrap();
                Ok(())
            })
        })
    });

    group.bench_function("buffered_single_roundtrip", |b| {
        let chan = Channel::<i32>::new(16);
        b.iter(|| {
            let _ = try_perform(put_op(chan.clone(), black_box(42)));
            let _ = try_perform(get_op(chan.clone()));
        })
    });

    group.finish();
}

fn bench_channel_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_throughput");

    for msg_count in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*msg_count as u64));

        group.bench_with_input(
            BenchmarkId::new("buffered_spsc", msg_count),
            msg_count,
            |b, &n| {
                b.iter(|| {
                    let sum = Arc::new(AtomicUsize::new(0));
                    let sum_in = sum.clone();
                    run(move |scope| {
                        let chan = Channel::<i32>::new(64);

                        let c1 = chan.clone();
                        scope
                            .clone()
                            .spawn(move || {
                                for i in 0..n {
                                    let _ = perform(put_op(c1.clone(), i as i32));
                                }
                                c1.close();
                                Ok(())
                            })
                            .unwrap();

                        let c2 = chan;
                        scope
                            .clone()
                            .spawn(move || loop {
                                match *perform(get_op(c2.clone()))
                                    .downcast::<Option<i32>>()
                                    .unwrap()
                                {
                                    Some(v) => {
                                        sum_in.fetch_add(v as usize, Ordering::Relaxed);
                                    }
                                    None => return Ok(()),
                                }
                            })
                            .unwrap();
                        Ok(())
                    });
                    black_box(sum.load(Ordering::Relaxed))
                })
            },
        );
    }

    group.finish();
}

// ============================================================================
// Event algebra (Op) benchmarks
// ============================================================================

fn bench_op_compile_and_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("op_compile_and_commit");

    group.bench_function("always_fast_path", |b| {
        b.iter(|| try_perform(always(Box::new(black_box(7i32)))))
    });

    group.bench_function("choice_of_10_one_ready", |b| {
        b.iter(|| {
            let mut arms: Vec<_> = (0..9).map(|_| never()).collect();
            arms.push(always(Box::new(black_box(3i32))));
            try_perform(choice(arms))
        })
    });

    group.finish();
}

// ============================================================================
// Scope benchmarks
// ============================================================================

fn bench_scope_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("scope_overhead");

    group.bench_function("empty_child_scope", |b| {
        b.iter(|| {
            run(|scope| {
                let report = run_scope(&scope, |_child| Ok(()));
                black_box(report.is_ok());
                Ok(())
            })
        })
    });

    group.bench_function("child_scope_10_fibers", |b| {
        b.iter(|| {
            run(|scope| {
                let report = run_scope(&scope, |child| {
                    for i in 0..10 {
                        child
                            .clone()
                            .spawn(move || {
                                black_box(i * 2);
                                Ok(())
                            })
                            .unwrap();
                    }
                    Ok(())
                });
                black_box(report.is_ok());
                Ok(())
            })
        })
    });

    group.finish();
}

criterion_group!(spawn_benches, bench_spawn_latency, bench_spawn_throughput);
criterion_group!(channel_benches, bench_channel_latency, bench_channel_throughput);
criterion_group!(op_benches, bench_op_compile_and_commit);
criterion_group!(scope_benches, bench_scope_overhead);

criterion_main!(spawn_benches, channel_benches, op_benches, scope_benches);
