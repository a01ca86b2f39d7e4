//! Benchmarks for the Queue Layer (C2), Pool Manager acquire/release
//! (C1), and Turbo chunk partitioning (C7), adapted from the teacher's
//! `benches/queue_bench.rs`.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Runtime;

use prometheus_task_engine::core::error::WorkerFailure;
use prometheus_task_engine::core::worker::{CallableRunner, LogSink};
use prometheus_task_engine::core::{
    Metrics, PoolManager, PoolManagerConfig, PoolType, Priority, TaskValue,
};

struct Echo;

#[async_trait]
impl CallableRunner for Echo {
    async fn call(
        &self,
        _callable: &str,
        args: &[TaskValue],
        _env: Option<&std::collections::HashMap<String, TaskValue>>,
        _log: LogSink,
    ) -> Result<TaskValue, WorkerFailure> {
        Ok(args.first().cloned().unwrap_or(TaskValue::Null))
    }
}

fn bench_queue_layer_priority_bands(c: &mut Criterion) {
    use prometheus_task_engine::core::Priority as P;
    let mut group = c.benchmark_group("queue_layer_priority_bands");

    for size in [100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut q = prometheus_task_engine::core::queue::QueueLayer::new();
                for i in 0..size {
                    let priority = match i % 3 {
                        0 => P::High,
                        1 => P::Normal,
                        _ => P::Low,
                    };
                    q.enqueue(i, priority);
                }
                while let Some(item) = q.dequeue_highest() {
                    black_box(item);
                }
            });
        });
    }
    group.finish();
}

fn bench_pool_acquire_release_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_acquire_release_cycle");

    for pool_size in [4, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(pool_size), &pool_size, |b, &pool_size| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let pool = PoolManager::new(
                    PoolType::Normal,
                    PoolManagerConfig { pool_size, max_temporary_workers: 0, max_queue_size: 1, ..PoolManagerConfig::default() },
                    Arc::new(Echo),
                    Arc::new(Metrics::new()),
                );
                for _ in 0..pool_size {
                    let acq = pool.acquire(Priority::Normal, None).await.unwrap();
                    pool.release(acq.entry_id, None, Duration::from_micros(1), false, None, false);
                }
                black_box(pool.stats());
            });
        });
    }
    group.finish();
}

fn bench_pool_acquire_under_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_acquire_under_contention");

    group.bench_function("queue_then_drain", |b| {
        b.to_async(Runtime::new().unwrap()).iter(|| async {
            let pool = Arc::new(PoolManager::new(
                PoolType::Normal,
                PoolManagerConfig { pool_size: 4, max_temporary_workers: 0, max_queue_size: 200, ..PoolManagerConfig::default() },
                Arc::new(Echo),
                Arc::new(Metrics::new()),
            ));
            let mut handles = Vec::new();
            for _ in 0..50u32 {
                let pool = Arc::clone(&pool);
                handles.push(tokio::spawn(async move {
                    let acq = pool.acquire(Priority::Normal, None).await.unwrap();
                    pool.release(acq.entry_id, None, Duration::from_micros(1), false, None, false);
                }));
            }
            for h in handles {
                let _ = h.await;
            }
            black_box(pool.stats());
        });
    });
    group.finish();
}

fn bench_turbo_chunk_bounds(c: &mut Criterion) {
    let mut group = c.benchmark_group("turbo_chunk_bounds");

    for n in [10_000usize, 100_000, 1_000_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let bounds = prometheus_task_engine::core::turbo::chunk_bounds_for_bench(n, 8);
                black_box(bounds);
            });
        });
    }
    group.finish();
}

criterion_group!(
    queue_benches,
    bench_queue_layer_priority_bands,
    bench_pool_acquire_release_cycle,
    bench_pool_acquire_under_contention,
    bench_turbo_chunk_bounds
);

criterion_main!(queue_benches);
