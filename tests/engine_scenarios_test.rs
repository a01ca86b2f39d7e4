//! End-to-end scenario tests (S1-S9) and boundary-behavior checks against
//! the public `Engine` facade, mirroring the teacher's
//! `tests/worker_pool_test.rs` style: real executors, no mocked internals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use prometheus_task_engine::builders::build_engine;
use prometheus_task_engine::config::Configuration;
use prometheus_task_engine::core::{
    CancellationToken, EngineError, PoolType, Priority, RetryPolicy, TaskDescriptor, TaskValue,
};
use prometheus_task_engine::core::error::WorkerFailure;
use prometheus_task_engine::core::worker::{CallableRunner, GeneratorRunner, LogSink};

/// A `CallableRunner` that interprets a handful of named callables, since
/// marshalling real callable source across a process boundary is out of
/// scope here (spec §1) — the engine only needs *some* executor to drive
/// scheduling decisions through.
struct ScenarioRunner {
    flaky_calls: AtomicU32,
}

impl ScenarioRunner {
    fn new() -> Self {
        Self { flaky_calls: AtomicU32::new(0) }
    }
}

fn num(v: &TaskValue) -> f64 {
    match v {
        TaskValue::Number(n) => *n,
        _ => panic!("expected a number, got {v:?}"),
    }
}

#[async_trait]
impl CallableRunner for ScenarioRunner {
    async fn call(
        &self,
        callable: &str,
        args: &[TaskValue],
        env: Option<&HashMap<String, TaskValue>>,
        _log: LogSink,
    ) -> Result<TaskValue, WorkerFailure> {
        match callable {
            "add" => Ok(TaskValue::Number(num(&args[0]) + num(&args[1]))),
            "tax" => {
                let rate = env.and_then(|e| e.get("TAX")).map(num).unwrap_or(0.0);
                Ok(TaskValue::Number(num(&args[0]) * rate))
            }
            "busy_loop" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(TaskValue::Bool(true))
            }
            "identity_sleep_30ms" => {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(args.first().cloned().unwrap_or(TaskValue::Null))
            }
            "flaky_twice" => {
                let n = self.flaky_calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(WorkerFailure { name: "Flaky".into(), message: "not yet".into(), stack: None })
                } else {
                    Ok(TaskValue::String("ok".into()))
                }
            }
            "double" => Ok(TaskValue::Number(num(&args[0]) * 2.0)),
            "label" => Ok(args.first().cloned().unwrap_or(TaskValue::Null)),
            other => Err(WorkerFailure { name: "ReferenceError".into(), message: format!("unknown callable {other}"), stack: None }),
        }
    }
}

struct CountUpGenerator;

#[async_trait]
impl GeneratorRunner for CountUpGenerator {
    async fn call(
        &self,
        _callable: &str,
        args: &[TaskValue],
        _env: Option<&HashMap<String, TaskValue>>,
        emit: Arc<dyn Fn(TaskValue) + Send + Sync>,
        _log: LogSink,
    ) -> Result<TaskValue, WorkerFailure> {
        let n = args.first().map(num).unwrap_or(0.0) as i64;
        for i in 1..=n {
            emit(TaskValue::Number(i as f64));
        }
        Ok(TaskValue::String("final".into()))
    }
}

fn config(overrides: impl FnOnce(Configuration) -> Configuration) -> Configuration {
    overrides(Configuration { pool_size: 4, max_temporary_workers: 2, max_queue_size: 16, ..Configuration::default() })
}

// S1 — Basic add.
#[tokio::test]
async fn s1_basic_add() {
    let engine = build_engine(config(|c| c), Arc::new(ScenarioRunner::new()), Arc::new(CountUpGenerator));
    let desc = TaskDescriptor { args: vec![TaskValue::Number(2.0), TaskValue::Number(3.0)], ..TaskDescriptor::new("add") };
    let result = engine.submit(desc).await.unwrap();
    assert_eq!(result, TaskValue::Number(5.0));
    assert_eq!(engine.metrics().tasks_executed, 1);
}

// S2 — Context injection.
#[tokio::test]
async fn s2_context_injection() {
    let engine = build_engine(config(|c| c), Arc::new(ScenarioRunner::new()), Arc::new(CountUpGenerator));
    let mut env = HashMap::new();
    env.insert("TAX".to_string(), TaskValue::Number(0.2));
    let desc = TaskDescriptor { args: vec![TaskValue::Number(100.0)], env: Some(env), ..TaskDescriptor::new("tax") };
    let result = engine.submit(desc).await.unwrap();
    assert_eq!(result, TaskValue::Number(20.0));
}

// S3 — Timeout.
#[tokio::test]
async fn s3_timeout_evicts_worker() {
    let engine = build_engine(config(|c| c), Arc::new(ScenarioRunner::new()), Arc::new(CountUpGenerator));
    let before = engine.pool_stats(PoolType::Normal);
    let desc = TaskDescriptor { timeout: Some(Duration::from_millis(50)), ..TaskDescriptor::new("busy_loop") };
    let result = engine.submit(desc).await;
    assert!(matches!(result, Err(EngineError::Timeout { timeout_ms: 50 })));
    let after = engine.pool_stats(PoolType::Normal);
    assert!(after.busy_count + after.idle_count <= before.busy_count + before.idle_count + 1);
}

// S4 — Abort already-aborted.
#[tokio::test]
async fn s4_already_aborted_short_circuits() {
    let engine = build_engine(config(|c| c), Arc::new(ScenarioRunner::new()), Arc::new(CountUpGenerator));
    let token = CancellationToken::new();
    token.cancel(Some("changed my mind".into()));
    let desc = TaskDescriptor { cancellation: Some(token), ..TaskDescriptor::new("busy_loop") };
    let result = engine.submit(desc).await;
    assert!(matches!(result, Err(EngineError::Aborted { .. })));
    assert_eq!(engine.metrics().tasks_executed, 0);
    let stats = engine.pool_stats(PoolType::Normal);
    assert_eq!(stats.busy_count + stats.idle_count, 0);
}

// S5 — Priority ordering under contention.
#[tokio::test]
async fn s5_strict_priority_ordering() {
    let engine = Arc::new(build_engine(
        config(|c| Configuration { pool_size: 1, max_temporary_workers: 0, ..c }),
        Arc::new(ScenarioRunner::new()),
        Arc::new(CountUpGenerator),
    ));

    let blocker_engine = Arc::clone(&engine);
    let blocker = tokio::spawn(async move {
        let desc = TaskDescriptor { timeout: None, ..TaskDescriptor::new("identity_sleep_30ms") };
        blocker_engine.submit(desc).await.unwrap()
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (label, priority) in [("low", Priority::Low), ("normal", Priority::Normal), ("high", Priority::High)] {
        let engine = Arc::clone(&engine);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let desc = TaskDescriptor {
                args: vec![TaskValue::String(label.into())],
                priority,
                ..TaskDescriptor::new("label")
            };
            let result = engine.submit(desc).await.unwrap();
            order.lock().await.push(result);
        }));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    blocker.await.unwrap();
    for h in handles {
        h.await.unwrap();
    }

    let completed: Vec<String> = order
        .lock()
        .await
        .iter()
        .map(|v| match v {
            TaskValue::String(s) => s.clone(),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(completed, vec!["high", "normal", "low"]);
}

// S6 — Turbo map.
#[tokio::test]
async fn s6_turbo_map_squares_in_order() {
    let engine = build_engine(
        config(|c| Configuration { pool_size: 4, ..c }),
        Arc::new(ScenarioRunner::new()),
        Arc::new(CountUpGenerator),
    );
    let items: Vec<TaskValue> = (0..50_000i64).map(|n| TaskValue::Number(n as f64)).collect();
    let result = engine.turbo().map(&items, "double").await.unwrap();
    assert_eq!(result.len(), items.len());
    for (i, value) in result.iter().enumerate() {
        assert_eq!(*value, TaskValue::Number(i as f64 * 2.0));
    }
}

// S7 — Coalescing.
#[tokio::test]
async fn s7_concurrent_identical_submissions_coalesce() {
    let engine = Arc::new(build_engine(config(|c| c), Arc::new(ScenarioRunner::new()), Arc::new(CountUpGenerator)));
    let mut handles = Vec::new();
    for _ in 0..100 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let desc = TaskDescriptor { args: vec![TaskValue::Number(7.0)], ..TaskDescriptor::new("identity_sleep_30ms") };
            engine.submit(desc).await.unwrap()
        }));
    }
    for h in handles {
        assert_eq!(h.await.unwrap(), TaskValue::Number(7.0));
    }
    let stats = engine.coalescer_stats();
    assert_eq!(stats.unique, 1);
    assert_eq!(stats.coalesced, 99);
}

// S8 — Retry.
#[tokio::test]
async fn s8_retries_until_success() {
    let engine = build_engine(config(|c| c), Arc::new(ScenarioRunner::new()), Arc::new(CountUpGenerator));
    let desc = TaskDescriptor {
        retry: RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5), backoff_factor: 1.0 },
        ..TaskDescriptor::new("flaky_twice")
    };
    let result = engine.submit(desc).await.unwrap();
    assert_eq!(result, TaskValue::String("ok".into()));
    assert_eq!(engine.metrics().retries, 2);
}

// S9 — Stream.
#[tokio::test]
async fn s9_stream_yields_then_returns() {
    let engine = build_engine(config(|c| c), Arc::new(ScenarioRunner::new()), Arc::new(CountUpGenerator));
    let desc = TaskDescriptor {
        args: vec![TaskValue::Number(2.0)],
        pool_type: PoolType::Generator,
        ..TaskDescriptor::new("gen")
    };
    let mut handle = engine.stream(desc).await.unwrap();
    let mut values = Vec::new();
    while let Some(item) = handle.next().await {
        values.push(item.unwrap());
    }
    assert_eq!(values, vec![TaskValue::Number(1.0), TaskValue::Number(2.0)]);
    assert_eq!(handle.return_value(), Some(&TaskValue::String("final".into())));
}

// Boundary: queue-full rejection.
#[tokio::test]
async fn queue_full_rejects_synchronously() {
    let engine = Arc::new(build_engine(
        config(|c| Configuration { pool_size: 1, max_temporary_workers: 1, max_queue_size: 1, ..c }),
        Arc::new(ScenarioRunner::new()),
        Arc::new(CountUpGenerator),
    ));

    // Occupy the one pooled worker and the one temporary worker.
    let e1 = Arc::clone(&engine);
    let h1 = tokio::spawn(async move { e1.submit(TaskDescriptor::new("busy_loop")).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let e2 = Arc::clone(&engine);
    let h2 = tokio::spawn(async move { e2.submit(TaskDescriptor::new("busy_loop")).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Fill the one queue slot.
    let e3 = Arc::clone(&engine);
    let h3 = tokio::spawn(async move { e3.submit(TaskDescriptor::new("busy_loop")).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let overflow = engine.submit(TaskDescriptor::new("busy_loop")).await;
    assert!(matches!(overflow, Err(EngineError::QueueFull { max_size: 1 })));

    h1.abort();
    h2.abort();
    h3.abort();
}

// Safe mode never rejects the future.
#[tokio::test]
async fn safe_mode_wraps_failures() {
    let engine = build_engine(config(|c| c), Arc::new(ScenarioRunner::new()), Arc::new(CountUpGenerator));
    let desc = TaskDescriptor { safe: true, ..TaskDescriptor::new("does_not_exist") };
    let outcome = engine.submit_safe(desc).await;
    match outcome {
        prometheus_task_engine::core::SafeOutcome::Rejected(EngineError::WorkerError(_)) => {}
        other => panic!("expected a rejected safe outcome, got {other:?}"),
    }
}

// Shutdown invariant: pool and queue are fully empty afterwards.
#[tokio::test]
async fn shutdown_drains_pool_and_queue() {
    let engine = build_engine(config(|c| c), Arc::new(ScenarioRunner::new()), Arc::new(CountUpGenerator));
    let desc = TaskDescriptor { args: vec![TaskValue::Number(1.0), TaskValue::Number(1.0)], ..TaskDescriptor::new("add") };
    engine.submit(desc).await.ok();
    engine.shutdown();
    let stats = engine.pool_stats(PoolType::Normal);
    assert_eq!(stats.busy_count, 0);
    assert_eq!(stats.idle_count, 0);
    assert_eq!(stats.queue_len, 0);
}

// Resource limits: an oversized argument vector is rejected at the submit
// boundary before a worker is ever acquired.
#[tokio::test]
async fn oversized_args_rejected_without_acquiring_a_worker() {
    use prometheus_task_engine::config::ResourceLimits;
    let engine = build_engine(
        config(|c| Configuration { resource_limits: ResourceLimits { max_args: 1, max_value_depth: 32 }, ..c }),
        Arc::new(ScenarioRunner::new()),
        Arc::new(CountUpGenerator),
    );
    let desc = TaskDescriptor { args: vec![TaskValue::Number(2.0), TaskValue::Number(3.0)], ..TaskDescriptor::new("add") };
    let result = engine.submit(desc).await;
    assert!(matches!(result, Err(EngineError::Validation { .. })));
    let stats = engine.pool_stats(PoolType::Normal);
    assert_eq!(stats.busy_count + stats.idle_count, 0);
}

// Resource limits also apply to stream(), which otherwise bypasses the
// Retry Controller and Coalescer.
#[tokio::test]
async fn stream_rejects_deeply_nested_args() {
    use prometheus_task_engine::config::ResourceLimits;
    let engine = build_engine(
        config(|c| Configuration { resource_limits: ResourceLimits { max_args: 64, max_value_depth: 1 }, ..c }),
        Arc::new(ScenarioRunner::new()),
        Arc::new(CountUpGenerator),
    );
    let nested = TaskValue::Array(vec![TaskValue::Array(vec![TaskValue::Number(1.0)])]);
    let desc = TaskDescriptor { args: vec![nested], pool_type: PoolType::Generator, ..TaskDescriptor::new("gen") };
    let result = engine.stream(desc).await;
    assert!(matches!(result, Err(EngineError::Validation { .. })));
}
