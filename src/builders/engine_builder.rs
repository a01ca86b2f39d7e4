//! Assembles the seven components (spec §2) into a single [`Engine`] over a
//! [`crate::config::Configuration`] and the host's two executor
//! implementations — one per [`PoolType`].
//!
//! Mirrors the teacher's `builders::pool_builder::build_pools`: a free
//! function that turns static configuration plus caller-supplied factories
//! into the live, running components, rather than a fluent builder chain
//! (the caller-facing descriptor builder is out of scope, spec §1).

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;
use uuid::Uuid;

use crate::config::Configuration;
use crate::core::descriptor::{PoolType, SafeOutcome, TaskDescriptor, TaskValue};
use crate::core::error::{EngineError, EngineResult};
use crate::core::metrics::{CoalescerSnapshot, Metrics, MetricsSnapshot};
use crate::core::pool::{PoolManager, PoolStats};
use crate::core::stream::{GeneratorHandle, StreamEngine};
use crate::core::turbo::Turbo;
use crate::core::worker::{CallableRunner, GeneratorRunner};
use crate::core::{Coalescer, RetryController, TaskEngine};

/// The assembled engine: Coalescer → Retry Controller → Task Engine → Pool
/// Manager for the normal pool (spec §2 data flow), plus the Stream Engine
/// and Turbo sharing the same pools.
///
/// `R` executes normal-pool callables; `G` executes generator-pool
/// callables. A deployment that has no use for streaming can instantiate
/// `G` with a runner that always returns a `Validation` error — the
/// generator pool itself is still created (spec §3: `PoolType` is always a
/// pair of independent pools) but never grown beyond its initial zero
/// entries unless `stream()` is actually called.
pub struct Engine<R, G> {
    config: Configuration,
    metrics: Arc<Metrics>,
    normal_pool: Arc<PoolManager<R>>,
    generator_pool: Arc<PoolManager<G>>,
    coalescer: Arc<Coalescer<R>>,
    stream_engine: Arc<StreamEngine<G>>,
    turbo: Arc<Turbo<R>>,
    reclaim_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<R, G> Engine<R, G>
where
    R: CallableRunner,
    G: GeneratorRunner,
{
    /// This engine's frozen-at-construction configuration.
    #[must_use]
    pub const fn config(&self) -> &Configuration {
        &self.config
    }

    /// Submit `desc` for single-shot execution (spec §2: Coalescer → Retry
    /// Controller → Task Engine → Pool Manager). `desc.safe` is ignored —
    /// use [`Self::submit_safe`] when a non-rejecting future is wanted.
    ///
    /// Fails with [`EngineError::Validation`] if `desc.pool_type` is
    /// `Generator`; generator tasks only run through [`Self::stream`].
    pub async fn submit(&self, desc: TaskDescriptor) -> EngineResult<TaskValue> {
        self.reject_wrong_pool(&desc)?;
        self.config.resource_limits.validate(&desc)?;
        let span = tracing::info_span!("engine.submit", task_id = %Uuid::new_v4(), priority = ?desc.priority);
        self.coalescer.run(&desc).instrument(span).await
    }

    /// Submit `desc`, always returning a [`SafeOutcome`] regardless of
    /// `desc.safe` (spec §7 "Safe mode" applies uniformly across retry
    /// attempts and, here, across coalesced sharers too).
    pub async fn submit_safe(&self, desc: TaskDescriptor) -> SafeOutcome<TaskValue> {
        if let Err(error) = self.reject_wrong_pool(&desc) {
            return SafeOutcome::Rejected(error);
        }
        if let Err(error) = self.config.resource_limits.validate(&desc) {
            return SafeOutcome::Rejected(error);
        }
        let span = tracing::info_span!("engine.submit_safe", task_id = %Uuid::new_v4(), priority = ?desc.priority);
        self.coalescer.run_safe(&desc).instrument(span).await
    }

    /// Start a generator task on the generator pool (spec §4.6: bypasses
    /// the Retry Controller and Coalescer entirely).
    pub async fn stream(&self, desc: TaskDescriptor) -> EngineResult<GeneratorHandle<G>> {
        if desc.pool_type != PoolType::Generator {
            return Err(EngineError::Validation {
                field: "pool_type".into(),
                expected: "generator (use submit() for normal-pool tasks)".into(),
            });
        }
        self.config.resource_limits.validate(&desc)?;
        self.stream_engine.start(&desc).await
    }

    /// The parallel map/filter/reduce front-end (spec §4.7), sharing the
    /// normal pool with [`Self::submit`].
    #[must_use]
    pub fn turbo(&self) -> &Turbo<R> {
        &self.turbo
    }

    /// Eagerly grow the named pool to `count` idle workers.
    pub fn warmup(&self, pool_type: PoolType, count: usize) {
        match pool_type {
            PoolType::Normal => self.normal_pool.warmup(count),
            PoolType::Generator => self.generator_pool.warmup(count),
        }
    }

    /// Current counters for the named pool.
    #[must_use]
    pub fn pool_stats(&self, pool_type: PoolType) -> PoolStats {
        match pool_type {
            PoolType::Normal => self.normal_pool.stats(),
            PoolType::Generator => self.generator_pool.stats(),
        }
    }

    /// A deep-frozen snapshot of the engine-wide [`Metrics`] bag (spec §3).
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// A point-in-time view of coalescing effectiveness (spec §4.5).
    #[must_use]
    pub fn coalescer_stats(&self) -> CoalescerSnapshot {
        self.coalescer.snapshot()
    }

    /// Stop the background idle-reclamation sweep and tear down both pools
    /// (spec §8 invariant 3: `|pool|=0`, no queue retains waiters).
    pub fn shutdown(&self) {
        if let Some(handle) = self.reclaim_task.lock().take() {
            handle.abort();
        }
        self.normal_pool.shutdown();
        self.generator_pool.shutdown();
    }

    fn reject_wrong_pool(&self, desc: &TaskDescriptor) -> EngineResult<()> {
        if desc.pool_type != PoolType::Normal {
            return Err(EngineError::Validation {
                field: "pool_type".into(),
                expected: "normal (use stream() for generator-pool tasks)".into(),
            });
        }
        Ok(())
    }
}

impl<R, G> Drop for Engine<R, G> {
    fn drop(&mut self) {
        if let Some(handle) = self.reclaim_task.lock().take() {
            handle.abort();
        }
    }
}

/// How often the background sweep checks both pools for idle entries past
/// `worker_idle_timeout` (spec §4.1 "Idle reclamation" — the spec leaves
/// the sweep cadence unspecified; a quarter of the timeout, floored at one
/// second, keeps eviction latency bounded without busy-polling).
fn reclaim_interval(config: &Configuration) -> Duration {
    (config.worker_idle_timeout() / 4).max(Duration::from_secs(1))
}

/// Build a fully wired [`Engine`] from `config` and the two pool executors.
///
/// Must be called from within a Tokio runtime: it spawns the background
/// idle-reclamation sweep via [`tokio::spawn`].
pub fn build_engine<R, G>(config: Configuration, normal_runner: Arc<R>, generator_runner: Arc<G>) -> Arc<Engine<R, G>>
where
    R: CallableRunner,
    G: GeneratorRunner,
{
    let metrics = Arc::new(Metrics::new());
    let pool_manager_config = config.pool_manager_config();

    let normal_pool = Arc::new(PoolManager::new(PoolType::Normal, pool_manager_config.clone(), normal_runner, Arc::clone(&metrics)));
    let generator_pool = Arc::new(PoolManager::new(PoolType::Generator, pool_manager_config, generator_runner, Arc::clone(&metrics)));

    let task_engine = Arc::new(TaskEngine::new(Arc::clone(&normal_pool)));
    let retry = Arc::new(RetryController::new(task_engine, Arc::clone(&metrics)));
    let coalescer = Arc::new(Coalescer::new(retry, Arc::clone(&metrics), config.coalescing_enabled));
    let stream_engine = Arc::new(StreamEngine::new(Arc::clone(&generator_pool)));
    let turbo = Arc::new(Turbo::new(Arc::clone(&normal_pool)));

    let interval = reclaim_interval(&config);
    let sweep_normal = Arc::clone(&normal_pool);
    let sweep_generator = Arc::clone(&generator_pool);
    let reclaim_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            sweep_normal.reclaim_idle();
            sweep_generator.reclaim_idle();
        }
    });

    Arc::new(Engine {
        config,
        metrics,
        normal_pool,
        generator_pool,
        coalescer,
        stream_engine,
        turbo,
        reclaim_task: parking_lot::Mutex::new(Some(reclaim_task)),
    })
}
