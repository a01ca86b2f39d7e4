//! # Prometheus Task Engine
//!
//! A worker-pool task execution engine for user-supplied compute jobs:
//! callers submit a callable plus its arguments and an optional injected
//! environment, and the engine runs it off the submitter's task on a
//! managed pool of worker threads, returning a result asynchronously.
//!
//! ## Core problem solved
//!
//! CPU-bound and mixed CPU/async workloads need to run off the caller's
//! task without blocking it, while the engine itself stays responsive
//! under contention:
//!
//! - **Affinity-aware routing**: a callable previously run on a worker
//!   prefers that worker again, to reuse warmed-up state.
//! - **Priority queueing**: three strict FIFO bands (`high`/`normal`/`low`)
//!   absorb bursts once every worker is busy.
//! - **Overflow and backpressure**: temporary workers absorb short spikes;
//!   `maxQueueSize` is the only admission control beyond that.
//! - **In-flight coalescing**: concurrent identical submissions share one
//!   dispatch instead of each paying for a separate worker.
//! - **Streaming**: incremental producers deliver a lazy, cancellable
//!   sequence instead of a single future.
//! - **Turbo**: parallel map/filter/reduce partitions an array across the
//!   pool and fails fast on the first chunk error.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use prometheus_task_engine::builders::build_engine;
//! use prometheus_task_engine::config::Configuration;
//! use prometheus_task_engine::core::TaskDescriptor;
//!
//! # async fn doc(normal_runner: std::sync::Arc<impl prometheus_task_engine::core::CallableRunner>,
//! #               generator_runner: std::sync::Arc<impl prometheus_task_engine::core::GeneratorRunner>)
//! # -> Result<(), prometheus_task_engine::core::EngineError> {
//! let engine = build_engine(Configuration::default(), normal_runner, generator_runner);
//! let result = engine.submit(TaskDescriptor::new("(a, b) => a + b")).await?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```
//!
//! For complete examples, see `tests/engine_scenarios_test.rs`.

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders that assemble a running task-execution stack from
/// [`config::Configuration`].
pub mod builders;
/// Frozen-at-read engine configuration.
pub mod config;
/// The seven cooperating components: queue, pool manager, task engine,
/// retry controller, coalescer, stream engine, and turbo.
pub mod core;
/// Shared utilities (clock, telemetry).
pub mod util;
