//! Core task-execution abstractions: descriptors, worker lifecycle, and
//! the seven components described in SPEC_FULL.md §2.

pub mod coalesce;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod stream;
pub mod turbo;
pub mod worker;

pub use coalesce::Coalescer;
pub use descriptor::{CancellationToken, PoolType, Priority, RetryPolicy, SafeOutcome, TaskDescriptor, TaskValue};
pub use engine::TaskEngine;
pub use error::{AppResult, EngineError, EngineResult, WorkerFailure};
pub use fingerprint::{fingerprint, InFlightKey};
pub use metrics::{CoalescerSnapshot, Metrics, MetricsSnapshot};
pub use pool::{Acquisition, PoolManager, PoolManagerConfig, PoolStats};
pub use queue::QueueLayer;
pub use retry::RetryController;
pub use stream::{GeneratorHandle, StreamEngine};
pub use turbo::Turbo;
pub use worker::{CallableRunner, GeneratorRunner, GeneratorMessage, LogSink, RequestMessage, ResponseMessage, TurboMessage, WorkerThread};
