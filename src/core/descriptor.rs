//! Task descriptors and the types that shape scheduling decisions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Priority band consulted in strict order by the Queue Layer (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Lowest band, drained only once `normal` and `high` are empty.
    Low,
    /// Default band; unrecognized priorities are coerced here (spec §4.2).
    Normal,
    /// Highest band, always drained first.
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Which independent worker pool a task is routed to (spec §3).
///
/// A `WorkerEntry` never migrates between pool types; `Normal` and
/// `Generator` each carry their own counters and queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    /// Single-shot request/response workers (Task Engine, Turbo).
    Normal,
    /// Incremental-producer workers (Stream Engine).
    Generator,
}

/// A cooperative cancellation signal shared between a submitter and the
/// Task Engine.
///
/// Cloning shares the same underlying flag; triggering any clone triggers
/// all of them.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    aborted: Arc<AtomicBool>,
    reason: Arc<parking_lot::Mutex<Option<String>>>,
}

impl CancellationToken {
    /// Create a token that has not yet been triggered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cancellation, optionally recording a reason. Triggering an
    /// already-triggered token is a no-op (reason is not overwritten).
    pub fn cancel(&self, reason: Option<String>) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            *self.reason.lock() = reason;
        }
    }

    /// Whether this token has been triggered.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// The reason supplied at cancellation time, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// Bounded exponential-backoff-with-jitter retry policy (spec §3, §4.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, inclusive of the first. Must be >= 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling applied to the computed delay before jitter.
    pub max_delay: Duration,
    /// Multiplicative backoff factor applied per attempt. Must be >= 1.0.
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// A disabled retry policy (single attempt, no backoff).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(0),
            backoff_factor: 1.0,
        }
    }

    /// Whether retries are effectively enabled (more than one attempt).
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.max_attempts > 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

/// Structured argument/environment value used for args and injected
/// environment (kept deliberately small and order-sensitive: it backs the
/// structural-key linearization used by affinity and coalescing, not a
/// general-purpose value type for callable bodies).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskValue {
    /// JSON null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Numeric value (integers and floats share a representation).
    Number(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    Array(Vec<TaskValue>),
}

/// A unit of work submitted to the engine (spec §3 `TaskDescriptor`).
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    /// Callable source text or opaque registered identifier. Treated as an
    /// opaque blob by everything except [`crate::core::fingerprint`] and
    /// the non-determinism pattern filter (spec §1: the serialization
    /// boundary to the sandboxed worker is out of scope).
    pub callable: String,
    /// Positional arguments passed to the callable.
    pub args: Vec<TaskValue>,
    /// Optional environment injected into the callable's lexical scope.
    pub env: Option<HashMap<String, TaskValue>>,
    /// Optional timeout; must be positive and finite if present.
    pub timeout: Option<Duration>,
    /// Optional cooperative cancellation token.
    pub cancellation: Option<CancellationToken>,
    /// Scheduling priority.
    pub priority: Priority,
    /// Retry policy; `RetryPolicy::disabled()` means no retry wrapping.
    pub retry: RetryPolicy,
    /// When set, the execution future always fulfills with a
    /// [`SafeOutcome`] instead of rejecting (spec §7 "Safe mode").
    pub safe: bool,
    /// Which pool this task is routed to.
    pub pool_type: PoolType,
    /// Bypass in-flight coalescing for this call even if it would
    /// otherwise be a deterministic match (spec §4.5).
    pub no_coalesce: bool,
}

impl TaskDescriptor {
    /// Start building a descriptor for the given callable.
    #[must_use]
    pub fn new(callable: impl Into<String>) -> Self {
        Self {
            callable: callable.into(),
            args: Vec::new(),
            env: None,
            timeout: None,
            cancellation: None,
            priority: Priority::Normal,
            retry: RetryPolicy::disabled(),
            safe: false,
            pool_type: PoolType::Normal,
            no_coalesce: false,
        }
    }

    /// Returns a shallow clone of this descriptor with `safe` forced to
    /// `false` and retry disabled, used internally when the Retry
    /// Controller drives repeated bare attempts (spec §4.4).
    #[must_use]
    pub(crate) fn as_bare_attempt(&self) -> Self {
        let mut d = self.clone();
        d.safe = false;
        d.retry = RetryPolicy::disabled();
        d
    }
}

/// Result wrapper used when [`TaskDescriptor::safe`] is set (spec §7).
#[derive(Debug, Clone)]
pub enum SafeOutcome<T> {
    /// The task completed successfully.
    Fulfilled(T),
    /// The task failed; the engine's future still resolves `Ok`.
    Rejected(crate::core::error::EngineError),
}
