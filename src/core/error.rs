//! The five-kind error taxonomy used throughout the engine.

use thiserror::Error;

/// A worker-reported failure, worker crash, or non-zero exit before a reply.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    /// Error name as reported by the worker (or a synthesized name for exits).
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Optional stack trace text, when the worker provided one.
    pub stack: Option<String>,
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// The five error kinds a task execution can fail with.
///
/// Independent of any particular worker-side exception type: a worker's
/// serialized error always arrives here as [`EngineError::WorkerError`].
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// Cancellation token triggered, or already triggered at submit time.
    #[error("aborted{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Aborted {
        /// Caller-supplied reason, if any.
        reason: Option<String>,
    },

    /// Elapsed wall time exceeded the task's configured timeout.
    #[error("timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// The pool's queue was at `max_queue_size` when acquisition fell
    /// through to enqueue.
    #[error("queue full (max size {max_size})")]
    QueueFull {
        /// The configured maximum queue size.
        max_size: usize,
    },

    /// Worker-reported failure, worker crash, or non-zero exit before reply.
    #[error("worker error: {0}")]
    WorkerError(WorkerFailure),

    /// Callable rejected at the host boundary (shape/type).
    #[error("validation failed for `{field}`: expected {expected}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// What was expected.
        expected: String,
    },
}

impl EngineError {
    /// Whether this error kind is retryable by the Retry Controller.
    ///
    /// `Aborted` and `Timeout` are caller-intent failures: retrying them is
    /// either a correctness bug or doubles the cancellation latency.
    /// `QueueFull` retry is left to the caller. `Validation` never
    /// succeeds on retry. `WorkerError` is retryable by default.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Aborted { .. } | Self::Timeout { .. } | Self::Validation { .. })
    }

    /// Build a worker-error variant from a worker-reported error.
    #[must_use]
    pub fn worker(name: impl Into<String>, message: impl Into<String>, stack: Option<String>) -> Self {
        Self::WorkerError(WorkerFailure {
            name: name.into(),
            message: message.into(),
            stack,
        })
    }

    /// Build a worker-error variant for a non-zero exit before any reply.
    #[must_use]
    pub fn worker_exit(code: i32) -> Self {
        Self::WorkerError(WorkerFailure {
            name: "WorkerExit".to_string(),
            message: format!("Worker exited with code {code}"),
            stack: None,
        })
    }
}

/// Application-facing result using anyhow for configuration/builder
/// boundaries where callers compose several fallible steps.
pub type AppResult<T> = Result<T, anyhow::Error>;

/// Library-internal result type.
pub type EngineResult<T> = Result<T, EngineError>;
