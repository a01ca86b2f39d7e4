//! The host/worker message shapes and the dedicated-thread worker that
//! executes them.
//!
//! Each worker owns a single-threaded Tokio runtime and a bounded job
//! queue of length one (a worker runs at most one task at a time). A job
//! is a boxed closure capturing whatever reply channel its caller wants
//! populated; this keeps the worker thread oblivious to whether it is
//! serving the Task Engine, the Stream Engine, or Turbo, mirroring the
//! teacher's generic `WorkerPool<P, R, E>` while dropping the
//! `Serialize`/`Deserialize` bounds that existed there only for
//! cross-process payload transport, which this crate has no need for.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use crossbeam_channel::{bounded, Sender, TrySendError};

use super::descriptor::TaskValue;
use super::error::WorkerFailure;

/// Out-of-band log forwarding from a worker to the host's logger, called
/// from inside [`CallableRunner::call`]. Cheap to clone and share across
/// a dispatch's lifetime.
pub type LogSink = Arc<dyn Fn(&str, &[String]) + Send + Sync>;

/// Forward a worker's log message to `tracing`, matching the teacher's
/// `util::telemetry` convention of routing everything through one sink.
#[must_use]
pub fn tracing_log_sink() -> LogSink {
    Arc::new(|level: &str, args: &[String]| {
        let message = args.join(" ");
        match level {
            "error" => tracing::error!(target: "worker", "{message}"),
            "warn" => tracing::warn!(target: "worker", "{message}"),
            "debug" => tracing::debug!(target: "worker", "{message}"),
            _ => tracing::info!(target: "worker", "{message}"),
        }
    })
}

/// The host-supplied boundary that actually executes a callable.
/// Marshalling and running arbitrary callable source is out of scope for
/// this crate — a host embeds this trait over whatever sandboxed
/// interpreter, subprocess, or plugin runtime it uses.
#[async_trait]
pub trait CallableRunner: Send + Sync + 'static {
    /// Execute `callable` with the given arguments and optional injected
    /// environment, forwarding any log lines through `log`.
    async fn call(
        &self,
        callable: &str,
        args: &[TaskValue],
        env: Option<&HashMap<String, TaskValue>>,
        log: LogSink,
    ) -> Result<TaskValue, WorkerFailure>;
}

/// The host-supplied boundary for the generator pool: executes `callable`
/// and pushes zero or more yielded values through `emit` before settling
/// with a final return value.
#[async_trait]
pub trait GeneratorRunner: Send + Sync + 'static {
    /// Run the generator body, calling `emit` for each yielded value.
    async fn call(
        &self,
        callable: &str,
        args: &[TaskValue],
        env: Option<&HashMap<String, TaskValue>>,
        emit: Arc<dyn Fn(TaskValue) + Send + Sync>,
        log: LogSink,
    ) -> Result<TaskValue, WorkerFailure>;
}

/// Host → worker Request Message for the normal pool.
pub struct RequestMessage {
    /// Callable source or opaque id.
    pub fn_ref: String,
    /// Positional arguments.
    pub args: Vec<TaskValue>,
    /// Optional injected environment, already linearized to owned values.
    pub context: Option<std::collections::HashMap<String, TaskValue>>,
}

/// Worker → host Response Messages for the normal pool.
pub enum ResponseMessage {
    /// `{ ok: true, value }`.
    Ok(TaskValue),
    /// `{ ok: false, error }`.
    Err(WorkerFailure),
}

/// Worker → host Response Messages for the generator pool.
pub enum GeneratorMessage {
    /// `{ type: 'yield', value }`.
    Yield(TaskValue),
    /// `{ type: 'return', value }` — at most once, before `End`.
    Return(TaskValue),
    /// `{ type: 'end' }`.
    End,
    /// `{ type: 'error', error }`.
    Error(WorkerFailure),
}

/// Out-of-band log message forwarded to the host's logger without
/// settling any pending future.
pub struct LogMessage {
    /// Log level as reported by the worker.
    pub level: String,
    /// Pre-formatted log arguments.
    pub args: Vec<String>,
}

/// Worker → host Turbo Response, emitted by Turbo chunk workers.
pub enum TurboMessage {
    /// `{ type: 'turbo_complete', worker_id, result, items_processed }`.
    Complete {
        /// The pool-assigned worker id that ran this chunk.
        worker_id: u64,
        /// The chunk's results, in input order.
        result: Vec<TaskValue>,
        /// Number of items processed in this chunk.
        items_processed: usize,
    },
    /// `{ type: 'turbo_error', worker_id, error }`.
    Error {
        /// The pool-assigned worker id that failed.
        worker_id: u64,
        /// The error that aborted this chunk.
        error: WorkerFailure,
    },
}

/// A unit of work dispatched onto a worker's dedicated thread. Boxed so
/// the Task Engine, Stream Engine, and Turbo can each hand the worker a
/// closure over their own executor trait and reply channel without the
/// worker thread knowing about any of those types.
pub type Job<E> = Box<dyn FnOnce(&E, &tokio::runtime::Runtime) + Send + 'static>;

/// A dedicated OS thread hosting a single-threaded Tokio runtime, standing
/// in for a sandboxed worker process. Accepts at most one in-flight job
/// at a time via a single-slot bounded channel, enforcing "dispatches at
/// most one task per worker at a time" at the transport level too.
pub struct WorkerThread<E> {
    tx: Sender<Job<E>>,
    handle: Option<JoinHandle<()>>,
}

impl<E: Send + Sync + 'static> WorkerThread<E> {
    /// Spawn a new worker thread bound to `executor`.
    pub fn spawn(name: impl Into<String>, executor: Arc<E>) -> Self {
        let (tx, rx) = bounded::<Job<E>>(1);
        let name = name.into();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(worker = %name, error = %e, "failed to build worker runtime");
                        return;
                    }
                };
                while let Ok(job) = rx.recv() {
                    job(&executor, &rt);
                }
                tracing::debug!(worker = %name, "worker thread exiting");
            })
            .expect("failed to spawn worker thread");

        Self { tx, handle: Some(handle) }
    }

    /// Dispatch a job to this worker. Fails only if the worker's single
    /// slot is already occupied, which cannot happen under the Pool
    /// Manager's `busy` invariant — surfaced as a `bool` so callers can
    /// assert rather than thread an error type through.
    pub fn dispatch(&self, job: Job<E>) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
        }
    }

    /// Hard-terminate this worker: drop the dispatch channel so the
    /// thread's recv loop exits once its current job (if any) returns,
    /// and detach the join handle without waiting. This is the
    /// process-kill substitute for a pool; the entry is evicted from the
    /// pool by the caller in the same breath, so the orphaned thread can
    /// never be handed more work.
    pub fn hard_stop(mut self) {
        // Dropping `tx` happens implicitly when `self` is dropped; we take
        // the join handle out first so Drop doesn't try to join it.
        if let Some(handle) = self.handle.take() {
            drop(handle); // detach: let the OS reclaim the thread on exit
        }
    }

    /// Join the worker thread, waiting up to `timeout` for a graceful
    /// exit once the dispatch channel has been dropped (used by
    /// `shutdown()`).
    pub fn join_with_timeout(mut self, timeout: std::time::Duration) -> bool {
        drop(self.tx_take());
        let Some(handle) = self.handle.take() else { return true };
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let waiter = std::thread::spawn(move || {
            let joined = handle.join().is_ok();
            let _ = done_tx.send(joined);
        });
        let joined = done_rx.recv_timeout(timeout).unwrap_or(false);
        drop(waiter);
        joined
    }

    fn tx_take(&mut self) -> Sender<Job<E>> {
        // Replace with a disconnected sender by constructing a fresh
        // channel and immediately dropping its receiver.
        let (tx, _rx) = bounded::<Job<E>>(0);
        std::mem::replace(&mut self.tx, tx)
    }
}

impl<E> Drop for WorkerThread<E> {
    fn drop(&mut self) {
        // Don't join in Drop: a pool drop must never block the caller.
        // Explicit `shutdown()`/`hard_stop()` handle graceful cleanup.
    }
}
