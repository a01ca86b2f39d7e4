//! Task Engine (C3): the single-attempt execution protocol.
//!
//! `TaskEngine::execute_once` is deliberately the only place that talks to
//! a worker directly; the Retry Controller and Coalescer both wrap it
//! rather than reimplementing any part of the dispatch/timeout/cancel
//! dance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::descriptor::{SafeOutcome, TaskDescriptor, TaskValue};
use super::error::EngineError;
use super::fingerprint::fingerprint;
use super::pool::PoolManager;
use super::worker::{tracing_log_sink, CallableRunner, ResponseMessage};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Executes [`TaskDescriptor`]s against a normal pool, one attempt at a
/// time.
///
/// Holds no `Metrics` handle of its own: [`PoolManager::release`] is the
/// single place that records `tasks_executed`/`tasks_failed`, so every
/// attempt is counted exactly once regardless of which outcome branch
/// below released it.
pub struct TaskEngine<R> {
    pool: Arc<PoolManager<R>>,
}

impl<R: CallableRunner> TaskEngine<R> {
    /// Build an engine over an already-constructed pool.
    #[must_use]
    pub fn new(pool: Arc<PoolManager<R>>) -> Self {
        Self { pool }
    }

    /// Access the underlying pool (used by `Turbo` to share the same
    /// worker fleet and by the engine builder for warmup/shutdown).
    #[must_use]
    pub fn pool(&self) -> &Arc<PoolManager<R>> {
        &self.pool
    }

    /// Run `desc` to completion exactly once: no retry, no coalescing, no
    /// safe-mode wrapping. Safe-mode is applied by the caller that owns
    /// the full attempt sequence — the Retry Controller when `desc.retry`
    /// is enabled, or directly by [`Self::execute_once_safe`] otherwise
    /// ("Safe mode" is defined over the whole attempt sequence, not a
    /// single bare attempt).
    pub async fn execute_once(&self, desc: &TaskDescriptor) -> Result<TaskValue, EngineError> {
        self.execute_once_bare(desc).await
    }

    /// Run `desc` once and wrap the outcome in [`SafeOutcome`] regardless
    /// of `desc.safe` (used by callers that always want the
    /// non-rejecting shape).
    pub async fn execute_once_safe(&self, desc: &TaskDescriptor) -> SafeOutcome<TaskValue> {
        match self.execute_once_bare(desc).await {
            Ok(value) => SafeOutcome::Fulfilled(value),
            Err(error) => SafeOutcome::Rejected(error),
        }
    }

    /// The execution protocol: pre-dispatch cancellation check, acquire a
    /// worker, dispatch, then race the reply against the timeout and a
    /// cancellation poll.
    async fn execute_once_bare(&self, desc: &TaskDescriptor) -> Result<TaskValue, EngineError> {
        // Step 1: pre-dispatch cancellation check.
        if let Some(token) = &desc.cancellation {
            if token.is_aborted() {
                return Err(EngineError::Aborted { reason: token.reason() });
            }
        }

        // Step 2: fingerprint for affinity routing.
        let fp = fingerprint(&desc.callable);

        // Step 3: acquire a worker.
        let acquisition = self.pool.acquire(desc.priority, Some(fp)).await?;
        let entry_id = acquisition.entry_id;
        let worker = Arc::clone(&acquisition.worker);
        let temporary_worker = acquisition.is_temporary().then(|| Arc::clone(&acquisition.worker));

        // Step 4/5: install the reply channel and dispatch the job.
        let (tx, rx) = oneshot::channel::<ResponseMessage>();
        let callable = desc.callable.clone();
        let args = desc.args.clone();
        let env = desc.env.clone();
        let log = tracing_log_sink();
        let dispatched = worker.dispatch(PoolManager::make_job(move |runner: &R, rt| {
            let outcome = rt.block_on(runner.call(&callable, &args, env.as_ref(), log));
            let message = match outcome {
                Ok(value) => ResponseMessage::Ok(value),
                Err(failure) => ResponseMessage::Err(failure),
            };
            let _ = tx.send(message);
        }));

        if !dispatched {
            // The pool's busy invariant guarantees a fresh acquisition's
            // slot is free; a failed dispatch means the worker died
            // between acquire and dispatch. Treat it like a worker crash.
            self.pool.release(entry_id, temporary_worker, Duration::ZERO, true, Some(fp), true);
            return Err(EngineError::worker_exit(-1));
        }

        let started = Instant::now();
        let mut rx = rx;
        let mut cancel_ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
        cancel_ticker.tick().await; // consume the immediate first tick

        let outcome = loop {
            let timeout_left = desc.timeout.map(|t| t.saturating_sub(started.elapsed()));

            tokio::select! {
                biased;

                reply = &mut rx => {
                    break match reply {
                        Ok(ResponseMessage::Ok(value)) => Ok(value),
                        Ok(ResponseMessage::Err(failure)) => Err(EngineError::WorkerError(failure)),
                        Err(_) => Err(EngineError::worker_exit(-1)),
                    };
                }

                () = tokio::time::sleep(timeout_left.unwrap_or(Duration::MAX)), if desc.timeout.is_some() => {
                    break Err(EngineError::Timeout { timeout_ms: desc.timeout.unwrap_or_default().as_millis() as u64 });
                }

                _ = cancel_ticker.tick() => {
                    if let Some(token) = &desc.cancellation {
                        if token.is_aborted() {
                            break Err(EngineError::Aborted { reason: token.reason() });
                        }
                    }
                }
            }
        };

        let elapsed = started.elapsed();
        match &outcome {
            Ok(_) => {
                self.pool.release(entry_id, temporary_worker, elapsed, false, Some(fp), false);
            }
            Err(EngineError::Timeout { .. } | EngineError::Aborted { .. }) => {
                // Worker keeps running a computation we can no longer
                // observe; evict it rather than return it to rotation.
                // `release`'s `failed=true` is what records this in
                // `Metrics` — see the struct doc above.
                self.pool.release(entry_id, temporary_worker, elapsed, true, Some(fp), true);
            }
            Err(_) => {
                self.pool.release(entry_id, temporary_worker, elapsed, true, Some(fp), false);
            }
        }

        outcome
    }
}
