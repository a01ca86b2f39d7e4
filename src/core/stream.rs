//! Stream Engine (C6): the generator pool's pull-based reader.
//!
//! Generators bypass the Retry Controller and Coalescer entirely:
//! retrying a partially-consumed stream or sharing it across unrelated
//! callers has no sound semantics. A Rust closure can't
//! actually suspend mid-body the way a JS generator can, so eager
//! production is bounded by a small bounded `flume` channel: the worker's
//! `emit` callback blocks on a full channel, which gives the reader real
//! pull-based backpressure even though the producer runs to completion on
//! its own thread rather than yielding control back to the host between
//! items.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::descriptor::{TaskDescriptor, TaskValue};
use super::error::EngineError;
use super::fingerprint::fingerprint;
use super::metrics::Metrics;
use super::pool::PoolManager;
use super::worker::{tracing_log_sink, GeneratorMessage, GeneratorRunner};

const GENERATOR_CHANNEL_CAPACITY: usize = 16;

/// A lazily-consumed handle over a running generator task.
pub struct GeneratorHandle<R> {
    rx: flume::Receiver<GeneratorMessage>,
    pool: Arc<PoolManager<R>>,
    entry_id: Option<u64>,
    temporary_worker: Option<Arc<super::worker::WorkerThread<R>>>,
    fingerprint: u64,
    return_value: Option<TaskValue>,
    closed: AtomicBool,
}

impl<R: GeneratorRunner> GeneratorHandle<R> {
    /// Pull the next yielded value, or `None` once the generator has
    /// returned and closed. Calling `next` after closing always returns
    /// `None`, so cleanup is idempotent.
    pub async fn next(&mut self) -> Option<Result<TaskValue, EngineError>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        loop {
            match self.rx.recv_async().await {
                Ok(GeneratorMessage::Yield(value)) => return Some(Ok(value)),
                Ok(GeneratorMessage::Return(value)) => {
                    self.return_value = Some(value);
                    // Keep looping: `End` still follows.
                }
                Ok(GeneratorMessage::End) => {
                    // The generator body has already run to completion by
                    // the time `End` arrives: the worker is idle, not
                    // mid-execution, so it goes back to rotation instead of
                    // being evicted.
                    self.finish(false, false);
                    return None;
                }
                Ok(GeneratorMessage::Error(failure)) => {
                    self.finish(true, true);
                    return Some(Err(EngineError::WorkerError(failure)));
                }
                Err(_) => {
                    // Worker thread dropped the sender without an End —
                    // treat as a crash.
                    self.finish(true, true);
                    return Some(Err(EngineError::worker_exit(-1)));
                }
            }
        }
    }

    /// The generator's final return value, available once `next` has
    /// returned `None` after an `End` message.
    #[must_use]
    pub fn return_value(&self) -> Option<&TaskValue> {
        self.return_value.as_ref()
    }

    /// Stop consuming and release the worker early. Safe to call more
    /// than once, and safe to call after natural completion.
    ///
    /// Called before an `End` has been observed, so the generator body may
    /// genuinely be mid-execution — the worker is always force-terminated
    /// rather than returned to rotation.
    pub fn close(&mut self) {
        self.finish(false, true);
    }

    /// `failed` records the task outcome for `Metrics`; `force_terminate`
    /// decides whether the worker is evicted or returned to the pool.
    /// Only the natural `End` path passes `force_terminate = false`: every
    /// other caller (`close()` before `End`, a worker-reported `Error`, or
    /// a crash) may be cutting the generator off mid-execution, so the
    /// worker is never safe to reuse there.
    fn finish(&mut self, failed: bool, force_terminate: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.release(self.entry_id, self.temporary_worker.take(), std::time::Duration::ZERO, failed, Some(self.fingerprint), force_terminate);
    }
}

impl<R> Drop for GeneratorHandle<R> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.closed.store(true, Ordering::Release);
            self.pool.release(self.entry_id, self.temporary_worker.take(), std::time::Duration::ZERO, true, Some(self.fingerprint), true);
        }
    }
}

/// Starts generator tasks against a generator pool.
///
/// Holds no `Metrics` handle of its own: a generator's success/failure
/// isn't known at dispatch time, only once [`GeneratorHandle::finish`]
/// runs, at which point `PoolManager::release` records it — recording
/// here too would double-count every stream.
pub struct StreamEngine<R> {
    pool: Arc<PoolManager<R>>,
}

impl<R: GeneratorRunner> StreamEngine<R> {
    /// Build a stream engine over a generator pool.
    #[must_use]
    pub fn new(pool: Arc<PoolManager<R>>) -> Self {
        Self { pool }
    }

    /// Acquire a worker and start the generator, returning a handle the
    /// caller pulls values from. No retry and no coalescing wrap this
    /// call.
    pub async fn start(&self, desc: &TaskDescriptor) -> Result<GeneratorHandle<R>, EngineError> {
        if let Some(token) = &desc.cancellation {
            if token.is_aborted() {
                return Err(EngineError::Aborted { reason: token.reason() });
            }
        }

        let fp = fingerprint(&desc.callable);
        let acquisition = self.pool.acquire(desc.priority, Some(fp)).await?;
        let entry_id = acquisition.entry_id;
        let worker = Arc::clone(&acquisition.worker);
        let temporary_worker = acquisition.is_temporary().then(|| Arc::clone(&acquisition.worker));

        let (tx, rx) = flume::bounded::<GeneratorMessage>(GENERATOR_CHANNEL_CAPACITY);
        let callable = desc.callable.clone();
        let args = desc.args.clone();
        let env = desc.env.clone();
        let log = tracing_log_sink();
        let emit_tx = tx.clone();
        let emit = Arc::new(move |value: TaskValue| {
            let _ = emit_tx.send(GeneratorMessage::Yield(value));
        });

        let dispatched = worker.dispatch(PoolManager::make_job(move |runner: &R, rt| {
            let outcome = rt.block_on(runner.call(&callable, &args, env.as_ref(), emit, log));
            match outcome {
                Ok(value) => {
                    let _ = tx.send(GeneratorMessage::Return(value));
                    let _ = tx.send(GeneratorMessage::End);
                }
                Err(failure) => {
                    let _ = tx.send(GeneratorMessage::Error(failure));
                }
            }
        }));

        if !dispatched {
            self.pool.release(entry_id, temporary_worker, std::time::Duration::ZERO, true, Some(fp), true);
            return Err(EngineError::worker_exit(-1));
        }

        Ok(GeneratorHandle {
            rx,
            pool: Arc::clone(&self.pool),
            entry_id,
            temporary_worker,
            fingerprint: fp,
            return_value: None,
            closed: AtomicBool::new(false),
        })
    }
}
