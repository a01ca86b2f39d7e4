//! Turbo (C7): chunked parallel map/filter/reduce over a normal pool.
//!
//! A chunk's items are processed one `CallableRunner::call` at a time
//! inside a single dispatched job, so a chunk costs one acquire/release
//! pair regardless of its size — the thing that actually parallelizes is
//! running `pool_size`-many chunks concurrently, not per-item dispatch.
//! There is no typed-buffer fast path here: `TaskValue` is always the
//! columnar representation, so every chunk takes the per-item-copy path
//! that stands in as a fallback when a host can't offer a contiguous
//! numeric buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::descriptor::{Priority, TaskValue};
use super::error::EngineError;
use super::fingerprint::fingerprint;
use super::pool::PoolManager;
use super::worker::{tracing_log_sink, CallableRunner};

/// Below this many items, parallelizing costs more than it saves; the
/// whole input runs as a single chunk on one worker.
pub const TURBO_THRESHOLD: usize = 10_000;

/// A chunk never has fewer items than this, which bounds how many chunks
/// a given input can be split into.
pub const MIN_ITEMS_PER_WORKER: usize = 1_000;

/// Exposes [`chunk_bounds`] for the benchmark suite, which lives outside
/// this crate's test-only visibility boundary.
#[doc(hidden)]
#[must_use]
pub fn chunk_bounds_for_bench(len: usize, pool_size: usize) -> Vec<(usize, usize)> {
    chunk_bounds(len, pool_size)
}

fn chunk_bounds(len: usize, pool_size: usize) -> Vec<(usize, usize)> {
    if len == 0 {
        return Vec::new();
    }
    // spec §4.7: `workers = min(maxPoolSize, ceil(N / MIN_ITEMS_PER_WORKER))`,
    // `chunkSize = ceil(N / workers)`, chunk `i` covers
    // `[i*chunkSize, min((i+1)*chunkSize, N))` — every chunk but the last is
    // exactly `chunkSize`, and the last absorbs whatever remains.
    let n_chunks = if len < TURBO_THRESHOLD { 1 } else { pool_size.max(1).min(len.div_ceil(MIN_ITEMS_PER_WORKER.max(1))).max(1) };
    let chunk_size = len.div_ceil(n_chunks);
    let mut bounds = Vec::with_capacity(n_chunks);
    let mut start = 0;
    while start < len {
        let end = (start + chunk_size).min(len);
        bounds.push((start, end));
        start = end;
    }
    bounds
}

/// Parallel map/filter/reduce over a shared normal pool.
pub struct Turbo<R> {
    pool: Arc<PoolManager<R>>,
}

impl<R: CallableRunner> Turbo<R> {
    /// Build a Turbo front-end over `pool` (typically the same pool the
    /// Task Engine uses).
    #[must_use]
    pub fn new(pool: Arc<PoolManager<R>>) -> Self {
        Self { pool }
    }

    async fn run_chunk(
        &self,
        callable: &str,
        args_for_item: impl Fn(usize) -> Vec<TaskValue>,
        range: (usize, usize),
        aborted: &Arc<AtomicBool>,
    ) -> Result<Vec<TaskValue>, EngineError> {
        let fp = fingerprint(callable);
        let acquisition = self.pool.acquire(Priority::High, Some(fp)).await?;
        let entry_id = acquisition.entry_id;
        let worker = Arc::clone(&acquisition.worker);
        let temporary_worker = acquisition.is_temporary().then(|| Arc::clone(&acquisition.worker));

        let items: Vec<Vec<TaskValue>> = (range.0..range.1).map(args_for_item).collect();
        let callable = callable.to_string();
        let aborted_flag = Arc::clone(aborted);
        let (tx, rx) = tokio::sync::oneshot::channel::<Result<Vec<TaskValue>, EngineError>>();

        let dispatched = worker.dispatch(PoolManager::make_job(move |runner: &R, rt| {
            let mut out = Vec::with_capacity(items.len());
            let mut failure = None;
            for item_args in items {
                if aborted_flag.load(Ordering::Acquire) {
                    failure = Some(EngineError::Aborted { reason: Some("sibling chunk failed".into()) });
                    break;
                }
                let log = tracing_log_sink();
                match rt.block_on(runner.call(&callable, &item_args, None, log)) {
                    Ok(value) => out.push(value),
                    Err(e) => {
                        failure = Some(EngineError::WorkerError(e));
                        break;
                    }
                }
            }
            let result = match failure {
                Some(e) => {
                    aborted_flag.store(true, Ordering::Release);
                    Err(e)
                }
                None => Ok(out),
            };
            let _ = tx.send(result);
        }));

        if !dispatched {
            self.pool.release(entry_id, temporary_worker, std::time::Duration::ZERO, true, Some(fp), true);
            return Err(EngineError::worker_exit(-1));
        }

        let start = std::time::Instant::now();
        let result = rx.await.unwrap_or_else(|_| Err(EngineError::worker_exit(-1)));
        let failed = result.is_err();
        self.pool.release(entry_id, temporary_worker, start.elapsed(), failed, Some(fp), false);
        result
    }

    /// Apply `callable` to every item, preserving order (merged back via
    /// an offset-based contiguous write per chunk).
    pub async fn map(&self, items: &[TaskValue], callable: &str) -> Result<Vec<TaskValue>, EngineError> {
        let pool_size = self.pool.pool_len().max(1);
        let bounds = chunk_bounds(items.len(), pool_size);
        let aborted = Arc::new(AtomicBool::new(false));
        let items = items.to_vec();

        let mut tasks = Vec::with_capacity(bounds.len());
        for range in bounds.clone() {
            let turbo = TurboRef { pool: Arc::clone(&self.pool) };
            let callable = callable.to_string();
            let items = items.clone();
            let aborted = Arc::clone(&aborted);
            tasks.push(tokio::spawn(async move {
                turbo.run_chunk_free(&callable, |i| vec![items[i].clone()], range, &aborted).await
            }));
        }

        let mut out = vec![TaskValue::Null; items.len()];
        for (handle, (start, end)) in tasks.into_iter().zip(bounds) {
            let chunk = handle.await.map_err(|_| EngineError::worker_exit(-1))??;
            out[start..end].clone_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Keep only items for which `callable` returns truthy, preserving
    /// order (merged via a two-pass length-then-copy over each chunk's
    /// kept items).
    pub async fn filter(&self, items: &[TaskValue], callable: &str) -> Result<Vec<TaskValue>, EngineError> {
        let pool_size = self.pool.pool_len().max(1);
        let bounds = chunk_bounds(items.len(), pool_size);
        let aborted = Arc::new(AtomicBool::new(false));
        let items = items.to_vec();

        let mut tasks = Vec::with_capacity(bounds.len());
        for range in bounds.clone() {
            let turbo = TurboRef { pool: Arc::clone(&self.pool) };
            let callable = callable.to_string();
            let items_clone = items.clone();
            let aborted = Arc::clone(&aborted);
            tasks.push(tokio::spawn(async move {
                turbo
                    .run_chunk_free(&callable, |i| vec![items_clone[i].clone()], range, &aborted)
                    .await
                    .map(|kept| (range, items_clone, kept))
            }));
        }

        let mut ordered_chunks: Vec<(usize, usize, Vec<TaskValue>)> = Vec::with_capacity(tasks.len());
        for handle in tasks {
            let (range, chunk_items, predicate_results) = handle.await.map_err(|_| EngineError::worker_exit(-1))??;
            let kept: Vec<TaskValue> = predicate_results
                .into_iter()
                .zip(chunk_items[range.0..range.1].iter())
                .filter_map(|(pred, item)| truthy(&pred).then(|| item.clone()))
                .collect();
            ordered_chunks.push((range.0, range.1, kept));
        }
        ordered_chunks.sort_by_key(|(start, _, _)| *start);

        let mut out = Vec::new();
        for (_, _, kept) in ordered_chunks {
            out.extend(kept);
        }
        Ok(out)
    }

    /// Fold `callable(acc, item)` across `items`, starting from `init`.
    /// `init` must be a left identity for `callable` — each chunk folds
    /// independently, in a single worker dispatch, starting from `init`;
    /// the ordered partials are then folded together the same way, also
    /// starting from `init`.
    pub async fn reduce(&self, items: &[TaskValue], callable: &str, init: TaskValue) -> Result<TaskValue, EngineError> {
        let pool_size = self.pool.pool_len().max(1);
        let bounds = chunk_bounds(items.len(), pool_size);
        if bounds.is_empty() {
            return Ok(init);
        }
        let aborted = Arc::new(AtomicBool::new(false));
        let items = items.to_vec();

        let mut tasks = Vec::with_capacity(bounds.len());
        for range in bounds {
            let turbo = TurboRef { pool: Arc::clone(&self.pool) };
            let callable = callable.to_string();
            let items = items.clone();
            let init = init.clone();
            let aborted = Arc::clone(&aborted);
            tasks.push(tokio::spawn(async move { turbo.fold_chunk_free(&callable, &items, range, init, &aborted).await }));
        }

        let mut partials = Vec::with_capacity(tasks.len());
        for handle in tasks {
            partials.push(handle.await.map_err(|_| EngineError::worker_exit(-1))??);
        }

        // Combine the ordered partials sequentially, starting again from
        // `init` per spec §4.7: "the combiner must treat init as a
        // left-identity". One more worker dispatch folds the whole
        // partials vector in place, same as a chunk fold.
        let aborted = Arc::new(AtomicBool::new(false));
        self.fold_chunk_free_pub(callable, &partials, (0, partials.len()), init, &aborted).await
    }

    async fn fold_chunk_free_pub(
        &self,
        callable: &str,
        items: &[TaskValue],
        range: (usize, usize),
        init: TaskValue,
        aborted: &Arc<AtomicBool>,
    ) -> Result<TaskValue, EngineError> {
        TurboRef { pool: Arc::clone(&self.pool) }.fold_chunk_free(callable, items, range, init, aborted).await
    }
}

fn truthy(value: &TaskValue) -> bool {
    match value {
        TaskValue::Null => false,
        TaskValue::Bool(b) => *b,
        TaskValue::Number(n) => *n != 0.0,
        TaskValue::String(s) => !s.is_empty(),
        TaskValue::Array(items) => !items.is_empty(),
    }
}

/// A `'static` handle to the pool, used so chunk work can run inside
/// `tokio::spawn` without borrowing `&Turbo`.
struct TurboRef<R> {
    pool: Arc<PoolManager<R>>,
}

impl<R: CallableRunner> TurboRef<R> {
    async fn run_chunk_free(
        &self,
        callable: &str,
        args_for_item: impl Fn(usize) -> Vec<TaskValue>,
        range: (usize, usize),
        aborted: &Arc<AtomicBool>,
    ) -> Result<Vec<TaskValue>, EngineError> {
        Turbo { pool: Arc::clone(&self.pool) }.run_chunk(callable, args_for_item, range, aborted).await
    }

    /// Fold `items[range]` into a single partial value, starting from
    /// `init`, inside one worker dispatch: the job itself loops
    /// `acc = callable(acc, item)` across the whole chunk, so a chunk of
    /// any size costs exactly one acquire/release pair, matching `map`
    /// and `filter`'s per-chunk dispatch cost.
    async fn fold_chunk_free(
        &self,
        callable: &str,
        items: &[TaskValue],
        range: (usize, usize),
        init: TaskValue,
        aborted: &Arc<AtomicBool>,
    ) -> Result<TaskValue, EngineError> {
        if range.0 >= range.1 {
            return Ok(init);
        }
        let fp = fingerprint(callable);
        let acquisition = self.pool.acquire(Priority::High, Some(fp)).await?;
        let entry_id = acquisition.entry_id;
        let worker = Arc::clone(&acquisition.worker);
        let temporary_worker = acquisition.is_temporary().then(|| Arc::clone(&acquisition.worker));

        let chunk_items: Vec<TaskValue> = items[range.0..range.1].to_vec();
        let callable = callable.to_string();
        let aborted_flag = Arc::clone(aborted);
        let (tx, rx) = tokio::sync::oneshot::channel::<Result<TaskValue, EngineError>>();

        let dispatched = worker.dispatch(PoolManager::make_job(move |runner: &R, rt| {
            let mut acc = init;
            let mut failure = None;
            for item in chunk_items {
                if aborted_flag.load(Ordering::Acquire) {
                    failure = Some(EngineError::Aborted { reason: Some("sibling chunk failed".into()) });
                    break;
                }
                let log = tracing_log_sink();
                match rt.block_on(runner.call(&callable, &[acc.clone(), item], None, log)) {
                    Ok(value) => acc = value,
                    Err(e) => {
                        failure = Some(EngineError::WorkerError(e));
                        break;
                    }
                }
            }
            let result = match failure {
                Some(e) => {
                    aborted_flag.store(true, Ordering::Release);
                    Err(e)
                }
                None => Ok(acc),
            };
            let _ = tx.send(result);
        }));

        if !dispatched {
            self.pool.release(entry_id, temporary_worker, std::time::Duration::ZERO, true, Some(fp), true);
            return Err(EngineError::worker_exit(-1));
        }

        let start = std::time::Instant::now();
        let result = rx.await.unwrap_or_else(|_| Err(EngineError::worker_exit(-1)));
        let failed = result.is_err();
        self.pool.release(entry_id, temporary_worker, start.elapsed(), failed, Some(fp), false);
        result
    }
}
