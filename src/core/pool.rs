//! Pool Manager (C1): worker lifecycle, selection, release, idle
//! reclamation, and overflow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::descriptor::{PoolType, Priority};
use super::error::EngineError;
use super::metrics::Metrics;
use super::queue::QueueLayer;
use super::worker::{Job, WorkerThread};

const AFFINITY_CAP: usize = 50;

/// How long `shutdown()` waits for each pooled worker thread to exit
/// gracefully before logging it as a straggler and detaching it.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Static configuration a [`PoolManager`] is built with (subset of the
/// crate-wide `Configuration`).
#[derive(Debug, Clone)]
pub struct PoolManagerConfig {
    /// Minimum pooled worker count kept alive by idle reclamation.
    pub min_threads: usize,
    /// Maximum pooled worker count strategy 3 will grow to.
    pub pool_size: usize,
    /// Maximum queued waiters before `acquire` fails with `QueueFull`.
    pub max_queue_size: usize,
    /// Maximum concurrently-alive temporary (overflow) workers.
    pub max_temporary_workers: usize,
    /// How long an idle pooled entry waits before reclamation.
    pub worker_idle_timeout: Duration,
    /// When set, affinity-set retention on release is skipped.
    pub low_memory_mode: bool,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            min_threads: 1,
            pool_size: num_cpus::get().max(1),
            max_queue_size: 1024,
            max_temporary_workers: 4,
            worker_idle_timeout: Duration::from_secs(60),
            low_memory_mode: false,
        }
    }
}

struct WorkerEntry<E> {
    id: u64,
    thread: Arc<WorkerThread<E>>,
    busy: bool,
    tasks_executed: u64,
    exec_time_total: Duration,
    failed_count: u64,
    /// Bounded set (cap 50) of fingerprints previously run here.
    affinity: Vec<u64>,
}

impl<E> WorkerEntry<E> {
    fn has_affinity(&self, fingerprint: u64) -> bool {
        self.affinity.contains(&fingerprint)
    }

    fn record_affinity(&mut self, fingerprint: u64, low_memory_mode: bool) {
        if low_memory_mode || self.affinity.contains(&fingerprint) {
            return;
        }
        if self.affinity.len() >= AFFINITY_CAP {
            // Best-effort retention: clear rather than LRU-evict.
            self.affinity.clear();
        }
        self.affinity.push(fingerprint);
    }
}

struct Waiter {
    tx: oneshot::Sender<Result<u64, EngineError>>,
}

struct PoolState<E> {
    entries: Vec<WorkerEntry<E>>,
    queue: QueueLayer<Waiter>,
    next_entry_id: u64,
    next_temp_id: u64,
    active_temporary_workers: usize,
    busy_count: usize,
    idle_count: usize,
    /// Entries currently idle, and when they went idle. Swept by
    /// `reclaim_idle` rather than a per-entry timer task, so `PoolManager`
    /// never needs an `Arc<Self>` self-reference.
    idle_since: HashMap<u64, Instant>,
}

impl<E> PoolState<E> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            queue: QueueLayer::new(),
            next_entry_id: 0,
            next_temp_id: 0,
            active_temporary_workers: 0,
            busy_count: 0,
            idle_count: 0,
            idle_since: HashMap::new(),
        }
    }
}

/// Outcome of a successful `acquire`.
pub struct Acquisition<E> {
    /// The pooled entry id, or `None` iff this is a temporary worker.
    pub entry_id: Option<u64>,
    /// Handle used to dispatch the job onto the worker's thread.
    pub worker: Arc<WorkerThread<E>>,
    /// Whether this entry was selected via an affinity match.
    pub affinity_hit: bool,
}

impl<E> Acquisition<E> {
    /// Whether this acquisition is a temporary (overflow) worker.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.entry_id.is_none()
    }
}

/// Snapshot of a pool's counters, returned by `stats()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Pooled entries currently executing a task.
    pub busy_count: usize,
    /// Pooled entries currently idle.
    pub idle_count: usize,
    /// Temporary workers currently alive.
    pub active_temporary_workers: usize,
    /// Waiters currently queued across all priority bands.
    pub queue_len: usize,
}

/// Owns worker lifecycle for a single pool (one `PoolType`). A
/// `WorkerEntry` never migrates between `PoolManager` instances.
pub struct PoolManager<E> {
    config: PoolManagerConfig,
    pool_type: PoolType,
    state: Mutex<PoolState<E>>,
    metrics: Arc<Metrics>,
    executor: Arc<E>,
}

impl<E: Send + Sync + 'static> PoolManager<E> {
    /// Build a new, empty pool manager for `pool_type`.
    pub fn new(pool_type: PoolType, config: PoolManagerConfig, executor: Arc<E>, metrics: Arc<Metrics>) -> Self {
        Self { config, pool_type, state: Mutex::new(PoolState::new()), metrics, executor }
    }

    /// This pool's type. A `PoolManager` only ever serves one.
    #[must_use]
    pub const fn pool_type(&self) -> PoolType {
        self.pool_type
    }

    fn spawn_entry(&self, state: &mut PoolState<E>) -> (u64, Arc<WorkerThread<E>>) {
        let id = state.next_entry_id;
        state.next_entry_id += 1;
        let thread = Arc::new(WorkerThread::spawn(format!("task-engine-worker-{id}"), Arc::clone(&self.executor)));
        (id, thread)
    }

    /// Eagerly grow the pool to `count` idle pooled entries (clamped to
    /// `pool_size`).
    pub fn warmup(&self, count: usize) {
        let mut state = self.state.lock();
        let target = count.min(self.config.pool_size);
        while state.entries.len() < target {
            let (id, thread) = self.spawn_entry(&mut state);
            state.entries.push(WorkerEntry {
                id,
                thread,
                busy: false,
                tasks_executed: 0,
                exec_time_total: Duration::ZERO,
                failed_count: 0,
                affinity: Vec::new(),
            });
            state.idle_count += 1;
            state.idle_since.insert(id, Instant::now());
        }
    }

    /// Current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            busy_count: state.busy_count,
            idle_count: state.idle_count,
            active_temporary_workers: state.active_temporary_workers,
            queue_len: state.queue.len(),
        }
    }

    /// Number of pooled entries (busy + idle), excluding temporary workers.
    #[must_use]
    pub fn pool_len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Acquire a worker, following the five-step selection algorithm.
    /// Evaluated strictly in order; first success wins.
    pub async fn acquire(&self, priority: Priority, fingerprint: Option<u64>) -> Result<Acquisition<E>, EngineError> {
        let mut rx = None;
        let immediate = {
            let mut state = self.state.lock();

            // Step 1: affinity match among idle entries.
            let affinity_idx = fingerprint.and_then(|fp| state.entries.iter().position(|e| !e.busy && e.has_affinity(fp)));

            if let Some(idx) = affinity_idx {
                self.metrics.record_affinity_hit();
                let (entry_id, worker) = self.claim_idle(&mut state, idx);
                Some(Ok(Acquisition { entry_id: Some(entry_id), worker, affinity_hit: true }))
            } else {
                if fingerprint.is_some() {
                    self.metrics.record_affinity_miss();
                }

                // Step 2: least-used idle entry.
                let least_used_idx = state
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| !e.busy)
                    .min_by_key(|(_, e)| e.tasks_executed)
                    .map(|(i, _)| i);

                if let Some(idx) = least_used_idx {
                    let (entry_id, worker) = self.claim_idle(&mut state, idx);
                    Some(Ok(Acquisition { entry_id: Some(entry_id), worker, affinity_hit: false }))
                } else if state.entries.len() < self.config.pool_size {
                    // Step 3: grow the pool. Born busy: avoids a counter
                    // race between push and the busy-count bump.
                    let (id, thread) = self.spawn_entry(&mut state);
                    state.entries.push(WorkerEntry {
                        id,
                        thread: Arc::clone(&thread),
                        busy: true,
                        tasks_executed: 0,
                        exec_time_total: Duration::ZERO,
                        failed_count: 0,
                        affinity: Vec::new(),
                    });
                    state.busy_count += 1;
                    Some(Ok(Acquisition { entry_id: Some(id), worker: thread, affinity_hit: false }))
                } else if state.active_temporary_workers < self.config.max_temporary_workers {
                    // Step 4: temporary overflow worker.
                    let id = state.next_temp_id;
                    state.next_temp_id += 1;
                    let thread = Arc::new(WorkerThread::spawn(format!("task-engine-temp-{id}"), Arc::clone(&self.executor)));
                    state.active_temporary_workers += 1;
                    self.metrics.record_temporary_worker_created();
                    Some(Ok(Acquisition { entry_id: None, worker: thread, affinity_hit: false }))
                } else if state.queue.len() < self.config.max_queue_size {
                    // Step 5: queue.
                    let (tx, waiter_rx) = oneshot::channel();
                    state.queue.enqueue(Waiter { tx }, priority);
                    rx = Some(waiter_rx);
                    None
                } else {
                    Some(Err(EngineError::QueueFull { max_size: self.config.max_queue_size }))
                }
            }
        };

        if let Some(result) = immediate {
            return result;
        }

        let rx = rx.expect("queued path always sets rx");
        let entry_id = rx.await.map_err(|_| EngineError::Aborted { reason: Some("pool shut down while queued".into()) })??;
        let state = self.state.lock();
        let entry = state.entries.iter().find(|e| e.id == entry_id).expect("granted entry id refers to a live entry");
        Ok(Acquisition { entry_id: Some(entry.id), worker: Arc::clone(&entry.thread), affinity_hit: false })
    }

    fn claim_idle(&self, state: &mut PoolState<E>, idx: usize) -> (u64, Arc<WorkerThread<E>>) {
        let entry = &mut state.entries[idx];
        entry.busy = true;
        let id = entry.id;
        let worker = Arc::clone(&entry.thread);
        state.idle_since.remove(&id);
        state.busy_count += 1;
        state.idle_count -= 1;
        (id, worker)
    }

    /// Release a worker back to the pool.
    ///
    /// `temporary_worker` must be `Some` (the same handle returned by
    /// `acquire`) whenever `entry_id` is `None`, unless `force_terminated`
    /// is set and the caller already tore the worker down itself.
    pub fn release(
        &self,
        entry_id: Option<u64>,
        temporary_worker: Option<Arc<WorkerThread<E>>>,
        execution_time: Duration,
        failed: bool,
        fingerprint: Option<u64>,
        force_terminated: bool,
    ) {
        let Some(entry_id) = entry_id else {
            // Temporary worker: single-use, always terminated on release.
            let mut state = self.state.lock();
            state.active_temporary_workers = state.active_temporary_workers.saturating_sub(1);
            self.metrics.record_temporary_worker_released();
            drop(state);
            if failed {
                self.metrics.record_failure();
            } else {
                self.metrics.record_success();
            }
            if !force_terminated {
                if let Some(worker) = temporary_worker.and_then(|w| Arc::try_unwrap(w).ok()) {
                    worker.hard_stop();
                }
            }
            return;
        };

        let mut state = self.state.lock();

        if force_terminated {
            if let Some(idx) = state.entries.iter().position(|e| e.id == entry_id) {
                let was_busy = state.entries[idx].busy;
                let removed = state.entries.remove(idx);
                if was_busy {
                    state.busy_count = state.busy_count.saturating_sub(1);
                } else {
                    state.idle_count = state.idle_count.saturating_sub(1);
                    state.idle_since.remove(&entry_id);
                }
                drop(state);
                if let Ok(w) = Arc::try_unwrap(removed.thread) {
                    w.hard_stop();
                }
            }
            if failed {
                self.metrics.record_failure();
            } else {
                self.metrics.record_success();
            }
            return;
        }

        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == entry_id) {
            entry.tasks_executed += 1;
            entry.exec_time_total += execution_time;
            if failed {
                entry.failed_count += 1;
            }
            if let Some(fp) = fingerprint {
                let low_memory = self.config.low_memory_mode;
                entry.record_affinity(fp, low_memory);
            }
        }

        if failed {
            self.metrics.record_failure();
        } else {
            self.metrics.record_success();
        }

        // Hand off to the highest-priority queued waiter, if any: the
        // entry stays busy and never observes an idle window.
        if let Some(waiter) = state.queue.dequeue_highest() {
            let _ = waiter.tx.send(Ok(entry_id));
            return;
        }

        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == entry_id) {
            entry.busy = false;
            state.busy_count = state.busy_count.saturating_sub(1);
            state.idle_count += 1;
            state.idle_since.insert(entry_id, Instant::now());
        }
    }

    /// Evict and hard-terminate any pooled entry that has been idle for at
    /// least `worker_idle_timeout`, while keeping at least `min_threads`
    /// entries alive. Intended to be called periodically by the engine's
    /// background sweep, since a per-entry timer task would need a
    /// `'static` handle back into this `PoolManager`.
    pub fn reclaim_idle(&self) {
        let min_threads = self.config.min_threads.max(1);
        let timeout = self.config.worker_idle_timeout;
        let now = Instant::now();

        let stale: Vec<u64> = {
            let state = self.state.lock();
            if state.entries.len() <= min_threads {
                Vec::new()
            } else {
                state
                    .idle_since
                    .iter()
                    .filter(|(_, since)| now.duration_since(**since) >= timeout)
                    .map(|(id, _)| *id)
                    .collect()
            }
        };

        for id in stale {
            let removed = {
                let mut state = self.state.lock();
                if state.entries.len() <= min_threads {
                    break;
                }
                let Some(idx) = state.entries.iter().position(|e| e.id == id && !e.busy) else { continue };
                let entry = state.entries.remove(idx);
                state.idle_count = state.idle_count.saturating_sub(1);
                state.idle_since.remove(&id);
                Some(entry)
            };
            if let Some(entry) = removed {
                if let Ok(w) = Arc::try_unwrap(entry.thread) {
                    w.hard_stop();
                }
            }
        }
    }

    /// Shut down the pool: reject every queued waiter, then join every
    /// pooled entry's thread with a bounded timeout, leaving the pool empty
    /// with no queued waiters. A worker stuck past the timeout is logged and
    /// detached rather than left to hang the caller.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        for waiter in state.queue.drain_all() {
            let _ = waiter.tx.send(Err(EngineError::Aborted { reason: Some("pool shut down".into()) }));
        }
        let entries = std::mem::take(&mut state.entries);
        state.busy_count = 0;
        state.idle_count = 0;
        state.active_temporary_workers = 0;
        state.idle_since.clear();
        drop(state);
        for entry in entries {
            if let Ok(w) = Arc::try_unwrap(entry.thread) {
                let id = entry.id;
                if !w.join_with_timeout(SHUTDOWN_JOIN_TIMEOUT) {
                    tracing::warn!(pool = ?self.pool_type, entry_id = id, "worker did not exit within shutdown timeout, detaching");
                }
            }
        }
    }

    /// Build the boxed job closure used to dispatch work onto a worker's
    /// thread; exposed so `TaskEngine`/`StreamEngine`/`Turbo` share one
    /// call site rather than reaching into `worker::Job` directly.
    pub fn make_job(f: impl FnOnce(&E, &tokio::runtime::Runtime) + Send + 'static) -> Job<E> {
        Box::new(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    fn manager() -> PoolManager<Echo> {
        PoolManager::new(
            PoolType::Normal,
            PoolManagerConfig { pool_size: 2, max_temporary_workers: 1, max_queue_size: 2, ..PoolManagerConfig::default() },
            Arc::new(Echo),
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn grows_then_overflows() {
        let pool = manager();
        let a1 = pool.acquire(Priority::Normal, None).await.unwrap();
        let a2 = pool.acquire(Priority::Normal, None).await.unwrap();
        assert!(!a1.is_temporary());
        assert!(!a2.is_temporary());
        assert_eq!(pool.pool_len(), 2);

        let a3 = pool.acquire(Priority::Normal, None).await.unwrap();
        assert!(a3.is_temporary());
        assert_eq!(pool.stats().active_temporary_workers, 1);
    }

    #[tokio::test]
    async fn queue_full_rejects() {
        let pool = Arc::new(manager());
        let _a1 = pool.acquire(Priority::Normal, None).await.unwrap();
        let _a2 = pool.acquire(Priority::Normal, None).await.unwrap();
        let _a3 = pool.acquire(Priority::Normal, None).await.unwrap(); // temporary

        let p1 = Arc::clone(&pool);
        let p2 = Arc::clone(&pool);
        let f1 = tokio::spawn(async move { p1.acquire(Priority::Normal, None).await });
        let f2 = tokio::spawn(async move { p2.acquire(Priority::Normal, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().queue_len, 2);

        let over = pool.acquire(Priority::Normal, None).await;
        assert!(matches!(over, Err(EngineError::QueueFull { .. })));
        f1.abort();
        f2.abort();
    }

    #[tokio::test]
    async fn release_hands_off_to_queued_waiter_without_going_idle() {
        let pool = Arc::new(manager());
        let a1 = pool.acquire(Priority::Normal, None).await.unwrap();
        let _a2 = pool.acquire(Priority::Normal, None).await.unwrap();
        let _a3 = pool.acquire(Priority::Normal, None).await.unwrap(); // temporary, pool now full

        let waiter_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { waiter_pool.acquire(Priority::High, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().queue_len, 1);

        let entry_id = a1.entry_id.unwrap();
        pool.release(Some(entry_id), None, Duration::from_millis(1), false, None, false);

        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(granted.entry_id, Some(entry_id));
        assert_eq!(pool.stats().idle_count, 0);
    }

    #[tokio::test]
    async fn affinity_hit_prefers_matching_idle_entry() {
        let pool = manager();
        let a1 = pool.acquire(Priority::Normal, None).await.unwrap();
        let id1 = a1.entry_id.unwrap();
        pool.release(Some(id1), None, Duration::from_millis(1), false, Some(42), false);

        let a2 = pool.acquire(Priority::Normal, Some(42)).await.unwrap();
        assert_eq!(a2.entry_id, Some(id1));
        assert!(a2.affinity_hit);
    }
}
