//! Coalescer (C5): shares a single in-flight dispatch across structurally
//! identical concurrent submissions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::descriptor::{TaskDescriptor, TaskValue};
use super::error::EngineError;
use super::fingerprint::{fingerprint, InFlightKey};
use super::metrics::Metrics;
use super::retry::RetryController;
use super::worker::CallableRunner;

const NONDET_CACHE_CAP: usize = 500;

/// Substrings whose presence in a callable's source marks it as
/// non-deterministic and therefore ineligible for coalescing — a
/// conservative textual filter, not a semantic analysis or a correctness
/// mechanism.
const NONDETERMINISM_PATTERNS: &[&str] =
    &["Date.now", "Date()", "Math.random", "performance.now", "crypto.randomUUID", "uuid", "Uuid"];

fn looks_nondeterministic(callable: &str) -> bool {
    NONDETERMINISM_PATTERNS.iter().any(|pattern| callable.contains(pattern))
}

struct InFlight {
    result: Mutex<Option<Result<TaskValue, EngineError>>>,
}

/// Wraps a [`RetryController`], deduplicating concurrent calls that share
/// a structural key so only one of them actually dispatches.
pub struct Coalescer<R> {
    inner: Arc<RetryController<R>>,
    metrics: Arc<Metrics>,
    enabled: bool,
    in_flight: Mutex<HashMap<InFlightKey, Arc<InFlight>>>,
    nondet_cache: Mutex<HashMap<u64, bool>>,
}

impl<R: CallableRunner> Coalescer<R> {
    /// Build a coalescer over `inner`. When `enabled` is `false`, every
    /// call bypasses deduplication entirely.
    #[must_use]
    pub fn new(inner: Arc<RetryController<R>>, metrics: Arc<Metrics>, enabled: bool) -> Self {
        Self { inner, metrics, enabled, in_flight: Mutex::new(HashMap::new()), nondet_cache: Mutex::new(HashMap::new()) }
    }

    fn is_nondeterministic(&self, callable: &str) -> bool {
        let key = fingerprint(callable);
        if let Some(&cached) = self.nondet_cache.lock().get(&key) {
            return cached;
        }
        let verdict = looks_nondeterministic(callable);
        let mut cache = self.nondet_cache.lock();
        if cache.len() >= NONDET_CACHE_CAP {
            // Best-effort retention, not an LRU: halve rather than evict
            // precisely.
            let keep: Vec<u64> = cache.keys().copied().take(NONDET_CACHE_CAP / 2).collect();
            cache.retain(|k, _| keep.contains(k));
        }
        cache.insert(key, verdict);
        verdict
    }

    /// Run `desc`, sharing an in-flight dispatch with any concurrent
    /// structurally-identical call unless coalescing is globally
    /// disabled, `desc.no_coalesce` is set, or the callable matches the
    /// non-determinism filter.
    pub async fn run(&self, desc: &TaskDescriptor) -> Result<TaskValue, EngineError> {
        if !self.enabled || desc.no_coalesce || self.is_nondeterministic(&desc.callable) {
            return self.inner.run(desc).await;
        }

        let key = InFlightKey::for_descriptor(desc);
        let (is_leader, entry) = {
            let mut map = self.in_flight.lock();
            if let Some(existing) = map.get(&key) {
                (false, Arc::clone(existing))
            } else {
                let entry = Arc::new(InFlight { result: Mutex::new(None) });
                map.insert(key, Arc::clone(&entry));
                (true, entry)
            }
        };

        if is_leader {
            self.metrics.record_unique();
            let result = self.inner.run(desc).await;
            *entry.result.lock() = Some(result.clone());
            self.in_flight.lock().remove(&key);
            result
        } else {
            self.metrics.record_coalesced();
            loop {
                if let Some(result) = entry.result.lock().clone() {
                    return result;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    /// Run `desc` through [`Self::run`] and wrap the outcome in
    /// [`crate::core::descriptor::SafeOutcome`], mirroring
    /// [`RetryController::run_safe`] one layer up so sharers of a
    /// coalesced dispatch can each independently wrap the same shared
    /// result without affecting one another.
    pub async fn run_safe(&self, desc: &TaskDescriptor) -> crate::core::descriptor::SafeOutcome<TaskValue> {
        match self.run(desc).await {
            Ok(value) => crate::core::descriptor::SafeOutcome::Fulfilled(value),
            Err(error) => crate::core::descriptor::SafeOutcome::Rejected(error),
        }
    }

    /// A point-in-time view of coalescing effectiveness.
    #[must_use]
    pub fn snapshot(&self) -> super::metrics::CoalescerSnapshot {
        let snap = self.metrics.snapshot();
        let total = snap.coalesced_count + snap.unique_count;
        let rate = if total == 0 { 0.0 } else { snap.coalesced_count as f64 / total as f64 };
        super::metrics::CoalescerSnapshot {
            coalesced: snap.coalesced_count,
            unique: snap.unique_count,
            in_flight: self.in_flight.lock().len(),
            rate,
        }
    }
}
