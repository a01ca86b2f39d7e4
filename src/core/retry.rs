//! Retry Controller (C4): bounded exponential backoff with jitter wrapped
//! around a single [`TaskEngine`] attempt.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::descriptor::{RetryPolicy, SafeOutcome, TaskDescriptor, TaskValue};
use super::engine::TaskEngine;
use super::error::EngineError;
use super::metrics::Metrics;
use super::worker::CallableRunner;

/// `delay + delay * 0.25 * U(-1, +1)`, computed for `attempt` (1-indexed:
/// the delay taken *before* attempt `attempt + 1`).
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let base_ms = policy.base_delay.as_millis() as f64;
    let max_ms = policy.max_delay.as_millis() as f64;
    let raw_ms = (base_ms * policy.backoff_factor.powi(exponent)).min(max_ms);

    let jitter_unit = rand::rng().random_range(-1.0_f64..=1.0_f64);
    let jittered_ms = (raw_ms + raw_ms * 0.25 * jitter_unit).max(0.0);
    Duration::from_millis(jittered_ms as u64)
}

/// Wraps a [`TaskEngine`], re-invoking `execute_once` per `desc.retry`
/// until it succeeds, exhausts `max_attempts`, or hits a non-retryable
/// error kind.
pub struct RetryController<R> {
    engine: Arc<TaskEngine<R>>,
    metrics: Arc<Metrics>,
}

impl<R: CallableRunner> RetryController<R> {
    /// Build a retry controller over `engine`.
    #[must_use]
    pub fn new(engine: Arc<TaskEngine<R>>, metrics: Arc<Metrics>) -> Self {
        Self { engine, metrics }
    }

    /// Run `desc` through its full retry sequence, ignoring `desc.safe`
    /// (callers that want the non-rejecting shape should use
    /// [`Self::run_safe`]).
    pub async fn run(&self, desc: &TaskDescriptor) -> Result<TaskValue, EngineError> {
        if !desc.retry.is_enabled() {
            return self.engine.execute_once(desc).await;
        }

        let bare = desc.as_bare_attempt();
        let policy = desc.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = self.engine.execute_once(&bare).await;
            match result {
                Ok(value) => return Ok(value),
                Err(error) if attempt < policy.max_attempts && error.is_retryable() => {
                    self.metrics.record_retry();
                    tokio::time::sleep(backoff_delay(&policy, attempt)).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Run `desc` through its full retry sequence and wrap the outcome in
    /// [`SafeOutcome`], honoring `desc.safe` at the attempt-sequence
    /// level: safe mode wraps the whole call, including its retries.
    pub async fn run_safe(&self, desc: &TaskDescriptor) -> SafeOutcome<TaskValue> {
        match self.run(desc).await {
            Ok(value) => SafeOutcome::Fulfilled(value),
            Err(error) => SafeOutcome::Rejected(error),
        }
    }
}
