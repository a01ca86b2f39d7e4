//! Engine configuration: the frozen-at-read `Configuration` (spec §3).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::descriptor::{RetryPolicy, TaskDescriptor, TaskValue};
use crate::core::error::EngineError;
use crate::core::pool::PoolManagerConfig;

/// Per-pool resource ceilings, read once at construction and never
/// mutated afterwards (spec §3 `resourceLimits`, AMBIENT: modeled as a
/// soft cap surfaced to callers via `EngineError::Validation` at submit
/// time rather than an OS-level cgroup limit, which is out of scope for
/// an in-process worker model).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum args a single `TaskDescriptor` may carry.
    pub max_args: usize,
    /// Maximum nesting depth accepted in a `TaskValue::Array`.
    pub max_value_depth: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { max_args: 64, max_value_depth: 32 }
    }
}

impl ResourceLimits {
    /// Enforce these ceilings against `desc` at the engine's submit
    /// boundary, rejecting with `EngineError::Validation` rather than
    /// letting an oversized payload reach a worker.
    pub fn validate(&self, desc: &TaskDescriptor) -> Result<(), EngineError> {
        if desc.args.len() > self.max_args {
            return Err(EngineError::Validation {
                field: "args".into(),
                expected: format!("at most {} arguments", self.max_args),
            });
        }
        for arg in &desc.args {
            if value_depth(arg) > self.max_value_depth {
                return Err(EngineError::Validation {
                    field: "args".into(),
                    expected: format!("nesting depth at most {}", self.max_value_depth),
                });
            }
        }
        if let Some(env) = &desc.env {
            for value in env.values() {
                if value_depth(value) > self.max_value_depth {
                    return Err(EngineError::Validation {
                        field: "env".into(),
                        expected: format!("nesting depth at most {}", self.max_value_depth),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Nesting depth of a `TaskValue`: a scalar is depth 0, an array is one
/// more than its deepest element (empty array is depth 1).
fn value_depth(value: &TaskValue) -> usize {
    match value {
        TaskValue::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Root engine configuration (spec §3 `Configuration`). Deserialized once
/// at startup and handed to the engine builder; nothing in this crate
/// mutates a `Configuration` after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Maximum pooled worker count the normal pool grows to.
    pub pool_size: usize,
    /// Minimum pooled worker count idle reclamation keeps alive.
    pub min_threads: usize,
    /// Maximum queued waiters before `acquire` fails with `QueueFull`.
    pub max_queue_size: usize,
    /// Maximum concurrently-alive temporary (overflow) workers.
    pub max_temporary_workers: usize,
    /// How long an idle pooled entry waits before reclamation, in
    /// milliseconds (serialized form; see `worker_idle_timeout()`).
    pub worker_idle_timeout_ms: u64,
    /// Advisory cache size for a worker's inherent function cache (spec
    /// §1: the cache itself is opaque to this crate — see
    /// `PoolManagerConfig` for what is actually enforced).
    pub function_cache_size: usize,
    /// When set, affinity-set retention is skipped pool-wide to favor
    /// memory over routing quality.
    pub low_memory_mode: bool,
    /// Soft per-task resource ceilings.
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Default retry policy applied to descriptors that don't override it.
    #[serde(default)]
    pub default_retry: RetryPolicy,
    /// Whether the Coalescer is active pool-wide.
    pub coalescing_enabled: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get().max(1),
            min_threads: 1,
            max_queue_size: 1024,
            max_temporary_workers: 4,
            worker_idle_timeout_ms: 60_000,
            function_cache_size: 128,
            low_memory_mode: false,
            resource_limits: ResourceLimits::default(),
            default_retry: RetryPolicy::default(),
            coalescing_enabled: true,
        }
    }
}

impl Configuration {
    /// This configuration's idle timeout as a `Duration`.
    #[must_use]
    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_idle_timeout_ms)
    }

    /// Validate field-level invariants (spec §3: all fields must be
    /// positive except the booleans and `low_memory_mode`'s peers).
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be greater than 0".into());
        }
        if self.min_threads > self.pool_size {
            return Err("min_threads must not exceed pool_size".into());
        }
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".into());
        }
        if self.worker_idle_timeout_ms == 0 {
            return Err("worker_idle_timeout_ms must be greater than 0".into());
        }
        if self.default_retry.max_attempts == 0 {
            return Err("default_retry.max_attempts must be at least 1".into());
        }
        if self.default_retry.backoff_factor < 1.0 {
            return Err("default_retry.backoff_factor must be >= 1.0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate it.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Project this configuration onto the subset [`PoolManager`] needs.
    ///
    /// [`PoolManager`]: crate::core::pool::PoolManager
    #[must_use]
    pub fn pool_manager_config(&self) -> PoolManagerConfig {
        PoolManagerConfig {
            min_threads: self.min_threads,
            pool_size: self.pool_size,
            max_queue_size: self.max_queue_size,
            max_temporary_workers: self.max_temporary_workers,
            worker_idle_timeout: self.worker_idle_timeout(),
            low_memory_mode: self.low_memory_mode,
        }
    }
}
