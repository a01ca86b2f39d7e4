//! Fingerprinting and structural keys for affinity routing and coalescing.
//!
//! Both are best-effort hints, not correctness mechanisms: a fingerprint
//! collision only costs a missed affinity hit, and a structural-key
//! collision between non-equal inputs would only be incorrect for the
//! Coalescer, which is why the non-determinism filter exists as a
//! conservative backstop rather than relying on the key alone.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::descriptor::{TaskDescriptor, TaskValue};

/// A fast, non-cryptographic hash over a callable's source text.
#[must_use]
pub fn fingerprint(callable: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    callable.hash(&mut hasher);
    hasher.finish()
}

/// Stable, order-sensitive, type-tagged linearization of a value, args
/// vector, or env map, used to build the Coalescer's `InFlightKey`. Equal
/// structural keys imply semantically equal inputs for pure callables.
fn hash_value(value: &TaskValue, hasher: &mut impl Hasher) {
    match value {
        TaskValue::Null => 0u8.hash(hasher),
        TaskValue::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        TaskValue::Number(n) => {
            2u8.hash(hasher);
            n.to_bits().hash(hasher);
        }
        TaskValue::String(s) => {
            3u8.hash(hasher);
            s.hash(hasher);
        }
        TaskValue::Array(items) => {
            4u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, hasher);
            }
        }
    }
}

/// A structural key hash for an argument vector.
#[must_use]
pub fn structural_key_args(args: &[TaskValue]) -> u64 {
    let mut hasher = DefaultHasher::new();
    args.len().hash(&mut hasher);
    for arg in args {
        hash_value(arg, &mut hasher);
    }
    hasher.finish()
}

/// A structural key hash for an injected environment map. Entries are
/// sorted by key first so the key is order-insensitive with respect to
/// map construction order while staying deterministic.
#[must_use]
pub fn structural_key_env(env: Option<&std::collections::HashMap<String, TaskValue>>) -> u64 {
    let mut hasher = DefaultHasher::new();
    match env {
        None => 0u8.hash(&mut hasher),
        Some(map) => {
            1u8.hash(&mut hasher);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            keys.len().hash(&mut hasher);
            for key in keys {
                key.hash(&mut hasher);
                hash_value(&map[key], &mut hasher);
            }
        }
    }
    hasher.finish()
}

/// The Coalescer's in-flight deduplication key: `fingerprint(callable) ⨁
/// structural-key(args) ⨁ structural-key(env)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InFlightKey(u64, u64, u64);

impl InFlightKey {
    /// Build the key for a task descriptor.
    #[must_use]
    pub fn for_descriptor(desc: &TaskDescriptor) -> Self {
        Self(
            fingerprint(&desc.callable),
            structural_key_args(&desc.args),
            structural_key_env(desc.env.as_ref()),
        )
    }
}
