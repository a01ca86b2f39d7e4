//! Wall-clock helpers used for timestamps and deadline math.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in whole milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
