//! Wall-clock helpers. Centralized so tests can see where time enters the
//! system, even though nothing here is currently mockable.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, used for envelope timestamps (§6).
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch, used for metric-sample timestamps (§3, §4.7).
pub fn now_sec() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
