//! Wall-clock helpers.
//!
//! Serialized timestamps (`lastUpdated`, `lastSeen`, alert/action stamps)
//! are milliseconds since the Unix epoch. Liveness windows that never leave
//! the process use `tokio::time::Instant` instead so they follow the tokio
//! clock (and can be paused in tests).

use std::time::SystemTime;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
