use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in whole seconds, or 0 if the clock is before the epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
