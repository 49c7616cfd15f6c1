use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Format a Unix millisecond timestamp as `seconds.millis`, as used in log lines
pub fn format_timestamp_millis(millis: u64) -> String {
    format!("{}.{:03}", millis / 1000, millis % 1000)
}
