// Time utilities.

/// Current Unix timestamp, seconds.
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current Unix timestamp, seconds, as u64 (wire-format messages use unsigned
/// timestamps; this is never called before the epoch).
pub fn now() -> u64 {
    current_timestamp().max(0) as u64
}

/// Current Unix timestamp in milliseconds, used for backoff/ETA math.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
