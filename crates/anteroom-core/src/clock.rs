use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in microseconds. Enqueue scores use this resolution;
/// collisions are resolved by the enqueue script, not here.
pub fn epoch_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Current unix time in whole seconds. Heartbeat and session timestamps use
/// this resolution.
pub fn epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
