// Time types and helpers used across the pool.
//
// Everything here reads the system clock and is only suitable for
// bookkeeping: activity timestamps, ban expiries, round durations,
// payment records. Nothing protocol-critical may depend on it being
// monotonic or identical across processes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Millisecond timestamps, tagged through the type alias
pub type TimestampMillis = u64;

// Second timestamps, tagged through the type alias
pub type TimestampSeconds = u64;

#[inline]
pub fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
}

// Return the current timestamp in seconds
pub fn get_current_time_in_seconds() -> TimestampSeconds {
    get_current_time().as_secs()
}

// Return the current timestamp in milliseconds
// Cast is safe for the next few hundred million years
pub fn get_current_time_in_millis() -> TimestampMillis {
    get_current_time().as_millis() as TimestampMillis
}
