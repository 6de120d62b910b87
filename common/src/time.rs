// Timestamp helpers shared across the daemon.
//
// These use SystemTime::now(), so values are wall-clock and not suitable for
// anything that must be reproducible (there's nothing consensus-sensitive in
// this service, unlike a chain node, but tests still stub the clock via
// `now_millis()` rather than calling `SystemTime::now()` directly).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type TimestampMillis = i64;
pub type TimestampSeconds = i64;

#[inline]
pub fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
}

pub fn now_seconds() -> TimestampSeconds {
    get_current_time().as_secs() as TimestampSeconds
}

pub fn now_millis() -> TimestampMillis {
    get_current_time().as_millis() as TimestampMillis
}
