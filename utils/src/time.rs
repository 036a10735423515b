use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn seconds_since_epoch() -> u64 {
    duration_since_epoch().as_secs()
}

pub fn millis_since_epoch() -> u64 {
    duration_since_epoch().as_millis() as u64
}

fn duration_since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Incorrect system time")
}
