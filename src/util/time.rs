//! Time utilities

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds since the epoch, as stamped on stored objects and events
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Short form for log lines: `250ms`, `1.5s`, `3s`, `5m`, `2m5s`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let millis = d.subsec_millis();
    match secs {
        0 => format!("{}ms", d.as_millis()),
        1..=59 if millis == 0 => format!("{}s", secs),
        1..=59 => format!("{}.{}s", secs, millis / 100),
        _ if secs % 60 == 0 => format!("{}m", secs / 60),
        _ => format!("{}m{}s", secs / 60, secs % 60),
    }
}
