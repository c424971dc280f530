#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in seconds.
#[inline]
pub fn unix_secs_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_secs() as i64
}

/// Wall-clock stamp used in transcript rows.
pub fn local_stamp() -> String {
	chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
