pub mod tags;
pub mod track;
pub mod uri;

pub use tags::{TagMap, USER_OWNED_TAGS};
pub use track::{fold, SortOptions, Track, TrackError};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch as a float, the unit of every timestamp tag.
pub fn unix_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs_f64()
}

pub fn now_secs() -> f64 {
    unix_secs(SystemTime::now())
}
