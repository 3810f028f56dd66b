//! GPS time conversion
//!
//! Class B beacons and DeviceTimeAns count seconds since the GPS epoch
//! (1980-01-06), which runs ahead of UTC by the accumulated leap seconds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// GPS epoch offset from Unix epoch (seconds)
pub const GPS_EPOCH_OFFSET: u64 = 315_964_800;

/// Leap seconds between GPS time and UTC
pub const LEAP_SECONDS: u64 = 18;

/// Time since the GPS epoch. Times before the epoch map to zero.
pub fn gps_time(t: SystemTime) -> Duration {
    let unix = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    (unix + Duration::from_secs(LEAP_SECONDS)).saturating_sub(Duration::from_secs(GPS_EPOCH_OFFSET))
}

/// Wall-clock time of a GPS timestamp
pub fn from_gps_time(gps: Duration) -> SystemTime {
    let unix = (gps + Duration::from_secs(GPS_EPOCH_OFFSET))
        .saturating_sub(Duration::from_secs(LEAP_SECONDS));
    UNIX_EPOCH + unix
}
