//! Beacon period timing
//!
//! Gateways transmit a beacon at every multiple of [`BEACON_INTERVAL`] GPS
//! time. The beacon occupies the first [`BEACON_RESERVED`] of a period;
//! ping slots follow.

use std::time::Duration;

/// Beacon period
pub const BEACON_INTERVAL: Duration = Duration::from_secs(128);

/// Start of the period reserved for the beacon itself
pub const BEACON_RESERVED: Duration = Duration::from_millis(2_120);

/// Ping slot length
pub const PING_SLOT_LEN: Duration = Duration::from_millis(30);

/// Slots in a beacon window (2^12)
pub const BEACON_WINDOW_SLOTS: u32 = 4_096;

/// Start of the beacon period containing `gps`
pub fn beacon_start(gps: Duration) -> Duration {
    let interval = BEACON_INTERVAL.as_secs();
    Duration::from_secs(gps.as_secs() / interval * interval)
}

/// Start of the beacon period after the one containing `gps`
pub fn next_beacon_start(gps: Duration) -> Duration {
    beacon_start(gps) + BEACON_INTERVAL
}
