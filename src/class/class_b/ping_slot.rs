//! Class B ping slot computation
//!
//! This module finds the ping slots a class B device opens:
//! - Ping slot periodicity and period
//! - Pseudo-random ping offset per beacon period
//! - Next ping slot after a given time

use core::cmp::min;
use std::time::{Duration, SystemTime};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

use super::beacon::{beacon_start, BEACON_INTERVAL, BEACON_RESERVED, BEACON_WINDOW_SLOTS, PING_SLOT_LEN};
use super::timing::{from_gps_time, gps_time};
use crate::config::device::DevAddr;

/// Ping slot configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingSlotConfig {
    /// Ping slot periodicity (0-7)
    periodicity: u8,
    /// Data rate index for ping slots
    data_rate_index: u8,
    /// Frequency for ping slots in Hz
    frequency: u64,
}

impl PingSlotConfig {
    /// Create new ping slot configuration
    pub fn new(periodicity: u8, data_rate_index: u8, frequency: u64) -> Self {
        Self {
            periodicity: min(periodicity, 7),
            data_rate_index,
            frequency,
        }
    }

    /// Ping slot periodicity
    pub fn periodicity(&self) -> u8 {
        self.periodicity
    }

    /// Ping slot data rate index
    pub fn data_rate_index(&self) -> u8 {
        self.data_rate_index
    }

    /// Ping slot frequency
    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// Number of ping slots per beacon period
    pub fn slots_per_beacon(&self) -> u32 {
        128 >> self.periodicity
    }

    /// Slots between two ping slots
    pub fn ping_period(&self) -> u32 {
        BEACON_WINDOW_SLOTS / self.slots_per_beacon()
    }
}

/// Offset of the first ping slot in a beacon period.
///
/// `beacon_time` is the GPS second the beacon period starts at.
pub fn ping_offset(beacon_time: u32, dev_addr: DevAddr, ping_period: u32) -> u32 {
    let mut block = [0u8; 16];
    block[..4].copy_from_slice(&beacon_time.to_le_bytes());
    block[4..8].copy_from_slice(&dev_addr.to_le_bytes());
    let cipher = Aes128::new(GenericArray::from_slice(&[0u8; 16]));
    let mut rand = GenericArray::from(block);
    cipher.encrypt_block(&mut rand);
    (rand[0] as u32 + rand[1] as u32 * 256) % ping_period
}

/// Ping slot openings of the beacon period starting at `start` (GPS time)
fn slots_in_period(
    start: Duration,
    dev_addr: DevAddr,
    config: &PingSlotConfig,
) -> impl Iterator<Item = Duration> {
    let period = config.ping_period();
    let offset = ping_offset(start.as_secs() as u32, dev_addr, period);
    (0..config.slots_per_beacon())
        .map(move |n| start + BEACON_RESERVED + PING_SLOT_LEN * (offset + n * period))
}

/// First ping slot of `dev_addr` opening strictly after `after`
pub fn next_ping_slot(dev_addr: DevAddr, config: &PingSlotConfig, after: SystemTime) -> SystemTime {
    let gps = gps_time(after);
    let start = beacon_start(gps);
    let next = start + BEACON_INTERVAL;
    let slot = slots_in_period(start, dev_addr, config)
        .chain(slots_in_period(next, dev_addr, config))
        .find(|slot| *slot > gps)
        // The next period always holds a slot later than `gps`.
        .unwrap_or(next + BEACON_RESERVED);
    from_gps_time(slot)
}
