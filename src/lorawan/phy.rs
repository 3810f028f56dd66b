//! Receive window timing and frame counters

use std::time::Duration;

/// RX1 delay in seconds before a MAC state negotiates another one
pub const DEFAULT_RX1_DELAY: u8 = 1;

/// Join-accept RX1 delay
pub const JOIN_ACCEPT_DELAY_1: Duration = Duration::from_secs(5);

/// Join-accept RX2 delay
pub const JOIN_ACCEPT_DELAY_2: Duration = Duration::from_secs(6);

/// Receive window timing for one uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingParams {
    /// Delay between uplink end and RX1
    pub rx1_delay: Duration,
    /// Delay between uplink end and RX2
    pub rx2_delay: Duration,
}

impl TimingParams {
    /// Data uplink windows for an RX1 delay in seconds (0 means 1)
    pub fn data(rx1_delay: u8) -> Self {
        let rx1 = Duration::from_secs(rx1_delay.clamp(1, 15) as u64);
        Self {
            rx1_delay: rx1,
            rx2_delay: rx1 + Duration::from_secs(1),
        }
    }

    /// Join-request windows
    pub fn join() -> Self {
        Self {
            rx1_delay: JOIN_ACCEPT_DELAY_1,
            rx2_delay: JOIN_ACCEPT_DELAY_2,
        }
    }
}

/// Reconstruct a 32-bit frame counter from its 16 transmitted bits.
///
/// Picks the smallest value not below `last` whose low half matches; values
/// that would roll the counter back resolve into the next 16-bit epoch.
pub fn full_f_cnt(last: u32, f_cnt: u16) -> u32 {
    let candidate = (last & 0xFFFF_0000) | f_cnt as u32;
    if candidate >= last {
        candidate
    } else {
        candidate.wrapping_add(0x1_0000)
    }
}
