//! Downlink windows per device class
//!
//! This module derives when and how a downlink can reach a device:
//! - Class A: RX1 and RX2 after each uplink
//! - Class B: ping slots synchronized with the network beacon
//! - Class C: RX2 whenever the device is not transmitting

/// Class A receive windows
pub mod class_a;

/// Class B ping slots
pub mod class_b;

/// Class C continuous reception
pub mod class_c;

use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};

pub use class_a::{RxWindows, NS_SCHEDULE_WINDOW};

/// Lead time between handing a class B/C downlink to the Gateway Server
/// and its transmission
pub const INFRASTRUCTURE_DELAY: Duration = Duration::from_millis(500);

/// Reject absolute times the infrastructure can no longer meet
pub fn check_absolute_time(at: SystemTime, now: SystemTime) -> Result<()> {
    if at < now + INFRASTRUCTURE_DELAY {
        return Err(Error::InvalidAbsoluteTime);
    }
    Ok(())
}
