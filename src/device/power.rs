//! Device power status reported through DevStatusAns
//!
//! This module interprets the battery and margin fields devices report:
//! - Power source (external, battery level, unknown)
//! - Battery state thresholds

use std::time::SystemTime;

/// Battery percentage below which a device is considered critical
const CRITICAL_BATTERY: f32 = 0.1;

/// Battery percentage below which a device is considered low
const LOW_BATTERY: f32 = 0.3;

/// Power source reported by a device
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PowerSource {
    /// Connected to an external power source
    External,
    /// Battery powered, with the level as a fraction in 0.0..=1.0
    Battery(f32),
    /// Device cannot measure its battery level
    Unknown,
}

impl PowerSource {
    /// Interpret the DevStatusAns battery octet
    pub fn from_battery(level: u8) -> Self {
        match level {
            0 => PowerSource::External,
            255 => PowerSource::Unknown,
            n => PowerSource::Battery((n - 1) as f32 / 253.0),
        }
    }

    /// Battery fraction, when battery powered
    pub fn battery_percentage(&self) -> Option<f32> {
        match self {
            PowerSource::Battery(p) => Some(*p),
            _ => None,
        }
    }
}

/// Power consumption states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Normal operation
    Normal,
    /// Battery running low
    Low,
    /// Critical battery level
    Critical,
}

/// Last device status report
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    /// Power source
    pub power: PowerSource,
    /// Demodulation margin of the DevStatusReq in dB
    pub downlink_margin: i8,
    /// When the report was received
    pub received_at: SystemTime,
    /// Uplink frame counter of the report
    pub f_cnt_up: u32,
}

impl DeviceStatus {
    /// Build from a DevStatusAns
    pub fn new(battery: u8, margin: i8, received_at: SystemTime, f_cnt_up: u32) -> Self {
        Self {
            power: PowerSource::from_battery(battery),
            downlink_margin: margin,
            received_at,
            f_cnt_up,
        }
    }

    /// Power state derived from the battery level
    pub fn power_state(&self) -> PowerState {
        match self.power.battery_percentage() {
            Some(p) if p < CRITICAL_BATTERY => PowerState::Critical,
            Some(p) if p < LOW_BATTERY => PowerState::Low,
            _ => PowerState::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_octet() {
        assert_eq!(PowerSource::from_battery(0), PowerSource::External);
        assert_eq!(PowerSource::from_battery(255), PowerSource::Unknown);
        assert_eq!(PowerSource::from_battery(254).battery_percentage(), Some(1.0));
        assert_eq!(PowerSource::from_battery(1).battery_percentage(), Some(0.0));
    }

    #[test]
    fn test_power_state() {
        let now = SystemTime::now();
        assert_eq!(DeviceStatus::new(10, 5, now, 1).power_state(), PowerState::Critical);
        assert_eq!(DeviceStatus::new(60, 5, now, 1).power_state(), PowerState::Low);
        assert_eq!(DeviceStatus::new(0, 5, now, 1).power_state(), PowerState::Normal);
    }
}
