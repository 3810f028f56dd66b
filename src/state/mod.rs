//! MAC state machine
//!
//! A device's MAC state holds two parameter sets:
//! - current parameters, the ones the device is known to use
//! - desired parameters, the ones the network steers it towards
//!
//! Desired parameters come from the frequency plan and MAC settings only.
//! Current parameters change when a join-accept is confirmed by an uplink
//! or when the device acknowledges a MAC command.

/// Adaptive data rate
pub mod adr;

/// MAC command handling
pub mod handle;

/// Recent frame history
pub mod recent;

use std::time::SystemTime;

use crate::config::device::{DevAddr, DeviceClass, MacSettings, MacVersion, NetID};
use crate::device::{EndDevice, SessionKeys};
use crate::error::{Error, Result};
use crate::lorawan::commands::DownlinkCommand;
use crate::lorawan::mac::DlSettings;
use crate::lorawan::phy::DEFAULT_RX1_DELAY;
use crate::lorawan::region::{Band, CFList, Channel, FrequencyPlan};
use crate::messages::{ApplicationDownlink, DownlinkMessage, UplinkMessage};

pub use recent::RecentBuffer;

/// Uplinks kept in the MAC state
pub const RECENT_UPLINK_COUNT: usize = 20;

/// Downlinks kept in the MAC state
pub const RECENT_DOWNLINK_COUNT: usize = 20;

/// Radio parameters of a device
#[derive(Debug, Clone, PartialEq)]
pub struct MacParameters {
    /// Maximum EIRP in dBm
    pub max_eirp: f32,
    /// ADR data rate index
    pub adr_data_rate_index: u8,
    /// ADR TX power index
    pub adr_tx_power_index: u8,
    /// ADR number of transmissions
    pub adr_nb_trans: u8,
    /// ADR_ACK_LIMIT exponent
    pub adr_ack_limit_exponent: u8,
    /// ADR_ACK_DELAY exponent
    pub adr_ack_delay_exponent: u8,
    /// RX1 delay in seconds
    pub rx1_delay: u8,
    /// RX1 data rate offset
    pub rx1_data_rate_offset: u8,
    /// RX2 data rate index
    pub rx2_data_rate_index: u8,
    /// RX2 frequency in Hz
    pub rx2_frequency: u64,
    /// Maximum duty cycle exponent (1/2^n)
    pub max_duty_cycle: u8,
    /// Class B ping slot frequency in Hz
    pub ping_slot_frequency: u64,
    /// Class B ping slot data rate index
    pub ping_slot_data_rate_index: u8,
    /// Class B beacon frequency in Hz
    pub beacon_frequency: u64,
    /// Channel plan
    pub channels: Vec<Channel>,
}

/// Join-accept parameters awaiting confirmation by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJoinRequest {
    /// DLSettings sent in the join-accept
    pub downlink_settings: DlSettings,
    /// RxDelay sent in the join-accept
    pub rx_delay: u8,
    /// CFList sent in the join-accept
    pub cf_list: Option<CFList>,
}

/// Join-accept waiting to be scheduled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJoinAccept {
    /// Encrypted join-accept PHYPayload
    pub payload: Vec<u8>,
    /// Allocated device address
    pub dev_addr: DevAddr,
    /// Network identifier
    pub net_id: NetID,
    /// Parameters sent in the join-accept
    pub request: PendingJoinRequest,
    /// Session keys. The AppSKey is dropped once the join-accept is scheduled.
    pub keys: SessionKeys,
    /// Correlation identifiers of the join-request and response
    pub correlation_ids: Vec<String>,
}

/// MAC state of a device
#[derive(Debug, Clone, PartialEq)]
pub struct MacState {
    /// Parameters in effect
    pub current_parameters: MacParameters,
    /// Parameters the network steers the device towards
    pub desired_parameters: MacParameters,
    /// Class the device operates in
    pub device_class: DeviceClass,
    /// MAC version of the session
    pub lorawan_version: MacVersion,
    /// Class B ping slot periodicity reported by the device
    pub ping_slot_periodicity: Option<u8>,
    /// Answers to device requests, sent with the next downlink
    pub queued_responses: Vec<DownlinkCommand>,
    /// Requests sent and not yet answered
    pub pending_requests: Vec<DownlinkCommand>,
    /// Join-accept awaiting scheduling
    pub queued_join_accept: Option<QueuedJoinAccept>,
    /// Join-accept sent, awaiting the first uplink
    pub pending_join_request: Option<PendingJoinRequest>,
    /// Confirmed application downlink awaiting acknowledgment
    pub pending_application_downlink: Option<ApplicationDownlink>,
    /// The last uplink still owes the device a class A downlink
    pub rx_windows_available: bool,
    /// Recent uplinks
    pub recent_uplinks: RecentBuffer<UplinkMessage, RECENT_UPLINK_COUNT>,
    /// Recent downlinks
    pub recent_downlinks: RecentBuffer<DownlinkMessage, RECENT_DOWNLINK_COUNT>,
    /// Uplink counter of the last DevStatusAns
    pub last_dev_status_f_cnt_up: Option<u32>,
    /// Last class B/C downlink
    pub last_network_initiated_downlink_at: Option<SystemTime>,
}

/// Class a device starts a session in
pub fn default_class(dev: &EndDevice) -> DeviceClass {
    if !dev.multicast && dev.lorawan_version >= MacVersion::V1_1 {
        DeviceClass::A
    } else if dev.supports_class_c {
        DeviceClass::C
    } else if dev.multicast && dev.supports_class_b {
        DeviceClass::B
    } else {
        DeviceClass::A
    }
}

/// Build a MAC state for `dev`.
///
/// Current parameters are the band defaults, or the ABP settings when the
/// device does not join. Desired parameters come from the frequency plan
/// and the MAC settings.
pub fn new_mac_state(dev: &EndDevice, fp: &FrequencyPlan, defaults: &MacSettings) -> Result<MacState> {
    let band = fp.band()?;
    let settings = dev.effective_mac_settings(defaults);
    let abp = !dev.supports_join;
    let abp_setting = |v: Option<u8>, default: u8| if abp { v.unwrap_or(default) } else { default };

    let rx1_delay = abp_setting(settings.rx1_delay, DEFAULT_RX1_DELAY);
    if !(1..=15).contains(&rx1_delay) {
        return Err(Error::InvalidConfig(format!("RX1 delay {rx1_delay} out of range")));
    }

    let current = MacParameters {
        max_eirp: band.default_max_eirp(),
        adr_data_rate_index: 0,
        adr_tx_power_index: 0,
        adr_nb_trans: 1,
        adr_ack_limit_exponent: band.adr_ack_limit_exponent(),
        adr_ack_delay_exponent: band.adr_ack_delay_exponent(),
        rx1_delay,
        rx1_data_rate_offset: abp_setting(settings.rx1_data_rate_offset, 0),
        rx2_data_rate_index: abp_setting(
            settings.rx2_data_rate_index,
            band.default_rx2_data_rate_index(),
        ),
        rx2_frequency: if abp {
            settings.rx2_frequency.unwrap_or(band.default_rx2_frequency())
        } else {
            band.default_rx2_frequency()
        },
        max_duty_cycle: settings.max_duty_cycle.unwrap_or(0),
        ping_slot_frequency: settings
            .ping_slot_frequency
            .unwrap_or(band.default_ping_slot_frequency()),
        ping_slot_data_rate_index: settings
            .ping_slot_data_rate_index
            .unwrap_or(band.default_ping_slot_data_rate_index()),
        beacon_frequency: band.default_beacon_frequency(),
        channels: band.default_channels(),
    };
    let desired = desired_parameters(&current, fp, band, &settings);

    Ok(MacState {
        current_parameters: current,
        desired_parameters: desired,
        device_class: default_class(dev),
        lorawan_version: dev.lorawan_version,
        ping_slot_periodicity: settings.ping_slot_periodicity,
        queued_responses: Vec::new(),
        pending_requests: Vec::new(),
        queued_join_accept: None,
        pending_join_request: None,
        pending_application_downlink: None,
        rx_windows_available: false,
        recent_uplinks: RecentBuffer::new(),
        recent_downlinks: RecentBuffer::new(),
        last_dev_status_f_cnt_up: None,
        last_network_initiated_downlink_at: None,
    })
}

fn desired_parameters(
    current: &MacParameters,
    fp: &FrequencyPlan,
    band: &dyn Band,
    settings: &MacSettings,
) -> MacParameters {
    MacParameters {
        max_eirp: fp.max_eirp.unwrap_or(current.max_eirp),
        adr_ack_limit_exponent: settings
            .desired_adr_ack_limit_exponent
            .unwrap_or(current.adr_ack_limit_exponent),
        adr_ack_delay_exponent: settings
            .desired_adr_ack_delay_exponent
            .unwrap_or(current.adr_ack_delay_exponent),
        rx1_delay: settings.desired_rx1_delay.unwrap_or(current.rx1_delay),
        rx1_data_rate_offset: settings
            .desired_rx1_data_rate_offset
            .unwrap_or(current.rx1_data_rate_offset),
        rx2_data_rate_index: settings
            .desired_rx2_data_rate_index
            .or(fp.rx2_data_rate_index)
            .unwrap_or(current.rx2_data_rate_index),
        rx2_frequency: settings
            .desired_rx2_frequency
            .or(fp.rx2_frequency)
            .unwrap_or(current.rx2_frequency),
        max_duty_cycle: settings
            .desired_max_duty_cycle
            .unwrap_or(current.max_duty_cycle),
        ping_slot_frequency: fp.ping_slot_frequency.unwrap_or(current.ping_slot_frequency),
        channels: if fp.band_id == band.id() {
            fp.channels.clone()
        } else {
            current.channels.clone()
        },
        ..current.clone()
    }
}

/// DLSettings and RxDelay to announce in a join-accept
pub fn join_accept_settings(state: &MacState) -> (DlSettings, u8) {
    let desired = &state.desired_parameters;
    (
        DlSettings {
            rx1_dr_offset: desired.rx1_data_rate_offset,
            rx2_dr: desired.rx2_data_rate_index,
            opt_neg: state.lorawan_version.opt_neg(),
        },
        desired.rx1_delay,
    )
}

/// Make the pending session and MAC state of `dev` active.
///
/// The join-accept parameters become current parameters, since the device
/// proved it received the join-accept.
pub fn promote_pending(dev: &mut EndDevice, band: &dyn Band) -> Result<()> {
    let mut state = dev
        .pending_mac_state
        .take()
        .ok_or(Error::MissingField("pending_mac_state"))?;
    let session = dev
        .pending_session
        .take()
        .ok_or(Error::MissingField("pending_session"))?;
    if let Some(req) = state.pending_join_request.take() {
        let current = &mut state.current_parameters;
        current.rx1_delay = req.rx_delay.clamp(1, 15);
        current.rx1_data_rate_offset = req.downlink_settings.rx1_dr_offset;
        current.rx2_data_rate_index = req.downlink_settings.rx2_dr;
        if let Some(cf_list) = &req.cf_list {
            band.apply_cf_list(cf_list, &mut current.channels);
        }
    }
    state.queued_join_accept = None;
    dev.ids.dev_addr = Some(session.dev_addr);
    dev.session = Some(session);
    dev.mac_state = Some(state);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::device::{EndDeviceIds, PhyVersion};
    use crate::device::Session;
    use crate::lorawan::region::frequency_plan;

    fn otaa_device() -> EndDevice {
        let mut dev = EndDevice::new(
            EndDeviceIds::new("app", "dev"),
            "EU_863_870",
            MacVersion::V1_0_3,
            PhyVersion::V1_0_3RevA,
        );
        dev.supports_join = true;
        dev
    }

    #[test]
    fn test_desired_ignores_join_defaults() {
        let fp = frequency_plan("EU_863_870_TTN").unwrap();
        let defaults = MacSettings {
            desired_rx1_delay: Some(5),
            ..Default::default()
        };
        let state = new_mac_state(&otaa_device(), &fp, &defaults).unwrap();
        assert_eq!(state.current_parameters.rx1_delay, 1);
        assert_eq!(state.current_parameters.channels.len(), 3);
        assert_eq!(state.current_parameters.rx2_data_rate_index, 0);
        assert_eq!(state.desired_parameters.rx1_delay, 5);
        assert_eq!(state.desired_parameters.channels.len(), 8);
        assert_eq!(state.desired_parameters.rx2_data_rate_index, 3);
        assert!(!state.rx_windows_available);
    }

    #[test]
    fn test_abp_settings_are_current() {
        let fp = frequency_plan("EU_863_870").unwrap();
        let mut dev = otaa_device();
        dev.supports_join = false;
        dev.mac_settings = Some(MacSettings {
            rx1_delay: Some(3),
            rx2_data_rate_index: Some(2),
            ..Default::default()
        });
        let state = new_mac_state(&dev, &fp, &MacSettings::default()).unwrap();
        assert_eq!(state.current_parameters.rx1_delay, 3);
        assert_eq!(state.current_parameters.rx2_data_rate_index, 2);
        assert_eq!(state.desired_parameters.rx1_delay, 3);
    }

    #[test]
    fn test_promote_pending_applies_join_accept() {
        let fp = frequency_plan("EU_863_870").unwrap();
        let band = fp.band().unwrap();
        let mut dev = otaa_device();
        let mut state = new_mac_state(&dev, &fp, &MacSettings::default()).unwrap();
        state.pending_join_request = Some(PendingJoinRequest {
            downlink_settings: DlSettings {
                rx1_dr_offset: 1,
                rx2_dr: 3,
                opt_neg: false,
            },
            rx_delay: 5,
            cf_list: band.cf_list(&fp.channels, dev.lorawan_phy_version),
        });
        dev.pending_mac_state = Some(state);
        let addr = DevAddr::new([0x26, 0, 0, 1]);
        dev.pending_session = Some(Session::new(addr, SessionKeys::default(), SystemTime::now()));

        promote_pending(&mut dev, band).unwrap();

        let state = dev.mac_state.as_ref().unwrap();
        assert_eq!(state.current_parameters.rx1_delay, 5);
        assert_eq!(state.current_parameters.rx1_data_rate_offset, 1);
        assert_eq!(state.current_parameters.rx2_data_rate_index, 3);
        assert_eq!(state.current_parameters.channels, fp.channels);
        assert!(state.pending_join_request.is_none());
        assert!(dev.pending_mac_state.is_none() && dev.pending_session.is_none());
        assert_eq!(dev.ids.dev_addr, Some(addr));
    }
}
