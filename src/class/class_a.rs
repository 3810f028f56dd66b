//! Class A receive windows
//!
//! Every uplink opens RX1 after the RX1 delay and RX2 one second later.
//! A downlink answering the uplink must reach the gateway before the
//! window it targets opens.

use std::time::{Duration, SystemTime};

use crate::config::device::DeviceClass;
use crate::error::{Error, Result};
use crate::lorawan::phy::TimingParams;
use crate::lorawan::region::Band;
use crate::messages::{TxRequest, TxSchedulePriority, UplinkMessage};
use crate::state::MacParameters;

/// Lead time the Gateway Server needs before a window opens
pub const NS_SCHEDULE_WINDOW: Duration = Duration::from_millis(200);

/// Receive windows still reachable after an uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxWindows {
    /// RX1 and RX2
    Both,
    /// RX1 has passed
    Rx2Only,
    /// Both windows have passed
    Expired,
}

impl RxWindows {
    /// Windows reachable at `now` for an uplink received at `received_at`
    pub fn at(received_at: SystemTime, timing: TimingParams, now: SystemTime) -> Self {
        let deadline = now + NS_SCHEDULE_WINDOW;
        if deadline < received_at + timing.rx1_delay {
            RxWindows::Both
        } else if deadline < received_at + timing.rx2_delay {
            RxWindows::Rx2Only
        } else {
            RxWindows::Expired
        }
    }

    /// Whether any window is reachable
    pub fn is_open(&self) -> bool {
        !matches!(self, RxWindows::Expired)
    }
}

/// Transmission request answering `up` in RX1 or RX2.
///
/// RX1 parameters derive from the uplink data rate, the RX1 data rate
/// offset and the band's RX1 channel mapping. RX2 parameters are the
/// current ones.
pub fn tx_request(
    band: &dyn Band,
    params: &MacParameters,
    up: &UplinkMessage,
    rx1_delay: u8,
    priority: TxSchedulePriority,
) -> Result<TxRequest> {
    let rx1_dr = band.rx1_data_rate(up.data_rate_index, params.rx1_data_rate_offset)?;
    let rx1_channel = band.rx1_channel(up.device_channel_index);
    let rx1_frequency = params
        .channels
        .get(rx1_channel as usize)
        .map(|ch| ch.downlink_frequency)
        .ok_or_else(|| Error::InvalidConfig(format!("channel {rx1_channel} not in channel plan")))?;
    let rx2 = band.data_rate(params.rx2_data_rate_index)?;

    Ok(TxRequest {
        class: DeviceClass::A,
        rx1_delay: Some(rx1_delay),
        rx1_data_rate: Some(band.data_rate(rx1_dr)?.rate),
        rx1_frequency,
        rx2_data_rate: Some(rx2.rate),
        rx2_frequency: params.rx2_frequency,
        priority,
        ..Default::default()
    })
}
