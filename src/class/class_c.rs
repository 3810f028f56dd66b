//! Class C downlink windows
//!
//! Class C devices listen on RX2 whenever they are not transmitting, so a
//! downlink can go out immediately or at a requested time.

use std::time::SystemTime;

use crate::config::device::DeviceClass;
use crate::error::Result;
use crate::lorawan::region::Band;
use crate::messages::{TxRequest, TxSchedulePriority};
use crate::state::MacParameters;

/// Transmission request using the RX2 parameters
pub fn tx_request(
    band: &dyn Band,
    params: &MacParameters,
    absolute_time: Option<SystemTime>,
    priority: TxSchedulePriority,
) -> Result<TxRequest> {
    let rx2 = band.data_rate(params.rx2_data_rate_index)?;
    Ok(TxRequest {
        class: DeviceClass::C,
        rx2_data_rate: Some(rx2.rate),
        rx2_frequency: params.rx2_frequency,
        priority,
        absolute_time,
        ..Default::default()
    })
}
