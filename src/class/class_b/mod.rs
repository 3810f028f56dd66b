//! Class B downlink windows
//!
//! Class B devices open ping slots synchronized with the network beacon:
//! - Beacon period timing
//! - Ping slot offsets and periodicity
//! - GPS time conversion

/// Beacon period timing
pub mod beacon;
/// Ping slot computation
pub mod ping_slot;
/// GPS time conversion
pub mod timing;

use std::time::SystemTime;

use crate::config::device::{DevAddr, DeviceClass};
use crate::error::{Error, Result};
use crate::lorawan::region::Band;
use crate::messages::{TxRequest, TxSchedulePriority};
use crate::state::MacParameters;

use self::ping_slot::{next_ping_slot, PingSlotConfig};
use super::INFRASTRUCTURE_DELAY;

/// Ping slot configuration of a device
pub fn ping_slot_config(params: &MacParameters, periodicity: u8) -> PingSlotConfig {
    PingSlotConfig::new(
        periodicity,
        params.ping_slot_data_rate_index,
        params.ping_slot_frequency,
    )
}

/// Transmission request for the next ping slot.
///
/// Without an `absolute_time` the downlink goes out in the first ping slot
/// the gateway can still reach.
pub fn tx_request(
    band: &dyn Band,
    params: &MacParameters,
    dev_addr: DevAddr,
    periodicity: Option<u8>,
    absolute_time: Option<SystemTime>,
    priority: TxSchedulePriority,
    now: SystemTime,
) -> Result<TxRequest> {
    let periodicity = periodicity.ok_or(Error::MissingField("ping_slot_periodicity"))?;
    let config = ping_slot_config(params, periodicity);
    let data_rate = band.data_rate(config.data_rate_index())?.rate;
    let at = match absolute_time {
        Some(t) => t,
        None => next_ping_slot(dev_addr, &config, now + INFRASTRUCTURE_DELAY),
    };
    Ok(TxRequest {
        class: DeviceClass::B,
        rx2_data_rate: Some(data_rate),
        rx2_frequency: config.frequency(),
        priority,
        absolute_time: Some(at),
        ..Default::default()
    })
}
