//! Adaptive data rate
//!
//! The link margin is the best SNR over the recent uplinks minus the
//! demodulation floor of the data rate and the configured safety margin.
//! Every 3 dB of margin raises the data rate one step, then lowers the TX
//! power one step. Negative margin raises the TX power.

use crate::error::Result;
use crate::lorawan::region::Band;

use super::MacState;

/// dB of margin per ADR step
const STEP_DB: f32 = 3.0;

/// Recompute the desired ADR parameters from the recent uplinks.
pub fn adapt_data_rate(state: &mut MacState, band: &dyn Band, adr_margin: f32) -> Result<()> {
    let Some(last) = state.recent_uplinks.last() else {
        return Ok(());
    };
    let data_rate_index = last.data_rate_index;
    let max_snr = state
        .recent_uplinks
        .iter()
        .filter(|up| up.data_rate_index == data_rate_index)
        .flat_map(|up| up.rx_metadata.iter().map(|md| md.snr))
        .fold(f32::NEG_INFINITY, f32::max);
    if !max_snr.is_finite() {
        return Ok(());
    }

    let floor = band.data_rate(data_rate_index)?.rate.demodulation_floor();
    let margin = max_snr - floor - adr_margin;
    let mut steps = (margin / STEP_DB).floor() as i32;

    let mut dr = data_rate_index.max(state.current_parameters.adr_data_rate_index);
    let mut power = state.current_parameters.adr_tx_power_index;
    while steps > 0 && dr < band.max_adr_data_rate_index() {
        dr += 1;
        steps -= 1;
    }
    while steps > 0 && power < band.max_tx_power_index() {
        power += 1;
        steps -= 1;
    }
    while steps < 0 && power > 0 {
        power -= 1;
        steps += 1;
    }

    let desired = &mut state.desired_parameters;
    desired.adr_data_rate_index = dr;
    desired.adr_tx_power_index = power;
    desired.adr_nb_trans = state.current_parameters.adr_nb_trans.max(1);
    Ok(())
}
