//! MAC command handling
//!
//! Uplink commands either answer a request the network sent with the
//! previous downlink, or ask the network for something. Answers are
//! matched to the pending requests in order; acknowledged values become
//! current parameters. Requests queue an answer for the next downlink.
//!
//! Downlink requests are generated from the differences between desired
//! and current parameters.

use std::collections::HashSet;

use tracing::debug;

use crate::class::class_b::timing::gps_time;
use crate::config::device::{DeviceClass, MacSettings, MacVersion};
use crate::device::power::DeviceStatus;
use crate::error::Result;
use crate::lorawan::commands::{DownlinkCommand, UplinkCommand};
use crate::lorawan::region::{Band, Channel};
use crate::messages::UplinkMessage;

use super::{MacParameters, MacState};

/// Channels addressed by one LinkADRReq channel mask
const CHANNELS_PER_MASK: usize = 16;

/// Channel plans longer than this use the fixed-plan mask control codes
const DYNAMIC_PLAN_MAX_CHANNELS: usize = 16;

/// Control code enabling every 125 kHz channel of a fixed plan
const CH_MASK_CNTL_ALL_ON: u8 = 6;

/// Control code disabling every 125 kHz channel of a fixed plan
const CH_MASK_CNTL_ALL_OFF: u8 = 7;

/// Narrow channels of a fixed plan
const FIXED_PLAN_NARROW_CHANNELS: usize = 64;

fn take_pending<F>(pending: &mut Vec<DownlinkCommand>, matches: F) -> Option<DownlinkCommand>
where
    F: Fn(&DownlinkCommand) -> bool,
{
    let i = pending.iter().position(matches)?;
    Some(pending.remove(i))
}

/// Handle the MAC commands of an uplink.
///
/// `pending` are the requests sent with the last downlink. Unanswered
/// requests are dropped; they are regenerated if still needed.
pub fn handle_uplink_commands(
    state: &mut MacState,
    last_dev_status: &mut Option<DeviceStatus>,
    mut pending: Vec<DownlinkCommand>,
    cmds: Vec<UplinkCommand>,
    up: &UplinkMessage,
    f_cnt: u32,
) -> Result<()> {
    for cmd in cmds {
        debug!(?cmd, "Handle MAC command");
        match cmd {
            UplinkCommand::ResetInd { minor } => {
                state.queued_responses.push(DownlinkCommand::ResetConf { minor: minor.min(1) });
            }
            UplinkCommand::RekeyInd { minor } => {
                state.queued_responses.push(DownlinkCommand::RekeyConf { minor: minor.min(1) });
            }
            UplinkCommand::LinkCheckReq => {
                state.queued_responses.push(link_check_ans(up));
            }
            UplinkCommand::DeviceTimeReq => {
                state.queued_responses.push(DownlinkCommand::DeviceTimeAns {
                    gps_time: gps_time(up.received_at),
                });
            }
            UplinkCommand::PingSlotInfoReq { periodicity } => {
                state.ping_slot_periodicity = Some(periodicity);
                state.queued_responses.push(DownlinkCommand::PingSlotInfoAns);
            }
            UplinkCommand::DeviceModeInd { class } => {
                if class != DeviceClass::B {
                    state.device_class = class;
                }
                state.queued_responses.push(DownlinkCommand::DeviceModeConf {
                    class: state.device_class,
                });
            }
            UplinkCommand::DevStatusAns { battery, margin } => {
                if take_pending(&mut pending, |r| matches!(r, DownlinkCommand::DevStatusReq)).is_some() {
                    *last_dev_status = Some(DeviceStatus::new(battery, margin, up.received_at, f_cnt));
                    state.last_dev_status_f_cnt_up = Some(f_cnt);
                }
            }
            UplinkCommand::LinkADRAns {
                power_ack,
                data_rate_ack,
                channel_mask_ack,
            } => {
                let block: Vec<_> = pending
                    .iter()
                    .filter(|r| matches!(r, DownlinkCommand::LinkADRReq { .. }))
                    .cloned()
                    .collect();
                pending.retain(|r| !matches!(r, DownlinkCommand::LinkADRReq { .. }));
                if power_ack && data_rate_ack && channel_mask_ack {
                    for req in &block {
                        apply_link_adr_req(&mut state.current_parameters, req);
                    }
                }
            }
            UplinkCommand::DutyCycleAns => {
                if let Some(DownlinkCommand::DutyCycleReq { max_duty_cycle }) =
                    take_pending(&mut pending, |r| matches!(r, DownlinkCommand::DutyCycleReq { .. }))
                {
                    state.current_parameters.max_duty_cycle = max_duty_cycle;
                }
            }
            UplinkCommand::RXParamSetupAns {
                rx1_dr_offset_ack,
                rx2_data_rate_ack,
                channel_ack,
            } => {
                let req = take_pending(&mut pending, |r| {
                    matches!(r, DownlinkCommand::RXParamSetupReq { .. })
                });
                if let Some(DownlinkCommand::RXParamSetupReq {
                    rx1_dr_offset,
                    rx2_data_rate_index,
                    rx2_frequency,
                }) = req
                {
                    if rx1_dr_offset_ack && rx2_data_rate_ack && channel_ack {
                        let current = &mut state.current_parameters;
                        current.rx1_data_rate_offset = rx1_dr_offset;
                        current.rx2_data_rate_index = rx2_data_rate_index;
                        current.rx2_frequency = rx2_frequency;
                    }
                }
            }
            UplinkCommand::RXTimingSetupAns => {
                if let Some(DownlinkCommand::RXTimingSetupReq { delay }) =
                    take_pending(&mut pending, |r| matches!(r, DownlinkCommand::RXTimingSetupReq { .. }))
                {
                    state.current_parameters.rx1_delay = delay.clamp(1, 15);
                }
            }
            UplinkCommand::NewChannelAns {
                data_rate_ok,
                channel_freq_ok,
            } => {
                let req = take_pending(&mut pending, |r| {
                    matches!(r, DownlinkCommand::NewChannelReq { .. })
                });
                if let (Some(req), true) = (req, data_rate_ok && channel_freq_ok) {
                    apply_new_channel_req(&mut state.current_parameters.channels, &req);
                }
            }
            UplinkCommand::DlChannelAns {
                channel_freq_ok,
                uplink_freq_exists,
            } => {
                let req = take_pending(&mut pending, |r| {
                    matches!(r, DownlinkCommand::DlChannelReq { .. })
                });
                if let Some(DownlinkCommand::DlChannelReq {
                    channel_index,
                    frequency,
                }) = req
                {
                    if channel_freq_ok && uplink_freq_exists {
                        if let Some(ch) = state
                            .current_parameters
                            .channels
                            .get_mut(channel_index as usize)
                        {
                            ch.downlink_frequency = frequency;
                        }
                    }
                }
            }
            UplinkCommand::ADRParamSetupAns => {
                if let Some(DownlinkCommand::ADRParamSetupReq {
                    ack_limit_exponent,
                    ack_delay_exponent,
                }) = take_pending(&mut pending, |r| {
                    matches!(r, DownlinkCommand::ADRParamSetupReq { .. })
                }) {
                    state.current_parameters.adr_ack_limit_exponent = ack_limit_exponent;
                    state.current_parameters.adr_ack_delay_exponent = ack_delay_exponent;
                }
            }
            UplinkCommand::PingSlotChannelAns {
                data_rate_ok,
                frequency_ok,
            } => {
                let req = take_pending(&mut pending, |r| {
                    matches!(r, DownlinkCommand::PingSlotChannelReq { .. })
                });
                if let Some(DownlinkCommand::PingSlotChannelReq {
                    frequency,
                    data_rate_index,
                }) = req
                {
                    if data_rate_ok && frequency_ok {
                        state.current_parameters.ping_slot_frequency = frequency;
                        state.current_parameters.ping_slot_data_rate_index = data_rate_index;
                    }
                }
            }
            UplinkCommand::TxParamSetupAns
            | UplinkCommand::RejoinParamSetupAns { .. }
            | UplinkCommand::BeaconFreqAns { .. } => {
                debug!(cid = cmd.cid(), "Answer to a request that is never sent");
            }
        }
    }
    if !pending.is_empty() {
        debug!(count = pending.len(), "Requests left unanswered");
    }
    Ok(())
}

fn link_check_ans(up: &UplinkMessage) -> DownlinkCommand {
    let floor = up.settings.data_rate.demodulation_floor();
    let best = up
        .rx_metadata
        .iter()
        .map(|md| md.snr)
        .fold(f32::NEG_INFINITY, f32::max);
    let margin = if best.is_finite() {
        (best - floor).clamp(0.0, 254.0) as u8
    } else {
        0
    };
    let gateways: HashSet<_> = up
        .rx_metadata
        .iter()
        .map(|md| md.gateway_ids.gateway_id.as_str())
        .collect();
    DownlinkCommand::LinkCheckAns {
        margin,
        gateway_count: gateways.len().min(255) as u8,
    }
}

fn apply_link_adr_req(params: &mut MacParameters, req: &DownlinkCommand) {
    let DownlinkCommand::LinkADRReq {
        data_rate_index,
        tx_power_index,
        ch_mask,
        ch_mask_cntl,
        nb_trans,
    } = *req
    else {
        return;
    };
    params.adr_data_rate_index = data_rate_index;
    params.adr_tx_power_index = tx_power_index;
    if nb_trans > 0 {
        params.adr_nb_trans = nb_trans;
    }
    apply_channel_mask(&mut params.channels, ch_mask, ch_mask_cntl);
}

fn set_mask_block(channels: &mut [Channel], block: usize, mask: u16) {
    for (i, ch) in channels
        .iter_mut()
        .enumerate()
        .skip(block * CHANNELS_PER_MASK)
        .take(CHANNELS_PER_MASK)
    {
        ch.enable_uplink = mask & (1 << (i % CHANNELS_PER_MASK)) != 0;
    }
}

fn apply_channel_mask(channels: &mut [Channel], mask: u16, cntl: u8) {
    if channels.len() <= DYNAMIC_PLAN_MAX_CHANNELS {
        match cntl {
            0 => set_mask_block(channels, 0, mask),
            CH_MASK_CNTL_ALL_ON => channels.iter_mut().for_each(|ch| ch.enable_uplink = true),
            _ => {}
        }
        return;
    }
    let narrow_block = FIXED_PLAN_NARROW_CHANNELS / CHANNELS_PER_MASK;
    match cntl {
        c if (c as usize) <= narrow_block => set_mask_block(channels, c as usize, mask),
        CH_MASK_CNTL_ALL_ON | CH_MASK_CNTL_ALL_OFF => {
            let on = cntl == CH_MASK_CNTL_ALL_ON;
            for ch in channels.iter_mut().take(FIXED_PLAN_NARROW_CHANNELS) {
                ch.enable_uplink = on;
            }
            set_mask_block(channels, narrow_block, mask);
        }
        _ => {}
    }
}

fn apply_new_channel_req(channels: &mut Vec<Channel>, req: &DownlinkCommand) {
    let DownlinkCommand::NewChannelReq {
        channel_index,
        frequency,
        min_data_rate_index,
        max_data_rate_index,
    } = *req
    else {
        return;
    };
    let i = channel_index as usize;
    if frequency == 0 {
        if i + 1 == channels.len() {
            channels.pop();
        } else if let Some(ch) = channels.get_mut(i) {
            ch.enable_uplink = false;
        }
        return;
    }
    let channel = Channel {
        uplink_frequency: frequency,
        downlink_frequency: frequency,
        min_data_rate_index,
        max_data_rate_index,
        enable_uplink: true,
    };
    if i < channels.len() {
        channels[i] = channel;
    } else {
        while channels.len() < i {
            channels.push(Channel {
                enable_uplink: false,
                ..channel
            });
        }
        channels.push(channel);
    }
}

fn channel_masks(channels: &[Channel]) -> Vec<u16> {
    let mut masks = vec![0u16; channels.len().div_ceil(CHANNELS_PER_MASK).max(1)];
    for (i, ch) in channels.iter().enumerate() {
        if ch.enable_uplink {
            masks[i / CHANNELS_PER_MASK] |= 1 << (i % CHANNELS_PER_MASK);
        }
    }
    masks
}

/// (ChMaskCntl, ChMask) pairs turning every channel of `channels` on or off
fn link_adr_masks(channels: &[Channel]) -> Vec<(u8, u16)> {
    let masks = channel_masks(channels);
    if channels.len() <= DYNAMIC_PLAN_MAX_CHANNELS {
        return vec![(0, masks[0])];
    }
    let narrow_block = FIXED_PLAN_NARROW_CHANNELS / CHANNELS_PER_MASK;
    let wide = masks.get(narrow_block).copied().unwrap_or_default();
    if masks[..narrow_block].iter().all(|m| *m == u16::MAX) {
        return vec![(CH_MASK_CNTL_ALL_ON, wide)];
    }
    let mut out = vec![(CH_MASK_CNTL_ALL_OFF, wide)];
    out.extend(
        masks[..narrow_block]
            .iter()
            .enumerate()
            .filter(|(_, m)| **m != 0)
            .map(|(i, m)| (i as u8, *m)),
    );
    out
}

fn enabled(channels: &[Channel]) -> Vec<bool> {
    channels.iter().map(|ch| ch.enable_uplink).collect()
}

fn new_channel_reqs(current: &[Channel], desired: &[Channel]) -> Vec<DownlinkCommand> {
    let mut reqs = Vec::new();
    for (i, want) in desired.iter().enumerate() {
        let same = current.get(i).is_some_and(|have| {
            have.uplink_frequency == want.uplink_frequency
                && have.min_data_rate_index == want.min_data_rate_index
                && have.max_data_rate_index == want.max_data_rate_index
        });
        if !same {
            reqs.push(DownlinkCommand::NewChannelReq {
                channel_index: i as u8,
                frequency: want.uplink_frequency,
                min_data_rate_index: want.min_data_rate_index,
                max_data_rate_index: want.max_data_rate_index,
            });
        }
    }
    for i in desired.len()..current.len() {
        reqs.push(DownlinkCommand::NewChannelReq {
            channel_index: i as u8,
            frequency: 0,
            min_data_rate_index: 0,
            max_data_rate_index: 0,
        });
    }
    reqs
}

/// Requests reconciling current with desired parameters, in groups that
/// must be sent together
fn requests(
    state: &MacState,
    band: &dyn Band,
    settings: &MacSettings,
    f_cnt_up: u32,
) -> Vec<Vec<DownlinkCommand>> {
    let current = &state.current_parameters;
    let desired = &state.desired_parameters;
    let mut groups = Vec::new();

    if band.default_channels().len() <= DYNAMIC_PLAN_MAX_CHANNELS {
        groups.extend(
            new_channel_reqs(&current.channels, &desired.channels)
                .into_iter()
                .map(|r| vec![r]),
        );
    }

    let target_channels = if desired.channels.len() == current.channels.len() {
        &desired.channels
    } else {
        &current.channels
    };
    if enabled(target_channels) != enabled(&current.channels)
        || desired.adr_data_rate_index != current.adr_data_rate_index
        || desired.adr_tx_power_index != current.adr_tx_power_index
        || desired.adr_nb_trans != current.adr_nb_trans
    {
        groups.push(
            link_adr_masks(&desired.channels)
                .into_iter()
                .map(|(ch_mask_cntl, ch_mask)| DownlinkCommand::LinkADRReq {
                    data_rate_index: desired.adr_data_rate_index,
                    tx_power_index: desired.adr_tx_power_index,
                    ch_mask,
                    ch_mask_cntl,
                    nb_trans: desired.adr_nb_trans,
                })
                .collect(),
        );
    }

    if desired.max_duty_cycle != current.max_duty_cycle {
        groups.push(vec![DownlinkCommand::DutyCycleReq {
            max_duty_cycle: desired.max_duty_cycle,
        }]);
    }

    if desired.rx1_data_rate_offset != current.rx1_data_rate_offset
        || desired.rx2_data_rate_index != current.rx2_data_rate_index
        || desired.rx2_frequency != current.rx2_frequency
    {
        groups.push(vec![DownlinkCommand::RXParamSetupReq {
            rx1_dr_offset: desired.rx1_data_rate_offset,
            rx2_data_rate_index: desired.rx2_data_rate_index,
            rx2_frequency: desired.rx2_frequency,
        }]);
    }

    if desired.rx1_delay != current.rx1_delay {
        groups.push(vec![DownlinkCommand::RXTimingSetupReq {
            delay: desired.rx1_delay,
        }]);
    }

    if state.lorawan_version >= MacVersion::V1_1
        && (desired.adr_ack_limit_exponent != current.adr_ack_limit_exponent
            || desired.adr_ack_delay_exponent != current.adr_ack_delay_exponent)
    {
        groups.push(vec![DownlinkCommand::ADRParamSetupReq {
            ack_limit_exponent: desired.adr_ack_limit_exponent,
            ack_delay_exponent: desired.adr_ack_delay_exponent,
        }]);
    }

    if state.device_class == DeviceClass::B
        && (desired.ping_slot_frequency != current.ping_slot_frequency
            || desired.ping_slot_data_rate_index != current.ping_slot_data_rate_index)
    {
        groups.push(vec![DownlinkCommand::PingSlotChannelReq {
            frequency: desired.ping_slot_frequency,
            data_rate_index: desired.ping_slot_data_rate_index,
        }]);
    }

    if let Some(periodicity) = settings.status_count_periodicity.filter(|p| *p > 0) {
        let last = state.last_dev_status_f_cnt_up.unwrap_or(0);
        if f_cnt_up.saturating_sub(last) >= periodicity {
            groups.push(vec![DownlinkCommand::DevStatusReq]);
        }
    }

    groups
}

/// Commands for the next downlink, at most `max_len` bytes.
///
/// Queued answers go first. Requests that fit are recorded as pending;
/// answers that do not fit stay queued.
pub fn generate_downlink_commands(
    state: &mut MacState,
    band: &dyn Band,
    settings: &MacSettings,
    f_cnt_up: u32,
    max_len: usize,
) -> Vec<DownlinkCommand> {
    let mut budget = max_len;
    let mut out = Vec::new();

    for answer in std::mem::take(&mut state.queued_responses) {
        if answer.len() <= budget {
            budget -= answer.len();
            out.push(answer);
        } else {
            state.queued_responses.push(answer);
        }
    }

    state.pending_requests.clear();
    for group in requests(state, band, settings, f_cnt_up) {
        let len: usize = group.iter().map(DownlinkCommand::len).sum();
        if len > budget {
            debug!(len, budget, "MAC request does not fit");
            continue;
        }
        budget -= len;
        state.pending_requests.extend(group.iter().cloned());
        out.extend(group);
    }
    out
}
