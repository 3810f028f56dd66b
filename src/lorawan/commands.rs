//! MAC commands
//!
//! Command identifiers are shared between directions, so uplink commands
//! (sent by devices) and downlink commands (sent by the network) are
//! separate types. Frequencies are in Hz and travel on the wire in units of
//! 100 Hz.

use std::time::Duration;

use crate::config::device::DeviceClass;
use crate::lorawan::mac::FrameError;

fn freq_from_bytes(b: &[u8]) -> u64 {
    u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64 * 100
}

fn freq_to_bytes(freq: u64) -> [u8; 3] {
    let v = ((freq / 100) as u32).to_le_bytes();
    [v[0], v[1], v[2]]
}

fn class_from_byte(b: u8) -> DeviceClass {
    match b {
        0x02 => DeviceClass::C,
        _ => DeviceClass::A,
    }
}

fn class_to_byte(class: DeviceClass) -> u8 {
    match class {
        DeviceClass::C => 0x02,
        _ => 0x00,
    }
}

/// Command sent by an end device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkCommand {
    /// ABP device reset (LoRaWAN 1.1)
    ResetInd {
        /// LoRaWAN minor version of the device
        minor: u8,
    },
    /// Link check request
    LinkCheckReq,
    /// Link ADR answer
    LinkADRAns {
        /// Power ACK
        power_ack: bool,
        /// Data rate ACK
        data_rate_ack: bool,
        /// Channel mask ACK
        channel_mask_ack: bool,
    },
    /// Duty cycle answer
    DutyCycleAns,
    /// RX parameter setup answer
    RXParamSetupAns {
        /// RX1 data rate offset ACK
        rx1_dr_offset_ack: bool,
        /// RX2 data rate ACK
        rx2_data_rate_ack: bool,
        /// RX2 channel ACK
        channel_ack: bool,
    },
    /// Device status answer
    DevStatusAns {
        /// Battery level: 0 external power, 1-254 level, 255 unknown
        battery: u8,
        /// Demodulation margin of the last DevStatusReq in dB
        margin: i8,
    },
    /// New channel answer
    NewChannelAns {
        /// Data rate range accepted
        data_rate_ok: bool,
        /// Frequency accepted
        channel_freq_ok: bool,
    },
    /// RX timing setup answer
    RXTimingSetupAns,
    /// TX parameter setup answer
    TxParamSetupAns,
    /// Downlink channel answer
    DlChannelAns {
        /// Frequency accepted
        channel_freq_ok: bool,
        /// Uplink frequency exists for the channel
        uplink_freq_exists: bool,
    },
    /// Rekey indication (LoRaWAN 1.1)
    RekeyInd {
        /// LoRaWAN minor version of the device
        minor: u8,
    },
    /// ADR parameter setup answer
    ADRParamSetupAns,
    /// Device time request
    DeviceTimeReq,
    /// Rejoin parameter setup answer
    RejoinParamSetupAns {
        /// Maximum time exponent accepted
        max_time_exponent_ack: bool,
    },
    /// Class B ping slot periodicity indication
    PingSlotInfoReq {
        /// Periodicity (0-7)
        periodicity: u8,
    },
    /// Ping slot channel answer
    PingSlotChannelAns {
        /// Data rate accepted
        data_rate_ok: bool,
        /// Frequency accepted
        frequency_ok: bool,
    },
    /// Beacon frequency answer
    BeaconFreqAns {
        /// Frequency accepted
        frequency_ok: bool,
    },
    /// Device class change indication
    DeviceModeInd {
        /// Requested class
        class: DeviceClass,
    },
}

impl UplinkCommand {
    /// Parse one command from its identifier and the bytes that follow it.
    ///
    /// Returns `Ok(None)` for unknown identifiers; the rest of the buffer
    /// cannot be interpreted after one.
    pub fn from_bytes(cid: u8, payload: &[u8]) -> Result<Option<Self>, FrameError> {
        let need = match Self::payload_len(cid) {
            Some(n) => n,
            None => return Ok(None),
        };
        if payload.len() < need {
            return Err(FrameError::TruncatedCommand { cid });
        }
        let b = payload.first().copied().unwrap_or_default();
        Ok(Some(match cid {
            0x01 => UplinkCommand::ResetInd { minor: b & 0x0F },
            0x02 => UplinkCommand::LinkCheckReq,
            0x03 => UplinkCommand::LinkADRAns {
                power_ack: (b & 0x04) != 0,
                data_rate_ack: (b & 0x02) != 0,
                channel_mask_ack: (b & 0x01) != 0,
            },
            0x04 => UplinkCommand::DutyCycleAns,
            0x05 => UplinkCommand::RXParamSetupAns {
                rx1_dr_offset_ack: (b & 0x04) != 0,
                rx2_data_rate_ack: (b & 0x02) != 0,
                channel_ack: (b & 0x01) != 0,
            },
            0x06 => UplinkCommand::DevStatusAns {
                battery: b,
                // 6-bit two's complement
                margin: ((payload[1] << 2) as i8) >> 2,
            },
            0x07 => UplinkCommand::NewChannelAns {
                data_rate_ok: (b & 0x02) != 0,
                channel_freq_ok: (b & 0x01) != 0,
            },
            0x08 => UplinkCommand::RXTimingSetupAns,
            0x09 => UplinkCommand::TxParamSetupAns,
            0x0A => UplinkCommand::DlChannelAns {
                uplink_freq_exists: (b & 0x02) != 0,
                channel_freq_ok: (b & 0x01) != 0,
            },
            0x0B => UplinkCommand::RekeyInd { minor: b & 0x0F },
            0x0C => UplinkCommand::ADRParamSetupAns,
            0x0D => UplinkCommand::DeviceTimeReq,
            0x0F => UplinkCommand::RejoinParamSetupAns {
                max_time_exponent_ack: (b & 0x01) != 0,
            },
            0x10 => UplinkCommand::PingSlotInfoReq {
                periodicity: b & 0x07,
            },
            0x11 => UplinkCommand::PingSlotChannelAns {
                data_rate_ok: (b & 0x02) != 0,
                frequency_ok: (b & 0x01) != 0,
            },
            0x13 => UplinkCommand::BeaconFreqAns {
                frequency_ok: (b & 0x01) != 0,
            },
            _ => UplinkCommand::DeviceModeInd {
                class: class_from_byte(b),
            },
        }))
    }

    fn payload_len(cid: u8) -> Option<usize> {
        Some(match cid {
            0x02 | 0x04 | 0x08 | 0x09 | 0x0C | 0x0D => 0,
            0x01 | 0x03 | 0x05 | 0x07 | 0x0A | 0x0B | 0x0F | 0x10 | 0x11 | 0x13 | 0x20 => 1,
            0x06 => 2,
            _ => return None,
        })
    }

    /// Command identifier
    pub fn cid(&self) -> u8 {
        match self {
            UplinkCommand::ResetInd { .. } => 0x01,
            UplinkCommand::LinkCheckReq => 0x02,
            UplinkCommand::LinkADRAns { .. } => 0x03,
            UplinkCommand::DutyCycleAns => 0x04,
            UplinkCommand::RXParamSetupAns { .. } => 0x05,
            UplinkCommand::DevStatusAns { .. } => 0x06,
            UplinkCommand::NewChannelAns { .. } => 0x07,
            UplinkCommand::RXTimingSetupAns => 0x08,
            UplinkCommand::TxParamSetupAns => 0x09,
            UplinkCommand::DlChannelAns { .. } => 0x0A,
            UplinkCommand::RekeyInd { .. } => 0x0B,
            UplinkCommand::ADRParamSetupAns => 0x0C,
            UplinkCommand::DeviceTimeReq => 0x0D,
            UplinkCommand::RejoinParamSetupAns { .. } => 0x0F,
            UplinkCommand::PingSlotInfoReq { .. } => 0x10,
            UplinkCommand::PingSlotChannelAns { .. } => 0x11,
            UplinkCommand::BeaconFreqAns { .. } => 0x13,
            UplinkCommand::DeviceModeInd { .. } => 0x20,
        }
    }

    /// Append the encoded command
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.cid());
        let flag = |b: bool, bit: u8| if b { 1 << bit } else { 0 };
        match self {
            UplinkCommand::ResetInd { minor } | UplinkCommand::RekeyInd { minor } => {
                buf.push(*minor)
            }
            UplinkCommand::LinkADRAns {
                power_ack,
                data_rate_ack,
                channel_mask_ack,
            } => buf.push(flag(*power_ack, 2) | flag(*data_rate_ack, 1) | flag(*channel_mask_ack, 0)),
            UplinkCommand::RXParamSetupAns {
                rx1_dr_offset_ack,
                rx2_data_rate_ack,
                channel_ack,
            } => buf.push(
                flag(*rx1_dr_offset_ack, 2) | flag(*rx2_data_rate_ack, 1) | flag(*channel_ack, 0),
            ),
            UplinkCommand::DevStatusAns { battery, margin } => {
                buf.push(*battery);
                buf.push((*margin as u8) & 0x3F);
            }
            UplinkCommand::NewChannelAns {
                data_rate_ok,
                channel_freq_ok,
            } => buf.push(flag(*data_rate_ok, 1) | flag(*channel_freq_ok, 0)),
            UplinkCommand::DlChannelAns {
                channel_freq_ok,
                uplink_freq_exists,
            } => buf.push(flag(*uplink_freq_exists, 1) | flag(*channel_freq_ok, 0)),
            UplinkCommand::RejoinParamSetupAns {
                max_time_exponent_ack,
            } => buf.push(flag(*max_time_exponent_ack, 0)),
            UplinkCommand::PingSlotInfoReq { periodicity } => buf.push(*periodicity & 0x07),
            UplinkCommand::PingSlotChannelAns {
                data_rate_ok,
                frequency_ok,
            } => buf.push(flag(*data_rate_ok, 1) | flag(*frequency_ok, 0)),
            UplinkCommand::BeaconFreqAns { frequency_ok } => buf.push(flag(*frequency_ok, 0)),
            UplinkCommand::DeviceModeInd { class } => buf.push(class_to_byte(*class)),
            UplinkCommand::LinkCheckReq
            | UplinkCommand::DutyCycleAns
            | UplinkCommand::RXTimingSetupAns
            | UplinkCommand::TxParamSetupAns
            | UplinkCommand::ADRParamSetupAns
            | UplinkCommand::DeviceTimeReq => {}
        }
    }
}

/// Parse all uplink commands in a FOpts or port 0 FRMPayload buffer.
///
/// Parsing stops at the first unknown identifier.
pub fn parse_uplink_commands(mut buf: &[u8]) -> Result<Vec<UplinkCommand>, FrameError> {
    let mut cmds = Vec::new();
    while let Some((&cid, rest)) = buf.split_first() {
        match UplinkCommand::from_bytes(cid, rest)? {
            Some(cmd) => {
                let n = UplinkCommand::payload_len(cid).unwrap_or_default();
                buf = &rest[n..];
                cmds.push(cmd);
            }
            None => {
                tracing::debug!(cid, "unknown uplink MAC command, skipping remainder");
                break;
            }
        }
    }
    Ok(cmds)
}

/// Command sent by the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownlinkCommand {
    /// ABP reset confirmation
    ResetConf {
        /// Negotiated LoRaWAN minor version
        minor: u8,
    },
    /// Link check answer
    LinkCheckAns {
        /// Link margin in dB
        margin: u8,
        /// Number of gateways that received the request
        gateway_count: u8,
    },
    /// Link ADR request
    LinkADRReq {
        /// Data rate index
        data_rate_index: u8,
        /// TX power index
        tx_power_index: u8,
        /// Channel mask
        ch_mask: u16,
        /// Channel mask control
        ch_mask_cntl: u8,
        /// Number of transmissions
        nb_trans: u8,
    },
    /// Duty cycle request
    DutyCycleReq {
        /// Maximum duty cycle exponent
        max_duty_cycle: u8,
    },
    /// RX parameter setup request
    RXParamSetupReq {
        /// RX1 data rate offset
        rx1_dr_offset: u8,
        /// RX2 data rate index
        rx2_data_rate_index: u8,
        /// RX2 frequency
        rx2_frequency: u64,
    },
    /// Device status request
    DevStatusReq,
    /// New channel request
    NewChannelReq {
        /// Channel index
        channel_index: u8,
        /// Uplink frequency, 0 disables the channel
        frequency: u64,
        /// Minimum data rate index
        min_data_rate_index: u8,
        /// Maximum data rate index
        max_data_rate_index: u8,
    },
    /// RX timing setup request
    RXTimingSetupReq {
        /// RX1 delay in seconds
        delay: u8,
    },
    /// Downlink channel request
    DlChannelReq {
        /// Channel index
        channel_index: u8,
        /// Downlink frequency
        frequency: u64,
    },
    /// Rekey confirmation
    RekeyConf {
        /// Negotiated LoRaWAN minor version
        minor: u8,
    },
    /// ADR parameter setup request
    ADRParamSetupReq {
        /// ADR_ACK_LIMIT exponent
        ack_limit_exponent: u8,
        /// ADR_ACK_DELAY exponent
        ack_delay_exponent: u8,
    },
    /// Device time answer
    DeviceTimeAns {
        /// Time since the GPS epoch
        gps_time: Duration,
    },
    /// Ping slot periodicity acknowledgment
    PingSlotInfoAns,
    /// Ping slot channel request
    PingSlotChannelReq {
        /// Ping slot frequency
        frequency: u64,
        /// Ping slot data rate index
        data_rate_index: u8,
    },
    /// Device class change confirmation
    DeviceModeConf {
        /// Class in effect
        class: DeviceClass,
    },
}

impl DownlinkCommand {
    /// Command identifier
    pub fn cid(&self) -> u8 {
        match self {
            DownlinkCommand::ResetConf { .. } => 0x01,
            DownlinkCommand::LinkCheckAns { .. } => 0x02,
            DownlinkCommand::LinkADRReq { .. } => 0x03,
            DownlinkCommand::DutyCycleReq { .. } => 0x04,
            DownlinkCommand::RXParamSetupReq { .. } => 0x05,
            DownlinkCommand::DevStatusReq => 0x06,
            DownlinkCommand::NewChannelReq { .. } => 0x07,
            DownlinkCommand::RXTimingSetupReq { .. } => 0x08,
            DownlinkCommand::DlChannelReq { .. } => 0x0A,
            DownlinkCommand::RekeyConf { .. } => 0x0B,
            DownlinkCommand::ADRParamSetupReq { .. } => 0x0C,
            DownlinkCommand::DeviceTimeAns { .. } => 0x0D,
            DownlinkCommand::PingSlotInfoAns => 0x10,
            DownlinkCommand::PingSlotChannelReq { .. } => 0x11,
            DownlinkCommand::DeviceModeConf { .. } => 0x20,
        }
    }

    /// Encoded length including the identifier
    pub fn len(&self) -> usize {
        1 + match self {
            DownlinkCommand::DevStatusReq | DownlinkCommand::PingSlotInfoAns => 0,
            DownlinkCommand::ResetConf { .. }
            | DownlinkCommand::DutyCycleReq { .. }
            | DownlinkCommand::RXTimingSetupReq { .. }
            | DownlinkCommand::RekeyConf { .. }
            | DownlinkCommand::ADRParamSetupReq { .. }
            | DownlinkCommand::DeviceModeConf { .. } => 1,
            DownlinkCommand::LinkCheckAns { .. } => 2,
            DownlinkCommand::LinkADRReq { .. }
            | DownlinkCommand::RXParamSetupReq { .. }
            | DownlinkCommand::DlChannelReq { .. }
            | DownlinkCommand::PingSlotChannelReq { .. } => 4,
            DownlinkCommand::NewChannelReq { .. } | DownlinkCommand::DeviceTimeAns { .. } => 5,
        }
    }

    /// Whether the device answers this command
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            DownlinkCommand::LinkADRReq { .. }
                | DownlinkCommand::DutyCycleReq { .. }
                | DownlinkCommand::RXParamSetupReq { .. }
                | DownlinkCommand::DevStatusReq
                | DownlinkCommand::NewChannelReq { .. }
                | DownlinkCommand::RXTimingSetupReq { .. }
                | DownlinkCommand::DlChannelReq { .. }
                | DownlinkCommand::ADRParamSetupReq { .. }
                | DownlinkCommand::PingSlotChannelReq { .. }
        )
    }

    /// Append the encoded command
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.cid());
        match self {
            DownlinkCommand::ResetConf { minor } | DownlinkCommand::RekeyConf { minor } => {
                buf.push(*minor & 0x0F)
            }
            DownlinkCommand::LinkCheckAns {
                margin,
                gateway_count,
            } => buf.extend_from_slice(&[*margin, *gateway_count]),
            DownlinkCommand::LinkADRReq {
                data_rate_index,
                tx_power_index,
                ch_mask,
                ch_mask_cntl,
                nb_trans,
            } => {
                buf.push((data_rate_index << 4) | (tx_power_index & 0x0F));
                buf.extend_from_slice(&ch_mask.to_le_bytes());
                buf.push(((ch_mask_cntl & 0x07) << 4) | (nb_trans & 0x0F));
            }
            DownlinkCommand::DutyCycleReq { max_duty_cycle } => buf.push(*max_duty_cycle & 0x0F),
            DownlinkCommand::RXParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate_index,
                rx2_frequency,
            } => {
                buf.push(((rx1_dr_offset & 0x07) << 4) | (rx2_data_rate_index & 0x0F));
                buf.extend_from_slice(&freq_to_bytes(*rx2_frequency));
            }
            DownlinkCommand::NewChannelReq {
                channel_index,
                frequency,
                min_data_rate_index,
                max_data_rate_index,
            } => {
                buf.push(*channel_index);
                buf.extend_from_slice(&freq_to_bytes(*frequency));
                buf.push((max_data_rate_index << 4) | (min_data_rate_index & 0x0F));
            }
            DownlinkCommand::RXTimingSetupReq { delay } => buf.push(*delay & 0x0F),
            DownlinkCommand::DlChannelReq {
                channel_index,
                frequency,
            } => {
                buf.push(*channel_index);
                buf.extend_from_slice(&freq_to_bytes(*frequency));
            }
            DownlinkCommand::ADRParamSetupReq {
                ack_limit_exponent,
                ack_delay_exponent,
            } => buf.push((ack_limit_exponent << 4) | (ack_delay_exponent & 0x0F)),
            DownlinkCommand::DeviceTimeAns { gps_time } => {
                buf.extend_from_slice(&(gps_time.as_secs() as u32).to_le_bytes());
                buf.push((gps_time.subsec_nanos() as u64 * 256 / 1_000_000_000) as u8);
            }
            DownlinkCommand::PingSlotChannelReq {
                frequency,
                data_rate_index,
            } => {
                buf.extend_from_slice(&freq_to_bytes(*frequency));
                buf.push(*data_rate_index & 0x0F);
            }
            DownlinkCommand::DeviceModeConf { class } => buf.push(class_to_byte(*class)),
            DownlinkCommand::DevStatusReq | DownlinkCommand::PingSlotInfoAns => {}
        }
    }

    /// Parse one command; used to inspect frames the network produced
    pub fn from_bytes(cid: u8, p: &[u8]) -> Result<Option<(Self, usize)>, FrameError> {
        let need = match cid {
            0x06 | 0x10 => 0,
            0x01 | 0x04 | 0x08 | 0x0B | 0x0C | 0x20 => 1,
            0x02 => 2,
            0x03 | 0x05 | 0x0A | 0x11 => 4,
            0x07 | 0x0D => 5,
            _ => return Ok(None),
        };
        if p.len() < need {
            return Err(FrameError::TruncatedCommand { cid });
        }
        let cmd = match cid {
            0x01 => DownlinkCommand::ResetConf { minor: p[0] & 0x0F },
            0x02 => DownlinkCommand::LinkCheckAns {
                margin: p[0],
                gateway_count: p[1],
            },
            0x03 => DownlinkCommand::LinkADRReq {
                data_rate_index: p[0] >> 4,
                tx_power_index: p[0] & 0x0F,
                ch_mask: u16::from_le_bytes([p[1], p[2]]),
                ch_mask_cntl: (p[3] >> 4) & 0x07,
                nb_trans: p[3] & 0x0F,
            },
            0x04 => DownlinkCommand::DutyCycleReq {
                max_duty_cycle: p[0] & 0x0F,
            },
            0x05 => DownlinkCommand::RXParamSetupReq {
                rx1_dr_offset: (p[0] >> 4) & 0x07,
                rx2_data_rate_index: p[0] & 0x0F,
                rx2_frequency: freq_from_bytes(&p[1..4]),
            },
            0x06 => DownlinkCommand::DevStatusReq,
            0x07 => DownlinkCommand::NewChannelReq {
                channel_index: p[0],
                frequency: freq_from_bytes(&p[1..4]),
                min_data_rate_index: p[4] & 0x0F,
                max_data_rate_index: p[4] >> 4,
            },
            0x08 => DownlinkCommand::RXTimingSetupReq { delay: p[0] & 0x0F },
            0x0A => DownlinkCommand::DlChannelReq {
                channel_index: p[0],
                frequency: freq_from_bytes(&p[1..4]),
            },
            0x0B => DownlinkCommand::RekeyConf { minor: p[0] & 0x0F },
            0x0C => DownlinkCommand::ADRParamSetupReq {
                ack_limit_exponent: p[0] >> 4,
                ack_delay_exponent: p[0] & 0x0F,
            },
            0x0D => DownlinkCommand::DeviceTimeAns {
                gps_time: Duration::from_secs(u32::from_le_bytes([p[0], p[1], p[2], p[3]]) as u64)
                    + Duration::from_nanos(p[4] as u64 * 1_000_000_000 / 256),
            },
            0x10 => DownlinkCommand::PingSlotInfoAns,
            0x11 => DownlinkCommand::PingSlotChannelReq {
                frequency: freq_from_bytes(&p[0..3]),
                data_rate_index: p[3] & 0x0F,
            },
            _ => DownlinkCommand::DeviceModeConf {
                class: class_from_byte(p[0]),
            },
        };
        Ok(Some((cmd, need)))
    }
}

/// Encode downlink commands into one buffer
pub fn encode_downlink_commands(cmds: &[DownlinkCommand]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(cmds.iter().map(DownlinkCommand::len).sum());
    for cmd in cmds {
        cmd.encode_into(&mut buf);
    }
    buf
}

/// Parse a buffer of downlink commands
pub fn parse_downlink_commands(mut buf: &[u8]) -> Result<Vec<DownlinkCommand>, FrameError> {
    let mut cmds = Vec::new();
    while let Some((&cid, rest)) = buf.split_first() {
        match DownlinkCommand::from_bytes(cid, rest)? {
            Some((cmd, n)) => {
                buf = &rest[n..];
                cmds.push(cmd);
            }
            None => break,
        }
    }
    Ok(cmds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uplink_sequence() {
        let buf = [0x02, 0x03, 0x07, 0x06, 0xff, 0x3e, 0x0d];
        let cmds = parse_uplink_commands(&buf).unwrap();
        assert_eq!(
            cmds,
            vec![
                UplinkCommand::LinkCheckReq,
                UplinkCommand::LinkADRAns {
                    power_ack: true,
                    data_rate_ack: true,
                    channel_mask_ack: true,
                },
                UplinkCommand::DevStatusAns {
                    battery: 0xff,
                    margin: -2,
                },
                UplinkCommand::DeviceTimeReq,
            ]
        );
    }

    #[test]
    fn test_unknown_cid_stops_parsing() {
        let cmds = parse_uplink_commands(&[0x02, 0x7f, 0x02]).unwrap();
        assert_eq!(cmds, vec![UplinkCommand::LinkCheckReq]);
    }

    #[test]
    fn test_truncated_command() {
        assert_eq!(
            parse_uplink_commands(&[0x06, 0x01]),
            Err(FrameError::TruncatedCommand { cid: 0x06 })
        );
    }

    #[test]
    fn test_rx_param_setup_req_encoding() {
        let cmd = DownlinkCommand::RXParamSetupReq {
            rx1_dr_offset: 1,
            rx2_data_rate_index: 3,
            rx2_frequency: 869_525_000,
        };
        let buf = encode_downlink_commands(&[cmd.clone()]);
        assert_eq!(buf.len(), cmd.len());
        assert_eq!(buf, vec![0x05, 0x13, 0xd2, 0xad, 0x84]);
        assert_eq!(parse_downlink_commands(&buf).unwrap(), vec![cmd]);
    }
}
