//! LoRaWAN PHYPayload codec
//!
//! Decodes uplink frames as received from gateways and encodes downlink
//! data frames. Join-accepts are produced encrypted by the Join Server and
//! pass through as opaque bytes.

use thiserror::Error;

use crate::config::device::{DevAddr, DevNonce, EUI64};
use crate::crypto::MIC_SIZE;

/// Maximum FOpts length
pub const MAX_FOPTS_LEN: usize = 15;

/// Join-request PHYPayload length
const JOIN_REQUEST_LEN: usize = 23;

/// Smallest data frame: MHDR, FHDR without FOpts, MIC
const MIN_DATA_LEN: usize = 1 + 7 + MIC_SIZE;

/// Frame codec error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Frame shorter than its structure requires
    #[error("frame too short: need {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes required
        expected: usize,
        /// Bytes present
        actual: usize,
    },
    /// Join-request of the wrong size
    #[error("invalid join-request length {0}")]
    InvalidJoinRequestLength(usize),
    /// LoRaWAN major version other than R1
    #[error("unsupported major version {0}")]
    UnsupportedMajor(u8),
    /// MAC commands present both in FOpts and FRMPayload
    #[error("FOpts present on port 0")]
    FOptsWithPortZero,
    /// FOpts longer than 15 bytes
    #[error("FOpts too long: {0} bytes")]
    FOptsTooLong(usize),
    /// MAC command payload truncated
    #[error("MAC command {cid:#04x} truncated")]
    TruncatedCommand {
        /// Command identifier
        cid: u8,
    },
}

/// MAC header types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MType {
    /// Join-request
    JoinRequest = 0x00,
    /// Join-accept
    JoinAccept = 0x20,
    /// Unconfirmed data uplink
    UnconfirmedDataUp = 0x40,
    /// Unconfirmed data downlink
    UnconfirmedDataDown = 0x60,
    /// Confirmed data uplink
    ConfirmedDataUp = 0x80,
    /// Confirmed data downlink
    ConfirmedDataDown = 0xA0,
    /// Rejoin-request
    RejoinRequest = 0xC0,
    /// Proprietary
    Proprietary = 0xE0,
}

impl MType {
    fn from_mhdr(byte: u8) -> Self {
        match byte & 0xE0 {
            0x00 => MType::JoinRequest,
            0x20 => MType::JoinAccept,
            0x40 => MType::UnconfirmedDataUp,
            0x60 => MType::UnconfirmedDataDown,
            0x80 => MType::ConfirmedDataUp,
            0xA0 => MType::ConfirmedDataDown,
            0xC0 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    /// Data uplink of either kind
    pub fn is_data_up(&self) -> bool {
        matches!(self, MType::UnconfirmedDataUp | MType::ConfirmedDataUp)
    }

    /// Confirmed data frame of either direction
    pub fn is_confirmed(&self) -> bool {
        matches!(self, MType::ConfirmedDataUp | MType::ConfirmedDataDown)
    }
}

/// MAC header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MHDR {
    /// Message type
    pub m_type: MType,
    /// Major version, 0 for LoRaWAN R1
    pub major: u8,
}

impl MHDR {
    fn to_byte(self) -> u8 {
        self.m_type as u8 | (self.major & 0x03)
    }
}

/// Frame control octet, without the FOpts length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FCtrl {
    /// Adaptive data rate
    pub adr: bool,
    /// ADR acknowledgment request (uplink only)
    pub adr_ack_req: bool,
    /// Acknowledges the last confirmed frame
    pub ack: bool,
    /// Frame pending (downlink) or class B enabled (uplink)
    pub f_pending: bool,
}

impl FCtrl {
    fn to_byte(self, f_opts_len: usize) -> u8 {
        let mut byte = (f_opts_len as u8) & 0x0F;
        if self.adr {
            byte |= 0x80;
        }
        if self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if self.f_pending {
            byte |= 0x10;
        }
        byte
    }

    fn from_byte(byte: u8) -> (Self, usize) {
        (
            Self {
                adr: (byte & 0x80) != 0,
                adr_ack_req: (byte & 0x40) != 0,
                ack: (byte & 0x20) != 0,
                f_pending: (byte & 0x10) != 0,
            },
            (byte & 0x0F) as usize,
        )
    }
}

/// Frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FHDR {
    /// Device address
    pub dev_addr: DevAddr,
    /// Frame control
    pub f_ctrl: FCtrl,
    /// 16 least significant bits of the frame counter
    pub f_cnt: u16,
    /// MAC commands piggybacked on the frame, as carried on the wire
    pub f_opts: Vec<u8>,
}

impl FHDR {
    fn serialize_into(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.dev_addr.to_le_bytes());
        buffer.push(self.f_ctrl.to_byte(self.f_opts.len()));
        buffer.extend_from_slice(&self.f_cnt.to_le_bytes());
        buffer.extend_from_slice(&self.f_opts);
    }
}

/// Data frame MACPayload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacPayload {
    /// Frame header
    pub f_hdr: FHDR,
    /// Port, absent when there is no FRMPayload
    pub f_port: Option<u8>,
    /// FRMPayload as carried on the wire (encrypted)
    pub frm_payload: Vec<u8>,
}

/// Join-request payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequestPayload {
    /// JoinEUI
    pub join_eui: EUI64,
    /// DevEUI
    pub dev_eui: EUI64,
    /// DevNonce
    pub dev_nonce: DevNonce,
}

/// Join-accept DLSettings octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DlSettings {
    /// RX1 data rate offset
    pub rx1_dr_offset: u8,
    /// RX2 data rate index
    pub rx2_dr: u8,
    /// LoRaWAN 1.1 key negotiation
    pub opt_neg: bool,
}

impl DlSettings {
    /// Encoded octet
    pub fn to_byte(self) -> u8 {
        let mut b = ((self.rx1_dr_offset & 0x07) << 4) | (self.rx2_dr & 0x0F);
        if self.opt_neg {
            b |= 0x80;
        }
        b
    }
}

/// Decoded MAC payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Join-request
    JoinRequest(JoinRequestPayload),
    /// Join-accept, encrypted
    JoinAccept(Vec<u8>),
    /// Data frame
    Data(MacPayload),
    /// Rejoin-request, undecoded
    RejoinRequest(Vec<u8>),
    /// Proprietary frame, undecoded
    Proprietary(Vec<u8>),
}

/// LoRaWAN PHYPayload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// MAC header
    pub mhdr: MHDR,
    /// MAC payload
    pub payload: Payload,
    /// Message integrity code
    pub mic: [u8; MIC_SIZE],
}

impl Message {
    /// Decode a PHYPayload
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < 1 + MIC_SIZE {
            return Err(FrameError::TooShort {
                expected: 1 + MIC_SIZE,
                actual: raw.len(),
            });
        }
        let mhdr = MHDR {
            m_type: MType::from_mhdr(raw[0]),
            major: raw[0] & 0x03,
        };
        if mhdr.major != 0 {
            return Err(FrameError::UnsupportedMajor(mhdr.major));
        }
        let mut mic = [0u8; MIC_SIZE];
        mic.copy_from_slice(&raw[raw.len() - MIC_SIZE..]);
        let body = &raw[1..raw.len() - MIC_SIZE];

        let payload = match mhdr.m_type {
            MType::JoinRequest => {
                if raw.len() != JOIN_REQUEST_LEN {
                    return Err(FrameError::InvalidJoinRequestLength(raw.len()));
                }
                let mut join_eui = [0u8; 8];
                let mut dev_eui = [0u8; 8];
                join_eui.copy_from_slice(&body[0..8]);
                dev_eui.copy_from_slice(&body[8..16]);
                Payload::JoinRequest(JoinRequestPayload {
                    join_eui: EUI64::from_le_bytes(join_eui),
                    dev_eui: EUI64::from_le_bytes(dev_eui),
                    dev_nonce: DevNonce::from_le_bytes([body[16], body[17]]),
                })
            }
            MType::JoinAccept => Payload::JoinAccept(raw[1..].to_vec()),
            MType::RejoinRequest => Payload::RejoinRequest(body.to_vec()),
            MType::Proprietary => Payload::Proprietary(body.to_vec()),
            _ => Payload::Data(decode_mac_payload(raw)?),
        };
        Ok(Self { mhdr, payload, mic })
    }

    /// Data frame payload, if this is a data frame
    pub fn mac_payload(&self) -> Option<&MacPayload> {
        match &self.payload {
            Payload::Data(p) => Some(p),
            _ => None,
        }
    }

    /// Encode the frame including its MIC
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = self.encode_without_mic();
        buffer.extend_from_slice(&self.mic);
        buffer
    }

    /// Encode MHDR through the end of the MAC payload; the MIC input
    pub fn encode_without_mic(&self) -> Vec<u8> {
        let mut buffer = vec![self.mhdr.to_byte()];
        match &self.payload {
            Payload::JoinRequest(jr) => {
                buffer.extend_from_slice(&jr.join_eui.to_le_bytes());
                buffer.extend_from_slice(&jr.dev_eui.to_le_bytes());
                buffer.extend_from_slice(&jr.dev_nonce.to_le_bytes());
            }
            Payload::Data(p) => {
                p.f_hdr.serialize_into(&mut buffer);
                if let Some(port) = p.f_port {
                    buffer.push(port);
                    buffer.extend_from_slice(&p.frm_payload);
                }
            }
            Payload::JoinAccept(b) | Payload::RejoinRequest(b) | Payload::Proprietary(b) => {
                buffer.extend_from_slice(b);
            }
        }
        buffer
    }
}

fn decode_mac_payload(raw: &[u8]) -> Result<MacPayload, FrameError> {
    if raw.len() < MIN_DATA_LEN {
        return Err(FrameError::TooShort {
            expected: MIN_DATA_LEN,
            actual: raw.len(),
        });
    }
    let end = raw.len() - MIC_SIZE;
    let dev_addr = DevAddr::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);
    let (f_ctrl, f_opts_len) = FCtrl::from_byte(raw[5]);
    let f_cnt = u16::from_le_bytes([raw[6], raw[7]]);
    let f_opts_end = 8 + f_opts_len;
    if f_opts_end > end {
        return Err(FrameError::TooShort {
            expected: f_opts_end + MIC_SIZE,
            actual: raw.len(),
        });
    }
    let f_opts = raw[8..f_opts_end].to_vec();
    let (f_port, frm_payload) = if f_opts_end < end {
        (Some(raw[f_opts_end]), raw[f_opts_end + 1..end].to_vec())
    } else {
        (None, Vec::new())
    };
    if f_port == Some(0) && !f_opts.is_empty() {
        return Err(FrameError::FOptsWithPortZero);
    }
    Ok(MacPayload {
        f_hdr: FHDR {
            dev_addr,
            f_ctrl,
            f_cnt,
            f_opts,
        },
        f_port,
        frm_payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_data_uplink() {
        let raw = [
            0x80, 0xda, 0x1b, 0x01, 0x26, 0x82, 0x2a, 0x00, 0x02, 0x06, 0x01, 0xaa, 0xbb,
            0x01, 0x02, 0x03, 0x04,
        ];
        let msg = Message::decode(&raw).unwrap();
        assert_eq!(msg.mhdr.m_type, MType::ConfirmedDataUp);
        let p = msg.mac_payload().unwrap();
        assert_eq!(p.f_hdr.dev_addr, DevAddr::new([0x26, 0x01, 0x1b, 0xda]));
        assert!(p.f_hdr.f_ctrl.adr);
        assert_eq!(p.f_hdr.f_cnt, 42);
        assert_eq!(p.f_hdr.f_opts, vec![0x02, 0x06]);
        assert_eq!(p.f_port, Some(1));
        assert_eq!(p.frm_payload, vec![0xaa, 0xbb]);
        assert_eq!(msg.mic, [1, 2, 3, 4]);
        assert_eq!(msg.encode(), raw.to_vec());
    }

    #[test]
    fn test_decode_rejects_fopts_overflow() {
        let raw = [0x40, 0xda, 0x1b, 0x01, 0x26, 0x0f, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04];
        assert!(matches!(
            Message::decode(&raw),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn test_decode_join_request() {
        let mut raw = vec![0x00];
        raw.extend_from_slice(&[0x01, 0, 0, 0, 0, 0, 0, 0x42]);
        raw.extend_from_slice(&[0x02, 0, 0, 0, 0, 0, 0, 0x42]);
        raw.extend_from_slice(&[0x34, 0x12]);
        raw.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let msg = Message::decode(&raw).unwrap();
        match msg.payload {
            Payload::JoinRequest(jr) => {
                assert_eq!(jr.join_eui, EUI64::new([0x42, 0, 0, 0, 0, 0, 0, 0x01]));
                assert_eq!(jr.dev_nonce, DevNonce::new([0x12, 0x34]));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(matches!(
            Message::decode(&raw[..20]),
            Err(FrameError::InvalidJoinRequestLength(20))
        ));
    }

    #[test]
    fn test_dl_settings_octet() {
        let s = DlSettings {
            rx1_dr_offset: 2,
            rx2_dr: 3,
            opt_neg: true,
        };
        assert_eq!(s.to_byte(), 0xa3);
    }
}
