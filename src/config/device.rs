//! Device identifiers, keys and per-device settings

use core::fmt;
use core::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Create from bytes in network (MSB-first) order
            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Bytes in MSB-first order
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Bytes in LoRaWAN wire (LSB-first) order
            pub fn to_le_bytes(&self) -> [u8; $len] {
                let mut b = self.0;
                b.reverse();
                b
            }

            /// Create from bytes in LoRaWAN wire (LSB-first) order
            pub fn from_le_bytes(mut bytes: [u8; $len]) -> Self {
                bytes.reverse();
                Self(bytes)
            }

            /// Whether all bytes are zero
            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode_upper(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(s, &mut bytes).map_err(|err| {
                    Error::InvalidConfig(format!("{} `{}`: {}", stringify!($name), s, err))
                })?;
                Ok(Self(bytes))
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(s: String) -> Result<Self> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.to_string()
            }
        }
    };
}

hex_id!(
    /// EUI-64 (DevEUI, JoinEUI, gateway EUI)
    EUI64,
    8
);
hex_id!(
    /// 32-bit device address
    DevAddr,
    4
);
hex_id!(
    /// 24-bit network identifier
    NetID,
    3
);
hex_id!(
    /// Join-request nonce
    DevNonce,
    2
);

/// AES-128 key (16 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AESKey([u8; 16]);

impl AESKey {
    /// Create a new key
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AESKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AESKey(..)")
    }
}

/// NwkID width in bits for each NetID type
const NWK_ID_BITS: [u32; 8] = [6, 6, 9, 11, 12, 13, 15, 17];

impl NetID {
    /// NetID type (3 MSBs)
    pub fn net_type(&self) -> u8 {
        self.0[0] >> 5
    }

    /// 24-bit value
    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes([0, self.0[0], self.0[1], self.0[2]])
    }

    /// NwkID embedded in device addresses of this network
    pub fn nwk_id(&self) -> u32 {
        let bits = NWK_ID_BITS[self.net_type() as usize];
        self.to_u32() & ((1 << bits) - 1)
    }
}

impl DevAddr {
    /// 32-bit value
    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Create from a 32-bit value
    pub fn from_u32(v: u32) -> Self {
        Self(v.to_be_bytes())
    }

    /// Allocate a random address inside the NetID's address block.
    ///
    /// The address carries the type prefix (`type` ones followed by a zero),
    /// then the NwkID, then random NwkAddr bits.
    pub fn random<R: Rng + ?Sized>(net_id: NetID, rng: &mut R) -> Self {
        let net_type = net_id.net_type() as u32;
        let prefix_len = net_type + 1;
        let prefix = ((1u32 << net_type) - 1) << 1;
        let nwk_id_bits = NWK_ID_BITS[net_type as usize];
        let addr_bits = 32 - prefix_len - nwk_id_bits;
        let nwk_addr = rng.gen::<u32>() & ((1u32 << addr_bits) - 1);
        Self::from_u32(
            (prefix << (32 - prefix_len)) | (net_id.nwk_id() << addr_bits) | nwk_addr,
        )
    }

    /// Whether the address belongs to the NetID's address block
    pub fn in_net(&self, net_id: NetID) -> bool {
        let net_type = net_id.net_type() as u32;
        let prefix_len = net_type + 1;
        let addr_bits = 32 - prefix_len - NWK_ID_BITS[net_type as usize];
        let expected = (((1u32 << net_type) - 1) << 1 << (32 - prefix_len))
            | (net_id.nwk_id() << addr_bits);
        let mask = !((1u32 << addr_bits) - 1);
        self.to_u32() & mask == expected
    }
}

/// LoRaWAN device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Class A: Uplink followed by two receive windows
    #[default]
    A,
    /// Class B: Scheduled receive slots (beaconing)
    B,
    /// Class C: Continuously listening except when transmitting
    C,
}

/// LoRaWAN MAC version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MacVersion {
    /// LoRaWAN 1.0
    V1_0,
    /// LoRaWAN 1.0.1
    V1_0_1,
    /// LoRaWAN 1.0.2
    V1_0_2,
    /// LoRaWAN 1.0.3
    V1_0_3,
    /// LoRaWAN 1.0.4
    V1_0_4,
    /// LoRaWAN 1.1
    V1_1,
}

impl MacVersion {
    /// FOpts are encrypted with NwkSEncKey
    pub fn encrypt_fopts(&self) -> bool {
        *self >= MacVersion::V1_1
    }

    /// Join-accept negotiates separate network session keys
    pub fn opt_neg(&self) -> bool {
        *self >= MacVersion::V1_1
    }

    /// Device sends ResetInd after ABP reset
    pub fn has_reset_ind(&self) -> bool {
        *self >= MacVersion::V1_1
    }
}

impl fmt::Display for MacVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MacVersion::V1_0 => "1.0.0",
            MacVersion::V1_0_1 => "1.0.1",
            MacVersion::V1_0_2 => "1.0.2",
            MacVersion::V1_0_3 => "1.0.3",
            MacVersion::V1_0_4 => "1.0.4",
            MacVersion::V1_1 => "1.1.0",
        };
        f.write_str(s)
    }
}

/// Regional parameters version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PhyVersion {
    /// TS001 1.0
    V1_0,
    /// TS001 1.0.1
    V1_0_1,
    /// TS001 1.0.2 revision A
    V1_0_2RevA,
    /// TS001 1.0.2 revision B
    V1_0_2RevB,
    /// TS001 1.0.3 revision A
    V1_0_3RevA,
    /// RP001 1.1 revision A
    V1_1RevA,
    /// RP001 1.1 revision B
    V1_1RevB,
}

impl PhyVersion {
    /// Join-accept may carry a CFList
    pub fn supports_cf_list(&self) -> bool {
        *self >= PhyVersion::V1_0_1
    }
}

/// Application and device identifier pair: the registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    /// Application identifier
    pub application_id: String,
    /// Device identifier, unique within the application
    pub device_id: String,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.application_id, self.device_id)
    }
}

/// End device identifiers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndDeviceIds {
    /// Application identifier
    pub application_id: String,
    /// Device identifier
    pub device_id: String,
    /// DevEUI
    pub dev_eui: Option<EUI64>,
    /// JoinEUI
    pub join_eui: Option<EUI64>,
    /// Current DevAddr
    pub dev_addr: Option<DevAddr>,
}

impl EndDeviceIds {
    /// Identifiers with only application and device id set
    pub fn new(application_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    /// Registry key
    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            application_id: self.application_id.clone(),
            device_id: self.device_id.clone(),
        }
    }
}

/// Gateway identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct GatewayIds {
    /// Gateway identifier
    pub gateway_id: String,
    /// Gateway EUI
    pub eui: Option<EUI64>,
}

impl GatewayIds {
    /// Identifiers with only the gateway id set
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            eui: None,
        }
    }
}

/// Per-device MAC settings. Unset fields fall back to the server defaults,
/// then to the band.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MacSettings {
    /// RX1 delay in seconds in effect for ABP devices
    pub rx1_delay: Option<u8>,
    /// RX1 delay the server steers the device to
    pub desired_rx1_delay: Option<u8>,
    /// RX1 data rate offset in effect for ABP devices
    pub rx1_data_rate_offset: Option<u8>,
    /// RX1 data rate offset the server steers the device to
    pub desired_rx1_data_rate_offset: Option<u8>,
    /// RX2 data rate index in effect for ABP devices
    pub rx2_data_rate_index: Option<u8>,
    /// RX2 data rate index the server steers the device to
    pub desired_rx2_data_rate_index: Option<u8>,
    /// RX2 frequency in effect for ABP devices
    pub rx2_frequency: Option<u64>,
    /// RX2 frequency the server steers the device to
    pub desired_rx2_frequency: Option<u64>,
    /// Maximum duty cycle exponent
    pub max_duty_cycle: Option<u8>,
    /// Desired maximum duty cycle exponent
    pub desired_max_duty_cycle: Option<u8>,
    /// Adaptive data rate enabled
    pub use_adr: Option<bool>,
    /// ADR margin in dB
    pub adr_margin: Option<f32>,
    /// Desired ADR_ACK_LIMIT exponent
    pub desired_adr_ack_limit_exponent: Option<u8>,
    /// Desired ADR_ACK_DELAY exponent
    pub desired_adr_ack_delay_exponent: Option<u8>,
    /// Request device status every this many uplinks
    pub status_count_periodicity: Option<u32>,
    /// Class B ping slot periodicity (0-7)
    pub ping_slot_periodicity: Option<u8>,
    /// Class B ping slot data rate index
    pub ping_slot_data_rate_index: Option<u8>,
    /// Class B ping slot frequency
    pub ping_slot_frequency: Option<u64>,
    /// Device resets frame counters without rejoining
    pub resets_f_cnt: Option<bool>,
}

impl MacSettings {
    /// Fill unset fields from `defaults`
    pub fn or(&self, defaults: &MacSettings) -> MacSettings {
        MacSettings {
            rx1_delay: self.rx1_delay.or(defaults.rx1_delay),
            desired_rx1_delay: self.desired_rx1_delay.or(defaults.desired_rx1_delay),
            rx1_data_rate_offset: self.rx1_data_rate_offset.or(defaults.rx1_data_rate_offset),
            desired_rx1_data_rate_offset: self
                .desired_rx1_data_rate_offset
                .or(defaults.desired_rx1_data_rate_offset),
            rx2_data_rate_index: self.rx2_data_rate_index.or(defaults.rx2_data_rate_index),
            desired_rx2_data_rate_index: self
                .desired_rx2_data_rate_index
                .or(defaults.desired_rx2_data_rate_index),
            rx2_frequency: self.rx2_frequency.or(defaults.rx2_frequency),
            desired_rx2_frequency: self.desired_rx2_frequency.or(defaults.desired_rx2_frequency),
            max_duty_cycle: self.max_duty_cycle.or(defaults.max_duty_cycle),
            desired_max_duty_cycle: self
                .desired_max_duty_cycle
                .or(defaults.desired_max_duty_cycle),
            use_adr: self.use_adr.or(defaults.use_adr),
            adr_margin: self.adr_margin.or(defaults.adr_margin),
            desired_adr_ack_limit_exponent: self
                .desired_adr_ack_limit_exponent
                .or(defaults.desired_adr_ack_limit_exponent),
            desired_adr_ack_delay_exponent: self
                .desired_adr_ack_delay_exponent
                .or(defaults.desired_adr_ack_delay_exponent),
            status_count_periodicity: self
                .status_count_periodicity
                .or(defaults.status_count_periodicity),
            ping_slot_periodicity: self.ping_slot_periodicity.or(defaults.ping_slot_periodicity),
            ping_slot_data_rate_index: self
                .ping_slot_data_rate_index
                .or(defaults.ping_slot_data_rate_index),
            ping_slot_frequency: self.ping_slot_frequency.or(defaults.ping_slot_frequency),
            resets_f_cnt: self.resets_f_cnt.or(defaults.resets_f_cnt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_dev_addr_in_net_id_block() {
        let net_id: NetID = "000013".parse().unwrap();
        let mut rng = StepRng::new(0xdead_beef, 0x1234_5678);
        for _ in 0..16 {
            let addr = DevAddr::random(net_id, &mut rng);
            assert!(addr.in_net(net_id), "{addr} outside {net_id}");
            assert_eq!(addr.to_u32() >> 25, 0x13);
        }
    }

    #[test]
    fn test_dev_addr_type_3_prefix() {
        let net_id = NetID::new([0x60, 0x00, 0x2a]);
        assert_eq!(net_id.net_type(), 3);
        let addr = DevAddr::random(net_id, &mut StepRng::new(0, 1));
        assert_eq!(addr.to_u32() >> 28, 0b1110);
        assert!(addr.in_net(net_id));
    }

    #[test]
    fn test_hex_roundtrip_and_wire_order() {
        let eui: EUI64 = "70B3D57ED0000001".parse().unwrap();
        assert_eq!(eui.to_string(), "70B3D57ED0000001");
        assert_eq!(eui.to_le_bytes()[0], 0x01);
        assert!("70B3".parse::<EUI64>().is_err());
    }

    #[test]
    fn test_mac_settings_fallback() {
        let defaults = MacSettings {
            desired_rx1_delay: Some(5),
            use_adr: Some(true),
            ..Default::default()
        };
        let device = MacSettings {
            use_adr: Some(false),
            ..Default::default()
        };
        let merged = device.or(&defaults);
        assert_eq!(merged.desired_rx1_delay, Some(5));
        assert_eq!(merged.use_adr, Some(false));
    }
}
