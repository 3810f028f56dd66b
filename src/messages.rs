//! Messages exchanged with gateways, Join Servers and Application Servers

use std::time::{Duration, SystemTime};

use crate::config::device::{DevAddr, DeviceClass, EndDeviceIds, GatewayIds, MacVersion, NetID};
use crate::device::SessionKeys;
use crate::error::{Error, Result};
use crate::lorawan::mac::{DlSettings, FrameError, Message};
use crate::lorawan::region::{CFList, DataRate};

/// Downlink transmission priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TxSchedulePriority {
    /// Lowest
    Lowest,
    /// Low
    Low,
    /// Below normal
    BelowNormal,
    /// Normal
    #[default]
    Normal,
    /// Above normal
    AboveNormal,
    /// High
    High,
    /// Highest, reserved for join-accepts
    Highest,
}

/// Whether a gateway may be used for downlink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownlinkPathConstraint {
    /// No constraint
    #[default]
    None,
    /// Use only when no other gateway is available
    PreferOther,
    /// Never use for downlink
    Never,
}

/// Reception of an uplink by one gateway antenna
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RxMetadata {
    /// Receiving gateway
    pub gateway_ids: GatewayIds,
    /// Antenna index
    pub antenna_index: u32,
    /// Gateway concentrator timestamp in microseconds
    pub timestamp: u32,
    /// Signal strength in dBm
    pub rssi: f32,
    /// Channel signal strength in dBm
    pub channel_rssi: f32,
    /// Signal-to-noise ratio in dB
    pub snr: f32,
    /// Opaque token the Gateway Server needs to answer through this antenna
    pub uplink_token: Vec<u8>,
    /// Downlink restriction of the gateway
    pub downlink_path_constraint: DownlinkPathConstraint,
}

/// Radio settings of an uplink
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxSettings {
    /// Data rate
    pub data_rate: DataRate,
    /// Frequency in Hz
    pub frequency: u64,
}

/// Uplink as received from the Gateway Server
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkMessage {
    /// PHYPayload
    pub raw_payload: Vec<u8>,
    /// Decoded PHYPayload, filled on first use
    pub payload: Option<Message>,
    /// Radio settings
    pub settings: TxSettings,
    /// One entry per receiving gateway antenna
    pub rx_metadata: Vec<RxMetadata>,
    /// When the Gateway Server received the uplink
    pub received_at: SystemTime,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
    /// Index of the uplink channel in the device channel plan
    pub device_channel_index: u8,
    /// Uplink data rate index
    pub data_rate_index: u8,
}

impl UplinkMessage {
    /// New uplink with nothing decoded yet
    pub fn new(
        raw_payload: Vec<u8>,
        settings: TxSettings,
        rx_metadata: Vec<RxMetadata>,
        received_at: SystemTime,
    ) -> Self {
        Self {
            raw_payload,
            payload: None,
            settings,
            rx_metadata,
            received_at,
            correlation_ids: Vec::new(),
            device_channel_index: 0,
            data_rate_index: 0,
        }
    }

    /// Decoded payload, decoding it on first use
    pub fn decoded(&mut self) -> Result<&Message> {
        if self.payload.is_none() {
            let msg = Message::decode(&self.raw_payload).map_err(|e| match e {
                FrameError::UnsupportedMajor(major) => Error::UnsupportedLoRaWANVersion(format!("major {major}")),
                e => Error::DecodePayload(e.to_string()),
            })?;
            self.payload = Some(msg);
        }
        self.payload
            .as_ref()
            .ok_or_else(|| Error::DecodePayload("payload missing".into()))
    }
}

/// Gateway antenna
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GatewayAntennaIds {
    /// Gateway
    pub gateway_ids: GatewayIds,
    /// Antenna index
    pub antenna_index: u32,
}

/// Route to a device through one gateway antenna
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownlinkPath {
    /// Answer through the antenna that received an uplink
    UplinkToken {
        /// Gateway that received the uplink
        gateway_ids: GatewayIds,
        /// Token from the uplink metadata
        token: Vec<u8>,
    },
    /// Transmit through a configured antenna
    Fixed(GatewayAntennaIds),
}

impl DownlinkPath {
    /// Gateway of the path
    pub fn gateway_ids(&self) -> &GatewayIds {
        match self {
            DownlinkPath::UplinkToken { gateway_ids, .. } => gateway_ids,
            DownlinkPath::Fixed(ids) => &ids.gateway_ids,
        }
    }
}

/// Downlink transmission request for the Gateway Server
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TxRequest {
    /// Device class the downlink targets
    pub class: DeviceClass,
    /// Paths the Gateway Server may use
    pub downlink_paths: Vec<DownlinkPath>,
    /// RX1 delay in seconds
    pub rx1_delay: Option<u8>,
    /// RX1 data rate
    pub rx1_data_rate: Option<DataRate>,
    /// RX1 frequency in Hz
    pub rx1_frequency: u64,
    /// RX2 data rate
    pub rx2_data_rate: Option<DataRate>,
    /// RX2 frequency in Hz
    pub rx2_frequency: u64,
    /// Priority
    pub priority: TxSchedulePriority,
    /// Transmit at this time instead of in a receive window
    pub absolute_time: Option<SystemTime>,
    /// Frequency plan of the device
    pub frequency_plan_id: String,
}

/// Downlink handed to the Gateway Server
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkMessage {
    /// PHYPayload
    pub raw_payload: Vec<u8>,
    /// Decoded PHYPayload of data downlinks
    pub payload: Option<Message>,
    /// Target device
    pub end_device_ids: Option<EndDeviceIds>,
    /// Transmission request
    pub settings: TxRequest,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
    /// Session the downlink belongs to
    pub session_key_id: Option<Vec<u8>>,
}

/// Gateway Server answer to a schedule request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleDownlinkResponse {
    /// Time until transmission
    pub delay: Duration,
    /// RX1 was used
    pub rx1: bool,
    /// RX2 was used
    pub rx2: bool,
}

/// Join-request forwarded to a Join Server
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    /// PHYPayload
    pub raw_payload: Vec<u8>,
    /// Decoded PHYPayload
    pub payload: Message,
    /// Address allocated for the device
    pub dev_addr: DevAddr,
    /// MAC version the device will use
    pub selected_mac_version: MacVersion,
    /// Network identifier
    pub net_id: NetID,
    /// Join-accept DLSettings
    pub downlink_settings: DlSettings,
    /// Join-accept RxDelay in seconds
    pub rx_delay: u8,
    /// Join-accept CFList
    pub cf_list: Option<CFList>,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
}

/// Join Server answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinResponse {
    /// Encrypted join-accept PHYPayload
    pub raw_payload: Vec<u8>,
    /// Session keys, including the AppSKey for the Application Server
    pub session_keys: SessionKeys,
    /// Session lifetime
    pub lifetime: Option<Duration>,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
}

impl JoinResponse {
    /// Response with the keys removed, for events
    pub fn without_keys(&self) -> Self {
        Self {
            session_keys: SessionKeys {
                session_key_id: self.session_keys.session_key_id.clone(),
                ..Default::default()
            },
            ..self.clone()
        }
    }
}

/// Class B and C transmission constraints of an application downlink
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassBC {
    /// Gateways to use instead of the uplink paths
    pub gateways: Vec<GatewayAntennaIds>,
    /// Transmit at exactly this time
    pub absolute_time: Option<SystemTime>,
}

/// Downlink queued by an application
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplicationDownlink {
    /// Session the payload is encrypted for
    pub session_key_id: Vec<u8>,
    /// Port (1-223)
    pub f_port: u8,
    /// Application frame counter the payload is encrypted with
    pub f_cnt: u32,
    /// Encrypted FRMPayload
    pub frm_payload: Vec<u8>,
    /// Request an acknowledgment
    pub confirmed: bool,
    /// Priority
    pub priority: TxSchedulePriority,
    /// Class B/C constraints
    pub class_b_c: Option<ClassBC>,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
}

/// Data uplink forwarded to the Application Server
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationUplink {
    /// Session the payload is encrypted for
    pub session_key_id: Vec<u8>,
    /// Port
    pub f_port: Option<u8>,
    /// Uplink frame counter
    pub f_cnt: u32,
    /// Encrypted FRMPayload
    pub frm_payload: Vec<u8>,
    /// Confirmed uplink
    pub confirmed: bool,
    /// Metadata of every gateway that received the uplink
    pub rx_metadata: Vec<RxMetadata>,
    /// Radio settings
    pub settings: TxSettings,
    /// When the uplink was received
    pub received_at: SystemTime,
}

/// Join-accept notification for the Application Server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationJoinAccept {
    /// Session key identifier
    pub session_key_id: Vec<u8>,
    /// Application session key
    pub app_s_key: Option<crate::config::device::AESKey>,
    /// When the join-request was received
    pub received_at: SystemTime,
}

/// Payload of an [`ApplicationUp`]
#[derive(Debug, Clone, PartialEq)]
pub enum ApplicationUpKind {
    /// Data uplink
    Uplink(ApplicationUplink),
    /// Device joined
    JoinAccept(ApplicationJoinAccept),
    /// Confirmed downlink acknowledged
    DownlinkAck(ApplicationDownlink),
    /// Confirmed downlink not acknowledged
    DownlinkNack(ApplicationDownlink),
    /// Downlink dropped
    DownlinkFailed {
        /// The dropped downlink
        downlink: ApplicationDownlink,
        /// Why it was dropped
        error: Error,
    },
}

/// Message for the Application Server
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationUp {
    /// Device
    pub end_device_ids: EndDeviceIds,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
    /// Payload
    pub up: ApplicationUpKind,
}

/// Batch sent to an Application Server
#[derive(Debug, Clone, PartialEq)]
pub struct NsAsHandleUplinkRequest {
    /// Messages, all for one application
    pub application_ups: Vec<ApplicationUp>,
}

/// Outcome of a transmission reported by the Gateway Server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxAckResult {
    /// Transmitted
    Success,
    /// Too late to transmit
    TooLate,
    /// Too early to transmit
    TooEarly,
    /// Collided with another transmission
    Collision,
    /// Any other failure
    Failed(String),
}

/// Transmission acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxAcknowledgment {
    /// Correlation identifiers of the downlink
    pub correlation_ids: Vec<String>,
    /// Outcome
    pub result: TxAckResult,
}

/// Append the identifiers of `extra` not already in `ids`
pub fn merge_correlation_ids(ids: &mut Vec<String>, extra: &[String]) {
    for id in extra {
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }
}

/// New correlation identifier with a component prefix
pub fn new_correlation_id(prefix: &str) -> String {
    format!("ns:{prefix}:{}", uuid::Uuid::new_v4())
}
