//! End device records
//!
//! [`EndDevice`] is the registry row the server reads and writes. Updates
//! name the top-level fields they touch with [`FieldPath`]s.

/// Device status reports
pub mod power;

use std::fmt;
use std::time::SystemTime;

use crate::config::device::{
    AESKey, DevAddr, EndDeviceIds, MacSettings, MacVersion, PhyVersion,
};
use crate::messages::ApplicationDownlink;
use crate::state::MacState;

use power::DeviceStatus;

/// Network session keys. The AppSKey is present only on its way to the
/// Application Server; the server never stores it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionKeys {
    /// Session key identifier assigned by the Join Server
    pub session_key_id: Vec<u8>,
    /// Forwarding network session integrity key (NwkSKey before 1.1)
    pub f_nwk_s_int_key: AESKey,
    /// Serving network session integrity key
    pub s_nwk_s_int_key: AESKey,
    /// Network session encryption key
    pub nwk_s_enc_key: AESKey,
    /// Application session key
    pub app_s_key: Option<AESKey>,
}

impl SessionKeys {
    /// Keys of a LoRaWAN 1.0.x session, where one key does every job
    pub fn legacy(session_key_id: Vec<u8>, nwk_s_key: AESKey) -> Self {
        Self {
            session_key_id,
            f_nwk_s_int_key: nwk_s_key,
            s_nwk_s_int_key: nwk_s_key,
            nwk_s_enc_key: nwk_s_key,
            app_s_key: None,
        }
    }

    /// Keys as stored by the server
    pub fn without_app_s_key(&self) -> Self {
        Self {
            app_s_key: None,
            ..self.clone()
        }
    }
}

/// Device session
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Session device address
    pub dev_addr: DevAddr,
    /// Session keys
    pub keys: SessionKeys,
    /// Last uplink frame counter processed
    pub last_f_cnt_up: u32,
    /// Last network downlink frame counter used
    pub last_n_f_cnt_down: u32,
    /// Last application downlink frame counter used
    pub last_a_f_cnt_down: u32,
    /// Last confirmed downlink frame counter, for LoRaWAN 1.1 uplink MICs
    pub last_conf_f_cnt_down: u32,
    /// When the session started
    pub started_at: SystemTime,
    /// Application downlinks waiting for a transmission opportunity
    pub queued_application_downlinks: Vec<ApplicationDownlink>,
}

impl Session {
    /// Fresh session with zeroed counters
    pub fn new(dev_addr: DevAddr, keys: SessionKeys, started_at: SystemTime) -> Self {
        Self {
            dev_addr,
            keys,
            last_f_cnt_up: 0,
            last_n_f_cnt_down: 0,
            last_a_f_cnt_down: 0,
            last_conf_f_cnt_down: 0,
            started_at,
            queued_application_downlinks: Vec::new(),
        }
    }
}

/// Top-level field of an [`EndDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldPath {
    /// EUIs and DevAddr in the identifiers
    Ids,
    /// Frequency plan
    FrequencyPlanId,
    /// MAC version
    LorawanVersion,
    /// Regional parameters version
    LorawanPhyVersion,
    /// OTAA capability
    SupportsJoin,
    /// Class B capability
    SupportsClassB,
    /// Class C capability
    SupportsClassC,
    /// Multicast group
    Multicast,
    /// Per-device MAC settings
    MacSettings,
    /// Active MAC state
    MacState,
    /// MAC state staged by a join
    PendingMacState,
    /// Active session
    Session,
    /// Session staged by a join
    PendingSession,
    /// Last DevStatusAns
    LastDevStatus,
}

impl FieldPath {
    /// Every field
    pub const ALL: [FieldPath; 14] = [
        FieldPath::Ids,
        FieldPath::FrequencyPlanId,
        FieldPath::LorawanVersion,
        FieldPath::LorawanPhyVersion,
        FieldPath::SupportsJoin,
        FieldPath::SupportsClassB,
        FieldPath::SupportsClassC,
        FieldPath::Multicast,
        FieldPath::MacSettings,
        FieldPath::MacState,
        FieldPath::PendingMacState,
        FieldPath::Session,
        FieldPath::PendingSession,
        FieldPath::LastDevStatus,
    ];

    /// Field name
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldPath::Ids => "ids",
            FieldPath::FrequencyPlanId => "frequency_plan_id",
            FieldPath::LorawanVersion => "lorawan_version",
            FieldPath::LorawanPhyVersion => "lorawan_phy_version",
            FieldPath::SupportsJoin => "supports_join",
            FieldPath::SupportsClassB => "supports_class_b",
            FieldPath::SupportsClassC => "supports_class_c",
            FieldPath::Multicast => "multicast",
            FieldPath::MacSettings => "mac_settings",
            FieldPath::MacState => "mac_state",
            FieldPath::PendingMacState => "pending_mac_state",
            FieldPath::Session => "session",
            FieldPath::PendingSession => "pending_session",
            FieldPath::LastDevStatus => "last_dev_status",
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// End device record
#[derive(Debug, Clone, PartialEq)]
pub struct EndDevice {
    /// Identifiers
    pub ids: EndDeviceIds,
    /// Frequency plan identifier
    pub frequency_plan_id: String,
    /// MAC version
    pub lorawan_version: MacVersion,
    /// Regional parameters version
    pub lorawan_phy_version: PhyVersion,
    /// Device activates over the air
    pub supports_join: bool,
    /// Device supports class B
    pub supports_class_b: bool,
    /// Device supports class C
    pub supports_class_c: bool,
    /// Device is a multicast group
    pub multicast: bool,
    /// MAC settings overriding the server defaults
    pub mac_settings: Option<MacSettings>,
    /// Active MAC state
    pub mac_state: Option<MacState>,
    /// MAC state staged by a join
    pub pending_mac_state: Option<MacState>,
    /// Active session
    pub session: Option<Session>,
    /// Session staged by a join
    pub pending_session: Option<Session>,
    /// Last DevStatusAns
    pub last_dev_status: Option<DeviceStatus>,
}

impl EndDevice {
    /// Device with no MAC state or session
    pub fn new(
        ids: EndDeviceIds,
        frequency_plan_id: impl Into<String>,
        lorawan_version: MacVersion,
        lorawan_phy_version: PhyVersion,
    ) -> Self {
        Self {
            ids,
            frequency_plan_id: frequency_plan_id.into(),
            lorawan_version,
            lorawan_phy_version,
            supports_join: false,
            supports_class_b: false,
            supports_class_c: false,
            multicast: false,
            mac_settings: None,
            mac_state: None,
            pending_mac_state: None,
            session: None,
            pending_session: None,
            last_dev_status: None,
        }
    }

    /// Copy of the device holding only the identifiers and `paths`
    pub fn masked(&self, paths: &[FieldPath]) -> EndDevice {
        let mut dev = EndDevice::new(
            EndDeviceIds::new(&self.ids.application_id, &self.ids.device_id),
            String::new(),
            self.lorawan_version,
            self.lorawan_phy_version,
        );
        dev.set_fields(self, paths);
        dev
    }

    /// Overwrite `paths` with the values in `from`
    pub fn set_fields(&mut self, from: &EndDevice, paths: &[FieldPath]) {
        for path in paths {
            match path {
                FieldPath::Ids => {
                    self.ids.dev_eui = from.ids.dev_eui;
                    self.ids.join_eui = from.ids.join_eui;
                    self.ids.dev_addr = from.ids.dev_addr;
                }
                FieldPath::FrequencyPlanId => {
                    self.frequency_plan_id = from.frequency_plan_id.clone()
                }
                FieldPath::LorawanVersion => self.lorawan_version = from.lorawan_version,
                FieldPath::LorawanPhyVersion => {
                    self.lorawan_phy_version = from.lorawan_phy_version
                }
                FieldPath::SupportsJoin => self.supports_join = from.supports_join,
                FieldPath::SupportsClassB => self.supports_class_b = from.supports_class_b,
                FieldPath::SupportsClassC => self.supports_class_c = from.supports_class_c,
                FieldPath::Multicast => self.multicast = from.multicast,
                FieldPath::MacSettings => self.mac_settings = from.mac_settings.clone(),
                FieldPath::MacState => self.mac_state = from.mac_state.clone(),
                FieldPath::PendingMacState => {
                    self.pending_mac_state = from.pending_mac_state.clone()
                }
                FieldPath::Session => self.session = from.session.clone(),
                FieldPath::PendingSession => self.pending_session = from.pending_session.clone(),
                FieldPath::LastDevStatus => self.last_dev_status = from.last_dev_status.clone(),
            }
        }
    }

    /// MAC settings with server defaults filled in
    pub fn effective_mac_settings(&self, defaults: &MacSettings) -> MacSettings {
        match &self.mac_settings {
            Some(s) => s.or(defaults),
            None => defaults.clone(),
        }
    }
}
