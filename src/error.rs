//! Network server errors
//!
//! Every failure the server reports, including the ones that only ever
//! travel as event payloads (duplicates, outdated frames), is a variant of
//! [`Error`]. The type is `Clone + Eq` so events can carry it by value.

use thiserror::Error;

use crate::lorawan::mac::FrameError;

/// Network server error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Uplink already seen within the deduplication lifetime, or already processed
    #[error("duplicate uplink")]
    Duplicate,

    /// No device matches the identifiers or the uplink
    #[error("device not found")]
    DeviceNotFound,

    /// PHYPayload could not be decoded
    #[error("failed to decode payload: {0}")]
    DecodePayload(String),

    /// MIC does not match any candidate session
    #[error("invalid MIC")]
    InvalidMic,

    /// Frame counter is behind the session
    #[error("outdated data: frame counter {f_cnt} is below {last_f_cnt}")]
    OutdatedData {
        /// Reconstructed frame counter of the uplink
        f_cnt: u32,
        /// Last frame counter processed for the session
        last_f_cnt: u32,
    },

    /// Join-request received for a device activated by personalization
    #[error("join-request from ABP device")]
    AbpJoinRequest,

    /// Rejoin-requests are not handled
    #[error("rejoin-request not supported")]
    RejoinRequest,

    /// MAC version not handled by the server
    #[error("unsupported LoRaWAN version `{0}`")]
    UnsupportedLoRaWANVersion(String),

    /// Application downlink payload does not fit the downlink data rate
    #[error("application downlink too long: {length} bytes, at most {max} allowed")]
    ApplicationDownlinkTooLong {
        /// FRMPayload length
        length: usize,
        /// Maximum FRMPayload length
        max: usize,
    },

    /// Application downlink encrypted for a session the device no longer uses
    #[error("application downlink for unknown session")]
    UnknownSession,

    /// Absolute downlink time is in the past or too close
    #[error("invalid absolute time")]
    InvalidAbsoluteTime,

    /// Class A receive windows already passed
    #[error("RX windows expired")]
    RxWindowsExpired,

    /// Frequency plan not known
    #[error("unknown frequency plan `{0}`")]
    UnknownFrequencyPlan(String),

    /// Band not known
    #[error("unknown band `{0}`")]
    UnknownBand(String),

    /// Data rate not defined for the band
    #[error("invalid data rate: {0}")]
    InvalidDataRate(String),

    /// Configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Record is missing a field required by the operation
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// No cluster peer for the role
    #[error("no {0} peer available")]
    PeerNotFound(String),

    /// Neither the cluster nor interoperability serves the JoinEUI
    #[error("no Join Server available")]
    NoJoinServer,

    /// Remote call failed
    #[error("rpc failed: {0}")]
    Rpc(String),

    /// Every downlink path was rejected
    #[error("downlink scheduling rejected by {attempts} peer(s), last error: {last}")]
    ScheduleRejected {
        /// Number of peer groups attempted
        attempts: usize,
        /// Last rejection received
        last: String,
    },

    /// No usable downlink path
    #[error("no downlink paths")]
    NoDownlinkPaths,

    /// Optimistic update lost the race too many times
    #[error("registry conflict after {0} attempts")]
    RegistryConflict(usize),

    /// Operation cancelled by shutdown
    #[error("operation cancelled")]
    Cancelled,

    /// Frame codec error
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Network server result
pub type Result<T, E = Error> = core::result::Result<T, E>;
