//! Device and network server configuration
//!
//! This module contains types for configuring the network server and the
//! devices it serves. It includes:
//! - Identifiers and keys (DevEUI, JoinEUI, DevAddr, NetID)
//! - LoRaWAN versions and device classes
//! - Per-device MAC settings
//! - Server configuration loaded from TOML

/// Device identifiers, versions and MAC settings
pub mod device;

/// Server configuration
pub mod server;

pub use device::{
    AESKey, DevAddr, DevNonce, DeviceClass, DeviceKey, EndDeviceIds, GatewayIds, MacSettings,
    MacVersion, NetID, PhyVersion, EUI64,
};
pub use server::{Config, QueueConfig};
