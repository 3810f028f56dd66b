//! LoRaWAN protocol layer
//!
//! This module contains the protocol pieces the network server speaks:
//! - PHYPayload codec
//! - MAC commands
//! - Receive window timing
//! - Regional parameters and frequency plans

/// MAC command handling
pub mod commands;

/// PHYPayload codec
pub mod mac;

/// Receive window timing and frame counters
pub mod phy;

/// Regional parameters and configurations
pub mod region;

pub use mac::{FrameError, MType, Message, Payload};
pub use phy::TimingParams;
pub use region::{band, frequency_plan, Band, Channel, DataRate, FrequencyPlan};
