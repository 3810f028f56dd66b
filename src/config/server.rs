//! Network server configuration
//!
//! Loaded from TOML. Every field has a default, so an empty document is a
//! valid configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::device::{MacSettings, NetID};
use crate::error::{Error, Result};

/// Network server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// NetID of this network, used for DevAddr allocation and join routing
    pub net_id: NetID,
    /// How long observations of one uplink are merged before processing
    pub deduplication_window_ms: u64,
    /// How long after the deduplication window late copies are still dropped
    pub cooldown_window_ms: u64,
    /// Application uplink queue consumers
    pub application_uplink_queue: QueueConfig,
    /// Downlink task queue consumers
    pub downlink_task_queue: QueueConfig,
    /// MAC settings applied where a device does not set its own
    pub default_mac_settings: MacSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            net_id: NetID::new([0x00, 0x00, 0x13]),
            deduplication_window_ms: 200,
            cooldown_window_ms: 1_000,
            application_uplink_queue: QueueConfig::default(),
            downlink_task_queue: QueueConfig::default(),
            default_mac_settings: MacSettings {
                desired_rx1_delay: Some(5),
                use_adr: Some(true),
                adr_margin: Some(15.0),
                status_count_periodicity: Some(200),
                ..Default::default()
            },
        }
    }
}

/// Queue consumer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of concurrent consumers
    pub num_consumers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { num_consumers: 1 }
    }
}

impl Config {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.deduplication_window_ms == 0 {
            return Err(Error::InvalidConfig(
                "deduplication_window_ms must be positive".into(),
            ));
        }
        if self.application_uplink_queue.num_consumers == 0
            || self.downlink_task_queue.num_consumers == 0
        {
            return Err(Error::InvalidConfig("num_consumers must be positive".into()));
        }
        if let Some(delay) = self.default_mac_settings.desired_rx1_delay {
            if !(1..=15).contains(&delay) {
                return Err(Error::InvalidConfig(format!("RX1 delay {delay} out of range")));
            }
        }
        Ok(())
    }

    /// Deduplication window
    pub fn deduplication_window(&self) -> Duration {
        Duration::from_millis(self.deduplication_window_ms)
    }

    /// Cooldown window
    pub fn cooldown_window(&self) -> Duration {
        Duration::from_millis(self.cooldown_window_ms)
    }
}
