//! Uplink deduplication
//!
//! Gateways in range of a device all forward its uplinks. Observations of
//! one frame share a [`Fingerprint`]. The first observation opens a
//! deduplication window; observations inside it add their metadata to the
//! first one. After the window the fingerprint stays known for a cooldown,
//! during which late copies are dropped without merging. After that the
//! fingerprint is forgotten and a copy counts as a new uplink.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::device::{DevAddr, DevNonce, EUI64};
use crate::crypto::MIC_SIZE;
use crate::error::Result;
use crate::messages::RxMetadata;

/// Identity of a frame, independent of the receiving gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    /// Data uplink fingerprint
    pub fn data(dev_addr: DevAddr, f_cnt: u32, mic: [u8; MIC_SIZE]) -> Self {
        let mut b = Vec::with_capacity(1 + 4 + 4 + MIC_SIZE);
        b.push(b'd');
        b.extend_from_slice(dev_addr.as_bytes());
        b.extend_from_slice(&f_cnt.to_be_bytes());
        b.extend_from_slice(&mic);
        Self(b)
    }

    /// Join-request fingerprint
    pub fn join(join_eui: EUI64, dev_eui: EUI64, dev_nonce: DevNonce, mic: [u8; MIC_SIZE]) -> Self {
        let mut b = Vec::with_capacity(1 + 8 + 8 + 2 + MIC_SIZE);
        b.push(b'j');
        b.extend_from_slice(join_eui.as_bytes());
        b.extend_from_slice(dev_eui.as_bytes());
        b.extend_from_slice(dev_nonce.as_bytes());
        b.extend_from_slice(&mic);
        Self(b)
    }
}

/// Deduplication store
#[async_trait]
pub trait UplinkDeduplicator: Send + Sync {
    /// Record an observation of `fingerprint`.
    ///
    /// Returns true for the first observation, which owns the window.
    /// Observations within `window` of the first are merged; the
    /// fingerprint is remembered for `lifetime`.
    async fn deduplicate_uplink(
        &self,
        fingerprint: &Fingerprint,
        rx_metadata: &[RxMetadata],
        window: Duration,
        lifetime: Duration,
    ) -> Result<bool>;

    /// Metadata merged for `fingerprint` so far
    async fn accumulated_metadata(&self, fingerprint: &Fingerprint) -> Result<Vec<RxMetadata>>;
}

struct Entry {
    window_ends: Instant,
    expires: Instant,
    rx_metadata: Vec<RxMetadata>,
}

/// Deduplicator kept in memory
#[derive(Default)]
pub struct InMemoryUplinkDeduplicator {
    entries: Mutex<HashMap<Fingerprint, Entry>>,
}

impl InMemoryUplinkDeduplicator {
    /// Empty deduplicator
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UplinkDeduplicator for InMemoryUplinkDeduplicator {
    async fn deduplicate_uplink(
        &self,
        fingerprint: &Fingerprint,
        rx_metadata: &[RxMetadata],
        window: Duration,
        lifetime: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.expires > now);
        if let Some(entry) = entries.get_mut(fingerprint) {
            if now < entry.window_ends {
                entry.rx_metadata.extend_from_slice(rx_metadata);
            }
            return Ok(false);
        }
        entries.insert(
            fingerprint.clone(),
            Entry {
                window_ends: now + window,
                expires: now + lifetime.max(window),
                rx_metadata: rx_metadata.to_vec(),
            },
        );
        Ok(true)
    }

    async fn accumulated_metadata(&self, fingerprint: &Fingerprint) -> Result<Vec<RxMetadata>> {
        Ok(self
            .entries
            .lock()
            .get(fingerprint)
            .map(|e| e.rx_metadata.clone())
            .unwrap_or_default())
    }
}
