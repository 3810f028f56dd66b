//! Regional parameters and frequency plans
//!
//! Bands carry the regional tables (data rates, default channels, RX1
//! mapping, RX2 defaults). Frequency plans narrow a band to the channels a
//! network actually operates.

use crate::config::device::PhyVersion;
use crate::error::{Error, Result};

/// Data rate modulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataRate {
    /// LoRa modulation
    Lora {
        /// Spreading factor (7-12)
        spreading_factor: u8,
        /// Bandwidth in Hz
        bandwidth: u32,
    },
    /// FSK modulation
    Fsk {
        /// Bit rate in bit/s
        bit_rate: u32,
    },
}

impl DataRate {
    const fn lora(spreading_factor: u8, bandwidth: u32) -> Self {
        DataRate::Lora {
            spreading_factor,
            bandwidth,
        }
    }

    /// Lowest SNR in dB at which the modulation still demodulates
    pub fn demodulation_floor(&self) -> f32 {
        match self {
            DataRate::Lora {
                spreading_factor, ..
            } => -5.0 - 2.5 * (*spreading_factor as f32 - 6.0),
            DataRate::Fsk { .. } => 0.0,
        }
    }
}

/// Band data rate entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandDataRate {
    /// Modulation
    pub rate: DataRate,
    /// Maximum FRMPayload size in bytes
    pub max_payload: usize,
}

const fn dr(rate: DataRate, max_payload: usize) -> Option<BandDataRate> {
    Some(BandDataRate { rate, max_payload })
}

/// Channel of a device channel plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    /// Uplink frequency in Hz
    pub uplink_frequency: u64,
    /// RX1 downlink frequency in Hz
    pub downlink_frequency: u64,
    /// Minimum uplink data rate index
    pub min_data_rate_index: u8,
    /// Maximum uplink data rate index
    pub max_data_rate_index: u8,
    /// Channel is enabled for uplink
    pub enable_uplink: bool,
}

impl Channel {
    fn symmetric(frequency: u64, min: u8, max: u8) -> Self {
        Self {
            uplink_frequency: frequency,
            downlink_frequency: frequency,
            min_data_rate_index: min,
            max_data_rate_index: max,
            enable_uplink: true,
        }
    }
}

/// Join-accept channel list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CFList {
    /// Up to five additional channel frequencies in Hz, 0 for unused slots
    Frequencies([u64; 5]),
    /// Channel enablement masks, 16 channels per entry
    ChannelMasks(Vec<u16>),
}

/// Regional band parameters
pub trait Band: Send + Sync {
    /// Band identifier
    fn id(&self) -> &'static str;

    /// Data rate table
    fn data_rates(&self) -> &[Option<BandDataRate>; 16];

    /// Channels every device starts with
    fn default_channels(&self) -> Vec<Channel>;

    /// RX1 data rate index for an uplink data rate index and RX1 offset
    fn rx1_data_rate(&self, up_index: u8, offset: u8) -> Result<u8>;

    /// Device channel index used for RX1 after an uplink on `up_channel`
    fn rx1_channel(&self, up_channel: u8) -> u8;

    /// Default RX2 frequency in Hz
    fn default_rx2_frequency(&self) -> u64;

    /// Default RX2 data rate index
    fn default_rx2_data_rate_index(&self) -> u8;

    /// Default class B ping slot frequency in Hz
    fn default_ping_slot_frequency(&self) -> u64;

    /// Default class B ping slot data rate index
    fn default_ping_slot_data_rate_index(&self) -> u8;

    /// Default beacon frequency in Hz
    fn default_beacon_frequency(&self) -> u64;

    /// Default maximum EIRP in dBm
    fn default_max_eirp(&self) -> f32;

    /// Highest TX power index
    fn max_tx_power_index(&self) -> u8;

    /// Highest data rate index ADR may assign
    fn max_adr_data_rate_index(&self) -> u8;

    /// Data rate indices devices may transmit with
    fn uplink_data_rate_indices(&self) -> core::ops::RangeInclusive<u8>;

    /// Default ADR_ACK_LIMIT exponent (2^n uplinks)
    fn adr_ack_limit_exponent(&self) -> u8 {
        6
    }

    /// Default ADR_ACK_DELAY exponent (2^n uplinks)
    fn adr_ack_delay_exponent(&self) -> u8 {
        5
    }

    /// Data rate at an index
    fn data_rate(&self, index: u8) -> Result<BandDataRate> {
        self.data_rates()
            .get(index as usize)
            .copied()
            .flatten()
            .ok_or_else(|| Error::InvalidDataRate(format!("DR{index} not defined in {}", self.id())))
    }

    /// Index of an uplink data rate
    fn uplink_data_rate_index(&self, rate: &DataRate) -> Result<u8> {
        self.uplink_data_rate_indices()
            .find(|i| matches!(self.data_rates()[*i as usize], Some(d) if d.rate == *rate))
            .ok_or_else(|| Error::InvalidDataRate(format!("{rate:?} not an uplink rate in {}", self.id())))
    }

    /// Build the CFList describing `channels` for a join-accept
    fn cf_list(&self, channels: &[Channel], phy: PhyVersion) -> Option<CFList>;

    /// Apply a join-accept CFList to a channel plan
    fn apply_cf_list(&self, cf_list: &CFList, channels: &mut Vec<Channel>);
}

/// EU 863-870 MHz band
#[derive(Debug, Default)]
pub struct EU868;

const EU868_DATA_RATES: [Option<BandDataRate>; 16] = [
    dr(DataRate::lora(12, 125_000), 51),
    dr(DataRate::lora(11, 125_000), 51),
    dr(DataRate::lora(10, 125_000), 51),
    dr(DataRate::lora(9, 125_000), 115),
    dr(DataRate::lora(8, 125_000), 222),
    dr(DataRate::lora(7, 125_000), 222),
    dr(DataRate::lora(7, 250_000), 222),
    dr(DataRate::Fsk { bit_rate: 50_000 }, 222),
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
];

impl Band for EU868 {
    fn id(&self) -> &'static str {
        "EU_863_870"
    }

    fn data_rates(&self) -> &[Option<BandDataRate>; 16] {
        &EU868_DATA_RATES
    }

    fn default_channels(&self) -> Vec<Channel> {
        [868_100_000, 868_300_000, 868_500_000]
            .into_iter()
            .map(|f| Channel::symmetric(f, 0, 5))
            .collect()
    }

    fn rx1_data_rate(&self, up_index: u8, offset: u8) -> Result<u8> {
        if up_index > 7 || offset > 5 {
            return Err(Error::InvalidDataRate(format!(
                "no RX1 data rate for DR{up_index} offset {offset}"
            )));
        }
        Ok(up_index.saturating_sub(offset))
    }

    fn rx1_channel(&self, up_channel: u8) -> u8 {
        up_channel
    }

    fn default_rx2_frequency(&self) -> u64 {
        869_525_000
    }

    fn default_rx2_data_rate_index(&self) -> u8 {
        0
    }

    fn default_ping_slot_frequency(&self) -> u64 {
        869_525_000
    }

    fn default_ping_slot_data_rate_index(&self) -> u8 {
        3
    }

    fn default_beacon_frequency(&self) -> u64 {
        869_525_000
    }

    fn default_max_eirp(&self) -> f32 {
        16.0
    }

    fn max_tx_power_index(&self) -> u8 {
        7
    }

    fn max_adr_data_rate_index(&self) -> u8 {
        5
    }

    fn uplink_data_rate_indices(&self) -> core::ops::RangeInclusive<u8> {
        0..=7
    }

    fn cf_list(&self, channels: &[Channel], phy: PhyVersion) -> Option<CFList> {
        if !phy.supports_cf_list() || channels.len() <= 3 {
            return None;
        }
        let mut freqs = [0u64; 5];
        for (slot, ch) in freqs.iter_mut().zip(channels.iter().skip(3)) {
            *slot = ch.uplink_frequency;
        }
        Some(CFList::Frequencies(freqs))
    }

    fn apply_cf_list(&self, cf_list: &CFList, channels: &mut Vec<Channel>) {
        if let CFList::Frequencies(freqs) = cf_list {
            channels.truncate(3);
            channels.extend(
                freqs
                    .iter()
                    .filter(|f| **f != 0)
                    .map(|f| Channel::symmetric(*f, 0, 5)),
            );
        }
    }
}

/// US 902-928 MHz band
#[derive(Debug, Default)]
pub struct US915;

const US915_DATA_RATES: [Option<BandDataRate>; 16] = [
    dr(DataRate::lora(10, 125_000), 11),
    dr(DataRate::lora(9, 125_000), 53),
    dr(DataRate::lora(8, 125_000), 125),
    dr(DataRate::lora(7, 125_000), 242),
    dr(DataRate::lora(8, 500_000), 242),
    None,
    None,
    None,
    dr(DataRate::lora(12, 500_000), 53),
    dr(DataRate::lora(11, 500_000), 129),
    dr(DataRate::lora(10, 500_000), 242),
    dr(DataRate::lora(9, 500_000), 242),
    dr(DataRate::lora(8, 500_000), 242),
    dr(DataRate::lora(7, 500_000), 242),
    None,
    None,
];

/// RX1 data rate per uplink DR (rows) and offset (columns)
const US915_RX1_DATA_RATES: [[u8; 4]; 5] = [
    [10, 9, 8, 8],
    [11, 10, 9, 8],
    [12, 11, 10, 9],
    [13, 12, 11, 10],
    [13, 13, 12, 11],
];

impl US915 {
    fn downlink_frequency(channel: u8) -> u64 {
        923_300_000 + (channel as u64 % 8) * 600_000
    }
}

impl Band for US915 {
    fn id(&self) -> &'static str {
        "US_902_928"
    }

    fn data_rates(&self) -> &[Option<BandDataRate>; 16] {
        &US915_DATA_RATES
    }

    fn default_channels(&self) -> Vec<Channel> {
        let narrow = (0..64u8).map(|i| Channel {
            uplink_frequency: 902_300_000 + i as u64 * 200_000,
            downlink_frequency: Self::downlink_frequency(i),
            min_data_rate_index: 0,
            max_data_rate_index: 3,
            enable_uplink: true,
        });
        let wide = (0..8u8).map(|i| Channel {
            uplink_frequency: 903_000_000 + i as u64 * 1_600_000,
            downlink_frequency: Self::downlink_frequency(i),
            min_data_rate_index: 4,
            max_data_rate_index: 4,
            enable_uplink: true,
        });
        narrow.chain(wide).collect()
    }

    fn rx1_data_rate(&self, up_index: u8, offset: u8) -> Result<u8> {
        US915_RX1_DATA_RATES
            .get(up_index as usize)
            .and_then(|row| row.get(offset as usize))
            .copied()
            .ok_or_else(|| {
                Error::InvalidDataRate(format!("no RX1 data rate for DR{up_index} offset {offset}"))
            })
    }

    fn rx1_channel(&self, up_channel: u8) -> u8 {
        up_channel % 8
    }

    fn default_rx2_frequency(&self) -> u64 {
        923_300_000
    }

    fn default_rx2_data_rate_index(&self) -> u8 {
        8
    }

    fn default_ping_slot_frequency(&self) -> u64 {
        923_300_000
    }

    fn default_ping_slot_data_rate_index(&self) -> u8 {
        8
    }

    fn default_beacon_frequency(&self) -> u64 {
        923_300_000
    }

    fn default_max_eirp(&self) -> f32 {
        30.0
    }

    fn max_tx_power_index(&self) -> u8 {
        14
    }

    fn max_adr_data_rate_index(&self) -> u8 {
        3
    }

    fn uplink_data_rate_indices(&self) -> core::ops::RangeInclusive<u8> {
        0..=4
    }

    fn cf_list(&self, channels: &[Channel], phy: PhyVersion) -> Option<CFList> {
        if phy < PhyVersion::V1_0_3RevA {
            return None;
        }
        let mut masks = vec![0u16; 5];
        for (i, ch) in channels.iter().enumerate().take(72) {
            if ch.enable_uplink {
                masks[i / 16] |= 1 << (i % 16);
            }
        }
        Some(CFList::ChannelMasks(masks))
    }

    fn apply_cf_list(&self, cf_list: &CFList, channels: &mut Vec<Channel>) {
        if let CFList::ChannelMasks(masks) = cf_list {
            for (i, ch) in channels.iter_mut().enumerate() {
                let mask = masks.get(i / 16).copied().unwrap_or_default();
                ch.enable_uplink = mask & (1 << (i % 16)) != 0;
            }
        }
    }
}

static EU868_BAND: EU868 = EU868;
static US915_BAND: US915 = US915;

/// Look up a band by identifier
pub fn band(id: &str) -> Result<&'static dyn Band> {
    match id {
        "EU_863_870" => Ok(&EU868_BAND),
        "US_902_928" => Ok(&US915_BAND),
        _ => Err(Error::UnknownBand(id.to_string())),
    }
}

/// Network frequency plan
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyPlan {
    /// Plan identifier
    pub id: &'static str,
    /// Band the plan operates in
    pub band_id: &'static str,
    /// Channels devices should use
    pub channels: Vec<Channel>,
    /// RX2 frequency override
    pub rx2_frequency: Option<u64>,
    /// RX2 data rate index override
    pub rx2_data_rate_index: Option<u8>,
    /// Ping slot frequency override
    pub ping_slot_frequency: Option<u64>,
    /// Maximum EIRP override
    pub max_eirp: Option<f32>,
}

impl FrequencyPlan {
    /// Band of the plan
    pub fn band(&self) -> Result<&'static dyn Band> {
        band(self.band_id)
    }
}

fn eu868_plan(id: &'static str, rx2_data_rate_index: Option<u8>) -> FrequencyPlan {
    let channels = [
        868_100_000,
        868_300_000,
        868_500_000,
        867_100_000,
        867_300_000,
        867_500_000,
        867_700_000,
        867_900_000,
    ]
    .into_iter()
    .map(|f| Channel::symmetric(f, 0, 5))
    .collect();
    FrequencyPlan {
        id,
        band_id: "EU_863_870",
        channels,
        rx2_frequency: Some(869_525_000),
        rx2_data_rate_index,
        ping_slot_frequency: Some(869_525_000),
        max_eirp: Some(16.0),
    }
}

/// Look up a frequency plan by identifier
pub fn frequency_plan(id: &str) -> Result<FrequencyPlan> {
    match id {
        "EU_863_870" => Ok(eu868_plan("EU_863_870", None)),
        "EU_863_870_TTN" => Ok(eu868_plan("EU_863_870_TTN", Some(3))),
        "US_902_928_FSB_2" => {
            let mut channels = US915.default_channels();
            for (i, ch) in channels.iter_mut().enumerate() {
                ch.enable_uplink = (8..16).contains(&i) || i == 65;
            }
            Ok(FrequencyPlan {
                id: "US_902_928_FSB_2",
                band_id: "US_902_928",
                channels,
                rx2_frequency: None,
                rx2_data_rate_index: None,
                ping_slot_frequency: None,
                max_eirp: None,
            })
        }
        _ => Err(Error::UnknownFrequencyPlan(id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eu868_cf_list_roundtrip() {
        let fp = frequency_plan("EU_863_870").unwrap();
        let band = fp.band().unwrap();
        let cf = band.cf_list(&fp.channels, PhyVersion::V1_0_3RevA).unwrap();
        let mut channels = band.default_channels();
        band.apply_cf_list(&cf, &mut channels);
        assert_eq!(channels, fp.channels);
    }

    #[test]
    fn test_us915_sub_band_masks() {
        let fp = frequency_plan("US_902_928_FSB_2").unwrap();
        let band = fp.band().unwrap();
        let cf = band.cf_list(&fp.channels, PhyVersion::V1_0_3RevA).unwrap();
        assert_eq!(cf, CFList::ChannelMasks(vec![0xff00, 0, 0, 0, 0x0002]));
        assert_eq!(band.cf_list(&fp.channels, PhyVersion::V1_0_2RevB), None);
    }

    #[test]
    fn test_unknown_plan() {
        assert!(matches!(
            frequency_plan("MARS_1"),
            Err(Error::UnknownFrequencyPlan(_))
        ));
    }
}
