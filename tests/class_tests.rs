use std::time::{Duration, SystemTime};

use lorawan_ns::class::class_b::beacon::{BEACON_INTERVAL, BEACON_RESERVED, PING_SLOT_LEN};
use lorawan_ns::class::class_b::ping_slot::{next_ping_slot, PingSlotConfig};
use lorawan_ns::class::class_b::timing::{from_gps_time, gps_time};
use lorawan_ns::class::{check_absolute_time, class_a, class_b, class_c, RxWindows, INFRASTRUCTURE_DELAY};
use lorawan_ns::config::device::{DevAddr, DeviceClass, EndDeviceIds, MacSettings, MacVersion, PhyVersion};
use lorawan_ns::device::EndDevice;
use lorawan_ns::lorawan::phy::TimingParams;
use lorawan_ns::lorawan::region::{frequency_plan, Band};
use lorawan_ns::messages::{TxSchedulePriority, TxSettings, UplinkMessage};
use lorawan_ns::state::{default_class, new_mac_state, MacState};
use lorawan_ns::Error;

const ADDR: DevAddr = DevAddr::new([0x26, 0x01, 0x1b, 0xda]);

fn device(version: MacVersion) -> EndDevice {
    EndDevice::new(
        EndDeviceIds::new("app", "dev"),
        "EU_863_870",
        version,
        PhyVersion::V1_0_3RevA,
    )
}

fn eu868_state() -> (MacState, &'static dyn Band) {
    let fp = frequency_plan("EU_863_870").unwrap();
    let state = new_mac_state(&device(MacVersion::V1_0_3), &fp, &MacSettings::default()).unwrap();
    (state, fp.band().unwrap())
}

fn uplink_at(band: &dyn Band, data_rate_index: u8, channel: u8) -> UplinkMessage {
    let mut up = UplinkMessage::new(
        vec![],
        TxSettings {
            data_rate: band.data_rate(data_rate_index).unwrap().rate,
            frequency: 868_300_000,
        },
        vec![],
        SystemTime::now(),
    );
    up.data_rate_index = data_rate_index;
    up.device_channel_index = channel;
    up
}

#[test]
fn test_class_a_windows_follow_rx1_delay() {
    let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let data = TimingParams::data(1);
    assert_eq!(RxWindows::at(t, data, t), RxWindows::Both);
    assert_eq!(RxWindows::at(t, data, t + Duration::from_millis(900)), RxWindows::Rx2Only);
    assert_eq!(RxWindows::at(t, data, t + Duration::from_millis(1_900)), RxWindows::Expired);
    assert!(!RxWindows::Expired.is_open());

    let join = TimingParams::join();
    assert_eq!(RxWindows::at(t, join, t + Duration::from_millis(4_700)), RxWindows::Both);
    assert_eq!(RxWindows::at(t, join, t + Duration::from_secs(5)), RxWindows::Rx2Only);
    assert!(RxWindows::at(t, join, t + Duration::from_millis(5_700)).is_open());

    assert_eq!(TimingParams::data(0), TimingParams::data(1));
    assert_eq!(TimingParams::data(5).rx2_delay, Duration::from_secs(6));
}

#[test]
fn test_class_a_answers_on_uplink_channel() {
    let (state, band) = eu868_state();
    let up = uplink_at(band, 5, 1);
    let tx = class_a::tx_request(band, &state.current_parameters, &up, 1, TxSchedulePriority::High).unwrap();

    assert_eq!(tx.class, DeviceClass::A);
    assert_eq!(tx.rx1_delay, Some(1));
    assert_eq!(tx.rx1_frequency, 868_300_000);
    assert_eq!(tx.rx1_data_rate, Some(band.data_rate(5).unwrap().rate));
    assert_eq!(tx.rx2_frequency, 869_525_000);
    assert_eq!(tx.rx2_data_rate, Some(band.data_rate(0).unwrap().rate));
    assert_eq!(tx.priority, TxSchedulePriority::High);
    assert!(tx.absolute_time.is_none());
}

#[test]
fn test_class_a_rx1_offset_lowers_data_rate() {
    let (mut state, band) = eu868_state();
    state.current_parameters.rx1_data_rate_offset = 2;
    let up = uplink_at(band, 5, 0);
    let tx = class_a::tx_request(band, &state.current_parameters, &up, 1, TxSchedulePriority::Normal).unwrap();
    assert_eq!(tx.rx1_data_rate, Some(band.data_rate(3).unwrap().rate));
}

#[test]
fn test_class_c_transmits_on_rx2() {
    let (state, band) = eu868_state();
    let at = SystemTime::now() + Duration::from_secs(10);
    let tx = class_c::tx_request(band, &state.current_parameters, Some(at), TxSchedulePriority::Low).unwrap();
    assert_eq!(tx.class, DeviceClass::C);
    assert_eq!(tx.rx1_data_rate, None);
    assert_eq!(tx.rx2_frequency, state.current_parameters.rx2_frequency);
    assert_eq!(tx.absolute_time, Some(at));
}

#[test]
fn test_class_b_targets_next_ping_slot() {
    let (state, band) = eu868_state();
    let params = &state.current_parameters;
    let now = SystemTime::now();

    let err = class_b::tx_request(band, params, ADDR, None, None, TxSchedulePriority::Normal, now).unwrap_err();
    assert_eq!(err, Error::MissingField("ping_slot_periodicity"));

    let tx = class_b::tx_request(band, params, ADDR, Some(7), None, TxSchedulePriority::Normal, now).unwrap();
    assert_eq!(tx.class, DeviceClass::B);
    assert_eq!(tx.rx2_frequency, params.ping_slot_frequency);
    let at = tx.absolute_time.unwrap();
    assert!(at > now + INFRASTRUCTURE_DELAY);
    assert!(at <= now + INFRASTRUCTURE_DELAY + BEACON_INTERVAL * 2);

    let fixed = now + Duration::from_secs(30);
    let tx = class_b::tx_request(band, params, ADDR, Some(7), Some(fixed), TxSchedulePriority::Normal, now).unwrap();
    assert_eq!(tx.absolute_time, Some(fixed));
}

#[test]
fn test_ping_slots_repeat_every_ping_period() {
    let config = PingSlotConfig::new(0, 3, 869_525_000);
    let period_start = Duration::from_secs(128 * 10_000);
    let first = next_ping_slot(ADDR, &config, from_gps_time(period_start));
    let first_gps = gps_time(first);
    assert!(first_gps >= period_start + BEACON_RESERVED);
    assert!(first_gps < period_start + BEACON_RESERVED + PING_SLOT_LEN * config.ping_period());

    let second = next_ping_slot(ADDR, &config, first);
    assert_eq!(
        second.duration_since(first).unwrap(),
        PING_SLOT_LEN * config.ping_period()
    );
}

#[test]
fn test_absolute_time_needs_infrastructure_lead() {
    let now = SystemTime::now();
    assert_eq!(
        check_absolute_time(now + Duration::from_millis(100), now),
        Err(Error::InvalidAbsoluteTime)
    );
    assert_eq!(check_absolute_time(now + Duration::from_secs(1), now), Ok(()));
}

#[test]
fn test_default_class() {
    let mut dev = device(MacVersion::V1_0_3);
    assert_eq!(default_class(&dev), DeviceClass::A);
    dev.supports_class_c = true;
    assert_eq!(default_class(&dev), DeviceClass::C);

    let mut dev = device(MacVersion::V1_1);
    dev.supports_class_c = true;
    assert_eq!(default_class(&dev), DeviceClass::A);

    let mut group = device(MacVersion::V1_0_3);
    group.multicast = true;
    group.supports_class_b = true;
    assert_eq!(default_class(&group), DeviceClass::B);
}
