//! Test doubles for cluster peers, plus frame and device builders
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, Semaphore};

use lorawan_ns::cluster::{
    ApplicationServerClient, CallContext, CallCredentials, GatewayServerClient, InteropClient,
    JoinServerClient,
};
use lorawan_ns::config::device::{AESKey, DevAddr, DevNonce, EndDeviceIds, MacVersion, NetID, PhyVersion, EUI64};
use lorawan_ns::crypto::{compute_join_request_mic, compute_legacy_uplink_mic};
use lorawan_ns::device::{EndDevice, Session, SessionKeys};
use lorawan_ns::events::{Event, EventName};
use lorawan_ns::lorawan::mac::{FCtrl, JoinRequestPayload, MacPayload, FHDR, MHDR};
use lorawan_ns::lorawan::{band, MType, Message, Payload};
use lorawan_ns::messages::{
    ApplicationUp, DownlinkMessage, JoinRequest, JoinResponse, NsAsHandleUplinkRequest, RxMetadata,
    ScheduleDownlinkResponse, TxSettings, UplinkMessage,
};
use lorawan_ns::{Error, Result};

/// Session key of ABP test devices
pub const NWK_S_KEY: AESKey = AESKey::new([0x2b; 16]);

/// Network key of joined test devices
pub const JOINED_NWK_KEY: AESKey = AESKey::new([0x3c; 16]);

/// Application session key issued by the test Join Servers
pub const APP_S_KEY: AESKey = AESKey::new([0x4d; 16]);

/// Root key used for join-request MICs
pub const APP_KEY: AESKey = AESKey::new([0x5e; 16]);

/// How long a test waits for background work
const WAIT: Duration = Duration::from_secs(30);

/// Values pushed by a mock, with a way to wait for them
pub struct Recorder<T> {
    items: Mutex<Vec<T>>,
    notify: Notify,
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push(item);
        self.notify.notify_waiters();
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().clone()
    }

    /// Wait until at least `n` values arrived
    pub async fn wait_for(&self, n: usize) -> Vec<T> {
        tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.notify.notified();
                let items = self.items();
                if items.len() >= n {
                    return items;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for mock calls")
    }
}

/// Gateway Server that accepts or rejects every downlink
pub struct MockGatewayServer {
    reject: bool,
    gate: Option<Semaphore>,
    pub requests: Recorder<DownlinkMessage>,
}

impl MockGatewayServer {
    fn with(reject: bool, gate: Option<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            reject,
            gate,
            requests: Recorder::new(),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::with(false, None)
    }

    pub fn rejecting() -> Arc<Self> {
        Self::with(true, None)
    }

    /// Accepts each downlink only once [`Self::release`] is called for it
    pub fn held() -> Arc<Self> {
        Self::with(false, Some(Semaphore::new(0)))
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }
}

#[async_trait]
impl GatewayServerClient for MockGatewayServer {
    async fn schedule_downlink(
        &self,
        _ctx: &CallContext,
        _creds: &CallCredentials,
        msg: &DownlinkMessage,
    ) -> Result<ScheduleDownlinkResponse> {
        self.requests.push(msg.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|e| Error::Rpc(e.to_string()))?.forget();
        }
        if self.reject {
            return Err(Error::Rpc("no gateway available".into()));
        }
        Ok(ScheduleDownlinkResponse {
            delay: Duration::from_millis(900),
            rx1: msg.settings.rx1_data_rate.is_some(),
            rx2: msg.settings.rx1_data_rate.is_none(),
        })
    }
}

/// Join Server answering every join-request the same way
pub struct MockJoinServer {
    response: Result<JoinResponse>,
    pub requests: Recorder<JoinRequest>,
}

impl MockJoinServer {
    pub fn new(response: Result<JoinResponse>) -> Arc<Self> {
        Arc::new(Self {
            response,
            requests: Recorder::new(),
        })
    }
}

#[async_trait]
impl JoinServerClient for MockJoinServer {
    async fn handle_join(
        &self,
        _ctx: &CallContext,
        _creds: &CallCredentials,
        req: &JoinRequest,
    ) -> Result<JoinResponse> {
        self.requests.push(req.clone());
        self.response.clone()
    }
}

#[async_trait]
impl InteropClient for MockJoinServer {
    async fn handle_join_request(&self, _ctx: &CallContext, _net_id: NetID, req: &JoinRequest) -> Result<JoinResponse> {
        self.requests.push(req.clone());
        self.response.clone()
    }
}

/// Application Server recording every message
pub struct MockApplicationServer {
    pub ups: Recorder<ApplicationUp>,
}

impl MockApplicationServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { ups: Recorder::new() })
    }
}

#[async_trait]
impl ApplicationServerClient for MockApplicationServer {
    async fn handle_uplink(
        &self,
        _ctx: &CallContext,
        _creds: &CallCredentials,
        req: &NsAsHandleUplinkRequest,
    ) -> Result<()> {
        for up in &req.application_ups {
            self.ups.push(up.clone());
        }
        Ok(())
    }
}

/// Next event named `name`, skipping others
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>, name: EventName) -> Event {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(evt) if evt.name == name => return evt,
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}

/// Events published so far
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(evt) = rx.try_recv() {
        events.push(evt);
    }
    events
}

/// Number of events named `name`
pub fn count(events: &[Event], name: EventName) -> usize {
    events.iter().filter(|e| e.name == name).count()
}

/// Data uplink PHYPayload with a LoRaWAN 1.0.x MIC
pub fn data_uplink_frame(
    dev_addr: DevAddr,
    key: &AESKey,
    f_cnt: u32,
    confirmed: bool,
    f_port: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut msg = Message {
        mhdr: MHDR {
            m_type: if confirmed {
                MType::ConfirmedDataUp
            } else {
                MType::UnconfirmedDataUp
            },
            major: 0,
        },
        payload: Payload::Data(MacPayload {
            f_hdr: FHDR {
                dev_addr,
                f_ctrl: FCtrl::default(),
                f_cnt: f_cnt as u16,
                f_opts: Vec::new(),
            },
            f_port: Some(f_port),
            frm_payload: payload.to_vec(),
        }),
        mic: [0; 4],
    };
    msg.mic = compute_legacy_uplink_mic(key, dev_addr, f_cnt, &msg.encode_without_mic());
    msg.encode()
}

/// Join-request PHYPayload
pub fn join_request_frame(join_eui: EUI64, dev_eui: EUI64, dev_nonce: u16) -> Vec<u8> {
    let mut msg = Message {
        mhdr: MHDR {
            m_type: MType::JoinRequest,
            major: 0,
        },
        payload: Payload::JoinRequest(JoinRequestPayload {
            join_eui,
            dev_eui,
            dev_nonce: DevNonce::new(dev_nonce.to_be_bytes()),
        }),
        mic: [0; 4],
    };
    msg.mic = compute_join_request_mic(&APP_KEY, &msg.encode_without_mic());
    msg.encode()
}

/// Reception by one gateway antenna, with an uplink token
pub fn rx_metadata(gateway_id: &str, antenna_index: u32, snr: f32) -> RxMetadata {
    RxMetadata {
        gateway_ids: lorawan_ns::config::device::GatewayIds::new(gateway_id),
        antenna_index,
        rssi: -80.0 + snr,
        channel_rssi: -80.0 + snr,
        snr,
        uplink_token: format!("{gateway_id}:{antenna_index}").into_bytes(),
        ..Default::default()
    }
}

/// EU868 DR5 uplink on the first default channel
pub fn uplink(raw: Vec<u8>, rx_metadata: Vec<RxMetadata>, received_at: SystemTime) -> UplinkMessage {
    let data_rate = band("EU_863_870").unwrap().data_rate(5).unwrap().rate;
    UplinkMessage::new(
        raw,
        TxSettings {
            data_rate,
            frequency: 868_100_000,
        },
        rx_metadata,
        received_at,
    )
}

/// LoRaWAN 1.0.3 device activated by personalization
pub fn abp_device(device_id: &str, dev_addr: DevAddr) -> EndDevice {
    let mut dev = EndDevice::new(
        EndDeviceIds::new("test-app", device_id),
        "EU_863_870",
        MacVersion::V1_0_3,
        PhyVersion::V1_0_3RevA,
    );
    dev.session = Some(Session::new(
        dev_addr,
        SessionKeys::legacy(b"abp".to_vec(), NWK_S_KEY),
        SystemTime::now(),
    ));
    dev
}

/// LoRaWAN 1.0.3 device activating over the air
pub fn otaa_device(device_id: &str, join_eui: EUI64, dev_eui: EUI64) -> EndDevice {
    let mut ids = EndDeviceIds::new("test-app", device_id);
    ids.join_eui = Some(join_eui);
    ids.dev_eui = Some(dev_eui);
    let mut dev = EndDevice::new(ids, "EU_863_870", MacVersion::V1_0_3, PhyVersion::V1_0_3RevA);
    dev.supports_join = true;
    dev
}

/// Join-accept with LoRaWAN 1.0.x keys
pub fn join_response(session_key_id: &[u8]) -> JoinResponse {
    JoinResponse {
        raw_payload: vec![0x20; 17],
        session_keys: SessionKeys {
            session_key_id: session_key_id.to_vec(),
            f_nwk_s_int_key: JOINED_NWK_KEY,
            s_nwk_s_int_key: JOINED_NWK_KEY,
            nwk_s_enc_key: JOINED_NWK_KEY,
            app_s_key: Some(APP_S_KEY),
        },
        lifetime: None,
        correlation_ids: vec!["js:join:1".into()],
    }
}
