//! In-memory Network Server
//!
//! Runs the server with in-memory stores and a static cluster whose
//! Gateway Server and Application Server only log what they receive:
//! - An ABP device is registered with a LoRaWAN 1.0.3 session
//! - Two gateways report the same confirmed uplink
//! - The Application Server gets the deduplicated uplink
//! - The Gateway Server gets the acknowledgment downlink
//!
//! Run with `RUST_LOG=lorawan_ns=debug cargo run --example in_memory_server`.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lorawan_ns::cluster::{
    ApplicationServerClient, CallContext, CallCredentials, ClusterPeer, GatewayServerClient,
    StaticCluster,
};
use lorawan_ns::config::device::{
    AESKey, DevAddr, EndDeviceIds, GatewayIds, MacVersion, PhyVersion,
};
use lorawan_ns::crypto::compute_legacy_uplink_mic;
use lorawan_ns::device::{EndDevice, FieldPath, Session, SessionKeys};
use lorawan_ns::events::TracingEventSink;
use lorawan_ns::lorawan::mac::{FCtrl, MacPayload, FHDR, MHDR};
use lorawan_ns::lorawan::{band, MType, Message, Payload};
use lorawan_ns::messages::{
    ApplicationUpKind, DownlinkMessage, NsAsHandleUplinkRequest, RxMetadata,
    ScheduleDownlinkResponse, TxSettings, UplinkMessage,
};
use lorawan_ns::{Components, Config, NetworkServer, Result};

const DEV_ADDR: DevAddr = DevAddr::new([0x26, 0x01, 0x1b, 0xda]);
const NWK_S_KEY: AESKey = AESKey::new([
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
]);

struct LoggingGatewayServer;

#[async_trait]
impl GatewayServerClient for LoggingGatewayServer {
    async fn schedule_downlink(
        &self,
        _ctx: &CallContext,
        _creds: &CallCredentials,
        msg: &DownlinkMessage,
    ) -> Result<ScheduleDownlinkResponse> {
        info!(
            payload = %hex::encode(&msg.raw_payload),
            class = ?msg.settings.class,
            rx1_frequency = msg.settings.rx1_frequency,
            paths = msg.settings.downlink_paths.len(),
            "Gateway Server schedules downlink"
        );
        Ok(ScheduleDownlinkResponse {
            delay: Duration::from_secs(1),
            rx1: msg.settings.rx1_data_rate.is_some(),
            rx2: msg.settings.rx1_data_rate.is_none(),
        })
    }
}

struct LoggingApplicationServer;

#[async_trait]
impl ApplicationServerClient for LoggingApplicationServer {
    async fn handle_uplink(
        &self,
        _ctx: &CallContext,
        _creds: &CallCredentials,
        req: &NsAsHandleUplinkRequest,
    ) -> Result<()> {
        for up in &req.application_ups {
            match &up.up {
                ApplicationUpKind::Uplink(uplink) => info!(
                    device_id = %up.end_device_ids.device_id,
                    f_cnt = uplink.f_cnt,
                    f_port = ?uplink.f_port,
                    gateways = uplink.rx_metadata.len(),
                    "Application Server received uplink"
                ),
                other => info!(device_id = %up.end_device_ids.device_id, ?other, "Application Server received message"),
            }
        }
        Ok(())
    }
}

/// Confirmed data uplink with a LoRaWAN 1.0.x MIC
fn confirmed_uplink(f_cnt: u32, f_port: u8, payload: &[u8]) -> Vec<u8> {
    let mut msg = Message {
        mhdr: MHDR {
            m_type: MType::ConfirmedDataUp,
            major: 0,
        },
        payload: Payload::Data(MacPayload {
            f_hdr: FHDR {
                dev_addr: DEV_ADDR,
                f_ctrl: FCtrl {
                    adr: true,
                    ..Default::default()
                },
                f_cnt: f_cnt as u16,
                f_opts: Vec::new(),
            },
            f_port: Some(f_port),
            frm_payload: payload.to_vec(),
        }),
        mic: [0; 4],
    };
    msg.mic = compute_legacy_uplink_mic(&NWK_S_KEY, DEV_ADDR, f_cnt, &msg.encode_without_mic());
    msg.encode()
}

fn reception(gateway_id: &str, snr: f32) -> RxMetadata {
    RxMetadata {
        gateway_ids: GatewayIds::new(gateway_id),
        snr,
        rssi: -90.0 + snr,
        channel_rssi: -90.0 + snr,
        uplink_token: gateway_id.as_bytes().to_vec(),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cluster = StaticCluster::new("demo-token")
        .with_gateway_peer(
            ClusterPeer::new("gs").with_gateway_server(Arc::new(LoggingGatewayServer)),
            [GatewayIds::new("gw-north"), GatewayIds::new("gw-south")],
        )
        .with_peer(ClusterPeer::new("as").with_application_server(Arc::new(LoggingApplicationServer)));
    let components = Components::in_memory(Arc::new(cluster), Arc::new(TracingEventSink));
    let server = NetworkServer::new(Config::default(), components)?;
    server.start();

    let mut dev = EndDevice::new(
        EndDeviceIds::new("demo-app", "sensor-1"),
        "EU_863_870",
        MacVersion::V1_0_3,
        PhyVersion::V1_0_3RevA,
    );
    dev.session = Some(Session::new(
        DEV_ADDR,
        SessionKeys::legacy(b"demo-session".to_vec(), NWK_S_KEY),
        SystemTime::now(),
    ));
    server.set_end_device(dev, &FieldPath::ALL).await?;

    let raw = confirmed_uplink(0, 1, b"21.5C");
    let data_rate = band("EU_863_870")?.data_rate(5)?.rate;
    let received_at = SystemTime::now();
    let observe = |gateway: &str, snr: f32| {
        server.handle_uplink(UplinkMessage::new(
            raw.clone(),
            TxSettings {
                data_rate,
                frequency: 868_100_000,
            },
            vec![reception(gateway, snr)],
            received_at,
        ))
    };
    let (north, south) = tokio::join!(observe("gw-north", 7.5), observe("gw-south", 2.0));
    north?;
    south?;

    tokio::time::sleep(Duration::from_secs(2)).await;
    server.close().await;
    Ok(())
}
