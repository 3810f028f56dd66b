use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc::UnboundedReceiver;

use lorawan_ns::cluster::{ClusterPeer, InteropClient, StaticCluster};
use lorawan_ns::config::device::{DevAddr, DeviceClass, EndDeviceIds, GatewayIds, MacSettings, EUI64};
use lorawan_ns::device::FieldPath;
use lorawan_ns::events::{ChannelEventSink, Event, EventName};
use lorawan_ns::lorawan::Payload;
use lorawan_ns::messages::{
    ApplicationDownlink, ApplicationUpKind, ClassBC, DownlinkPath, GatewayAntennaIds, TxAckResult,
    TxAcknowledgment,
};
use lorawan_ns::{Components, Config, Error, NetworkServer};

mod mock;
use mock::*;

const DEV_ADDR: DevAddr = DevAddr::new([0x26, 0x01, 0x00, 0x01]);
const JOIN_EUI: EUI64 = EUI64::new([0x70, 0xb3, 0xd5, 0x7e, 0xd0, 0x00, 0x00, 0x01]);
const DEV_EUI: EUI64 = EUI64::new([0x00, 0x04, 0xa3, 0x0b, 0x00, 0x1f, 0x00, 0x01]);

fn start(cluster: StaticCluster, interop: Option<Arc<dyn InteropClient>>) -> (NetworkServer, UnboundedReceiver<Event>) {
    let (sink, rx) = ChannelEventSink::new();
    let mut components = Components::in_memory(Arc::new(cluster), Arc::new(sink));
    if let Some(interop) = interop {
        components = components.with_interop(interop);
    }
    let server = NetworkServer::new(Config::default(), components).unwrap();
    server.start();
    (server, rx)
}

fn network(gs: &Arc<MockGatewayServer>, app: &Arc<MockApplicationServer>) -> StaticCluster {
    StaticCluster::new("token")
        .with_peer(ClusterPeer::new("gs").with_gateway_server(gs.clone()))
        .with_peer(ClusterPeer::new("as").with_application_server(app.clone()))
}

/// Let background tasks finish what they started
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn test_merges_gateway_observations() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let (server, mut events) = start(network(&gs, &app), None);
    server
        .set_end_device(abp_device("dev-1", DEV_ADDR), &FieldPath::ALL)
        .await
        .unwrap();

    let raw = data_uplink_frame(DEV_ADDR, &NWK_S_KEY, 0, false, 1, b"temp");
    let now = SystemTime::now();
    let observe = |gw: &str, snr: f32| server.handle_uplink(uplink(raw.clone(), vec![rx_metadata(gw, 0, snr)], now));
    let (a, b, c) = tokio::join!(observe("gw-1", 7.0), observe("gw-2", 3.0), observe("gw-3", -2.0));
    assert_eq!((a, b, c), (Ok(()), Ok(()), Ok(())));

    let ups = app.ups.wait_for(1).await;
    let ApplicationUpKind::Uplink(uplink) = &ups[0].up else {
        panic!("expected a data uplink, got {:?}", ups[0].up);
    };
    assert_eq!(uplink.rx_metadata.len(), 3);
    assert_eq!(uplink.f_port, Some(1));
    assert_eq!(uplink.frm_payload, b"temp");
    assert_eq!(ups[0].end_device_ids.device_id, "dev-1");

    settle().await;
    let seen = drain_events(&mut events);
    assert_eq!(count(&seen, EventName::ReceiveDataUplink), 3);
    assert_eq!(count(&seen, EventName::DropDataUplink), 2);
    assert!(seen
        .iter()
        .filter(|e| e.name == EventName::DropDataUplink)
        .all(|e| e.error() == Some(&Error::Duplicate)));
    assert_eq!(count(&seen, EventName::ProcessDataUplink), 1);
    assert_eq!(count(&seen, EventName::ForwardDataUplink), 1);
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicates_are_dropped_with_device_ids() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let (server, mut events) = start(network(&gs, &app), None);
    server
        .set_end_device(abp_device("dev-1", DEV_ADDR), &FieldPath::ALL)
        .await
        .unwrap();

    let raw = data_uplink_frame(DEV_ADDR, &NWK_S_KEY, 0, false, 1, b"temp");
    let now = SystemTime::now();
    let observe = |gw: &str| server.handle_uplink(uplink(raw.clone(), vec![rx_metadata(gw, 0, 5.0)], now));
    let _ = tokio::join!(observe("gw-1"), observe("gw-2"), observe("gw-3"));
    next_event(&mut events, EventName::ProcessDataUplink).await;

    // A copy within the cooldown window is a duplicate observation.
    server
        .handle_uplink(uplink(raw.clone(), vec![rx_metadata("gw-4", 0, 1.0)], now))
        .await
        .unwrap();
    let dropped = next_event(&mut events, EventName::DropDataUplink).await;
    assert_eq!(dropped.error(), Some(&Error::Duplicate));

    // A replay after the cooldown is a retransmission of a processed uplink.
    tokio::time::sleep(Duration::from_secs(2)).await;
    server
        .handle_uplink(uplink(raw, vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
        .await
        .unwrap();
    let dropped = next_event(&mut events, EventName::DropDataUplink).await;
    assert_eq!(dropped.error(), Some(&Error::Duplicate));
    assert_eq!(dropped.identifiers.map(|ids| ids.device_id), Some("dev-1".to_string()));

    settle().await;
    let receives = drain_events(&mut events);
    assert_eq!(count(&receives, EventName::ProcessDataUplink), 0);
    assert_eq!(app.ups.items().len(), 1);
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_uplinks_are_dropped() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let (server, mut events) = start(network(&gs, &app), None);
    server
        .set_end_device(abp_device("dev-1", DEV_ADDR), &FieldPath::ALL)
        .await
        .unwrap();

    let unknown = DevAddr::new([0x26, 0x01, 0x00, 0x99]);
    let raw = data_uplink_frame(unknown, &NWK_S_KEY, 0, false, 1, b"x");
    server
        .handle_uplink(uplink(raw, vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
        .await
        .unwrap();
    let dropped = next_event(&mut events, EventName::DropDataUplink).await;
    assert_eq!(dropped.error(), Some(&Error::DeviceNotFound));
    assert_eq!(dropped.identifiers, None);

    let forged = data_uplink_frame(DEV_ADDR, &APP_KEY, 0, false, 1, b"x");
    server
        .handle_uplink(uplink(forged, vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
        .await
        .unwrap();
    let dropped = next_event(&mut events, EventName::DropDataUplink).await;
    assert_eq!(dropped.error(), Some(&Error::InvalidMic));

    let mut downlink_frame = data_uplink_frame(DEV_ADDR, &NWK_S_KEY, 1, false, 1, b"x");
    downlink_frame[0] = 0x60;
    let mut major_1 = data_uplink_frame(DEV_ADDR, &NWK_S_KEY, 1, false, 1, b"x");
    major_1[0] |= 0x01;
    for (raw, unsupported_version) in [(vec![0x40, 0x01], false), (downlink_frame, false), (major_1, true)] {
        let res = server
            .handle_uplink(uplink(raw, vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
            .await;
        assert_eq!(res, Ok(()));
        let dropped = next_event(&mut events, EventName::DropDataUplink).await;
        assert_eq!(dropped.identifiers, None);
        assert!(!dropped.correlation_ids.is_empty());
        if unsupported_version {
            assert!(matches!(dropped.error(), Some(Error::UnsupportedLoRaWANVersion(_))));
        } else {
            assert!(matches!(dropped.error(), Some(Error::DecodePayload(_))));
        }
    }

    let res = server
        .handle_uplink(uplink(vec![0xc0; 19], vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
        .await;
    assert_eq!(res, Ok(()));
    let dropped = next_event(&mut events, EventName::DropJoinRequest).await;
    assert_eq!(dropped.error(), Some(&Error::RejoinRequest));

    settle().await;
    assert!(gs.requests.items().is_empty());
    assert!(app.ups.items().is_empty());
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_counter_reset_accepted_only_when_configured() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let (server, mut events) = start(network(&gs, &app), None);
    server
        .set_end_device(abp_device("strict", DEV_ADDR), &FieldPath::ALL)
        .await
        .unwrap();

    let send = |f_cnt: u32| {
        let raw = data_uplink_frame(DEV_ADDR, &NWK_S_KEY, f_cnt, false, 1, b"x");
        server.handle_uplink(uplink(raw, vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
    };
    send(10).await.unwrap();
    next_event(&mut events, EventName::ProcessDataUplink).await;

    send(3).await.unwrap();
    let dropped = next_event(&mut events, EventName::DropDataUplink).await;
    assert_eq!(dropped.error(), Some(&Error::InvalidMic));

    let ids = EndDeviceIds::new("test-app", "strict");
    let mut update = server.get_end_device(&ids, &FieldPath::ALL).await.unwrap();
    update.mac_settings = Some(MacSettings {
        resets_f_cnt: Some(true),
        ..Default::default()
    });
    server.set_end_device(update, &[FieldPath::MacSettings]).await.unwrap();

    send(3).await.unwrap();
    next_event(&mut events, EventName::ProcessDataUplink).await;
    let dev = server.get_end_device(&ids, &[FieldPath::Session]).await.unwrap();
    assert_eq!(dev.session.unwrap().last_f_cnt_up, 3);
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_downlink_falls_back_to_next_peer() {
    let gs_a = MockGatewayServer::rejecting();
    let gs_b = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let cluster = StaticCluster::new("token")
        .with_gateway_peer(ClusterPeer::new("gs-a").with_gateway_server(gs_a.clone()), [GatewayIds::new("gw-1")])
        .with_gateway_peer(ClusterPeer::new("gs-b").with_gateway_server(gs_b.clone()), [GatewayIds::new("gw-2")])
        .with_peer(ClusterPeer::new("as").with_application_server(app.clone()));
    let (server, mut events) = start(cluster, None);
    let dev = server
        .set_end_device(abp_device("dev-1", DEV_ADDR), &FieldPath::ALL)
        .await
        .unwrap();

    let raw = data_uplink_frame(DEV_ADDR, &NWK_S_KEY, 0, true, 1, b"ping");
    let md = vec![
        rx_metadata("gw-2", 0, 4.0),
        rx_metadata("gw-1", 0, 9.0),
        rx_metadata("gw-1", 1, 8.0),
    ];
    server.handle_uplink(uplink(raw, md, SystemTime::now())).await.unwrap();

    let sent = gs_b.requests.wait_for(1).await;
    next_event(&mut events, EventName::ScheduleDataDownlinkSuccess).await;
    let rejected = gs_a.requests.items();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].settings.downlink_paths.len(), 2);
    assert!(rejected[0]
        .settings
        .downlink_paths
        .iter()
        .all(|p| p.gateway_ids().gateway_id == "gw-1"));
    assert_eq!(sent[0].settings.downlink_paths.len(), 1);
    assert_eq!(sent[0].settings.class, DeviceClass::A);
    let Some(Payload::Data(mac)) = sent[0].payload.as_ref().map(|m| &m.payload) else {
        panic!("expected a data downlink");
    };
    assert!(mac.f_hdr.f_ctrl.ack);

    settle().await;
    let stored = server.get_end_device(&dev.ids, &FieldPath::ALL).await.unwrap();
    assert_eq!(stored.session.unwrap().last_n_f_cnt_down, 1);
    assert!(!stored.mac_state.unwrap().rx_windows_available);

    let ack = TxAcknowledgment {
        correlation_ids: sent[0].correlation_ids.clone(),
        result: TxAckResult::Success,
    };
    let matched = server.report_tx_acknowledgment(&ack).await.unwrap();
    assert_eq!(matched.map(|d| d.correlation_ids), Some(sent[0].correlation_ids.clone()));
    let evt = next_event(&mut events, EventName::TransmissionSuccess).await;
    assert_eq!(evt.identifiers.map(|ids| ids.device_id), Some("dev-1".to_string()));
    assert_eq!(server.report_tx_acknowledgment(&ack).await.unwrap(), None);
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_expired_rx_windows_skip_downlink() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let (server, mut events) = start(network(&gs, &app), None);
    let dev = server
        .set_end_device(abp_device("dev-1", DEV_ADDR), &FieldPath::ALL)
        .await
        .unwrap();

    let raw = data_uplink_frame(DEV_ADDR, &NWK_S_KEY, 0, true, 1, b"late");
    let received_at = SystemTime::now() - Duration::from_secs(2);
    server
        .handle_uplink(uplink(raw, vec![rx_metadata("gw-1", 0, 5.0)], received_at))
        .await
        .unwrap();
    next_event(&mut events, EventName::ProcessDataUplink).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(gs.requests.items().is_empty());
    let stored = server.get_end_device(&dev.ids, &[FieldPath::MacState]).await.unwrap();
    assert!(!stored.mac_state.unwrap().rx_windows_available);
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_passed_rx1_uses_rx2_only() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let (server, _events) = start(network(&gs, &app), None);
    server
        .set_end_device(abp_device("dev-1", DEV_ADDR), &FieldPath::ALL)
        .await
        .unwrap();

    let raw = data_uplink_frame(DEV_ADDR, &NWK_S_KEY, 0, true, 1, b"rx2");
    let received_at = SystemTime::now() - Duration::from_millis(1500);
    server
        .handle_uplink(uplink(raw, vec![rx_metadata("gw-1", 0, 5.0)], received_at))
        .await
        .unwrap();

    let sent = gs.requests.wait_for(1).await;
    assert_eq!(sent[0].settings.rx1_data_rate, None);
    assert!(sent[0].settings.rx2_data_rate.is_some());
    assert_eq!(sent[0].settings.rx2_frequency, 869_525_000);
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_join_then_first_uplink_promotes_session() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let js = MockJoinServer::new(Ok(join_response(b"sk-1")));
    let cluster = network(&gs, &app).with_peer(ClusterPeer::new("js").with_join_server(js.clone()));
    let (server, mut events) = start(cluster, None);
    let dev = server
        .set_end_device(otaa_device("dev-1", JOIN_EUI, DEV_EUI), &FieldPath::ALL)
        .await
        .unwrap();

    let raw = join_request_frame(JOIN_EUI, DEV_EUI, 1);
    let md = vec![rx_metadata("gw-1", 0, 5.0), rx_metadata("gw-2", 0, 2.0)];
    server.handle_uplink(uplink(raw, md, SystemTime::now())).await.unwrap();

    let requests = js.requests.wait_for(1).await;
    assert_eq!(requests[0].net_id, server.config().net_id);
    assert_eq!(requests[0].rx_delay, 5);
    assert!(requests[0].cf_list.is_some());
    let dev_addr = requests[0].dev_addr;
    assert!(dev_addr.in_net(server.config().net_id));

    let sent = gs.requests.wait_for(1).await;
    assert_eq!(sent[0].raw_payload, vec![0x20; 17]);
    assert_eq!(sent[0].settings.rx1_delay, Some(5));
    assert_eq!(sent[0].settings.downlink_paths.len(), 2);
    assert_eq!(sent[0].session_key_id.as_deref(), Some(&b"sk-1"[..]));
    next_event(&mut events, EventName::ScheduleJoinAcceptSuccess).await;

    let ups = app.ups.wait_for(1).await;
    let ApplicationUpKind::JoinAccept(accept) = &ups[0].up else {
        panic!("expected a join-accept, got {:?}", ups[0].up);
    };
    assert_eq!(accept.app_s_key, Some(APP_S_KEY));
    assert_eq!(accept.session_key_id, b"sk-1");

    settle().await;
    let staged = server.get_end_device(&dev.ids, &FieldPath::ALL).await.unwrap();
    assert!(staged.session.is_none());
    let pending = staged.pending_session.unwrap();
    assert_eq!(pending.dev_addr, dev_addr);
    assert_eq!(pending.keys.app_s_key, None);

    let raw = data_uplink_frame(dev_addr, &JOINED_NWK_KEY, 0, false, 2, b"hello");
    server
        .handle_uplink(uplink(raw, vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
        .await
        .unwrap();
    next_event(&mut events, EventName::ProcessDataUplink).await;

    let joined = server.get_end_device(&dev.ids, &FieldPath::ALL).await.unwrap();
    assert!(joined.pending_session.is_none());
    assert!(joined.pending_mac_state.is_none());
    assert_eq!(joined.ids.dev_addr, Some(dev_addr));
    assert_eq!(joined.session.unwrap().keys.session_key_id, b"sk-1");
    let state = joined.mac_state.unwrap();
    assert_eq!(state.current_parameters.rx1_delay, 5);
    assert_eq!(state.current_parameters.channels.len(), 8);

    let ups = app.ups.wait_for(2).await;
    assert!(matches!(&ups[1].up, ApplicationUpKind::Uplink(up) if up.f_port == Some(2)));
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_join_accept_keeps_windows_open_until_scheduled() {
    let gs = MockGatewayServer::held();
    let app = MockApplicationServer::new();
    let js = MockJoinServer::new(Ok(join_response(b"sk-1")));
    let cluster = network(&gs, &app).with_peer(ClusterPeer::new("js").with_join_server(js.clone()));
    let (server, mut events) = start(cluster, None);
    let dev = server
        .set_end_device(otaa_device("dev-1", JOIN_EUI, DEV_EUI), &FieldPath::ALL)
        .await
        .unwrap();

    let raw = join_request_frame(JOIN_EUI, DEV_EUI, 1);
    server
        .handle_uplink(uplink(raw, vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
        .await
        .unwrap();

    gs.requests.wait_for(1).await;
    let queued = server.get_end_device(&dev.ids, &FieldPath::ALL).await.unwrap();
    let state = queued.pending_mac_state.unwrap();
    assert!(state.rx_windows_available);
    assert!(state.queued_join_accept.is_some());
    assert!(queued.pending_session.is_none());

    gs.release();
    next_event(&mut events, EventName::ScheduleJoinAcceptSuccess).await;
    settle().await;
    let sent = server.get_end_device(&dev.ids, &FieldPath::ALL).await.unwrap();
    let state = sent.pending_mac_state.unwrap();
    assert!(!state.rx_windows_available);
    assert!(state.queued_join_accept.is_none());
    assert!(state.pending_join_request.is_some());
    assert!(sent.pending_session.is_some());
    assert_eq!(gs.requests.items().len(), 1);
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_two_gateways_one_uplink_one_downlink() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let (server, mut events) = start(network(&gs, &app), None);
    let dev = server
        .set_end_device(abp_device("dev-1", DEV_ADDR), &FieldPath::ALL)
        .await
        .unwrap();
    let down = ApplicationDownlink {
        session_key_id: b"abp".to_vec(),
        f_port: 10,
        f_cnt: 1,
        frm_payload: b"on".to_vec(),
        correlation_ids: vec!["as:down:1".to_string()],
        ..Default::default()
    };
    server.push_application_downlinks(&dev.ids, vec![down]).await.unwrap();
    settle().await;
    assert!(gs.requests.items().is_empty());

    let raw = data_uplink_frame(DEV_ADDR, &NWK_S_KEY, 0, false, 1, b"temp");
    let now = SystemTime::now();
    let observe = |gw: &str, snr: f32| server.handle_uplink(uplink(raw.clone(), vec![rx_metadata(gw, 0, snr)], now));
    let (a, b) = tokio::join!(observe("gw-1", 7.0), observe("gw-2", 3.0));
    assert_eq!((a, b), (Ok(()), Ok(())));

    let ups = app.ups.wait_for(1).await;
    let sent = gs.requests.wait_for(1).await;
    next_event(&mut events, EventName::ScheduleDataDownlinkSuccess).await;
    settle().await;
    assert_eq!(app.ups.items().len(), 1);
    assert_eq!(gs.requests.items().len(), 1);

    let seen = drain_events(&mut events);
    assert_eq!(count(&seen, EventName::ReceiveDataUplink), 2);
    assert_eq!(count(&seen, EventName::DropDataUplink), 1);
    let processed = seen
        .iter()
        .find(|e| e.name == EventName::ProcessDataUplink)
        .expect("uplink processed");
    let uplink_id = processed
        .correlation_ids
        .iter()
        .find(|id| id.starts_with("ns:uplink:"))
        .expect("uplink correlation id");

    let msg = &sent[0];
    assert_eq!(msg.settings.class, DeviceClass::A);
    assert_eq!(msg.settings.downlink_paths.len(), 2);
    assert!(msg.correlation_ids.contains(uplink_id));
    assert!(ups[0].correlation_ids.iter().all(|id| msg.correlation_ids.contains(id)));
    assert!(msg.correlation_ids.iter().any(|id| id.starts_with("ns:downlink:")));
    assert!(msg.correlation_ids.contains(&"as:down:1".to_string()));
    let attempt = seen
        .iter()
        .find(|e| e.name == EventName::ScheduleDataDownlinkAttempt)
        .expect("downlink attempted");
    assert_eq!(attempt.correlation_ids, msg.correlation_ids);

    let stored = server.get_end_device(&dev.ids, &FieldPath::ALL).await.unwrap();
    let session = stored.session.unwrap();
    assert!(session.queued_application_downlinks.is_empty());
    assert_eq!(session.last_a_f_cnt_down, 1);
    assert!(!stored.mac_state.unwrap().rx_windows_available);
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_join_through_interop_without_cluster_join_server() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let interop = MockJoinServer::new(Ok(join_response(b"sk-interop")));
    let (server, mut events) = start(network(&gs, &app), Some(interop.clone() as Arc<dyn InteropClient>));
    server
        .set_end_device(otaa_device("dev-1", JOIN_EUI, DEV_EUI), &FieldPath::ALL)
        .await
        .unwrap();

    let raw = join_request_frame(JOIN_EUI, DEV_EUI, 7);
    server
        .handle_uplink(uplink(raw, vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
        .await
        .unwrap();

    next_event(&mut events, EventName::InteropJoinSuccess).await;
    assert_eq!(interop.requests.items().len(), 1);
    let sent = gs.requests.wait_for(1).await;
    assert_eq!(sent[0].session_key_id.as_deref(), Some(&b"sk-interop"[..]));
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_cluster_join_failure_skips_interop() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let js = MockJoinServer::new(Err(Error::Rpc("unknown device".into())));
    let interop = MockJoinServer::new(Ok(join_response(b"sk-interop")));
    let cluster = network(&gs, &app).with_peer(ClusterPeer::new("js").with_join_server(js.clone()));
    let (server, mut events) = start(cluster, Some(interop.clone() as Arc<dyn InteropClient>));
    server
        .set_end_device(otaa_device("dev-1", JOIN_EUI, DEV_EUI), &FieldPath::ALL)
        .await
        .unwrap();

    let raw = join_request_frame(JOIN_EUI, DEV_EUI, 1);
    server
        .handle_uplink(uplink(raw, vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
        .await
        .unwrap();

    next_event(&mut events, EventName::ClusterJoinFail).await;
    let dropped = next_event(&mut events, EventName::DropJoinRequest).await;
    assert_eq!(dropped.error(), Some(&Error::Rpc("unknown device".into())));
    assert!(interop.requests.items().is_empty());
    settle().await;
    assert!(gs.requests.items().is_empty());
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_join_without_join_server_is_dropped() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let (server, mut events) = start(network(&gs, &app), None);
    server
        .set_end_device(otaa_device("dev-1", JOIN_EUI, DEV_EUI), &FieldPath::ALL)
        .await
        .unwrap();
    server
        .set_end_device(abp_device("dev-abp", DEV_ADDR), &FieldPath::ALL)
        .await
        .unwrap();

    let raw = join_request_frame(JOIN_EUI, DEV_EUI, 1);
    server
        .handle_uplink(uplink(raw, vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
        .await
        .unwrap();
    let dropped = next_event(&mut events, EventName::DropJoinRequest).await;
    assert_eq!(dropped.error(), Some(&Error::NoJoinServer));

    let unknown = join_request_frame(JOIN_EUI, EUI64::new([0xff; 8]), 1);
    server
        .handle_uplink(uplink(unknown, vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
        .await
        .unwrap();
    let dropped = next_event(&mut events, EventName::DropJoinRequest).await;
    assert_eq!(dropped.error(), Some(&Error::DeviceNotFound));
    assert_eq!(dropped.identifiers, None);
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_reset_factory_defaults() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let (server, mut events) = start(network(&gs, &app), None);
    let abp = server
        .set_end_device(abp_device("dev-abp", DEV_ADDR), &FieldPath::ALL)
        .await
        .unwrap();

    let raw = data_uplink_frame(DEV_ADDR, &NWK_S_KEY, 7, false, 1, b"x");
    server
        .handle_uplink(uplink(raw, vec![rx_metadata("gw-1", 0, 5.0)], SystemTime::now()))
        .await
        .unwrap();
    next_event(&mut events, EventName::ProcessDataUplink).await;

    let reset = server
        .reset_factory_defaults(&abp.ids, &[FieldPath::Session, FieldPath::MacState])
        .await
        .unwrap();
    let session = reset.session.unwrap();
    assert_eq!(session.dev_addr, DEV_ADDR);
    assert_eq!(session.last_f_cnt_up, 0);
    assert_eq!(session.keys.f_nwk_s_int_key, NWK_S_KEY);
    assert!(reset.mac_state.unwrap().recent_uplinks.is_empty());

    let mut otaa = otaa_device("dev-otaa", JOIN_EUI, DEV_EUI);
    otaa.session = abp_device("", DEV_ADDR).session;
    let otaa = server.set_end_device(otaa, &FieldPath::ALL).await.unwrap();
    let reset = server.reset_factory_defaults(&otaa.ids, &FieldPath::ALL).await.unwrap();
    assert!(reset.session.is_none());
    assert!(reset.mac_state.is_none());

    let missing = EndDeviceIds::new("test-app", "missing");
    assert_eq!(
        server.reset_factory_defaults(&missing, &FieldPath::ALL).await.err(),
        Some(Error::DeviceNotFound)
    );
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_class_c_application_downlinks() {
    let gs = MockGatewayServer::accepting();
    let app = MockApplicationServer::new();
    let (server, mut events) = start(network(&gs, &app), None);
    let mut dev = abp_device("dev-c", DEV_ADDR);
    dev.supports_class_c = true;
    let dev = server.set_end_device(dev, &FieldPath::ALL).await.unwrap();

    let gateway = GatewayAntennaIds {
        gateway_ids: GatewayIds::new("gw-1"),
        antenna_index: 0,
    };
    let down = |f_cnt: u32, frm_payload: Vec<u8>| ApplicationDownlink {
        session_key_id: b"abp".to_vec(),
        f_port: 10,
        f_cnt,
        frm_payload,
        class_b_c: Some(ClassBC {
            gateways: vec![gateway.clone()],
            absolute_time: None,
        }),
        correlation_ids: vec![format!("as:down:{f_cnt}")],
        ..Default::default()
    };
    server
        .push_application_downlinks(&dev.ids, vec![down(1, b"on".to_vec())])
        .await
        .unwrap();

    let sent = gs.requests.wait_for(1).await;
    assert_eq!(sent[0].settings.class, DeviceClass::C);
    assert_eq!(sent[0].settings.downlink_paths, vec![DownlinkPath::Fixed(gateway.clone())]);
    assert!(sent[0].correlation_ids.contains(&"as:down:1".to_string()));
    next_event(&mut events, EventName::ScheduleDataDownlinkSuccess).await;

    server
        .push_application_downlinks(&dev.ids, vec![down(2, vec![0xab; 60])])
        .await
        .unwrap();
    let ups = app.ups.wait_for(1).await;
    let ApplicationUpKind::DownlinkFailed { downlink, error } = &ups[0].up else {
        panic!("expected a failed downlink, got {:?}", ups[0].up);
    };
    assert_eq!(downlink.f_cnt, 2);
    assert!(matches!(error, Error::ApplicationDownlinkTooLong { length: 60, .. }));

    settle().await;
    assert_eq!(gs.requests.items().len(), 1);
    let stored = server.get_end_device(&dev.ids, &FieldPath::ALL).await.unwrap();
    let session = stored.session.unwrap();
    assert!(session.queued_application_downlinks.is_empty());
    assert_eq!(session.last_a_f_cnt_down, 1);
    assert!(stored.mac_state.unwrap().last_network_initiated_downlink_at.is_some());
    server.close().await;
}
