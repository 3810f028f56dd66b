//! Uplink processing
//!
//! Every observation is decoded and matched to a device before
//! deduplication, so receive and drop events carry device identifiers.
//! The first observation of a frame waits for the deduplication window,
//! then runs the MAC state machine on the merged metadata.

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::device::{DevAddr, MacSettings, MacVersion};
use crate::crypto::{
    compute_legacy_uplink_mic, compute_uplink_mic, encrypt_fopts, encrypt_payload, Direction, MIC_SIZE,
};
use crate::dedup::Fingerprint;
use crate::device::{EndDevice, FieldPath, Session, SessionKeys};
use crate::error::{Error, Result};
use crate::events::{Event, EventName};
use crate::join::network_session_keys;
use crate::lorawan::commands::{parse_uplink_commands, UplinkCommand};
use crate::lorawan::mac::{JoinRequestPayload, MType, MacPayload, Message, Payload};
use crate::lorawan::phy::full_f_cnt;
use crate::lorawan::region::{frequency_plan, Band, Channel};
use crate::messages::{
    merge_correlation_ids, new_correlation_id, ApplicationUp, ApplicationUpKind, ApplicationUplink,
    JoinRequest, UplinkMessage,
};
use crate::registry::{set_by_id, SetOutcome};
use crate::server::Core;
use crate::state::adr::adapt_data_rate;
use crate::state::handle::handle_uplink_commands;
use crate::state::{join_accept_settings, new_mac_state, promote_pending, MacState, PendingJoinRequest, QueuedJoinAccept};

/// ADR margin used when neither the device nor the server sets one
const DEFAULT_ADR_MARGIN: f32 = 15.0;

/// Fields a data uplink may change
const DATA_UPLINK_SETS: [FieldPath; 6] = [
    FieldPath::Ids,
    FieldPath::MacState,
    FieldPath::PendingMacState,
    FieldPath::Session,
    FieldPath::PendingSession,
    FieldPath::LastDevStatus,
];

/// Device and session a data uplink verified against
struct Match {
    device: EndDevice,
    pending_session: bool,
    session_key_id: Vec<u8>,
    f_cnt: u32,
}

fn channel_index(channels: &[Channel], frequency: u64) -> u8 {
    channels
        .iter()
        .position(|ch| ch.uplink_frequency == frequency)
        .unwrap_or_default() as u8
}

fn mic_input(raw: &[u8]) -> &[u8] {
    &raw[..raw.len().saturating_sub(MIC_SIZE)]
}

/// Whether a data uplink of this MAC state was processed before
fn has_data_uplinks(state: &MacState) -> bool {
    state
        .recent_uplinks
        .iter()
        .any(|up| up.payload.as_ref().is_some_and(|m| m.mhdr.m_type.is_data_up()))
}

#[allow(clippy::too_many_arguments)]
fn verify_mic(
    version: MacVersion,
    session: &Session,
    mac: &MacPayload,
    up: &UplinkMessage,
    data_rate_index: u8,
    ch_index: u8,
    f_cnt: u32,
    mic: [u8; MIC_SIZE],
) -> bool {
    let keys = &session.keys;
    let payload = mic_input(&up.raw_payload);
    let dev_addr = mac.f_hdr.dev_addr;
    let computed = if version >= MacVersion::V1_1 {
        let conf_f_cnt_down = if mac.f_hdr.f_ctrl.ack {
            session.last_conf_f_cnt_down
        } else {
            0
        };
        compute_uplink_mic(
            &keys.s_nwk_s_int_key,
            &keys.f_nwk_s_int_key,
            conf_f_cnt_down,
            data_rate_index,
            ch_index,
            dev_addr,
            f_cnt,
            payload,
        )
    } else {
        compute_legacy_uplink_mic(&keys.f_nwk_s_int_key, dev_addr, f_cnt, payload)
    };
    computed == mic
}

fn decode_uplink_commands(
    version: MacVersion,
    keys: &SessionKeys,
    dev_addr: DevAddr,
    f_cnt: u32,
    mac: &MacPayload,
) -> Result<Vec<UplinkCommand>> {
    if mac.f_port == Some(0) {
        if !mac.f_hdr.f_opts.is_empty() {
            return Err(Error::DecodePayload("FOpts on port 0".into()));
        }
        let plain = encrypt_payload(&keys.nwk_s_enc_key, dev_addr, f_cnt, Direction::Up, &mac.frm_payload);
        return Ok(parse_uplink_commands(&plain)?);
    }
    if version.encrypt_fopts() && !mac.f_hdr.f_opts.is_empty() {
        let plain = encrypt_fopts(&keys.nwk_s_enc_key, dev_addr, f_cnt, Direction::Up, &mac.f_hdr.f_opts);
        return Ok(parse_uplink_commands(&plain)?);
    }
    Ok(parse_uplink_commands(&mac.f_hdr.f_opts)?)
}

impl Core {
    pub(crate) async fn handle_uplink(&self, mut up: UplinkMessage) -> Result<()> {
        up.correlation_ids.push(new_correlation_id("uplink"));
        let msg = match up.decoded() {
            Ok(msg) => msg.clone(),
            Err(err) => {
                debug!(error = %err, "Drop undecodable uplink");
                self.publish(Event::new(EventName::DropDataUplink, None, &up.correlation_ids).with_error(err));
                return Ok(());
            }
        };
        match (&msg.mhdr.m_type, &msg.payload) {
            (MType::UnconfirmedDataUp | MType::ConfirmedDataUp, Payload::Data(mac)) => {
                self.handle_data_uplink(up, &msg, mac).await
            }
            (MType::JoinRequest, Payload::JoinRequest(jr)) => self.handle_join_request(up, &msg, jr).await,
            (MType::RejoinRequest, _) => {
                self.publish(
                    Event::new(EventName::DropJoinRequest, None, &up.correlation_ids)
                        .with_error(Error::RejoinRequest),
                );
                Ok(())
            }
            (m_type, _) => {
                let err = Error::DecodePayload(format!("{m_type:?} is not an uplink"));
                debug!(error = %err, "Drop downlink frame received as uplink");
                self.publish(Event::new(EventName::DropDataUplink, None, &up.correlation_ids).with_error(err));
                Ok(())
            }
        }
    }

    fn match_data_uplink(
        &self,
        up: &mut UplinkMessage,
        mac: &MacPayload,
        mic: [u8; MIC_SIZE],
        devices: Vec<EndDevice>,
    ) -> Result<Match> {
        if devices.is_empty() {
            return Err(Error::DeviceNotFound);
        }
        let dev_addr = mac.f_hdr.dev_addr;
        for dev in devices {
            let band = match frequency_plan(&dev.frequency_plan_id).and_then(|fp| fp.band()) {
                Ok(band) => band,
                Err(err) => {
                    debug!(device = %dev.ids.key(), error = %err, "Skip device without band");
                    continue;
                }
            };
            let Ok(data_rate_index) = band.uplink_data_rate_index(&up.settings.data_rate) else {
                continue;
            };
            let resets_f_cnt = dev
                .effective_mac_settings(&self.config.default_mac_settings)
                .resets_f_cnt
                .unwrap_or(false);
            let candidates = [
                (dev.session.as_ref(), dev.mac_state.as_ref(), false),
                (dev.pending_session.as_ref(), dev.pending_mac_state.as_ref(), true),
            ];
            let mut found = None;
            for (session, state, pending) in candidates {
                let (Some(session), Some(state)) = (session, state) else {
                    continue;
                };
                if session.dev_addr != dev_addr {
                    continue;
                }
                let ch_index = channel_index(&state.current_parameters.channels, up.settings.frequency);
                let mut f_cnts = vec![full_f_cnt(session.last_f_cnt_up, mac.f_hdr.f_cnt)];
                if resets_f_cnt && f_cnts[0] != mac.f_hdr.f_cnt as u32 {
                    f_cnts.push(mac.f_hdr.f_cnt as u32);
                }
                let verified = f_cnts.into_iter().find(|f_cnt| {
                    verify_mic(
                        state.lorawan_version,
                        session,
                        mac,
                        up,
                        data_rate_index,
                        ch_index,
                        *f_cnt,
                        mic,
                    )
                });
                if let Some(f_cnt) = verified {
                    up.data_rate_index = data_rate_index;
                    up.device_channel_index = ch_index;
                    found = Some((pending, session.keys.session_key_id.clone(), f_cnt));
                    break;
                }
            }
            if let Some((pending_session, session_key_id, f_cnt)) = found {
                return Ok(Match {
                    device: dev,
                    pending_session,
                    session_key_id,
                    f_cnt,
                });
            }
        }
        Err(Error::InvalidMic)
    }

    async fn handle_data_uplink(&self, mut up: UplinkMessage, msg: &Message, mac: &MacPayload) -> Result<()> {
        let devices = self
            .registry
            .range_by_dev_addr(mac.f_hdr.dev_addr, &FieldPath::ALL)
            .await?;
        let matched = match self.match_data_uplink(&mut up, mac, msg.mic, devices) {
            Ok(m) => m,
            Err(err) => {
                debug!(dev_addr = %mac.f_hdr.dev_addr, error = %err, "Drop unmatched data uplink");
                self.publish(Event::new(EventName::DropDataUplink, None, &up.correlation_ids).with_error(err));
                return Ok(());
            }
        };
        let ids = matched.device.ids.clone();
        let key = ids.key();
        self.publish(Event::new(EventName::ReceiveDataUplink, Some(&ids), &up.correlation_ids));

        let fingerprint = Fingerprint::data(mac.f_hdr.dev_addr, matched.f_cnt, msg.mic);
        let window = self.config.deduplication_window();
        let lifetime = window + self.config.cooldown_window();
        if !self
            .deduplicator
            .deduplicate_uplink(&fingerprint, &up.rx_metadata, window, lifetime)
            .await?
        {
            self.publish(
                Event::new(EventName::DropDataUplink, Some(&ids), &up.correlation_ids).with_error(Error::Duplicate),
            );
            return Ok(());
        }
        self.ctx.run(async {
            tokio::time::sleep(window).await;
            Ok(())
        })
        .await?;
        let merged = self.deduplicator.accumulated_metadata(&fingerprint).await?;
        if !merged.is_empty() {
            up.rx_metadata = merged;
        }

        let fp = frequency_plan(&matched.device.frequency_plan_id)?;
        let band = fp.band()?;
        let defaults = &self.config.default_mac_settings;
        let confirmed = msg.mhdr.m_type == MType::ConfirmedDataUp;
        let mut app_ups = Vec::new();
        let res = set_by_id(self.registry.as_ref(), &key, &FieldPath::ALL, |stored| {
            app_ups.clear();
            let mut dev = stored.ok_or(Error::DeviceNotFound)?;
            if matched.pending_session {
                let same = dev
                    .pending_session
                    .as_ref()
                    .is_some_and(|s| s.keys.session_key_id == matched.session_key_id);
                if !same {
                    return Err(Error::DeviceNotFound);
                }
                promote_pending(&mut dev, band)?;
                debug!(device = %key, "Join-accept confirmed, session active");
            }
            let settings = dev.effective_mac_settings(defaults);
            process_data_uplink(&mut dev, &matched, &up, msg, mac, confirmed, band, &settings, &mut app_ups)?;
            Ok(SetOutcome::Set(dev, DATA_UPLINK_SETS.to_vec()))
        })
        .await;

        let dev = match res {
            Ok(Some(dev)) => dev,
            Ok(None) => return Ok(()),
            Err(err @ (Error::Duplicate | Error::OutdatedData { .. } | Error::DeviceNotFound)) => {
                debug!(device = %key, error = %err, "Drop data uplink");
                self.publish(Event::new(EventName::DropDataUplink, Some(&ids), &up.correlation_ids).with_error(err));
                return Ok(());
            }
            Err(err) => {
                warn!(device = %key, error = %err, "Failed to process data uplink");
                self.publish(
                    Event::new(EventName::DropDataUplink, Some(&ids), &up.correlation_ids).with_error(err.clone()),
                );
                return Err(err);
            }
        };
        self.publish(Event::new(EventName::ProcessDataUplink, Some(&dev.ids), &up.correlation_ids));

        let app_ups: Vec<ApplicationUp> = app_ups
            .into_iter()
            .map(|kind| ApplicationUp {
                end_device_ids: dev.ids.clone(),
                correlation_ids: up.correlation_ids.clone(),
                up: kind,
            })
            .collect();
        if let Err(err) = self.application_uplinks.add(app_ups).await {
            warn!(device = %key, error = %err, "Failed to queue application uplinks");
        }
        self.wake_downlink_task(&key).await;
        Ok(())
    }

    async fn handle_join_request(&self, mut up: UplinkMessage, msg: &Message, jr: &JoinRequestPayload) -> Result<()> {
        let dev = match self
            .registry
            .get_by_eui(jr.join_eui, jr.dev_eui, &FieldPath::ALL)
            .await
        {
            Ok(dev) => dev,
            Err(Error::DeviceNotFound) => {
                debug!(join_eui = %jr.join_eui, dev_eui = %jr.dev_eui, "Drop join-request of unknown device");
                self.publish(
                    Event::new(EventName::DropJoinRequest, None, &up.correlation_ids).with_error(Error::DeviceNotFound),
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let ids = dev.ids.clone();
        let key = ids.key();
        let reject = |err: Error, cids: &[String]| {
            self.publish(Event::new(EventName::DropJoinRequest, Some(&ids), cids).with_error(err));
        };
        if !dev.supports_join {
            reject(Error::AbpJoinRequest, &up.correlation_ids);
            return Ok(());
        }
        let fp = frequency_plan(&dev.frequency_plan_id)?;
        let band = fp.band()?;
        up.data_rate_index = match band.uplink_data_rate_index(&up.settings.data_rate) {
            Ok(i) => i,
            Err(err) => {
                reject(err, &up.correlation_ids);
                return Ok(());
            }
        };
        up.device_channel_index = channel_index(&band.default_channels(), up.settings.frequency);
        self.publish(Event::new(EventName::ReceiveJoinRequest, Some(&ids), &up.correlation_ids));

        let fingerprint = Fingerprint::join(jr.join_eui, jr.dev_eui, jr.dev_nonce, msg.mic);
        let window = self.config.deduplication_window();
        let lifetime = window + self.config.cooldown_window();
        if !self
            .deduplicator
            .deduplicate_uplink(&fingerprint, &up.rx_metadata, window, lifetime)
            .await?
        {
            reject(Error::Duplicate, &up.correlation_ids);
            return Ok(());
        }
        let window_ends = Instant::now() + window;

        let mut state = new_mac_state(&dev, &fp, &self.config.default_mac_settings)?;
        let dev_addr = DevAddr::random(self.config.net_id, &mut rand::thread_rng());
        let (downlink_settings, rx_delay) = join_accept_settings(&state);
        let cf_list = band.cf_list(&state.desired_parameters.channels, dev.lorawan_phy_version);
        let mut correlation_ids = up.correlation_ids.clone();
        correlation_ids.push(new_correlation_id("join"));
        let req = JoinRequest {
            raw_payload: up.raw_payload.clone(),
            payload: msg.clone(),
            dev_addr,
            selected_mac_version: dev.lorawan_version,
            net_id: self.config.net_id,
            downlink_settings,
            rx_delay,
            cf_list: cf_list.clone(),
            correlation_ids,
        };
        let ctx = self.ctx.with_correlation_ids(&req.correlation_ids);
        let resp = match self.join.handle_join(&ctx, &ids, &req).await {
            Ok(resp) => resp,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                reject(err, &req.correlation_ids);
                return Ok(());
            }
        };

        ctx.run(async {
            tokio::time::sleep_until(window_ends).await;
            Ok(())
        })
        .await?;
        let merged = self.deduplicator.accumulated_metadata(&fingerprint).await?;
        if !merged.is_empty() {
            up.rx_metadata = merged;
        }
        let mut correlation_ids = req.correlation_ids;
        merge_correlation_ids(&mut correlation_ids, &resp.correlation_ids);
        up.correlation_ids = correlation_ids.clone();

        let mut keys = network_session_keys(&resp.session_keys, dev.lorawan_version);
        keys.app_s_key = resp.session_keys.app_s_key;
        state.queued_join_accept = Some(QueuedJoinAccept {
            payload: resp.raw_payload,
            dev_addr,
            net_id: self.config.net_id,
            request: PendingJoinRequest {
                downlink_settings,
                rx_delay,
                cf_list,
            },
            keys,
            correlation_ids: correlation_ids.clone(),
        });
        state.rx_windows_available = true;
        state.recent_uplinks.push(up);

        set_by_id(self.registry.as_ref(), &key, &[FieldPath::PendingMacState], |stored| {
            let mut dev = stored.ok_or(Error::DeviceNotFound)?;
            dev.pending_mac_state = Some(state.clone());
            Ok(SetOutcome::Set(dev, vec![FieldPath::PendingMacState]))
        })
        .await?;
        self.publish(Event::new(EventName::ProcessJoinRequest, Some(&ids), &correlation_ids));
        self.wake_downlink_task(&key).await;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn process_data_uplink(
    dev: &mut EndDevice,
    matched: &Match,
    up: &UplinkMessage,
    msg: &Message,
    mac: &MacPayload,
    confirmed: bool,
    band: &dyn Band,
    settings: &MacSettings,
    app_ups: &mut Vec<ApplicationUpKind>,
) -> Result<()> {
    let EndDevice {
        session,
        mac_state,
        last_dev_status,
        ..
    } = dev;
    let session = session
        .as_mut()
        .filter(|s| s.keys.session_key_id == matched.session_key_id)
        .ok_or(Error::DeviceNotFound)?;
    let state = mac_state.as_mut().ok_or(Error::MissingField("mac_state"))?;
    let f_cnt = matched.f_cnt;

    let processed = has_data_uplinks(state);
    let reset = settings.resets_f_cnt.unwrap_or(false);
    if processed && f_cnt < session.last_f_cnt_up && !reset {
        return Err(Error::OutdatedData {
            f_cnt,
            last_f_cnt: session.last_f_cnt_up,
        });
    }
    let retransmission = processed && f_cnt == session.last_f_cnt_up;
    if retransmission && !confirmed {
        return Err(Error::Duplicate);
    }

    if !retransmission {
        let pending = std::mem::take(&mut state.pending_requests);
        let cmds = decode_uplink_commands(state.lorawan_version, &session.keys, session.dev_addr, f_cnt, mac)
            .unwrap_or_else(|err| {
                warn!(error = %err, "Failed to decode uplink MAC commands");
                Vec::new()
            });
        handle_uplink_commands(state, last_dev_status, pending, cmds, up, f_cnt)?;

        if let Some(down) = state.pending_application_downlink.take() {
            app_ups.push(if mac.f_hdr.f_ctrl.ack {
                ApplicationUpKind::DownlinkAck(down)
            } else {
                ApplicationUpKind::DownlinkNack(down)
            });
        }
    }

    session.last_f_cnt_up = f_cnt;
    let mut recent = up.clone();
    recent.payload = Some(msg.clone());
    state.recent_uplinks.push(recent);
    state.rx_windows_available = true;

    if mac.f_hdr.f_ctrl.adr && settings.use_adr.unwrap_or(false) {
        adapt_data_rate(state, band, settings.adr_margin.unwrap_or(DEFAULT_ADR_MARGIN))?;
    }

    if !retransmission && mac.f_port.is_some_and(|p| p != 0) {
        app_ups.push(ApplicationUpKind::Uplink(ApplicationUplink {
            session_key_id: session.keys.session_key_id.clone(),
            f_port: mac.f_port,
            f_cnt,
            frm_payload: mac.frm_payload.clone(),
            confirmed,
            rx_metadata: up.rx_metadata.clone(),
            settings: up.settings,
            received_at: up.received_at,
        }));
    }
    Ok(())
}
