//! Downlink task handling
//!
//! A due task builds at most one downlink for its device:
//! - a queued join-accept, in the join-accept windows of the join-request
//! - a class A data downlink, in the windows of the last data uplink
//! - a class B or C data downlink, for queued application downlinks
//!
//! Registry updates only happen after a Gateway Server accepted the
//! downlink.

use std::time::SystemTime;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::class::{check_absolute_time, class_a, class_b, class_c, RxWindows};
use crate::config::device::{DeviceClass, DeviceKey, EndDeviceIds, MacSettings, MacVersion};
use crate::crypto::{compute_downlink_mic, encrypt_fopts, Direction};
use crate::device::{EndDevice, FieldPath, Session};
use crate::downlink::paths::{fixed_paths, paths_from_metadata};
use crate::downlink::scheduler::{DownlinkKind, ScheduledDownlink};
use crate::downlink::task_queue::DownlinkTaskHandler;
use crate::error::{Error, Result};
use crate::events::{Event, EventName};
use crate::lorawan::commands::encode_downlink_commands;
use crate::lorawan::mac::{FCtrl, MType, MacPayload, Message, Payload, FHDR, MAX_FOPTS_LEN, MHDR};
use crate::lorawan::phy::{TimingParams, JOIN_ACCEPT_DELAY_1};
use crate::lorawan::region::{frequency_plan, Band, FrequencyPlan};
use crate::messages::{
    new_correlation_id, ApplicationDownlink, ApplicationJoinAccept, ApplicationUp, ApplicationUpKind,
    DownlinkMessage, TxRequest, TxSchedulePriority, UplinkMessage,
};
use crate::registry::{set_by_id, SetOutcome};
use crate::server::{Core, DOWNLINK_RETRY_INTERVAL};
use crate::state::handle::generate_downlink_commands;

/// Application downlinks dropped while building a downlink
type Failed = Vec<(ApplicationDownlink, Error)>;

/// Data downlink ready for scheduling
struct DataDownlink {
    /// Device with the MAC state and session the downlink leaves behind
    device: EndDevice,
    message: Message,
    application_downlink: Option<ApplicationDownlink>,
    priority: TxSchedulePriority,
}

fn is_data_uplink(up: &UplinkMessage) -> bool {
    up.payload.as_ref().is_some_and(|m| m.mhdr.m_type.is_data_up())
}

/// Pick the first application downlink that can go out, dropping the
/// ones that never can.
fn take_application_downlink(
    session: &mut Session,
    version: MacVersion,
    class: DeviceClass,
    max_payload: usize,
    now: SystemTime,
    failed: &mut Failed,
) -> Option<ApplicationDownlink> {
    let last_f_cnt = if version >= MacVersion::V1_1 {
        session.last_a_f_cnt_down
    } else {
        session.last_a_f_cnt_down.max(session.last_n_f_cnt_down)
    };
    while let Some(down) = session.queued_application_downlinks.first() {
        let absolute_time = down.class_b_c.as_ref().and_then(|c| c.absolute_time);
        if class == DeviceClass::A && absolute_time.is_some() {
            return None;
        }
        let err = if down.session_key_id != session.keys.session_key_id {
            Some(Error::UnknownSession)
        } else if last_f_cnt > 0 && down.f_cnt <= last_f_cnt {
            Some(Error::OutdatedData {
                f_cnt: down.f_cnt,
                last_f_cnt,
            })
        } else if down.frm_payload.len() > max_payload {
            Some(Error::ApplicationDownlinkTooLong {
                length: down.frm_payload.len(),
                max: max_payload,
            })
        } else {
            absolute_time.and_then(|at| check_absolute_time(at, now).err())
        };
        let down = session.queued_application_downlinks.remove(0);
        match err {
            Some(err) => {
                debug!(f_cnt = down.f_cnt, error = %err, "Drop application downlink");
                failed.push((down, err));
            }
            None => return Some(down),
        }
    }
    None
}

/// Build the next data downlink of `dev`.
///
/// `max_payload` is the largest MACPayload content the data rate allows;
/// FOpts and FRMPayload share it.
fn build_data_downlink(
    dev: &EndDevice,
    band: &dyn Band,
    settings: &MacSettings,
    class: DeviceClass,
    max_payload: usize,
    now: SystemTime,
    failed: &mut Failed,
) -> Result<Option<DataDownlink>> {
    let mut device = dev.clone();
    let (Some(state), Some(session)) = (device.mac_state.as_mut(), device.session.as_mut()) else {
        return Err(Error::MissingField("session"));
    };
    let version = state.lorawan_version;

    let ack = class == DeviceClass::A
        && state
            .recent_uplinks
            .last()
            .and_then(|up| up.payload.as_ref())
            .is_some_and(|m| m.mhdr.m_type == MType::ConfirmedDataUp);
    let cmds = generate_downlink_commands(
        state,
        band,
        settings,
        session.last_f_cnt_up,
        MAX_FOPTS_LEN.min(max_payload),
    );
    let mut f_opts = encode_downlink_commands(&cmds);

    let app = take_application_downlink(
        session,
        version,
        class,
        max_payload.saturating_sub(f_opts.len()),
        now,
        failed,
    );
    if app.is_none() && (class != DeviceClass::A || (f_opts.is_empty() && !ack)) {
        return Ok(None);
    }

    let f_cnt = match &app {
        Some(down) => {
            session.last_a_f_cnt_down = down.f_cnt;
            if version < MacVersion::V1_1 {
                session.last_n_f_cnt_down = down.f_cnt;
            }
            down.f_cnt
        }
        None if version >= MacVersion::V1_1 => session.last_n_f_cnt_down + 1,
        None => session.last_n_f_cnt_down.max(session.last_a_f_cnt_down) + 1,
    };
    if app.is_none() {
        session.last_n_f_cnt_down = f_cnt;
    }
    if version.encrypt_fopts() && !f_opts.is_empty() {
        f_opts = encrypt_fopts(&session.keys.nwk_s_enc_key, session.dev_addr, f_cnt, Direction::Down, &f_opts);
    }

    let confirmed = app.as_ref().is_some_and(|d| d.confirmed);
    let mut message = Message {
        mhdr: MHDR {
            m_type: if confirmed {
                MType::ConfirmedDataDown
            } else {
                MType::UnconfirmedDataDown
            },
            major: 0,
        },
        payload: Payload::Data(MacPayload {
            f_hdr: FHDR {
                dev_addr: session.dev_addr,
                f_ctrl: FCtrl {
                    adr: settings.use_adr.unwrap_or(false),
                    adr_ack_req: false,
                    ack,
                    f_pending: !session.queued_application_downlinks.is_empty(),
                },
                f_cnt: f_cnt as u16,
                f_opts,
            },
            f_port: app.as_ref().map(|d| d.f_port),
            frm_payload: app.as_ref().map(|d| d.frm_payload.clone()).unwrap_or_default(),
        }),
        mic: [0; 4],
    };
    let conf_f_cnt_up = if version >= MacVersion::V1_1 && ack {
        session.last_f_cnt_up
    } else {
        0
    };
    message.mic = compute_downlink_mic(
        &session.keys.s_nwk_s_int_key,
        conf_f_cnt_up,
        session.dev_addr,
        f_cnt,
        &message.encode_without_mic(),
    );

    if confirmed {
        state.pending_application_downlink = app.clone();
        session.last_conf_f_cnt_down = f_cnt;
    }
    state.rx_windows_available = false;
    let priority = app.as_ref().map_or(TxSchedulePriority::High, |d| d.priority);
    Ok(Some(DataDownlink {
        device,
        message,
        application_downlink: app,
        priority,
    }))
}

impl Core {
    async fn close_rx_windows(&self, key: &DeviceKey, pending: bool) -> Result<()> {
        let path = if pending {
            FieldPath::PendingMacState
        } else {
            FieldPath::MacState
        };
        set_by_id(self.registry.as_ref(), key, &[path], |stored| {
            let Some(mut dev) = stored else {
                return Ok(SetOutcome::Keep);
            };
            let state = if pending {
                dev.pending_mac_state.as_mut()
            } else {
                dev.mac_state.as_mut()
            };
            match state {
                Some(state) if state.rx_windows_available => {
                    state.rx_windows_available = false;
                    Ok(SetOutcome::Set(dev, vec![path]))
                }
                _ => Ok(SetOutcome::Keep),
            }
        })
        .await?;
        Ok(())
    }

    /// Remove dropped application downlinks from the queue and report them
    async fn report_failed(&self, key: &DeviceKey, ids: &EndDeviceIds, failed: Failed) -> Result<()> {
        if failed.is_empty() {
            return Ok(());
        }
        set_by_id(self.registry.as_ref(), key, &[FieldPath::Session], |stored| {
            let Some(mut dev) = stored else {
                return Ok(SetOutcome::Keep);
            };
            let Some(session) = dev.session.as_mut() else {
                return Ok(SetOutcome::Keep);
            };
            session
                .queued_application_downlinks
                .retain(|d| !failed.iter().any(|(f, _)| f == d));
            Ok(SetOutcome::Set(dev, vec![FieldPath::Session]))
        })
        .await?;
        let ups = failed
            .into_iter()
            .map(|(downlink, error)| ApplicationUp {
                end_device_ids: ids.clone(),
                correlation_ids: downlink.correlation_ids.clone(),
                up: ApplicationUpKind::DownlinkFailed { downlink, error },
            })
            .collect();
        self.application_uplinks.add(ups).await
    }

    /// Write the state a scheduled data downlink leaves behind
    async fn commit_data_downlink(
        &self,
        key: &DeviceKey,
        built: &DataDownlink,
        sent: &DownlinkMessage,
        network_initiated: bool,
    ) -> Result<()> {
        let (Some(next_state), Some(next_session)) = (&built.device.mac_state, &built.device.session) else {
            return Err(Error::MissingField("session"));
        };
        set_by_id(
            self.registry.as_ref(),
            key,
            &[FieldPath::MacState, FieldPath::Session],
            |stored| {
                let Some(mut dev) = stored else {
                    return Ok(SetOutcome::Keep);
                };
                let (Some(state), Some(session)) = (dev.mac_state.as_mut(), dev.session.as_mut()) else {
                    return Ok(SetOutcome::Keep);
                };
                if session.keys.session_key_id != next_session.keys.session_key_id {
                    debug!(device = %key, "Session changed while scheduling, skip update");
                    return Ok(SetOutcome::Keep);
                }
                session.last_n_f_cnt_down = session.last_n_f_cnt_down.max(next_session.last_n_f_cnt_down);
                session.last_a_f_cnt_down = session.last_a_f_cnt_down.max(next_session.last_a_f_cnt_down);
                session.last_conf_f_cnt_down = session.last_conf_f_cnt_down.max(next_session.last_conf_f_cnt_down);
                if let Some(down) = &built.application_downlink {
                    session.queued_application_downlinks.retain(|d| d != down);
                }
                state.queued_responses = next_state.queued_responses.clone();
                state.pending_requests = next_state.pending_requests.clone();
                if built.application_downlink.is_some() {
                    state.pending_application_downlink = next_state.pending_application_downlink.clone();
                }
                state.rx_windows_available = false;
                if network_initiated {
                    state.last_network_initiated_downlink_at = Some(SystemTime::now());
                }
                state.recent_downlinks.push(sent.clone());
                Ok(SetOutcome::Set(dev, vec![FieldPath::MacState, FieldPath::Session]))
            },
        )
        .await?;
        Ok(())
    }

    async fn schedule(
        &self,
        kind: DownlinkKind,
        msg: &DownlinkMessage,
    ) -> Result<Option<ScheduledDownlink>> {
        let ctx = self.ctx.with_correlation_ids(&msg.correlation_ids);
        match self.scheduler.schedule(&ctx, kind, msg).await {
            Ok(scheduled) => Ok(Some(scheduled)),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                debug!(error = %err, "Downlink not scheduled");
                Ok(None)
            }
        }
    }

    async fn schedule_join_accept(&self, key: &DeviceKey, dev: EndDevice) -> Result<Option<Instant>> {
        let fp = frequency_plan(&dev.frequency_plan_id)?;
        let band = fp.band()?;
        let Some(state) = dev.pending_mac_state.as_ref() else {
            return Ok(None);
        };
        let (Some(ja), Some(up)) = (state.queued_join_accept.as_ref(), state.recent_uplinks.last()) else {
            return Ok(None);
        };
        let mut correlation_ids = ja.correlation_ids.clone();
        correlation_ids.push(new_correlation_id("downlink"));

        let windows = RxWindows::at(up.received_at, TimingParams::join(), SystemTime::now());
        if !windows.is_open() {
            warn!(device = %key, "Join-accept windows expired");
            self.publish(
                Event::new(EventName::ScheduleJoinAcceptFail, Some(&dev.ids), &correlation_ids)
                    .with_error(Error::RxWindowsExpired),
            );
            self.close_rx_windows(key, true).await?;
            return Ok(None);
        }
        let mut settings = class_a::tx_request(
            band,
            &state.current_parameters,
            up,
            JOIN_ACCEPT_DELAY_1.as_secs() as u8,
            TxSchedulePriority::Highest,
        )?;
        if windows == RxWindows::Rx2Only {
            settings.rx1_data_rate = None;
            settings.rx1_frequency = 0;
        }
        settings.downlink_paths = paths_from_metadata(&up.rx_metadata);
        settings.frequency_plan_id = fp.id.to_string();

        let msg = DownlinkMessage {
            raw_payload: ja.payload.clone(),
            payload: None,
            end_device_ids: Some(dev.ids.clone()),
            settings,
            correlation_ids,
            session_key_id: Some(ja.keys.session_key_id.clone()),
        };
        let Some(scheduled) = self.schedule(DownlinkKind::JoinAccept, &msg).await? else {
            return Ok(None);
        };

        let session_key_id = ja.keys.session_key_id.clone();
        let session = Session::new(ja.dev_addr, ja.keys.without_app_s_key(), SystemTime::now());
        let sets = [FieldPath::PendingMacState, FieldPath::PendingSession];
        set_by_id(self.registry.as_ref(), key, &sets, |stored| {
            let Some(mut dev) = stored else {
                return Ok(SetOutcome::Keep);
            };
            let Some(state) = dev.pending_mac_state.as_mut() else {
                return Ok(SetOutcome::Keep);
            };
            let same = state
                .queued_join_accept
                .as_ref()
                .is_some_and(|ja| ja.keys.session_key_id == session_key_id);
            let Some(queued) = state.queued_join_accept.take().filter(|_| same) else {
                return Ok(SetOutcome::Keep);
            };
            state.pending_join_request = Some(queued.request);
            state.rx_windows_available = false;
            state.recent_downlinks.push(scheduled.message.clone());
            dev.pending_session = Some(session.clone());
            Ok(SetOutcome::Set(dev, sets.to_vec()))
        })
        .await?;

        if let Err(err) = self.scheduled_downlinks.add(scheduled.message).await {
            warn!(device = %key, error = %err, "Failed to store scheduled join-accept");
        }
        let accept = ApplicationUp {
            end_device_ids: dev.ids.clone(),
            correlation_ids: ja.correlation_ids.clone(),
            up: ApplicationUpKind::JoinAccept(ApplicationJoinAccept {
                session_key_id: ja.keys.session_key_id.clone(),
                app_s_key: ja.keys.app_s_key,
                received_at: up.received_at,
            }),
        };
        self.application_uplinks.add(vec![accept]).await?;
        Ok(None)
    }

    /// Try to answer the last data uplink. Returns whether a downlink was
    /// scheduled.
    async fn schedule_class_a(
        &self,
        key: &DeviceKey,
        dev: &EndDevice,
        fp: &FrequencyPlan,
        band: &dyn Band,
        settings: &MacSettings,
    ) -> Result<bool> {
        let Some(state) = dev.mac_state.as_ref() else {
            return Ok(false);
        };
        let Some(up) = state.recent_uplinks.last().filter(|up| is_data_uplink(up)) else {
            return Ok(false);
        };
        let now = SystemTime::now();
        let params = &state.current_parameters;
        let windows = RxWindows::at(up.received_at, TimingParams::data(params.rx1_delay), now);
        let rx2_max = band.data_rate(params.rx2_data_rate_index)?.max_payload;
        let max_payload = match windows {
            RxWindows::Expired => {
                debug!(device = %key, "Class A windows expired");
                return Ok(false);
            }
            RxWindows::Rx2Only => rx2_max,
            RxWindows::Both => {
                let rx1 = band.rx1_data_rate(up.data_rate_index, params.rx1_data_rate_offset)?;
                band.data_rate(rx1)?.max_payload.min(rx2_max)
            }
        };

        let mut failed = Vec::new();
        let built = build_data_downlink(dev, band, settings, DeviceClass::A, max_payload, now, &mut failed);
        self.report_failed(key, &dev.ids, failed).await?;
        let Some(built) = built? else {
            return Ok(false);
        };

        let mut tx = class_a::tx_request(band, params, up, params.rx1_delay, built.priority)?;
        if windows == RxWindows::Rx2Only {
            tx.rx1_data_rate = None;
            tx.rx1_frequency = 0;
        }
        tx.downlink_paths = paths_from_metadata(&up.rx_metadata);
        let Some(scheduled) = self.schedule_data(key, dev, fp, &built, tx, &up.correlation_ids).await? else {
            return Ok(false);
        };
        self.commit_data_downlink(key, &built, &scheduled.message, false).await?;
        self.remember(key, scheduled.message).await;
        Ok(true)
    }

    async fn schedule_class_b_c(
        &self,
        key: &DeviceKey,
        dev: &EndDevice,
        fp: &FrequencyPlan,
        band: &dyn Band,
        settings: &MacSettings,
    ) -> Result<Option<Instant>> {
        let (Some(state), Some(session)) = (dev.mac_state.as_ref(), dev.session.as_ref()) else {
            return Ok(None);
        };
        let class = state.device_class;
        let params = &state.current_parameters;
        let max_payload = match class {
            DeviceClass::B => band.data_rate(params.ping_slot_data_rate_index)?.max_payload,
            _ => band.data_rate(params.rx2_data_rate_index)?.max_payload,
        };
        let now = SystemTime::now();
        let mut failed = Vec::new();
        let built = build_data_downlink(dev, band, settings, class, max_payload, now, &mut failed);
        self.report_failed(key, &dev.ids, failed).await?;
        let Some(built) = built? else {
            return Ok(None);
        };

        let class_b_c = built
            .application_downlink
            .as_ref()
            .and_then(|d| d.class_b_c.clone())
            .unwrap_or_default();
        let mut tx = match class {
            DeviceClass::B => class_b::tx_request(
                band,
                params,
                session.dev_addr,
                state.ping_slot_periodicity,
                class_b_c.absolute_time,
                built.priority,
                now,
            )?,
            _ => class_c::tx_request(band, params, class_b_c.absolute_time, built.priority)?,
        };
        let last_up = state.recent_uplinks.last();
        tx.downlink_paths = if class_b_c.gateways.is_empty() {
            last_up.map(|up| paths_from_metadata(&up.rx_metadata)).unwrap_or_default()
        } else {
            fixed_paths(&class_b_c.gateways)
        };

        let more_queued = !built
            .device
            .session
            .as_ref()
            .is_some_and(|s| s.queued_application_downlinks.is_empty());
        match self.schedule_data(key, dev, fp, &built, tx, &[]).await? {
            Some(scheduled) => {
                self.commit_data_downlink(key, &built, &scheduled.message, true).await?;
                self.remember(key, scheduled.message).await;
                Ok(more_queued.then(|| Instant::now() + scheduled.response.delay))
            }
            None => Ok(Some(Instant::now() + DOWNLINK_RETRY_INTERVAL)),
        }
    }

    /// Hand a built data downlink to the scheduler. Its correlation ids
    /// are those of the uplink it answers, a fresh downlink id and those of
    /// the application downlink it carries.
    async fn schedule_data(
        &self,
        key: &DeviceKey,
        dev: &EndDevice,
        fp: &FrequencyPlan,
        built: &DataDownlink,
        mut tx: TxRequest,
        uplink_correlation_ids: &[String],
    ) -> Result<Option<ScheduledDownlink>> {
        tx.frequency_plan_id = fp.id.to_string();
        let mut correlation_ids = uplink_correlation_ids.to_vec();
        correlation_ids.push(new_correlation_id("downlink"));
        if let Some(down) = &built.application_downlink {
            correlation_ids.extend(down.correlation_ids.iter().cloned());
        }
        let msg = DownlinkMessage {
            raw_payload: built.message.encode(),
            payload: Some(built.message.clone()),
            end_device_ids: Some(dev.ids.clone()),
            settings: tx,
            correlation_ids,
            session_key_id: dev.session.as_ref().map(|s| s.keys.session_key_id.clone()),
        };
        debug!(device = %key, class = ?msg.settings.class, "Schedule data downlink");
        self.schedule(DownlinkKind::Data, &msg).await
    }

    async fn remember(&self, key: &DeviceKey, down: DownlinkMessage) {
        if let Err(err) = self.scheduled_downlinks.add(down).await {
            warn!(device = %key, error = %err, "Failed to store scheduled downlink");
        }
    }

    async fn schedule_data_downlink(&self, key: &DeviceKey, dev: EndDevice) -> Result<Option<Instant>> {
        let Some(state) = dev.mac_state.as_ref() else {
            debug!(device = %key, "No active session");
            return Ok(None);
        };
        let fp = frequency_plan(&dev.frequency_plan_id)?;
        let band = fp.band()?;
        let settings = dev.effective_mac_settings(&self.config.default_mac_settings);

        if state.rx_windows_available {
            let scheduled = self.schedule_class_a(key, &dev, &fp, band, &settings).await?;
            if scheduled {
                return Ok(None);
            }
            self.close_rx_windows(key, false).await?;
        }
        if state.device_class == DeviceClass::A {
            return Ok(None);
        }
        // Re-read: class A handling may have changed counters and the queue.
        let dev = match self.registry.get_by_id(key, &FieldPath::ALL).await {
            Ok(dev) => dev,
            Err(Error::DeviceNotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        self.schedule_class_b_c(key, &dev, &fp, band, &settings).await
    }
}

#[async_trait]
impl DownlinkTaskHandler for Core {
    #[instrument(skip_all, fields(device = %key))]
    async fn handle_downlink_task(&self, key: &DeviceKey, _fired_at: Instant) -> Result<Option<Instant>> {
        let dev = match self.registry.get_by_id(key, &FieldPath::ALL).await {
            Ok(dev) => dev,
            Err(Error::DeviceNotFound) => {
                debug!("Device deleted, drop downlink task");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let join_accept_due = dev
            .pending_mac_state
            .as_ref()
            .is_some_and(|s| s.queued_join_accept.is_some() && s.rx_windows_available);
        if join_accept_due {
            return self.schedule_join_accept(key, dev).await;
        }
        self.schedule_data_downlink(key, dev).await
    }
}
