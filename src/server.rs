//! Network server
//!
//! [`NetworkServer`] ties the components together:
//! - uplinks from Gateway Servers enter through [`NetworkServer::handle_uplink`]
//! - devices are provisioned through the registry operations
//! - downlink task consumers and Application Server forwarders run in the
//!   background between [`NetworkServer::start`] and [`NetworkServer::close`]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::application::{ApplicationForwarder, ApplicationUplinkQueue, InMemoryApplicationUplinkQueue};
use crate::cluster::{CallContext, Cluster, InteropClient};
use crate::config::device::{DeviceKey, EndDeviceIds};
use crate::config::server::Config;
use crate::dedup::{InMemoryUplinkDeduplicator, UplinkDeduplicator};
use crate::device::{EndDevice, FieldPath, Session};
use crate::downlink::scheduler::DownlinkScheduler;
use crate::downlink::task_queue::{DownlinkTaskQueue, InMemoryDownlinkTaskQueue};
use crate::error::{Error, Result};
use crate::events::{Event, EventData, EventName, EventSink};
use crate::join::JoinOrchestrator;
use crate::lorawan::region::frequency_plan;
use crate::matcher::{InMemoryScheduledDownlinkMatcher, ScheduledDownlinkMatcher};
use crate::messages::{ApplicationDownlink, DownlinkMessage, TxAckResult, TxAcknowledgment, UplinkMessage};
use crate::registry::{set_by_id, DeviceRegistry, InMemoryDeviceRegistry, SetOutcome};
use crate::state::new_mac_state;

/// Delay before a failed class B/C downlink is attempted again
pub const DOWNLINK_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Time a background task gets to finish after [`NetworkServer::close`]
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Collaborators of the server
#[derive(Clone)]
pub struct Components {
    /// Cluster membership
    pub cluster: Arc<dyn Cluster>,
    /// Join Servers outside the cluster
    pub interop: Option<Arc<dyn InteropClient>>,
    /// Device registry
    pub registry: Arc<dyn DeviceRegistry>,
    /// Uplink deduplicator
    pub deduplicator: Arc<dyn UplinkDeduplicator>,
    /// Downlink task queue
    pub downlink_tasks: Arc<dyn DownlinkTaskQueue>,
    /// Application uplink queue
    pub application_uplinks: Arc<dyn ApplicationUplinkQueue>,
    /// Scheduled downlink matcher
    pub scheduled_downlinks: Arc<dyn ScheduledDownlinkMatcher>,
    /// Event sink
    pub events: Arc<dyn EventSink>,
}

impl Components {
    /// In-memory stores around `cluster`, without interoperability
    pub fn in_memory(cluster: Arc<dyn Cluster>, events: Arc<dyn EventSink>) -> Self {
        Self {
            cluster,
            interop: None,
            registry: Arc::new(InMemoryDeviceRegistry::new()),
            deduplicator: Arc::new(InMemoryUplinkDeduplicator::new()),
            downlink_tasks: Arc::new(InMemoryDownlinkTaskQueue::new()),
            application_uplinks: Arc::new(InMemoryApplicationUplinkQueue::new()),
            scheduled_downlinks: Arc::new(InMemoryScheduledDownlinkMatcher::new()),
            events,
        }
    }

    /// Use `interop` for Join Servers outside the cluster
    pub fn with_interop(mut self, interop: Arc<dyn InteropClient>) -> Self {
        self.interop = Some(interop);
        self
    }
}

/// State shared by the server and its background tasks
pub(crate) struct Core {
    pub(crate) config: Config,
    pub(crate) registry: Arc<dyn DeviceRegistry>,
    pub(crate) deduplicator: Arc<dyn UplinkDeduplicator>,
    pub(crate) downlink_tasks: Arc<dyn DownlinkTaskQueue>,
    pub(crate) application_uplinks: Arc<dyn ApplicationUplinkQueue>,
    pub(crate) scheduled_downlinks: Arc<dyn ScheduledDownlinkMatcher>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) join: JoinOrchestrator,
    pub(crate) scheduler: DownlinkScheduler,
    pub(crate) forwarder: ApplicationForwarder,
    pub(crate) ctx: CallContext,
}

impl Core {
    pub(crate) fn publish(&self, event: Event) {
        self.events.publish(event);
    }

    /// Wake the downlink task of a device now
    pub(crate) async fn wake_downlink_task(&self, key: &DeviceKey) {
        if let Err(err) = self.downlink_tasks.add(key, Instant::now(), true).await {
            warn!(device = %key, error = %err, "Failed to add downlink task");
        }
    }
}

/// LoRaWAN Network Server
pub struct NetworkServer {
    core: Arc<Core>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkServer {
    /// New server. Nothing runs in the background before [`start`](Self::start).
    pub fn new(config: Config, components: Components) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let Components {
            cluster,
            interop,
            registry,
            deduplicator,
            downlink_tasks,
            application_uplinks,
            scheduled_downlinks,
            events,
        } = components;
        let core = Core {
            join: JoinOrchestrator::new(cluster.clone(), interop, events.clone()),
            scheduler: DownlinkScheduler::new(cluster.clone(), events.clone()),
            forwarder: ApplicationForwarder::new(cluster, application_uplinks.clone(), events.clone()),
            config,
            registry,
            deduplicator,
            downlink_tasks,
            application_uplinks,
            scheduled_downlinks,
            events,
            ctx: CallContext::new(cancel.clone()),
        };
        Ok(Self {
            core: Arc::new(core),
            cancel,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Server configuration
    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Spawn the downlink task consumers and Application Server forwarders
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        let downlink_consumers = self.core.config.downlink_task_queue.num_consumers;
        for id in 0..downlink_consumers {
            let core = self.core.clone();
            let cancel = self.cancel.clone();
            workers.push(tokio::spawn(async move {
                debug!(consumer = id, "Downlink task consumer started");
                loop {
                    match core.downlink_tasks.pop(&cancel, core.as_ref()).await {
                        Ok(()) => {}
                        Err(Error::Cancelled) => break,
                        Err(err) => warn!(consumer = id, error = %err, "Failed to pop downlink task"),
                    }
                }
                debug!(consumer = id, "Downlink task consumer stopped");
            }));
        }
        let forwarders = self.core.config.application_uplink_queue.num_consumers;
        for id in 0..forwarders {
            let core = self.core.clone();
            workers.push(tokio::spawn(async move {
                debug!(consumer = id, "Application uplink forwarder started");
                core.forwarder.run(&core.ctx).await;
                debug!(consumer = id, "Application uplink forwarder stopped");
            }));
        }
        info!(downlink_consumers, forwarders, "Network server started");
    }

    /// Cancel background work and wait for it to stop
    pub async fn close(&self) {
        self.cancel.cancel();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for mut handle in workers {
            tokio::select! {
                _ = &mut handle => {}
                _ = tokio::time::sleep(SHUTDOWN_GRACE) => handle.abort(),
            }
        }
        info!("Network server stopped");
    }

    /// Handle an uplink observation from a Gateway Server.
    ///
    /// Protocol failures never reach the Gateway Server: undecodable or
    /// unmatched frames, bad MICs and duplicates are dropped with an event
    /// and return `Ok`. Other failures are returned.
    #[instrument(skip_all, fields(gateways = up.rx_metadata.len()))]
    pub async fn handle_uplink(&self, up: UplinkMessage) -> Result<()> {
        self.core.handle_uplink(up).await
    }

    /// Create or update a device, writing only `paths`.
    ///
    /// A new device that does not join and already has a session gets a
    /// MAC state derived from its frequency plan.
    #[instrument(skip_all, fields(device = %dev.ids.key()))]
    pub async fn set_end_device(&self, dev: EndDevice, paths: &[FieldPath]) -> Result<EndDevice> {
        let core = &self.core;
        if paths.contains(&FieldPath::FrequencyPlanId) {
            frequency_plan(&dev.frequency_plan_id)?;
        }
        let key = dev.ids.key();
        let mut created = false;
        let mut written = Vec::new();
        let stored = set_by_id(core.registry.as_ref(), &key, &FieldPath::ALL, |stored| {
            written = paths.to_vec();
            created = stored.is_none();
            let next = match stored {
                None => {
                    let mut next = dev.clone();
                    if !next.supports_join && next.session.is_some() && next.mac_state.is_none() {
                        let fp = frequency_plan(&next.frequency_plan_id)?;
                        next.mac_state = Some(new_mac_state(&next, &fp, &core.config.default_mac_settings)?);
                        written.push(FieldPath::MacState);
                    }
                    if let Some(session) = &next.session {
                        next.ids.dev_addr = Some(session.dev_addr);
                        written.push(FieldPath::Ids);
                    }
                    next
                }
                Some(mut stored) => {
                    stored.set_fields(&dev, paths);
                    stored
                }
            };
            written.sort();
            written.dedup();
            Ok(SetOutcome::Set(next, written.clone()))
        })
        .await?
        .ok_or(Error::DeviceNotFound)?;

        let name = if created {
            EventName::CreateEndDevice
        } else {
            EventName::UpdateEndDevice
        };
        core.publish(
            Event::new(name, Some(&stored.ids), &core.ctx.correlation_ids)
                .with_data(EventData::FieldPaths(written)),
        );
        Ok(stored.masked(paths))
    }

    /// Device holding only `paths`
    #[instrument(skip_all, fields(device = %ids.key()))]
    pub async fn get_end_device(&self, ids: &EndDeviceIds, paths: &[FieldPath]) -> Result<EndDevice> {
        self.core.registry.get_by_id(&ids.key(), paths).await
    }

    /// Remove a device
    #[instrument(skip_all, fields(device = %ids.key()))]
    pub async fn delete_end_device(&self, ids: &EndDeviceIds) -> Result<()> {
        self.core.registry.delete(&ids.key()).await
    }

    /// Reset a device to the state it had when provisioned.
    ///
    /// Devices that join lose their sessions and MAC states. Devices that
    /// do not keep their DevAddr and keys with counters reset and a fresh
    /// MAC state.
    #[instrument(skip_all, fields(device = %ids.key()))]
    pub async fn reset_factory_defaults(&self, ids: &EndDeviceIds, paths: &[FieldPath]) -> Result<EndDevice> {
        let core = &self.core;
        let now = SystemTime::now();
        let sets = [
            FieldPath::MacState,
            FieldPath::PendingMacState,
            FieldPath::Session,
            FieldPath::PendingSession,
        ];
        let dev = set_by_id(core.registry.as_ref(), &ids.key(), &FieldPath::ALL, |stored| {
            let mut dev = stored.ok_or(Error::DeviceNotFound)?;
            dev.pending_mac_state = None;
            dev.pending_session = None;
            if dev.supports_join {
                dev.session = None;
                dev.mac_state = None;
            } else {
                let session = dev.session.as_ref().ok_or(Error::MissingField("session"))?;
                dev.session = Some(Session::new(session.dev_addr, session.keys.clone(), now));
                let fp = frequency_plan(&dev.frequency_plan_id)?;
                dev.mac_state = Some(new_mac_state(&dev, &fp, &core.config.default_mac_settings)?);
            }
            Ok(SetOutcome::Set(dev, sets.to_vec()))
        })
        .await?
        .ok_or(Error::DeviceNotFound)?;
        core.publish(
            Event::new(EventName::UpdateEndDevice, Some(&dev.ids), &core.ctx.correlation_ids)
                .with_data(EventData::FieldPaths(sets.to_vec())),
        );
        Ok(dev.masked(paths))
    }

    /// Queue application downlinks for the active session
    #[instrument(skip_all, fields(device = %ids.key(), count = downs.len()))]
    pub async fn push_application_downlinks(
        &self,
        ids: &EndDeviceIds,
        downs: Vec<ApplicationDownlink>,
    ) -> Result<()> {
        let core = &self.core;
        let key = ids.key();
        set_by_id(core.registry.as_ref(), &key, &[FieldPath::Session], |stored| {
            let mut dev = stored.ok_or(Error::DeviceNotFound)?;
            let session = dev.session.as_mut().ok_or(Error::MissingField("session"))?;
            session.queued_application_downlinks.extend(downs.iter().cloned());
            Ok(SetOutcome::Set(dev, vec![FieldPath::Session]))
        })
        .await?;
        core.wake_downlink_task(&key).await;
        Ok(())
    }

    /// Handle a transmission report from a Gateway Server.
    ///
    /// Returns the downlink the report refers to, if it is known.
    #[instrument(skip_all)]
    pub async fn report_tx_acknowledgment(&self, ack: &TxAcknowledgment) -> Result<Option<DownlinkMessage>> {
        let core = &self.core;
        let Some(down) = core.scheduled_downlinks.match_ack(ack).await? else {
            debug!(correlation_ids = ?ack.correlation_ids, "No downlink matches TX acknowledgment");
            return Ok(None);
        };
        let event = match &ack.result {
            TxAckResult::Success => Event::new(
                EventName::TransmissionSuccess,
                down.end_device_ids.as_ref(),
                &down.correlation_ids,
            ),
            result => Event::new(
                EventName::TransmissionFail,
                down.end_device_ids.as_ref(),
                &down.correlation_ids,
            )
            .with_error(Error::Rpc(format!("transmission failed: {result:?}"))),
        };
        core.publish(event);
        Ok(Some(down))
    }
}

impl Drop for NetworkServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
