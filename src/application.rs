//! Application uplink queue
//!
//! Messages for Application Servers are queued per application and
//! forwarded in batches by consumers. A batch the Application Server does
//! not take is dropped with a failure event per message; the uplink path
//! never waits for an Application Server.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::{CallContext, Cluster, ClusterRole};
use crate::error::{Error, Result};
use crate::events::{Event, EventData, EventName, EventSink};
use crate::messages::{ApplicationUp, ApplicationUpKind, NsAsHandleUplinkRequest};

/// Queue of messages for Application Servers
#[async_trait]
pub trait ApplicationUplinkQueue: Send + Sync {
    /// Append messages
    async fn add(&self, ups: Vec<ApplicationUp>) -> Result<()>;

    /// Wait for queued messages and take those of the oldest application.
    ///
    /// Fails with [`Error::Cancelled`] once `cancel` fires.
    async fn pop(&self, cancel: &CancellationToken) -> Result<Vec<ApplicationUp>>;
}

/// Queue kept in memory
#[derive(Default)]
pub struct InMemoryApplicationUplinkQueue {
    queue: Mutex<VecDeque<ApplicationUp>>,
    notify: Notify,
}

impl InMemoryApplicationUplinkQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether no message is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_batch(&self) -> Option<Vec<ApplicationUp>> {
        let mut queue = self.queue.lock();
        let app = queue.front()?.end_device_ids.application_id.clone();
        let (batch, rest): (VecDeque<_>, VecDeque<_>) = queue
            .drain(..)
            .partition(|up| up.end_device_ids.application_id == app);
        *queue = rest;
        Some(batch.into())
    }
}

#[async_trait]
impl ApplicationUplinkQueue for InMemoryApplicationUplinkQueue {
    async fn add(&self, ups: Vec<ApplicationUp>) -> Result<()> {
        if ups.is_empty() {
            return Ok(());
        }
        self.queue.lock().extend(ups);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, cancel: &CancellationToken) -> Result<Vec<ApplicationUp>> {
        loop {
            let notified = self.notify.notified();
            if let Some(batch) = self.take_batch() {
                return Ok(batch);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = notified => {}
            }
        }
    }
}

/// Delivers queued messages to the Application Server
pub struct ApplicationForwarder {
    cluster: Arc<dyn Cluster>,
    queue: Arc<dyn ApplicationUplinkQueue>,
    events: Arc<dyn EventSink>,
}

impl ApplicationForwarder {
    /// New forwarder
    pub fn new(
        cluster: Arc<dyn Cluster>,
        queue: Arc<dyn ApplicationUplinkQueue>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            cluster,
            queue,
            events,
        }
    }

    /// Forward batches until `ctx` is cancelled
    pub async fn run(&self, ctx: &CallContext) {
        loop {
            let batch = match self.queue.pop(ctx.cancel_token()).await {
                Ok(batch) => batch,
                Err(Error::Cancelled) => return,
                Err(err) => {
                    warn!(error = %err, "Failed to pop application uplinks");
                    continue;
                }
            };
            if let Err(err) = self.forward(ctx, batch).await {
                if err == Error::Cancelled {
                    return;
                }
                warn!(error = %err, "Failed to forward application uplinks");
            }
        }
    }

    /// Send one batch to the Application Server.
    ///
    /// When the batch cannot be delivered, every message in it is reported
    /// with a forward failure event and dropped.
    pub async fn forward(&self, ctx: &CallContext, ups: Vec<ApplicationUp>) -> Result<()> {
        let req = NsAsHandleUplinkRequest {
            application_ups: ups,
        };
        let peer = match self.send(ctx, &req).await {
            Ok(peer) => peer,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                for up in &req.application_ups {
                    self.events.publish(
                        Event::new(EventName::ForwardApplicationUpFail, Some(&up.end_device_ids), &up.correlation_ids)
                            .with_error(err.clone()),
                    );
                }
                return Err(err);
            }
        };
        debug!(count = req.application_ups.len(), peer = %peer, "Forwarded application uplinks");

        for up in req.application_ups {
            let name = match &up.up {
                ApplicationUpKind::Uplink(_) => EventName::ForwardDataUplink,
                ApplicationUpKind::JoinAccept(_) => EventName::ForwardJoinAccept,
                _ => continue,
            };
            let mut forwarded = up.clone();
            if let ApplicationUpKind::JoinAccept(accept) = &mut forwarded.up {
                accept.app_s_key = None;
            }
            self.events.publish(
                Event::new(name, Some(&up.end_device_ids), &up.correlation_ids)
                    .with_data(EventData::ApplicationUp(Box::new(forwarded))),
            );
        }
        Ok(())
    }

    async fn send(&self, ctx: &CallContext, req: &NsAsHandleUplinkRequest) -> Result<String> {
        let peer = self
            .cluster
            .get_peer(ctx, ClusterRole::ApplicationServer, None)
            .await?;
        let client = peer
            .application_server()
            .ok_or_else(|| Error::PeerNotFound(ClusterRole::ApplicationServer.to_string()))?;
        let creds = self.cluster.auth(ctx).await?;
        ctx.run(client.handle_uplink(ctx, &creds, req)).await?;
        Ok(peer.name().to_string())
    }
}
