//! Join orchestration
//!
//! A join-request goes to exactly one Join Server: the cluster peer
//! serving the device when there is one, otherwise the Join Server reached
//! through interoperability by NetID.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cluster::{CallContext, Cluster, ClusterRole, EntityIds, InteropClient};
use crate::config::device::{EndDeviceIds, MacVersion};
use crate::device::SessionKeys;
use crate::error::{Error, Result};
use crate::events::{Event, EventData, EventName, EventSink};
use crate::messages::{JoinRequest, JoinResponse};

/// Routes join-requests to a Join Server
pub struct JoinOrchestrator {
    cluster: Arc<dyn Cluster>,
    interop: Option<Arc<dyn InteropClient>>,
    events: Arc<dyn EventSink>,
}

impl JoinOrchestrator {
    /// New orchestrator. Without `interop`, only cluster Join Servers are used.
    pub fn new(
        cluster: Arc<dyn Cluster>,
        interop: Option<Arc<dyn InteropClient>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            cluster,
            interop,
            events,
        }
    }

    fn publish(&self, name: EventName, ids: &EndDeviceIds, req: &JoinRequest, data: EventData) {
        self.events
            .publish(Event::new(name, Some(ids), &req.correlation_ids).with_data(data));
    }

    /// Obtain a join-accept for `req`
    pub async fn handle_join(
        &self,
        ctx: &CallContext,
        ids: &EndDeviceIds,
        req: &JoinRequest,
    ) -> Result<JoinResponse> {
        let entity = EntityIds::Device(ids.clone());
        match self.cluster.get_peer(ctx, ClusterRole::JoinServer, Some(&entity)).await {
            Ok(peer) => {
                let js = peer
                    .join_server()
                    .ok_or_else(|| Error::PeerNotFound(ClusterRole::JoinServer.to_string()))?;
                self.publish(EventName::ClusterJoinAttempt, ids, req, EventData::None);
                let res = async {
                    let creds = self.cluster.auth(ctx).await?;
                    ctx.run(js.handle_join(ctx, &creds, req)).await
                }
                .await;
                match res {
                    Ok(resp) => {
                        self.publish(
                            EventName::ClusterJoinSuccess,
                            ids,
                            req,
                            EventData::JoinResponse(Box::new(resp.without_keys())),
                        );
                        Ok(resp)
                    }
                    Err(err) => {
                        warn!(peer = peer.name(), error = %err, "Cluster Join Server failed to handle join-request");
                        self.publish(EventName::ClusterJoinFail, ids, req, EventData::Error(err.clone()));
                        Err(err)
                    }
                }
            }
            Err(Error::PeerNotFound(_)) => self.handle_interop(ctx, ids, req).await,
            Err(err) => Err(err),
        }
    }

    async fn handle_interop(
        &self,
        ctx: &CallContext,
        ids: &EndDeviceIds,
        req: &JoinRequest,
    ) -> Result<JoinResponse> {
        let Some(interop) = &self.interop else {
            debug!("No cluster or interoperability Join Server");
            return Err(Error::NoJoinServer);
        };
        self.publish(EventName::InteropJoinAttempt, ids, req, EventData::None);
        match ctx.run(interop.handle_join_request(ctx, req.net_id, req)).await {
            Ok(resp) => {
                self.publish(
                    EventName::InteropJoinSuccess,
                    ids,
                    req,
                    EventData::JoinResponse(Box::new(resp.without_keys())),
                );
                Ok(resp)
            }
            Err(err) => {
                warn!(error = %err, "Interoperability Join Server failed to handle join-request");
                self.publish(EventName::InteropJoinFail, ids, req, EventData::Error(err.clone()));
                Err(err)
            }
        }
    }
}

/// Session keys as the server keeps them.
///
/// Without OptNeg, the forwarding key serves every network role. The
/// AppSKey is dropped.
pub fn network_session_keys(keys: &SessionKeys, version: MacVersion) -> SessionKeys {
    let mut keys = keys.without_app_s_key();
    if !version.opt_neg() {
        keys.s_nwk_s_int_key = keys.f_nwk_s_int_key;
        keys.nwk_s_enc_key = keys.f_nwk_s_int_key;
    }
    keys
}
