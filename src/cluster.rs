//! Cluster collaborators
//!
//! The server talks to Gateway Servers, Join Servers and Application
//! Servers through cluster peers. A [`Cluster`] resolves the peer serving
//! a role (optionally for one entity) and issues call credentials. Every
//! call carries a [`CallContext`] that shutdown cancels.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::device::{EndDeviceIds, GatewayIds, NetID};
use crate::error::{Error, Result};
use crate::messages::{
    DownlinkMessage, JoinRequest, JoinResponse, NsAsHandleUplinkRequest, ScheduleDownlinkResponse,
};

/// Cluster role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterRole {
    /// Gateway Server
    GatewayServer,
    /// Join Server
    JoinServer,
    /// Application Server
    ApplicationServer,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClusterRole::GatewayServer => "Gateway Server",
            ClusterRole::JoinServer => "Join Server",
            ClusterRole::ApplicationServer => "Application Server",
        })
    }
}

/// Entity a peer is resolved for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityIds {
    /// Gateway
    Gateway(GatewayIds),
    /// End device
    Device(EndDeviceIds),
}

/// Context of an outbound call
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Correlation identifiers propagated to the peer
    pub correlation_ids: Vec<String>,
    cancel: CancellationToken,
}

impl CallContext {
    /// Context cancelled with `cancel`
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            correlation_ids: Vec::new(),
            cancel,
        }
    }

    /// Same cancellation, other correlation identifiers
    pub fn with_correlation_ids(&self, correlation_ids: &[String]) -> Self {
        Self {
            correlation_ids: correlation_ids.to_vec(),
            cancel: self.cancel.clone(),
        }
    }

    /// Cancellation token
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the context was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut` until it completes or the context is cancelled
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        }
    }
}

/// Credentials for a call to a peer
#[derive(Clone, PartialEq, Eq, Default)]
pub struct CallCredentials {
    /// Bearer token
    pub token: String,
}

impl fmt::Debug for CallCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallCredentials(..)")
    }
}

/// Gateway Server downlink API
#[async_trait]
pub trait GatewayServerClient: Send + Sync {
    /// Schedule a downlink on one of its paths
    async fn schedule_downlink(
        &self,
        ctx: &CallContext,
        creds: &CallCredentials,
        msg: &DownlinkMessage,
    ) -> Result<ScheduleDownlinkResponse>;
}

/// Join Server API
#[async_trait]
pub trait JoinServerClient: Send + Sync {
    /// Handle a join-request
    async fn handle_join(
        &self,
        ctx: &CallContext,
        creds: &CallCredentials,
        req: &JoinRequest,
    ) -> Result<JoinResponse>;
}

/// Application Server API
#[async_trait]
pub trait ApplicationServerClient: Send + Sync {
    /// Handle a batch of application messages
    async fn handle_uplink(
        &self,
        ctx: &CallContext,
        creds: &CallCredentials,
        req: &NsAsHandleUplinkRequest,
    ) -> Result<()>;
}

/// Cluster member
pub trait Peer: Send + Sync {
    /// Peer name
    fn name(&self) -> &str;

    /// Gateway Server API, if the peer has the role
    fn gateway_server(&self) -> Option<Arc<dyn GatewayServerClient>> {
        None
    }

    /// Join Server API, if the peer has the role
    fn join_server(&self) -> Option<Arc<dyn JoinServerClient>> {
        None
    }

    /// Application Server API, if the peer has the role
    fn application_server(&self) -> Option<Arc<dyn ApplicationServerClient>> {
        None
    }
}

/// Peer assembled from role clients
#[derive(Clone, Default)]
pub struct ClusterPeer {
    name: String,
    gateway_server: Option<Arc<dyn GatewayServerClient>>,
    join_server: Option<Arc<dyn JoinServerClient>>,
    application_server: Option<Arc<dyn ApplicationServerClient>>,
}

impl ClusterPeer {
    /// Peer without roles
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add the Gateway Server role
    pub fn with_gateway_server(mut self, client: Arc<dyn GatewayServerClient>) -> Self {
        self.gateway_server = Some(client);
        self
    }

    /// Add the Join Server role
    pub fn with_join_server(mut self, client: Arc<dyn JoinServerClient>) -> Self {
        self.join_server = Some(client);
        self
    }

    /// Add the Application Server role
    pub fn with_application_server(mut self, client: Arc<dyn ApplicationServerClient>) -> Self {
        self.application_server = Some(client);
        self
    }
}

impl fmt::Debug for ClusterPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterPeer").field("name", &self.name).finish()
    }
}

impl Peer for ClusterPeer {
    fn name(&self) -> &str {
        &self.name
    }

    fn gateway_server(&self) -> Option<Arc<dyn GatewayServerClient>> {
        self.gateway_server.clone()
    }

    fn join_server(&self) -> Option<Arc<dyn JoinServerClient>> {
        self.join_server.clone()
    }

    fn application_server(&self) -> Option<Arc<dyn ApplicationServerClient>> {
        self.application_server.clone()
    }
}

/// Cluster membership
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Peer serving `role`, for `ids` when given.
    ///
    /// Fails with [`Error::PeerNotFound`] when no peer serves the role.
    async fn get_peer(
        &self,
        ctx: &CallContext,
        role: ClusterRole,
        ids: Option<&EntityIds>,
    ) -> Result<Arc<dyn Peer>>;

    /// Credentials for calls to peers
    async fn auth(&self, ctx: &CallContext) -> Result<CallCredentials>;
}

struct Member {
    peer: Arc<ClusterPeer>,
    gateways: Vec<GatewayIds>,
}

impl Member {
    fn has_role(&self, role: ClusterRole) -> bool {
        match role {
            ClusterRole::GatewayServer => self.peer.gateway_server.is_some(),
            ClusterRole::JoinServer => self.peer.join_server.is_some(),
            ClusterRole::ApplicationServer => self.peer.application_server.is_some(),
        }
    }
}

/// Cluster with a fixed set of peers.
///
/// Gateway Server peers may be bound to gateways; a peer without bound
/// gateways serves every gateway not bound elsewhere.
#[derive(Default)]
pub struct StaticCluster {
    members: Vec<Member>,
    token: String,
}

impl StaticCluster {
    /// Cluster without peers
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            members: Vec::new(),
            token: token.into(),
        }
    }

    /// Add a peer serving every entity of its roles
    pub fn with_peer(mut self, peer: ClusterPeer) -> Self {
        self.members.push(Member {
            peer: Arc::new(peer),
            gateways: Vec::new(),
        });
        self
    }

    /// Add a Gateway Server peer bound to `gateways`
    pub fn with_gateway_peer(mut self, peer: ClusterPeer, gateways: impl IntoIterator<Item = GatewayIds>) -> Self {
        self.members.push(Member {
            peer: Arc::new(peer),
            gateways: gateways.into_iter().collect(),
        });
        self
    }
}

#[async_trait]
impl Cluster for StaticCluster {
    async fn get_peer(
        &self,
        _ctx: &CallContext,
        role: ClusterRole,
        ids: Option<&EntityIds>,
    ) -> Result<Arc<dyn Peer>> {
        let candidates = self.members.iter().filter(|m| m.has_role(role));
        let member = match ids {
            Some(EntityIds::Gateway(gtw)) => {
                let (bound, unbound): (Vec<_>, Vec<_>) = candidates.partition(|m| !m.gateways.is_empty());
                bound
                    .into_iter()
                    .find(|m| m.gateways.contains(gtw))
                    .or_else(|| unbound.into_iter().next())
            }
            _ => candidates.into_iter().find(|m| m.gateways.is_empty()),
        };
        member
            .map(|m| m.peer.clone() as Arc<dyn Peer>)
            .ok_or_else(|| Error::PeerNotFound(role.to_string()))
    }

    async fn auth(&self, _ctx: &CallContext) -> Result<CallCredentials> {
        Ok(CallCredentials {
            token: self.token.clone(),
        })
    }
}

/// Join Servers outside the cluster, reached by NetID
#[async_trait]
pub trait InteropClient: Send + Sync {
    /// Forward a join-request
    async fn handle_join_request(
        &self,
        ctx: &CallContext,
        net_id: NetID,
        req: &JoinRequest,
    ) -> Result<JoinResponse>;
}
