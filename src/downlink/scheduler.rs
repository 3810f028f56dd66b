//! Downlink scheduling across Gateway Server peers
//!
//! Paths are resolved to peers up front. Consecutive paths served by the
//! same peer form one group and go out in one request. Groups are tried
//! one after the other; the first peer that accepts wins.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cluster::{CallContext, Cluster, ClusterRole, EntityIds, Peer};
use crate::error::{Error, Result};
use crate::events::{Event, EventData, EventName, EventSink};
use crate::messages::{DownlinkMessage, DownlinkPath, ScheduleDownlinkResponse};

/// What a downlink carries, for event naming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkKind {
    /// Join-accept
    JoinAccept,
    /// Data downlink
    Data,
}

impl DownlinkKind {
    fn events(self) -> (EventName, EventName, EventName) {
        match self {
            DownlinkKind::JoinAccept => (
                EventName::ScheduleJoinAcceptAttempt,
                EventName::ScheduleJoinAcceptSuccess,
                EventName::ScheduleJoinAcceptFail,
            ),
            DownlinkKind::Data => (
                EventName::ScheduleDataDownlinkAttempt,
                EventName::ScheduleDataDownlinkSuccess,
                EventName::ScheduleDataDownlinkFail,
            ),
        }
    }
}

/// Downlink accepted by a Gateway Server
#[derive(Debug, Clone)]
pub struct ScheduledDownlink {
    /// Message as sent, with the paths of the accepting peer
    pub message: DownlinkMessage,
    /// Gateway Server answer
    pub response: ScheduleDownlinkResponse,
    /// Name of the accepting peer
    pub peer: String,
}

struct PeerGroup {
    peer: Arc<dyn Peer>,
    paths: Vec<DownlinkPath>,
}

/// Hands downlinks to Gateway Servers
pub struct DownlinkScheduler {
    cluster: Arc<dyn Cluster>,
    events: Arc<dyn EventSink>,
}

impl DownlinkScheduler {
    /// New scheduler
    pub fn new(cluster: Arc<dyn Cluster>, events: Arc<dyn EventSink>) -> Self {
        Self { cluster, events }
    }

    async fn group_paths(&self, ctx: &CallContext, paths: &[DownlinkPath]) -> Vec<PeerGroup> {
        let mut groups: Vec<PeerGroup> = Vec::new();
        for path in paths {
            let entity = EntityIds::Gateway(path.gateway_ids().clone());
            let peer = match self
                .cluster
                .get_peer(ctx, ClusterRole::GatewayServer, Some(&entity))
                .await
            {
                Ok(peer) => peer,
                Err(err) => {
                    debug!(gateway = %path.gateway_ids().gateway_id, error = %err, "Skip path without Gateway Server");
                    continue;
                }
            };
            match groups.last_mut() {
                Some(group) if Arc::ptr_eq(&group.peer, &peer) || group.peer.name() == peer.name() => {
                    group.paths.push(path.clone());
                }
                _ => groups.push(PeerGroup {
                    peer,
                    paths: vec![path.clone()],
                }),
            }
        }
        groups
    }

    /// Schedule `msg` on its downlink paths.
    ///
    /// Fails with [`Error::NoDownlinkPaths`] when no path resolves to a
    /// peer and with [`Error::ScheduleRejected`] when every peer rejects.
    pub async fn schedule(
        &self,
        ctx: &CallContext,
        kind: DownlinkKind,
        msg: &DownlinkMessage,
    ) -> Result<ScheduledDownlink> {
        let (attempt_evt, success_evt, fail_evt) = kind.events();
        let ids = msg.end_device_ids.as_ref();
        let groups = self.group_paths(ctx, &msg.settings.downlink_paths).await;
        if groups.is_empty() {
            self.events.publish(
                Event::new(fail_evt, ids, &msg.correlation_ids).with_error(Error::NoDownlinkPaths),
            );
            return Err(Error::NoDownlinkPaths);
        }

        let mut attempts = 0;
        let mut last = String::new();
        for group in groups {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(gs) = group.peer.gateway_server() else {
                continue;
            };
            let mut attempt = msg.clone();
            attempt.settings.downlink_paths = group.paths;
            attempts += 1;
            self.events.publish(
                Event::new(attempt_evt, ids, &msg.correlation_ids)
                    .with_data(EventData::Downlink(Box::new(attempt.clone()))),
            );

            let res = async {
                let creds = self.cluster.auth(ctx).await?;
                ctx.run(gs.schedule_downlink(ctx, &creds, &attempt)).await
            }
            .await;
            match res {
                Ok(response) => {
                    self.events.publish(
                        Event::new(success_evt, ids, &msg.correlation_ids)
                            .with_data(EventData::ScheduleResponse(response)),
                    );
                    return Ok(ScheduledDownlink {
                        message: attempt,
                        response,
                        peer: group.peer.name().to_string(),
                    });
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    warn!(peer = group.peer.name(), error = %err, "Gateway Server rejected downlink");
                    last = err.to_string();
                }
            }
        }

        let err = if attempts == 0 {
            Error::NoDownlinkPaths
        } else {
            Error::ScheduleRejected { attempts, last }
        };
        self.events
            .publish(Event::new(fail_evt, ids, &msg.correlation_ids).with_error(err.clone()));
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{CallCredentials, ClusterPeer, GatewayServerClient, StaticCluster};
    use crate::config::device::GatewayIds;
    use crate::events::ChannelEventSink;
    use crate::messages::TxRequest;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Gs {
        accept: bool,
        calls: Mutex<Vec<Vec<DownlinkPath>>>,
    }

    impl Gs {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                accept,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GatewayServerClient for Gs {
        async fn schedule_downlink(
            &self,
            _: &CallContext,
            _: &CallCredentials,
            msg: &DownlinkMessage,
        ) -> Result<ScheduleDownlinkResponse> {
            self.calls.lock().push(msg.settings.downlink_paths.clone());
            if !self.accept {
                return Err(Error::Rpc("busy".into()));
            }
            Ok(ScheduleDownlinkResponse {
                delay: Duration::from_millis(800),
                rx1: true,
                rx2: false,
            })
        }
    }

    fn path(gateway_id: &str, token: u8) -> DownlinkPath {
        DownlinkPath::UplinkToken {
            gateway_ids: GatewayIds::new(gateway_id),
            token: vec![token],
        }
    }

    fn message(paths: Vec<DownlinkPath>) -> DownlinkMessage {
        DownlinkMessage {
            raw_payload: vec![0x60; 12],
            payload: None,
            end_device_ids: None,
            settings: TxRequest {
                downlink_paths: paths,
                ..Default::default()
            },
            correlation_ids: vec!["ns:test:1".into()],
            session_key_id: None,
        }
    }

    fn cluster(gs1: &Arc<Gs>, gs2: &Arc<Gs>) -> Arc<StaticCluster> {
        let client = |gs: &Arc<Gs>| gs.clone() as Arc<dyn GatewayServerClient>;
        Arc::new(
            StaticCluster::new("token")
                .with_gateway_peer(ClusterPeer::new("gs-1").with_gateway_server(client(gs1)), [GatewayIds::new("gw-1")])
                .with_gateway_peer(ClusterPeer::new("gs-2").with_gateway_server(client(gs2)), [GatewayIds::new("gw-2")]),
        )
    }

    #[tokio::test]
    async fn test_rejection_moves_to_next_peer_group() {
        let (gs1, gs2) = (Gs::new(false), Gs::new(true));
        let (sink, mut rx) = ChannelEventSink::new();
        let scheduler = DownlinkScheduler::new(cluster(&gs1, &gs2), Arc::new(sink));
        let msg = message(vec![path("gw-1", 1), path("gw-1", 2), path("gw-2", 3)]);

        let scheduled = scheduler
            .schedule(&CallContext::default(), DownlinkKind::Data, &msg)
            .await
            .unwrap();
        assert_eq!(scheduled.peer, "gs-2");
        assert_eq!(scheduled.response.delay, Duration::from_millis(800));
        assert_eq!(*gs1.calls.lock(), vec![vec![path("gw-1", 1), path("gw-1", 2)]]);
        assert_eq!(*gs2.calls.lock(), vec![vec![path("gw-2", 3)]]);
        assert_eq!(scheduled.message.settings.downlink_paths, vec![path("gw-2", 3)]);

        let mut names = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            names.push(evt.name);
        }
        assert_eq!(
            names,
            vec![
                EventName::ScheduleDataDownlinkAttempt,
                EventName::ScheduleDataDownlinkAttempt,
                EventName::ScheduleDataDownlinkSuccess,
            ]
        );
    }

    #[tokio::test]
    async fn test_every_peer_rejecting_fails() {
        let (gs1, gs2) = (Gs::new(false), Gs::new(false));
        let (sink, mut rx) = ChannelEventSink::new();
        let scheduler = DownlinkScheduler::new(cluster(&gs1, &gs2), Arc::new(sink));
        let msg = message(vec![path("gw-2", 1), path("gw-1", 2)]);

        let err = scheduler
            .schedule(&CallContext::default(), DownlinkKind::JoinAccept, &msg)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScheduleRejected { attempts: 2, .. }));
        let mut last = None;
        while let Ok(evt) = rx.try_recv() {
            last = Some(evt);
        }
        let last = last.unwrap();
        assert_eq!(last.name, EventName::ScheduleJoinAcceptFail);
        assert_eq!(last.error(), Some(&err));
    }

    #[tokio::test]
    async fn test_unresolvable_paths_fail_without_calls() {
        let (gs1, gs2) = (Gs::new(true), Gs::new(true));
        let (sink, _rx) = ChannelEventSink::new();
        let scheduler = DownlinkScheduler::new(cluster(&gs1, &gs2), Arc::new(sink));

        let err = scheduler
            .schedule(&CallContext::default(), DownlinkKind::Data, &message(vec![path("gw-9", 1)]))
            .await
            .unwrap_err();
        assert_eq!(err, Error::NoDownlinkPaths);
        assert!(gs1.calls.lock().is_empty());
        assert!(gs2.calls.lock().is_empty());
    }
}
