//! Scheduled downlink matching
//!
//! Gateway Servers report transmission results by correlation identifier.
//! Scheduled downlinks are remembered until their acknowledgment arrives,
//! or until newer downlinks push them out.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::messages::{DownlinkMessage, TxAcknowledgment};

/// Downlinks remembered by the in-memory matcher
pub const MATCHER_CAPACITY: usize = 1024;

/// Store of scheduled downlinks awaiting a transmission acknowledgment
#[async_trait]
pub trait ScheduledDownlinkMatcher: Send + Sync {
    /// Remember a scheduled downlink
    async fn add(&self, down: DownlinkMessage) -> Result<()>;

    /// Take the downlink `ack` reports on
    async fn match_ack(&self, ack: &TxAcknowledgment) -> Result<Option<DownlinkMessage>>;
}

/// Matcher kept in memory
#[derive(Default)]
pub struct InMemoryScheduledDownlinkMatcher {
    downlinks: Mutex<VecDeque<DownlinkMessage>>,
}

impl InMemoryScheduledDownlinkMatcher {
    /// Empty matcher
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduledDownlinkMatcher for InMemoryScheduledDownlinkMatcher {
    async fn add(&self, down: DownlinkMessage) -> Result<()> {
        let mut downlinks = self.downlinks.lock();
        if downlinks.len() == MATCHER_CAPACITY {
            downlinks.pop_front();
        }
        downlinks.push_back(down);
        Ok(())
    }

    async fn match_ack(&self, ack: &TxAcknowledgment) -> Result<Option<DownlinkMessage>> {
        let mut downlinks = self.downlinks.lock();
        let pos = downlinks.iter().position(|down| {
            down.correlation_ids
                .iter()
                .any(|id| ack.correlation_ids.contains(id))
        });
        Ok(pos.and_then(|i| downlinks.remove(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{TxAckResult, TxRequest};

    fn down(cid: &str) -> DownlinkMessage {
        DownlinkMessage {
            raw_payload: vec![0x60],
            payload: None,
            end_device_ids: None,
            settings: TxRequest::default(),
            correlation_ids: vec![cid.to_string()],
            session_key_id: None,
        }
    }

    #[tokio::test]
    async fn test_match_by_correlation_id() {
        let m = InMemoryScheduledDownlinkMatcher::new();
        m.add(down("ns:downlink:1")).await.unwrap();
        m.add(down("ns:downlink:2")).await.unwrap();

        let ack = TxAcknowledgment {
            correlation_ids: vec!["gs:tx:9".into(), "ns:downlink:2".into()],
            result: TxAckResult::Success,
        };
        let matched = m.match_ack(&ack).await.unwrap().unwrap();
        assert_eq!(matched.correlation_ids, vec!["ns:downlink:2"]);
        assert!(m.match_ack(&ack).await.unwrap().is_none());
    }
}
