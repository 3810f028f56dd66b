//! Downlink task queue
//!
//! Holds at most one pending task per device. A consumer pops the earliest
//! due task and runs a handler for it. While the handler runs, the device
//! is in flight: other consumers skip it, and tasks added meanwhile wait
//! until the handler returns.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::device::DeviceKey;
use crate::error::{Error, Result};

/// Work run for a due task
#[async_trait]
pub trait DownlinkTaskHandler: Send + Sync {
    /// Handle the task of `key` that fired at `fired_at`.
    ///
    /// Returns when the device needs another attempt, if at all.
    async fn handle_downlink_task(&self, key: &DeviceKey, fired_at: Instant) -> Result<Option<Instant>>;
}

/// Per-device downlink task queue
#[async_trait]
pub trait DownlinkTaskQueue: Send + Sync {
    /// Schedule a task for `key` at `at`.
    ///
    /// With `replace`, an existing task is moved to `at`. Otherwise the
    /// earlier of the two times is kept.
    async fn add(&self, key: &DeviceKey, at: Instant, replace: bool) -> Result<()>;

    /// Wait for a due task and run `handler` on it.
    ///
    /// Fails with [`Error::Cancelled`] once `cancel` fires.
    async fn pop(&self, cancel: &CancellationToken, handler: &dyn DownlinkTaskHandler) -> Result<()>;
}

#[derive(Default)]
struct Tasks {
    due: HashMap<DeviceKey, Instant>,
    in_flight: HashSet<DeviceKey>,
}

impl Tasks {
    fn insert(&mut self, key: &DeviceKey, at: Instant, replace: bool) {
        match self.due.get_mut(key) {
            Some(existing) if !replace => *existing = (*existing).min(at),
            Some(existing) => *existing = at,
            None => {
                self.due.insert(key.clone(), at);
            }
        }
    }

    fn next(&self) -> Option<(DeviceKey, Instant)> {
        self.due
            .iter()
            .filter(|(k, _)| !self.in_flight.contains(*k))
            .min_by_key(|(_, at)| **at)
            .map(|(k, at)| (k.clone(), *at))
    }
}

/// Task queue kept in memory
#[derive(Default)]
pub struct InMemoryDownlinkTaskQueue {
    tasks: Mutex<Tasks>,
    notify: Notify,
}

impl InMemoryDownlinkTaskQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// When the task of `key` is due, if it has one
    pub fn due_at(&self, key: &DeviceKey) -> Option<Instant> {
        self.tasks.lock().due.get(key).copied()
    }

    async fn take_due(&self, cancel: &CancellationToken) -> Result<(DeviceKey, Instant)> {
        loop {
            let notified = self.notify.notified();
            let wake_at = {
                let mut tasks = self.tasks.lock();
                match tasks.next() {
                    Some((key, at)) if at <= Instant::now() => {
                        tasks.due.remove(&key);
                        tasks.in_flight.insert(key.clone());
                        return Ok((key, at));
                    }
                    Some((_, at)) => Some(at),
                    None => None,
                }
            };
            match wake_at {
                Some(at) => tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = notified => {}
                    _ = tokio::time::sleep_until(at) => {}
                },
                None => tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = notified => {}
                },
            }
        }
    }
}

#[async_trait]
impl DownlinkTaskQueue for InMemoryDownlinkTaskQueue {
    async fn add(&self, key: &DeviceKey, at: Instant, replace: bool) -> Result<()> {
        self.tasks.lock().insert(key, at, replace);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, cancel: &CancellationToken, handler: &dyn DownlinkTaskHandler) -> Result<()> {
        let (key, fired_at) = self.take_due(cancel).await?;
        let res = handler.handle_downlink_task(&key, fired_at).await;
        {
            let mut tasks = self.tasks.lock();
            tasks.in_flight.remove(&key);
            match &res {
                Ok(Some(next)) => tasks.insert(&key, *next, false),
                Ok(None) => {}
                Err(err) => warn!(device = %key, error = %err, "Downlink task failed"),
            }
        }
        self.notify.notify_waiters();
        match res {
            Err(Error::Cancelled) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }
}
