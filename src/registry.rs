//! Device registry
//!
//! Devices are never locked. Writers read a [`Version`] of the fields they
//! depend on and commit with compare-and-swap; the swap fails if any of
//! those fields changed in between. Two writers touching disjoint fields
//! both succeed.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::device::{DevAddr, DeviceKey, EUI64};
use crate::device::{EndDevice, FieldPath};
use crate::error::{Error, Result};

/// Attempts of a read-modify-write cycle before giving up
pub const CAS_ATTEMPTS: usize = 5;

/// Backoff after the first lost race, doubled after each further one
pub const CAS_BACKOFF: Duration = Duration::from_millis(10);

/// Field versions observed by a read
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Version {
    generation: Option<u64>,
    fields: Vec<(FieldPath, u64)>,
}

impl Version {
    /// Whether the device existed when read
    pub fn exists(&self) -> bool {
        self.generation.is_some()
    }
}

/// Device storage
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Device by key, holding only `paths`
    async fn get_by_id(&self, key: &DeviceKey, paths: &[FieldPath]) -> Result<EndDevice>;

    /// Device by JoinEUI and DevEUI, holding only `paths`
    async fn get_by_eui(&self, join_eui: EUI64, dev_eui: EUI64, paths: &[FieldPath]) -> Result<EndDevice>;

    /// Devices whose active or pending session uses `dev_addr`
    async fn range_by_dev_addr(&self, dev_addr: DevAddr, paths: &[FieldPath]) -> Result<Vec<EndDevice>>;

    /// Device holding `gets`, and the version of those fields
    async fn read(&self, key: &DeviceKey, gets: &[FieldPath]) -> Result<(Option<EndDevice>, Version)>;

    /// Write `sets` of `dev` if the fields in `version` are unchanged.
    ///
    /// Creates the device if it did not exist at `version`. Returns
    /// whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &DeviceKey,
        version: &Version,
        dev: &EndDevice,
        sets: &[FieldPath],
    ) -> Result<bool>;

    /// Remove a device
    async fn delete(&self, key: &DeviceKey) -> Result<()>;
}

/// Change requested by a [`set_by_id`] closure
#[derive(Debug, Clone, PartialEq)]
pub enum SetOutcome {
    /// Write the fields of the device
    Set(EndDevice, Vec<FieldPath>),
    /// Leave the stored device as is
    Keep,
}

/// Read-modify-write a device.
///
/// `f` receives the device holding `gets` and returns the change to
/// apply. The cycle repeats when another writer changed one of `gets`
/// first. Returns the device as written, or as read for
/// [`SetOutcome::Keep`].
pub async fn set_by_id<F>(
    registry: &dyn DeviceRegistry,
    key: &DeviceKey,
    gets: &[FieldPath],
    mut f: F,
) -> Result<Option<EndDevice>>
where
    F: FnMut(Option<EndDevice>) -> Result<SetOutcome> + Send,
{
    let mut backoff = CAS_BACKOFF;
    for attempt in 1..=CAS_ATTEMPTS {
        let (stored, version) = registry.read(key, gets).await?;
        let (dev, sets) = match f(stored.clone())? {
            SetOutcome::Keep => return Ok(stored),
            SetOutcome::Set(dev, sets) => (dev, sets),
        };
        if registry.compare_and_swap(key, &version, &dev, &sets).await? {
            return Ok(Some(dev));
        }
        debug!(device = %key, attempt, "Device changed concurrently, retry");
        if attempt < CAS_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
    Err(Error::RegistryConflict(CAS_ATTEMPTS))
}

struct Record {
    device: EndDevice,
    generation: u64,
    versions: HashMap<FieldPath, u64>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<DeviceKey, Record>,
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Registry kept in memory
#[derive(Default)]
pub struct InMemoryDeviceRegistry {
    inner: Mutex<Inner>,
}

impl InMemoryDeviceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Whether the registry holds no device
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn uses_dev_addr(dev: &EndDevice, dev_addr: DevAddr) -> bool {
    dev.session.as_ref().is_some_and(|s| s.dev_addr == dev_addr)
        || dev.pending_session.as_ref().is_some_and(|s| s.dev_addr == dev_addr)
}

#[async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
    async fn get_by_id(&self, key: &DeviceKey, paths: &[FieldPath]) -> Result<EndDevice> {
        let inner = self.inner.lock();
        let record = inner.records.get(key).ok_or(Error::DeviceNotFound)?;
        Ok(record.device.masked(paths))
    }

    async fn get_by_eui(&self, join_eui: EUI64, dev_eui: EUI64, paths: &[FieldPath]) -> Result<EndDevice> {
        let inner = self.inner.lock();
        inner
            .records
            .values()
            .find(|r| r.device.ids.join_eui == Some(join_eui) && r.device.ids.dev_eui == Some(dev_eui))
            .map(|r| r.device.masked(paths))
            .ok_or(Error::DeviceNotFound)
    }

    async fn range_by_dev_addr(&self, dev_addr: DevAddr, paths: &[FieldPath]) -> Result<Vec<EndDevice>> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .values()
            .filter(|r| uses_dev_addr(&r.device, dev_addr))
            .map(|r| r.device.masked(paths))
            .collect())
    }

    async fn read(&self, key: &DeviceKey, gets: &[FieldPath]) -> Result<(Option<EndDevice>, Version)> {
        let inner = self.inner.lock();
        let Some(record) = inner.records.get(key) else {
            return Ok((None, Version::default()));
        };
        let fields = gets
            .iter()
            .map(|p| (*p, record.versions.get(p).copied().unwrap_or_default()))
            .collect();
        Ok((
            Some(record.device.masked(gets)),
            Version {
                generation: Some(record.generation),
                fields,
            },
        ))
    }

    async fn compare_and_swap(
        &self,
        key: &DeviceKey,
        version: &Version,
        dev: &EndDevice,
        sets: &[FieldPath],
    ) -> Result<bool> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let generation = inner.records.get(key).map(|r| r.generation);
        if generation != version.generation {
            return Ok(false);
        }
        let stamp = inner.tick();
        match inner.records.get_mut(key) {
            Some(record) => {
                let changed = version
                    .fields
                    .iter()
                    .any(|(p, v)| record.versions.get(p).copied().unwrap_or_default() != *v);
                if changed {
                    return Ok(false);
                }
                record.device.set_fields(dev, sets);
                for p in sets {
                    record.versions.insert(*p, stamp);
                }
            }
            None => {
                let mut device = dev.masked(sets);
                device.ids = dev.ids.clone();
                let versions = FieldPath::ALL.iter().map(|p| (*p, stamp)).collect();
                inner.records.insert(
                    key.clone(),
                    Record {
                        device,
                        generation: stamp,
                        versions,
                    },
                );
            }
        }
        Ok(true)
    }

    async fn delete(&self, key: &DeviceKey) -> Result<()> {
        self.inner
            .lock()
            .records
            .remove(key)
            .map(|_| ())
            .ok_or(Error::DeviceNotFound)
    }
}
