//! The concurrent id → device index.
//!
//! A bounded multi-map from canonical [`DeviceId`] to live devices. All
//! operations take one lock over the whole index, so visitation sees a
//! point-in-time consistent set; visitors run under the lock and must not
//! re-enter the registry with writes.
//!
//! ## Duplicate policy
//!
//! When a device connects with an id that is already present:
//!
//! - [`DuplicatePolicy::Displace`] (default) — the new connection wins. The
//!   prior device is returned from [`Registry::add`] so the manager can close
//!   it with reason `DuplicateConnection`. Load-balancer friendly.
//! - [`DuplicatePolicy::Reject`] — the existing device stays;
//!   `add` fails with `NonUniqueId`. For strict-identity deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Deserialize;

use super::device::Device;
use crate::error::DeviceError;
use crate::id::DeviceId;

/// What [`Registry::add`] does when the id is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    #[default]
    Displace,
    Reject,
}

impl DuplicatePolicy {
    /// Parse the configuration name (`displace` or `reject`).
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "displace" => Some(Self::Displace),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<DeviceId, Vec<Arc<Device>>>,
    total: usize,
}

/// Bounded concurrent multi-map of connected devices.
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Inner>,
    max_devices: u32,
    policy: DuplicatePolicy,
}

impl Registry {
    /// `max_devices == 0` means effectively unbounded (`u32::MAX`).
    #[must_use]
    pub fn new(max_devices: u32, policy: DuplicatePolicy) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_devices,
            policy,
        }
    }

    /// The configured capacity.
    #[must_use]
    pub fn max_devices(&self) -> u32 {
        if self.max_devices == 0 {
            u32::MAX
        } else {
            self.max_devices
        }
    }

    /// Insert `device`, honouring the duplicate policy.
    ///
    /// Returns `(displaced, total)` where `displaced` is the prior device at
    /// the same id under [`DuplicatePolicy::Displace`], and `total` is the
    /// registry size after the insert.
    pub fn add(
        &self,
        device: Arc<Device>,
    ) -> Result<(Option<Arc<Device>>, usize), DeviceError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");

        let occupied = inner
            .devices
            .get(device.id())
            .is_some_and(|slot| !slot.is_empty());
        if occupied {
            let slot = inner.devices.get_mut(device.id()).expect("slot exists");
            if slot.iter().any(|existing| existing.key() == device.key()) {
                return Err(DeviceError::DuplicateKey);
            }
            if self.policy == DuplicatePolicy::Reject {
                return Err(DeviceError::NonUniqueId);
            }
            // Displace: the newest connection takes the slot.
            let displaced = slot.pop();
            let drained = slot.len();
            slot.clear();
            slot.push(device);
            inner.total -= drained;
            let total = inner.total;
            return Ok((displaced, total));
        }

        if inner.total as u64 + 1 > u64::from(self.max_devices()) {
            return Err(DeviceError::TooManyDevices);
        }
        inner
            .devices
            .entry(device.id().clone())
            .or_default()
            .push(device);
        inner.total += 1;
        Ok((None, inner.total))
    }

    /// Look up a device by id; the most recent arrival wins if several share
    /// the id.
    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<Arc<Device>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .devices
            .get(id)
            .and_then(|slot| slot.last().cloned())
    }

    /// Remove exactly `device` (matched by id + key). Returns whether it was
    /// present.
    pub fn remove(&self, device: &Arc<Device>) -> bool {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let Some(slot) = inner.devices.get_mut(device.id()) else {
            return false;
        };
        let before = slot.len();
        slot.retain(|existing| existing.key() != device.key());
        let removed = before - slot.len();
        if slot.is_empty() {
            inner.devices.remove(device.id());
        }
        inner.total -= removed;
        removed > 0
    }

    /// Remove whatever device currently holds `id`.
    pub fn remove_id(&self, id: &DeviceId) -> Option<Arc<Device>> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let mut slot = inner.devices.remove(id)?;
        inner.total -= slot.len();
        slot.pop()
    }

    /// Remove every device matching `pred`, returning the removed set.
    pub fn remove_if(&self, mut pred: impl FnMut(&Arc<Device>) -> bool) -> Vec<Arc<Device>> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let mut removed = Vec::new();
        inner.devices.retain(|_, slot| {
            slot.retain(|device| {
                if pred(device) {
                    removed.push(Arc::clone(device));
                    false
                } else {
                    true
                }
            });
            !slot.is_empty()
        });
        inner.total -= removed.len();
        removed
    }

    /// Visit every device matching `pred`. Returns the visit count.
    pub fn visit_if(
        &self,
        mut pred: impl FnMut(&Arc<Device>) -> bool,
        mut visit: impl FnMut(&Arc<Device>),
    ) -> usize {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut count = 0;
        for device in inner.devices.values().flatten() {
            if pred(device) {
                visit(device);
                count += 1;
            }
        }
        count
    }

    /// Visit every device. Returns the visit count.
    pub fn visit_all(&self, mut visit: impl FnMut(&Arc<Device>)) -> usize {
        self.visit_if(|_| true, |device| visit(device))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convey::Compliance;
    use crate::devices::device::Key;
    use crate::devices::transaction::Transactions;
    use std::collections::HashSet;

    fn device(id: &str) -> Arc<Device> {
        let (device, _rx) = Device::new(
            DeviceId::parse(id).unwrap(),
            Key::random(),
            None,
            Compliance::Missing,
            1,
            Arc::new(Transactions::new()),
        );
        device
    }

    #[test]
    fn test_add_and_get() {
        let registry = Registry::new(10, DuplicatePolicy::Displace);
        let a = device("mac:0000000000aa");
        let (displaced, total) = registry.add(Arc::clone(&a)).unwrap();
        assert!(displaced.is_none());
        assert_eq!(total, 1);
        let found = registry.get(a.id()).unwrap();
        assert_eq!(found.key(), a.key());
        assert!(registry.get(&DeviceId::parse("mac:0000000000bb").unwrap()).is_none());
    }

    #[test]
    fn test_displace_returns_prior_device_and_keeps_count() {
        let registry = Registry::new(10, DuplicatePolicy::Displace);
        let first = device("mac:0000000000aa");
        let second = device("mac:0000000000aa");
        registry.add(Arc::clone(&first)).unwrap();

        let (displaced, total) = registry.add(Arc::clone(&second)).unwrap();
        assert_eq!(displaced.unwrap().key(), first.key());
        assert_eq!(total, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(first.id()).unwrap().key(), second.key());
    }

    #[test]
    fn test_reject_mode_keeps_existing() {
        let registry = Registry::new(10, DuplicatePolicy::Reject);
        let first = device("mac:0000000000aa");
        registry.add(Arc::clone(&first)).unwrap();

        let err = registry.add(device("mac:0000000000aa")).unwrap_err();
        assert_eq!(err, DeviceError::NonUniqueId);
        assert_eq!(registry.get(first.id()).unwrap().key(), first.key());
    }

    #[test]
    fn test_same_key_is_duplicate_key() {
        let registry = Registry::new(10, DuplicatePolicy::Displace);
        let first = device("mac:0000000000aa");
        registry.add(Arc::clone(&first)).unwrap();
        assert_eq!(
            registry.add(Arc::clone(&first)).unwrap_err(),
            DeviceError::DuplicateKey
        );
    }

    #[test]
    fn test_capacity_enforced_and_freed_by_remove() {
        let registry = Registry::new(1, DuplicatePolicy::Displace);
        let first = device("mac:0000000000aa");
        let second = device("mac:0000000000bb");

        let (_, total) = registry.add(Arc::clone(&first)).unwrap();
        assert_eq!(total, 1);
        assert_eq!(
            registry.add(Arc::clone(&second)).unwrap_err(),
            DeviceError::TooManyDevices
        );

        assert!(registry.remove_id(first.id()).is_some());
        let (_, total) = registry.add(second).unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_displacement_not_blocked_by_cap() {
        let registry = Registry::new(1, DuplicatePolicy::Displace);
        registry.add(device("mac:0000000000aa")).unwrap();
        let (displaced, total) = registry.add(device("mac:0000000000aa")).unwrap();
        assert!(displaced.is_some());
        assert_eq!(total, 1);
    }

    #[test]
    fn test_remove_exact_device_only() {
        let registry = Registry::new(10, DuplicatePolicy::Displace);
        let kept = device("mac:0000000000aa");
        let other = device("mac:0000000000aa");
        registry.add(Arc::clone(&kept)).unwrap();

        // `other` shares the id but not the key, and was never added.
        assert!(!registry.remove(&other));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&kept));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_zero_cap_means_unbounded() {
        let registry = Registry::new(0, DuplicatePolicy::Displace);
        assert_eq!(registry.max_devices(), u32::MAX);
        for i in 0..100u64 {
            registry.add(device(DeviceId::from_int(i).as_str())).unwrap();
        }
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_visit_all_sees_exactly_the_current_set() {
        let registry = Registry::new(10, DuplicatePolicy::Displace);
        let ids: Vec<String> = (0..4).map(|i| DeviceId::from_int(i).as_str().to_string()).collect();
        for id in &ids {
            registry.add(device(id)).unwrap();
        }
        registry.remove_id(&DeviceId::parse(&ids[0]).unwrap());

        let mut seen = HashSet::new();
        let count = registry.visit_all(|d| {
            seen.insert(d.id().as_str().to_string());
        });
        assert_eq!(count, 3);
        assert_eq!(seen, ids[1..].iter().cloned().collect());
    }

    #[test]
    fn test_visit_if_and_remove_if() {
        let registry = Registry::new(10, DuplicatePolicy::Displace);
        for i in 0..6u64 {
            registry.add(device(DeviceId::from_int(i).as_str())).unwrap();
        }

        let even = |d: &Arc<Device>| {
            let digits = &d.id().as_str()["mac:".len()..];
            u64::from_str_radix(digits, 16).unwrap() % 2 == 0
        };

        let mut visited = 0;
        assert_eq!(registry.visit_if(even, |_| visited += 1), 3);
        assert_eq!(visited, 3);

        let removed = registry.remove_if(even);
        assert_eq!(removed.len(), 3);
        assert_eq!(registry.len(), 3);
    }
}
