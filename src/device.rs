//! # Devices: physical resources under mutual exclusion.
//!
//! A [`Device`] is a physical resource (an arm, a gripper, an I/O group) that
//! can be exclusively controlled by at most one running activity at a time.
//! Devices report an operational state through a watch channel; the scheduler
//! drops its device→activity assignment when a device leaves the operational
//! state.
//!
//! [`DeviceSet`] is the small ordered set the scheduling layer reasons with:
//! affected/controlled sets, superset checks for takeover, difference for
//! "stranded device" reporting.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::watch;

/// Global counter for device identities.
static DEVICE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a device within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

/// Operational state reported by a device driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Device is not reachable or not initialized.
    Offline,
    /// Device is reachable but not released for motion (e.g. safety stop).
    SafeOperational,
    /// Device is fully operational.
    Operational,
}

impl DeviceState {
    /// Returns true if activities may control the device in this state.
    #[inline]
    pub fn is_operational(self) -> bool {
        matches!(self, DeviceState::Operational)
    }
}

/// A physical resource requiring mutual exclusion among activities.
///
/// Cheap to share (`DeviceRef` is an `Arc`); identity is by [`DeviceId`],
/// not by name.
pub struct Device {
    id: DeviceId,
    name: Cow<'static, str>,
    state: watch::Sender<DeviceState>,
}

/// Shared handle to a device.
pub type DeviceRef = Arc<Device>;

impl Device {
    /// Creates a new device, initially [`DeviceState::Operational`].
    pub fn new(name: impl Into<Cow<'static, str>>) -> DeviceRef {
        Self::with_state(name, DeviceState::Operational)
    }

    /// Creates a new device in the given initial state.
    pub fn with_state(name: impl Into<Cow<'static, str>>, state: DeviceState) -> DeviceRef {
        let (tx, _rx) = watch::channel(state);
        Arc::new(Self {
            id: DeviceId(DEVICE_SEQ.fetch_add(1, AtomicOrdering::Relaxed)),
            name: name.into(),
            state: tx,
        })
    }

    /// Returns the device identity.
    #[inline]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Returns the display name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current operational state.
    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    /// Reports a new operational state (driver-side API).
    pub fn set_state(&self, state: DeviceState) {
        self.state.send_if_modified(|s| {
            let changed = *s != state;
            *s = state;
            changed
        });
    }

    /// Subscribes to operational-state changes.
    ///
    /// The receiver has observed the current value; `changed()` resolves on
    /// the next transition.
    pub fn watch_state(&self) -> watch::Receiver<DeviceState> {
        self.state.subscribe()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// An ordered, duplicate-free set of devices.
///
/// Kept sorted by [`DeviceId`] so equality, superset and difference are
/// linear merges; sets in this layer are small (a handful of devices).
#[derive(Clone, Default)]
pub struct DeviceSet {
    devices: Vec<DeviceRef>,
}

impl DeviceSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set from the given devices (duplicates collapse).
    pub fn from_iter(devices: impl IntoIterator<Item = DeviceRef>) -> Self {
        let mut set = Self::new();
        for d in devices {
            set.insert(d);
        }
        set
    }

    /// Inserts a device; returns false if it was already present.
    pub fn insert(&mut self, device: DeviceRef) -> bool {
        match self.devices.binary_search_by_key(&device.id(), |d| d.id()) {
            Ok(_) => false,
            Err(pos) => {
                self.devices.insert(pos, device);
                true
            }
        }
    }

    /// Returns true if the set contains the device.
    pub fn contains(&self, device: &DeviceRef) -> bool {
        self.contains_id(device.id())
    }

    /// Returns true if the set contains a device with the given id.
    pub fn contains_id(&self, id: DeviceId) -> bool {
        self.devices.binary_search_by_key(&id, |d| d.id()).is_ok()
    }

    /// Returns true if every device of `other` is in `self`.
    pub fn is_superset_of(&self, other: &DeviceSet) -> bool {
        other.devices.iter().all(|d| self.contains_id(d.id()))
    }

    /// Returns true if the sets share at least one device.
    pub fn intersects(&self, other: &DeviceSet) -> bool {
        // Iterate over the smaller set.
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small.devices.iter().any(|d| large.contains_id(d.id()))
    }

    /// Returns the first device shared with `other`, if any.
    pub fn first_shared(&self, other: &DeviceSet) -> Option<&DeviceRef> {
        self.devices.iter().find(|d| other.contains_id(d.id()))
    }

    /// Returns the devices of `self` that are not in `other`.
    pub fn difference(&self, other: &DeviceSet) -> DeviceSet {
        DeviceSet {
            devices: self
                .devices
                .iter()
                .filter(|d| !other.contains_id(d.id()))
                .cloned()
                .collect(),
        }
    }

    /// Returns the union of both sets.
    pub fn union(&self, other: &DeviceSet) -> DeviceSet {
        let mut out = self.clone();
        for d in &other.devices {
            out.insert(Arc::clone(d));
        }
        out
    }

    /// Number of devices in the set.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Iterates over the devices in id order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceRef> {
        self.devices.iter()
    }

    /// Returns the device names (for error messages and events).
    pub fn names(&self) -> Vec<Arc<str>> {
        self.devices.iter().map(|d| Arc::from(d.name())).collect()
    }
}

impl fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.devices.iter().map(|d| d.name()))
            .finish()
    }
}

impl FromIterator<DeviceRef> for DeviceSet {
    fn from_iter<T: IntoIterator<Item = DeviceRef>>(iter: T) -> Self {
        DeviceSet::from_iter(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_dedups() {
        let d = Device::new("arm");
        let mut set = DeviceSet::new();
        assert!(set.insert(d.clone()));
        assert!(!set.insert(d.clone()));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_superset_and_difference() {
        let d1 = Device::new("arm");
        let d2 = Device::new("gripper");
        let both = DeviceSet::from_iter([d1.clone(), d2.clone()]);
        let one = DeviceSet::from_iter([d1.clone()]);

        assert!(both.is_superset_of(&one));
        assert!(both.is_superset_of(&both));
        assert!(!one.is_superset_of(&both));

        let stranded = both.difference(&one);
        assert_eq!(stranded.len(), 1);
        assert!(stranded.contains(&d2));
    }

    #[test]
    fn test_intersects_and_first_shared() {
        let d1 = Device::new("arm");
        let d2 = Device::new("gripper");
        let d3 = Device::new("io");
        let a = DeviceSet::from_iter([d1.clone(), d2.clone()]);
        let b = DeviceSet::from_iter([d2.clone(), d3.clone()]);
        let c = DeviceSet::from_iter([d3.clone()]);

        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.first_shared(&b).unwrap().id(), d2.id());
    }

    #[test]
    fn test_state_watch_sees_transition() {
        let d = Device::new("arm");
        let mut rx = d.watch_state();
        assert!(d.state().is_operational());

        d.set_state(DeviceState::Offline);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), DeviceState::Offline);
    }
}
