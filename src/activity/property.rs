//! # Per-activity property bag.
//!
//! Properties describe what an activity knows about a device once its
//! preparation succeeded (e.g. the final pose of a motion, used by a
//! successor for blending). The bag is keyed by `(device, property type)`;
//! values are shared type-erased payloads.
//!
//! ## Rules
//! - The bag is populated during `prepare` and marked populated on
//!   admission; [`PropertyBag::wait_populated`] is the future-style access.
//! - Reads before population return `None` (or await, for the future form).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::device::{DeviceId, DeviceRef};

/// Type-erased property payload.
pub type PropertyValue = Arc<dyn Any + Send + Sync>;

/// Thread-safe `(device, type)`-keyed property store.
pub struct PropertyBag {
    map: Mutex<HashMap<(DeviceId, TypeId), PropertyValue>>,
    populated: watch::Sender<bool>,
}

impl PropertyBag {
    /// Creates an empty, unpopulated bag.
    pub fn new() -> Self {
        let (populated, _rx) = watch::channel(false);
        Self {
            map: Mutex::new(HashMap::new()),
            populated,
        }
    }

    /// Stores a property for `device`, replacing an existing one of the same type.
    pub fn insert<T: Any + Send + Sync>(&self, device: &DeviceRef, value: T) {
        self.map
            .lock()
            .expect("property lock")
            .insert((device.id(), TypeId::of::<T>()), Arc::new(value));
    }

    /// Returns the property of type `T` for `device`, if present.
    pub fn get<T: Any + Send + Sync>(&self, device: &DeviceRef) -> Option<Arc<T>> {
        self.get_raw(device.id(), TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Type-erased lookup (used by the combinator search).
    pub fn get_raw(&self, device: DeviceId, type_id: TypeId) -> Option<PropertyValue> {
        self.map
            .lock()
            .expect("property lock")
            .get(&(device, type_id))
            .cloned()
    }

    /// Marks the bag as populated (preparation succeeded).
    pub fn mark_populated(&self) {
        self.populated.send_if_modified(|p| {
            let changed = !*p;
            *p = true;
            changed
        });
    }

    /// Returns true once the bag was marked populated.
    pub fn is_populated(&self) -> bool {
        *self.populated.borrow()
    }

    /// Awaits population of the bag.
    pub async fn wait_populated(&self) {
        let mut rx = self.populated.subscribe();
        // An error means the bag was dropped; nothing left to wait for.
        let _ = rx.wait_for(|p| *p).await;
    }
}

impl Default for PropertyBag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[derive(Debug, PartialEq)]
    struct FinalPose(f64);

    #[derive(Debug, PartialEq)]
    struct GripState(bool);

    #[test]
    fn test_insert_and_typed_get() {
        let bag = PropertyBag::new();
        let arm = Device::new("arm");
        bag.insert(&arm, FinalPose(1.5));

        assert_eq!(bag.get::<FinalPose>(&arm).unwrap().0, 1.5);
        assert!(bag.get::<GripState>(&arm).is_none());
    }

    #[test]
    fn test_keyed_per_device() {
        let bag = PropertyBag::new();
        let arm = Device::new("arm");
        let gripper = Device::new("gripper");
        bag.insert(&arm, FinalPose(1.0));

        assert!(bag.get::<FinalPose>(&arm).is_some());
        assert!(bag.get::<FinalPose>(&gripper).is_none());
    }

    #[tokio::test]
    async fn test_wait_populated_resolves() {
        let bag = Arc::new(PropertyBag::new());
        assert!(!bag.is_populated());
        let waiter = {
            let bag = Arc::clone(&bag);
            tokio::spawn(async move { bag.wait_populated().await })
        };
        bag.mark_populated();
        waiter.await.unwrap();
        assert!(bag.is_populated());
    }
}
