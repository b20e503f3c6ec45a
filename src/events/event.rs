//! # Runtime events emitted by the scheduler and activities.
//!
//! The [`EventKind`] enum classifies event types across three categories:
//! - **Admission events**: scheduling flow (admitted, conflicts, chaining)
//! - **Lifecycle events**: per-activity status changes and guard rejections
//! - **Consistency events**: assignment invalidation (device state, foreign loads)
//!
//! The [`Event`] struct carries metadata such as timestamps, activity and
//! device names, predecessor names and status values.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically. Use `seq` to restore the exact order when events are
//! delivered out of order.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::activity::ActivityStatus;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `activity`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `activity`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,

    // === Admission events ===
    /// Activity was admitted; its command was loaded or chained.
    ///
    /// Sets:
    /// - `activity`: activity name
    ActivityScheduled,

    /// Two admissions raced for the same device; the later one failed.
    ///
    /// Sets:
    /// - `activity`: rejected activity name
    /// - `device`: the contested device
    SchedulingConflict,

    /// Successor chained onto its predecessor with a takeover hand-off.
    ///
    /// Sets:
    /// - `activity`: successor name
    /// - `predecessor`: predecessor name
    TakeoverChained,

    /// Successor waited for its predecessor's completion, then chained.
    ///
    /// Sets:
    /// - `activity`: successor name
    /// - `predecessor`: predecessor name
    SequencedAfter,

    // === Lifecycle events ===
    /// An admitted activity changed status (hook forwarding).
    ///
    /// Sets:
    /// - `activity`: activity name
    /// - `status`: the new status
    StatusChanged,

    /// A transition that would violate the monotonicity guard was rejected.
    ///
    /// Sets:
    /// - `activity`: activity name
    /// - `status`: the rejected target status
    /// - `reason`: originating operation
    IllegalTransition,

    /// A force-finished predecessor's failure was consumed during admission.
    ///
    /// Sets:
    /// - `activity`: the failed predecessor's name
    /// - `reason`: the failure label
    PredecessorFailureConsumed,

    // === Consistency events ===
    /// A device left the operational state; its assignment was cleared.
    ///
    /// Sets:
    /// - `device`: device name
    DeviceNotOperational,

    /// A command not originated by the scheduler was loaded; all assignments
    /// were invalidated.
    ///
    /// Sets:
    /// - `reason`: the foreign command id
    ForeignCommandLoaded,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Name of the activity, if applicable.
    pub activity: Option<Arc<str>>,
    /// Name of the device, if applicable.
    pub device: Option<Arc<str>>,
    /// Name of the predecessor activity, if applicable.
    pub predecessor: Option<Arc<str>>,
    /// Status value carried by lifecycle events.
    pub status: Option<ActivityStatus>,
    /// Human-readable reason (errors, overflow details, etc.).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next
    /// sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            activity: None,
            device: None,
            predecessor: None,
            status: None,
            reason: None,
        }
    }

    /// Attaches an activity name.
    #[inline]
    pub fn with_activity(mut self, activity: impl Into<Arc<str>>) -> Self {
        self.activity = Some(activity.into());
        self
    }

    /// Attaches a device name.
    #[inline]
    pub fn with_device(mut self, device: impl Into<Arc<str>>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Attaches a predecessor name.
    #[inline]
    pub fn with_predecessor(mut self, predecessor: impl Into<Arc<str>>) -> Self {
        self.predecessor = Some(predecessor.into());
        self
    }

    /// Attaches a status value.
    #[inline]
    pub fn with_status(mut self, status: ActivityStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_activity(subscriber)
            .with_reason(reason)
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_activity(subscriber)
            .with_reason(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_is_monotonic() {
        let a = Event::new(EventKind::ActivityScheduled);
        let b = Event::new(EventKind::ActivityScheduled);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_builders_set_fields() {
        let ev = Event::new(EventKind::TakeoverChained)
            .with_activity("pick")
            .with_predecessor("approach")
            .with_device("arm");
        assert_eq!(ev.activity.as_deref(), Some("pick"));
        assert_eq!(ev.predecessor.as_deref(), Some("approach"));
        assert_eq!(ev.device.as_deref(), Some("arm"));
        assert!(ev.status.is_none());
    }
}
