//! Error types used by the activisor scheduling layer and activities.
//!
//! This module defines three main types:
//!
//! - [`SchedulingError`] — errors raised by the admission/coordination protocol itself.
//! - [`ActivityError`] — errors raised by the execution of an individual activity.
//! - [`RtError`] — an error reported by the real-time command substrate, classified
//!   by a stable class string so declared/propagated/ignored rules can match on it.
//!
//! The enums provide helper methods (`as_label`, `as_message`) for logging/metrics.

use std::sync::Arc;

use thiserror::Error;

use crate::activity::ActivityStatus;

/// # Errors produced by the scheduling/admission protocol.
///
/// These represent failures in the coordination layer: two admissions racing
/// for the same device, a successor that would strand devices of a maintaining
/// predecessor, or API calls made in the wrong lifecycle phase.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum SchedulingError {
    /// Another activity currently inside `schedule()` claims an overlapping device.
    ///
    /// Surfaced immediately to the caller; never retried by the scheduler.
    #[error("activity '{activity}' conflicts on device '{device}' with a concurrent admission")]
    Conflict {
        /// Name of the activity whose admission failed.
        activity: Arc<str>,
        /// The first shared device found.
        device: Arc<str>,
    },

    /// A MAINTAINING predecessor cannot be fully taken over by the successor's
    /// controlled-device set; the named devices would be left without a controller.
    #[error("illegal successor: devices {devices:?} of a maintaining predecessor are not taken over")]
    IllegalSuccessor {
        /// Devices of the predecessor that the successor does not control.
        devices: Vec<Arc<str>>,
    },

    /// A predecessor activity ended FAILED; its stored error is wrapped here and
    /// surfaced on the new activity's admission path.
    #[error("previous activity failed: {source}")]
    PreviousActivityFailed {
        #[source]
        source: Box<ActivityError>,
    },

    /// A lifecycle operation was called in a status that does not permit it.
    ///
    /// This is a programming error and is surfaced fail-fast, never ignored.
    #[error("operation '{operation}' is illegal in status {status:?}")]
    IllegalState {
        /// The operation that was attempted (e.g. `begin_execute`).
        operation: &'static str,
        /// The status the activity was in.
        status: ActivityStatus,
    },
}

impl SchedulingError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SchedulingError::Conflict { .. } => "scheduling_conflict",
            SchedulingError::IllegalSuccessor { .. } => "illegal_successor",
            SchedulingError::PreviousActivityFailed { .. } => "previous_activity_failed",
            SchedulingError::IllegalState { .. } => "illegal_state",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Errors produced by activity execution.
///
/// Either a scheduling failure bubbled up through `begin_execute`, or a
/// substrate error ([`RtError`]) that terminated the activity's command.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ActivityError {
    /// Admission/coordination failure.
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    /// The real-time command terminated with an error.
    #[error("command failed: {error}")]
    Runtime {
        /// The substrate error, possibly aggregating several member failures.
        error: RtError,
    },

    /// A declaration was attempted after the activity's command was sealed.
    #[error("activity declarations are sealed")]
    Sealed,

    /// The command description was rejected by the runtime (e.g. unsealed,
    /// or chained after an unknown handle).
    #[error("command rejected by runtime: {reason}")]
    Rejected {
        /// Why the runtime refused to load the command.
        reason: Arc<str>,
    },
}

impl ActivityError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ActivityError::Scheduling(e) => e.as_label(),
            ActivityError::Runtime { .. } => "command_failed",
            ActivityError::Sealed => "declarations_sealed",
            ActivityError::Rejected { .. } => "command_rejected",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }

    /// Shorthand for wrapping a substrate error.
    pub fn runtime(error: RtError) -> Self {
        ActivityError::Runtime { error }
    }
}

/// An error reported by the command substrate.
///
/// `class` is a stable identifier that declared/propagated/ignored exception
/// rules match on; `message` is free-form detail. When several members of a
/// transaction fail in the same cycle, the failures are merged into one error
/// whose `causes` carry the full list for inspection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{class}: {message}")]
pub struct RtError {
    /// Stable error class, matched by exception-declaration rules.
    pub class: Arc<str>,
    /// Human-readable detail.
    pub message: Arc<str>,
    /// Member errors merged into this one (empty for plain errors).
    pub causes: Vec<RtError>,
}

impl RtError {
    /// Class assigned to merged multi-member failures.
    pub const AGGREGATE_CLASS: &'static str = "aggregate";

    /// Creates a plain substrate error.
    pub fn new(class: impl Into<Arc<str>>, message: impl Into<Arc<str>>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Merges several errors into one carrying the full list.
    ///
    /// A single-element list is returned unchanged.
    pub fn aggregate(mut errors: Vec<RtError>) -> Self {
        if errors.len() == 1 {
            return errors.pop().expect("len checked");
        }
        let message = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            class: Self::AGGREGATE_CLASS.into(),
            message: message.into(),
            causes: errors,
        }
    }

    /// Returns true if this error (or any merged cause) has the given class.
    pub fn has_class(&self, class: &str) -> bool {
        self.class.as_ref() == class || self.causes.iter().any(|c| c.has_class(class))
    }
}
