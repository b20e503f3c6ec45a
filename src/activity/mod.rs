//! # Activity abstractions: lifecycle, state machine, properties.
//!
//! This module provides the core activity types:
//! - [`Activity`] — trait for schedulable units of work
//! - [`ActivityOps`] — execution operations on [`ActivityRef`] handles
//! - [`ActivityBody`] — shared core (status, devices, declarations, properties)
//! - [`ActivityStatus`] / [`StatusCell`] — phase order with the central
//!   monotonicity guard
//! - [`RtActivityFn`] — function-backed leaf activity
//! - [`Prepared`] / [`Predecessors`] — the preparation protocol

#[allow(clippy::module_inception)]
mod activity;
mod body;
mod property;
mod state;
mod status;

pub use activity::{
    Activity, ActivityOps, ActivityRef, PrepareArgs, Predecessors, Prepared, ReadyCommand,
    RtActivityFn,
};
pub use body::{ActivityBody, ActivityId};
pub use property::{PropertyBag, PropertyValue};
pub use status::{ActivityStatus, StatusCell, StatusChange};
