//! # Activity combinators.
//!
//! Build larger schedulable units out of smaller activities. Every
//! combinator assembles its members' sealed commands into one transaction,
//! so a composed activity is admitted (and handed off) as a single unit.
//!
//! ## Contents
//! - [`Sequential`] — ordered execution with optional continuous hand-off
//! - [`Parallel`] — concurrent execution over disjoint devices
//! - [`Conditional`] — if/else branching over a runtime condition
//! - [`WithSubactivities`] — main activity plus condition-triggered helpers
//! - [`WithCancelHandler`] — main activity plus a handler run on cancellation
//! - [`WithMaintaining`] — main activity plus a device-holding phase

mod cancel_handler;
mod conditional;
mod maintaining;
mod parallel;
mod sequential;
mod subactivities;

pub use cancel_handler::WithCancelHandler;
pub use conditional::{Branch, Conditional};
pub use maintaining::WithMaintaining;
pub use parallel::{Parallel, ParallelBuilder};
pub use sequential::{Sequential, SequentialBuilder};
pub use subactivities::WithSubactivities;
