//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to runtime events emitted by the scheduler and by
//! activity bodies.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] — event classification and payload metadata
//! - [`Bus`] — thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `ActivityScheduler` (admission, consistency), activity
//!   bodies (guard rejections), `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: the scheduler's subscriber listener (fans out to
//!   [`SubscriberSet`](crate::subscribers::SubscriberSet)).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
