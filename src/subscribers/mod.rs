//! # Subscriber fan-out.
//!
//! This module provides the hook mechanism of the scheduler: the
//! [`Subscribe`] trait for event consumers and the [`SubscriberSet`] that
//! fans events out through bounded per-subscriber queues without blocking
//! the publisher.

mod set;
mod subscribe;

#[cfg(feature = "logging")]
mod log;

pub use set::SubscriberSet;
pub use subscribe::Subscribe;

#[cfg(feature = "logging")]
pub use log::LogWriter;
