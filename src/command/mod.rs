//! Command substrate surface: descriptions, conditions, runtime seam.
//!
//! This module groups everything the scheduling layer consumes from the
//! real-time control runtime:
//!
//! ## Contents
//! - [`Condition`], [`StateKind`], [`CommandId`] — boolean condition algebra
//! - [`Command`], [`TransactionMember`], [`Watcher`], [`ErrorRule`] — command
//!   descriptions assembled by activities and combinators
//! - [`CommandRuntime`], [`CommandHandle`], [`CommandStatus`] — the loading
//!   and observation seam to the external runtime
//! - [`sim`] — reference in-memory runtime (tests, demos)

mod command;
mod condition;
mod runtime;
pub mod sim;

pub use command::{
    Command, CommandKind, Effect, ErrorRule, StatusTap, TransactionMember, WatchMode, Watcher,
};
pub use condition::{CommandId, Condition, SignalId, StateKind};
pub use runtime::{CommandHandle, CommandRuntime, CommandStatus, RuntimeRef};
