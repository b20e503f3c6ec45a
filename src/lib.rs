//! # activisor
//!
//! **Activisor** is an activity scheduling and coordination library for
//! robot-style control systems.
//!
//! Application code builds **activities** (units of device work) bottom-up
//! with combinators, then asks the **scheduler** to admit them. The
//! scheduler decides *when* each activity may start, *which* devices it
//! exclusively controls while running, and *whether* it may seamlessly take
//! over control from a predecessor without interrupting real-time execution.
//! Activities compile into **commands** executed by an external control
//! runtime; this crate ships [`command::sim::SimRuntime`] as the in-memory
//! reference runtime for tests and demos.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐
//!  │  Activity   │  │ Sequential/ │  │ Conditional │   (application builds
//!  │   (leaf)    │  │  Parallel   │  │  /triggers  │    the tree bottom-up)
//!  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘
//!         └────────────────┼────────────────┘
//!                          ▼ begin_execute()
//! ┌────────────────────────────────────────────────────────────┐
//! │  ActivityScheduler (admission & hand-off authority)        │
//! │  - waiting set (conflict check)                            │
//! │  - device → activity assignment map                        │
//! │  - takeover vs. sequencing decision                        │
//! │  - Bus (broadcast events) + SubscriberSet (hooks)          │
//! └──────────────────────────┬─────────────────────────────────┘
//!                            ▼ load / load_after
//! ┌────────────────────────────────────────────────────────────┐
//! │  CommandRuntime (external; SimRuntime as reference)        │
//! │  - executes sealed Commands / transactions                 │
//! │  - fires Condition watchers, honors error rules            │
//! │  - reports READY / RUNNING / TERMINATED / ERROR            │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Lifecycle
//! ```text
//! NEW ──admit──► SCHEDULED ──started──► RUNNING ──┬──► COMPLETED
//!                                                 ├──► MAINTAINING ──► COMPLETED/FAILED
//!                                                 └──► FAILED
//! ```
//! Once the status passes RUNNING it never moves back — the guard is
//! enforced centrally, not per transition.
//!
//! ## Features
//! | Area            | Description                                               | Key types / traits                          |
//! |-----------------|-----------------------------------------------------------|---------------------------------------------|
//! | **Activities**  | Define units of device work, compose them, execute them.  | [`Activity`], [`ActivityOps`], [`RtActivityFn`] |
//! | **Combinators** | Sequence, parallelize, branch, trigger, hold.             | [`Sequential`], [`Parallel`], [`Conditional`], [`WithSubactivities`], [`WithCancelHandler`], [`WithMaintaining`] |
//! | **Scheduling**  | Admission, mutual exclusion, takeover hand-off.           | [`ActivityScheduler`], [`SchedulerConfig`]  |
//! | **Commands**    | Describe real-time programs and their conditions.         | [`Command`], [`Condition`], [`CommandRuntime`] |
//! | **Devices**     | Physical resources under mutual exclusion.                | [`Device`], [`DeviceSet`], [`DeviceState`]  |
//! | **Errors**      | Typed errors for scheduling and execution.                | [`SchedulingError`], [`ActivityError`], [`RtError`] |
//! | **Subscribers** | Hook into admission/lifecycle events.                     | [`Subscribe`], [`SubscriberSet`]            |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use activisor::{
//!     Activity, ActivityOps, ActivityScheduler, Command, Device, DeviceSet, PrepareArgs,
//!     RtActivityFn, command::sim::SimRuntime,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = SimRuntime::new();
//!     let scheduler = ActivityScheduler::builder(runtime.clone()).build();
//!     let arm = Device::new("arm");
//!
//!     let move_home = RtActivityFn::arc(
//!         "move-home",
//!         scheduler.clone(),
//!         DeviceSet::from_iter([Arc::clone(&arm)]),
//!         |cx: PrepareArgs| async move { cx.assemble(Command::atomic("move-home")).await },
//!     );
//!
//!     move_home.begin_execute().await?;
//!     // A real runtime completes the command on its own; the sim is told to.
//!     let id = move_home.body().handle().expect("admitted").command();
//!     runtime.complete(id);
//!     move_home.end_execute().await?;
//!     Ok(())
//! }
//! ```

pub mod command;
mod composed;
mod device;
mod error;
pub mod events;
mod scheduler;
pub mod subscribers;

mod activity;

#[cfg(test)]
mod testkit;

// ---- Public re-exports ----

pub use activity::{
    Activity, ActivityBody, ActivityId, ActivityOps, ActivityRef, ActivityStatus, PrepareArgs,
    Predecessors, Prepared, PropertyBag, PropertyValue, ReadyCommand, RtActivityFn, StatusCell,
    StatusChange,
};
pub use command::{
    Command, CommandHandle, CommandId, CommandRuntime, CommandStatus, Condition, RuntimeRef,
    StateKind, TransactionMember, WatchMode,
};
pub use composed::{
    Branch, Conditional, Parallel, ParallelBuilder, Sequential, SequentialBuilder,
    WithCancelHandler, WithMaintaining, WithSubactivities,
};
pub use device::{Device, DeviceId, DeviceRef, DeviceSet, DeviceState};
pub use error::{ActivityError, RtError, SchedulingError};
pub use events::{Bus, Event, EventKind};
pub use scheduler::{ActivityScheduler, SchedulerBuilder, SchedulerConfig, SchedulerRef};
pub use subscribers::{Subscribe, SubscriberSet};

// Optional: expose a simple built-in logger subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
