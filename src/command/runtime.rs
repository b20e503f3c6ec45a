//! # Runtime seam: loading and observing commands.
//!
//! [`CommandRuntime`] is the boundary to the external real-time control
//! runtime: it loads sealed [`Command`]s (optionally chained after a
//! predecessor handle for hand-off) and reports loads so the scheduler can
//! detect out-of-band execution.
//!
//! A [`CommandHandle`] is the execution-side view of one loaded command:
//! its id, a watch stream of [`CommandStatus`], and a cancellation token
//! the runtime observes.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::command::command::Command;
use crate::command::condition::CommandId;
use crate::error::{ActivityError, RtError};

/// Asynchronous status of a loaded command.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandStatus {
    /// Loaded, not yet started.
    Ready,
    /// Executing.
    Running,
    /// Finished; `error` is set when the command terminated abnormally.
    Terminated {
        /// Terminal error, if any.
        error: Option<RtError>,
    },
    /// Failed before or outside normal termination (e.g. load rejected
    /// mid-flight by the runtime).
    Error {
        /// The failure.
        error: RtError,
    },
}

impl CommandStatus {
    /// Returns true for `Terminated` and `Error`.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            CommandStatus::Terminated { .. } | CommandStatus::Error { .. }
        )
    }

    /// Returns the terminal error, if this status carries one.
    pub fn error(&self) -> Option<&RtError> {
        match self {
            CommandStatus::Terminated { error } => error.as_ref(),
            CommandStatus::Error { error } => Some(error),
            _ => None,
        }
    }
}

/// Execution-side view of one loaded command.
#[derive(Clone)]
pub struct CommandHandle {
    command: CommandId,
    status: watch::Receiver<CommandStatus>,
    cancel: CancellationToken,
}

impl CommandHandle {
    /// Creates a handle (runtime-side constructor).
    pub fn new(
        command: CommandId,
        status: watch::Receiver<CommandStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            command,
            status,
            cancel,
        }
    }

    /// Identity of the loaded command.
    pub fn command(&self) -> CommandId {
        self.command
    }

    /// Current status.
    pub fn status(&self) -> CommandStatus {
        self.status.borrow().clone()
    }

    /// A fresh status subscription (current value already observed).
    pub fn watch_status(&self) -> watch::Receiver<CommandStatus> {
        self.status.clone()
    }

    /// Requests cancellation of the command. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token the runtime observes for cancellation.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Awaits a final status and returns its error, if any.
    pub async fn wait_final(&self) -> Option<RtError> {
        let mut rx = self.status.clone();
        loop {
            if rx.borrow().is_final() {
                return rx.borrow().error().cloned();
            }
            if rx.changed().await.is_err() {
                // Runtime dropped the channel; report what we last saw.
                return rx.borrow().error().cloned();
            }
        }
    }
}

impl std::fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("command", &self.command)
            .field("status", &self.status())
            .finish()
    }
}

/// Boundary to the external control runtime.
#[async_trait]
pub trait CommandRuntime: Send + Sync + 'static {
    /// Loads and starts a sealed command.
    async fn load(&self, command: Command) -> Result<CommandHandle, ActivityError>;

    /// Loads a sealed command chained after `after`: it starts as soon as the
    /// predecessor terminates, or earlier when the predecessor signals
    /// takeover-allowed (in which case the predecessor is gracefully stopped).
    async fn load_after(
        &self,
        command: Command,
        after: &CommandHandle,
    ) -> Result<CommandHandle, ActivityError>;

    /// Subscribes to the ids of all commands loaded through this runtime,
    /// including loads the subscriber did not originate.
    fn observe_loads(&self) -> broadcast::Receiver<CommandId>;
}

/// Shared handle to a command runtime.
pub type RuntimeRef = Arc<dyn CommandRuntime>;
