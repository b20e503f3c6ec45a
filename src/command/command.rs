//! # Command descriptions.
//!
//! A [`Command`] describes one opaque real-time program for a
//! [`CommandRuntime`](crate::command::CommandRuntime): an atomic operation, a
//! fixed-duration wait, or a transaction composing member commands that are
//! started/stopped/cancelled based on [`Condition`]s.
//!
//! A command accumulates watchers (run an effect when a condition fires),
//! error rules (raise/map/ignore substrate errors) and condition overrides,
//! then is **sealed**. A sealed command is immutable; runtimes only accept
//! sealed commands.
//!
//! ## Rules
//! - Mutation after `seal()` fails with [`ActivityError::Sealed`].
//! - Watcher and error-rule order is preserved (rules fire in declaration order).
//! - Member commands must themselves be sealed before being added.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::command::condition::{CommandId, Condition, StateKind};
use crate::command::runtime::CommandStatus;
use crate::error::{ActivityError, RtError};

/// Side effect run by a watcher. Must be cheap and non-blocking; runtimes
/// invoke effects inline on their driver loop.
pub type Effect = Arc<dyn Fn() + Send + Sync>;

/// Callback observing the local status of one command node (READY on load,
/// RUNNING on start, TERMINATED/ERROR at the end).
pub type StatusTap = Arc<dyn Fn(CommandStatus) + Send + Sync>;

/// When a watcher's effect runs relative to its condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchMode {
    /// The first time the condition becomes true, then never again.
    Once,
    /// On every rising edge.
    OnEntry,
    /// On every falling edge.
    OnExit,
}

/// A (condition, mode, effect) triple installed on a command.
#[derive(Clone)]
pub struct Watcher {
    /// The observed condition.
    pub when: Condition,
    /// Edge semantics.
    pub mode: WatchMode,
    /// Effect to run.
    pub effect: Effect,
}

/// Declarative error handling installed on a command.
#[derive(Clone)]
pub enum ErrorRule {
    /// Terminate the command with `error` the first time `when` becomes true.
    Raise {
        /// Triggering condition.
        when: Condition,
        /// Error to terminate with.
        error: RtError,
    },
    /// Replace any error whose class is `from` with `to`.
    Map {
        /// Matched class.
        from: Arc<str>,
        /// Replacement error.
        to: RtError,
    },
    /// Suppress any error whose class is `class`; the command finishes
    /// as if it had completed.
    Ignore {
        /// Suppressed class.
        class: Arc<str>,
    },
}

/// A member of a transaction with its start/stop/cancel wiring.
pub struct TransactionMember {
    /// The member command (sealed).
    pub command: Command,
    /// Start together with the transaction.
    pub auto_start: bool,
    /// Start the first time this condition becomes true.
    pub start_when: Option<Condition>,
    /// Gracefully stop (complete early) when this condition first fires.
    pub stop_when: Option<Condition>,
    /// Cancel the member when this condition first fires.
    pub cancel_when: Option<Condition>,
    /// Permit starting even while the transaction is cancelling
    /// (cancel handlers need this; everything else defaults to false).
    pub start_during_cancel: bool,
}

impl TransactionMember {
    /// Member started together with the transaction.
    pub fn auto(command: Command) -> Self {
        Self {
            command,
            auto_start: true,
            start_when: None,
            stop_when: None,
            cancel_when: None,
            start_during_cancel: false,
        }
    }

    /// Member started the first time `when` becomes true.
    pub fn started_when(command: Command, when: Condition) -> Self {
        Self {
            command,
            auto_start: false,
            start_when: Some(when),
            stop_when: None,
            cancel_when: None,
            start_during_cancel: false,
        }
    }

    /// Adds a graceful-stop condition.
    pub fn stop_when(mut self, when: Condition) -> Self {
        self.stop_when = Some(when);
        self
    }

    /// Adds a cancel condition.
    pub fn cancel_when(mut self, when: Condition) -> Self {
        self.cancel_when = Some(when);
        self
    }

    /// Allows the member to start while the transaction is cancelling.
    pub fn allow_start_during_cancel(mut self) -> Self {
        self.start_during_cancel = true;
        self
    }
}

/// What a command does.
pub enum CommandKind {
    /// One opaque real-time operation on the runtime.
    Atomic,
    /// Completes after `duration` (`None` = completes immediately).
    Wait {
        /// Time to wait.
        duration: Option<Duration>,
    },
    /// Composite of member commands.
    Transaction {
        /// Members in declaration order.
        members: Vec<TransactionMember>,
    },
}

/// Description of one real-time program.
pub struct Command {
    id: CommandId,
    name: Cow<'static, str>,
    kind: CommandKind,
    watchers: Vec<Watcher>,
    error_rules: Vec<ErrorRule>,
    cancel_when: Condition,
    stop_when: Condition,
    done_override: Option<Condition>,
    takeover_override: Option<Condition>,
    status_tap: Option<StatusTap>,
    sealed: bool,
}

impl Command {
    fn new(name: impl Into<Cow<'static, str>>, kind: CommandKind) -> Self {
        Self {
            id: CommandId::next(),
            name: name.into(),
            kind,
            watchers: Vec::new(),
            error_rules: Vec::new(),
            cancel_when: Condition::False,
            stop_when: Condition::False,
            done_override: None,
            takeover_override: None,
            status_tap: None,
            sealed: false,
        }
    }

    /// Creates an atomic command.
    pub fn atomic(name: impl Into<Cow<'static, str>>) -> Self {
        Self::new(name, CommandKind::Atomic)
    }

    /// Creates a wait command; `None` completes immediately (no-op).
    pub fn wait(name: impl Into<Cow<'static, str>>, duration: Option<Duration>) -> Self {
        Self::new(name, CommandKind::Wait { duration })
    }

    /// Creates a transaction over the given members.
    pub fn transaction(
        name: impl Into<Cow<'static, str>>,
        members: Vec<TransactionMember>,
    ) -> Self {
        Self::new(name, CommandKind::Transaction { members })
    }

    /// Returns the command identity.
    #[inline]
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Returns the display name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once [`Command::seal`] was called.
    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    // ---- condition accessors ----

    /// Condition: this command has begun executing.
    pub fn started(&self) -> Condition {
        Condition::state(self.id, StateKind::Started)
    }

    /// Condition: this command has begun and not finished.
    pub fn active(&self) -> Condition {
        Condition::state(self.id, StateKind::Active)
    }

    /// Condition: this command reached its goal normally.
    pub fn completed(&self) -> Condition {
        Condition::state(self.id, StateKind::Completed)
    }

    /// Condition: this command finished in any non-error way.
    pub fn done(&self) -> Condition {
        Condition::state(self.id, StateKind::Done)
    }

    /// Condition: cancellation of this command was requested.
    pub fn cancelling(&self) -> Condition {
        Condition::state(self.id, StateKind::Cancelling)
    }

    /// Condition: this command allows a successor to take over its devices.
    pub fn takeover_allowed(&self) -> Condition {
        Condition::state(self.id, StateKind::TakeoverAllowed)
    }

    // ---- pre-seal mutators ----

    fn check_unsealed(&self) -> Result<(), ActivityError> {
        if self.sealed {
            Err(ActivityError::Sealed)
        } else {
            Ok(())
        }
    }

    /// Appends a member to a transaction.
    ///
    /// Exists so member wiring can reference the transaction's own
    /// conditions (e.g. "not cancelling") before the member is added.
    pub fn push_member(&mut self, member: TransactionMember) -> Result<(), ActivityError> {
        self.check_unsealed()?;
        match &mut self.kind {
            CommandKind::Transaction { members } => {
                members.push(member);
                Ok(())
            }
            _ => Err(ActivityError::Rejected {
                reason: "members can only be added to transactions".into(),
            }),
        }
    }

    /// Installs a watcher.
    pub fn watch(
        &mut self,
        when: Condition,
        mode: WatchMode,
        effect: Effect,
    ) -> Result<(), ActivityError> {
        self.check_unsealed()?;
        self.watchers.push(Watcher { when, mode, effect });
        Ok(())
    }

    /// Appends an error rule (declaration order is preserved).
    pub fn add_error_rule(&mut self, rule: ErrorRule) -> Result<(), ActivityError> {
        self.check_unsealed()?;
        self.error_rules.push(rule);
        Ok(())
    }

    /// ORs `when` into the command's cancel condition.
    pub fn cancel_when(&mut self, when: Condition) -> Result<(), ActivityError> {
        self.check_unsealed()?;
        self.cancel_when = std::mem::replace(&mut self.cancel_when, Condition::False).or(when);
        Ok(())
    }

    /// ORs `when` into the command's graceful-stop condition.
    pub fn stop_when(&mut self, when: Condition) -> Result<(), ActivityError> {
        self.check_unsealed()?;
        self.stop_when = std::mem::replace(&mut self.stop_when, Condition::False).or(when);
        Ok(())
    }

    /// Overrides the derived done condition (transactions).
    pub fn override_done(&mut self, when: Condition) -> Result<(), ActivityError> {
        self.check_unsealed()?;
        self.done_override = Some(when);
        Ok(())
    }

    /// Overrides the derived takeover-allowed condition (transactions).
    pub fn override_takeover(&mut self, when: Condition) -> Result<(), ActivityError> {
        self.check_unsealed()?;
        self.takeover_override = Some(when);
        Ok(())
    }

    /// Installs the status tap observing this command node's local status.
    pub fn set_status_tap(&mut self, tap: StatusTap) -> Result<(), ActivityError> {
        self.check_unsealed()?;
        self.status_tap = Some(tap);
        Ok(())
    }

    /// Freezes the command. Idempotent.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    // ---- sealed accessors (runtime side) ----

    /// Command kind.
    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Installed watchers in declaration order.
    pub fn watchers(&self) -> &[Watcher] {
        &self.watchers
    }

    /// Installed error rules in declaration order.
    pub fn error_rules(&self) -> &[ErrorRule] {
        &self.error_rules
    }

    /// Combined cancel condition (`False` when none declared).
    pub fn cancel_condition(&self) -> &Condition {
        &self.cancel_when
    }

    /// Combined graceful-stop condition (`False` when none declared).
    pub fn stop_condition(&self) -> &Condition {
        &self.stop_when
    }

    /// Done override, if any.
    pub fn done_override(&self) -> Option<&Condition> {
        self.done_override.as_ref()
    }

    /// Takeover override, if any.
    pub fn takeover_override(&self) -> Option<&Condition> {
        self.takeover_override.as_ref()
    }

    /// Status tap, if any.
    pub fn status_tap(&self) -> Option<&StatusTap> {
        self.status_tap.as_ref()
    }

    /// Consumes the command, yielding its kind (runtime-side flattening).
    pub fn into_kind(self) -> CommandKind {
        self.kind
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            CommandKind::Atomic => "atomic".to_string(),
            CommandKind::Wait { duration } => format!("wait({duration:?})"),
            CommandKind::Transaction { members } => format!("transaction[{}]", members.len()),
        };
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &kind)
            .field("watchers", &self.watchers.len())
            .field("error_rules", &self.error_rules.len())
            .field("sealed", &self.sealed)
            .finish()
    }
}
