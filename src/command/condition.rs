//! # Condition algebra over command states.
//!
//! A [`Condition`] is a boolean, time-varying signal over the execution of
//! commands: atoms observe a named state of one command ([`StateKind`]) or a
//! free [`Signal`](crate::command::sim::Signal) provided by the runtime;
//! composites combine them with AND/OR/NOT.
//!
//! Conditions are pure descriptions. Evaluation happens inside a runtime
//! against its current state table; this module only provides the algebra
//! and an `eval` walk parameterized by a lookup function.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Global counter for command identities.
static COMMAND_SEQ: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a command description within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl CommandId {
    /// Allocates a fresh command id.
    pub(crate) fn next() -> Self {
        CommandId(COMMAND_SEQ.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

/// Stable identity of a free boolean signal owned by a runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SignalId(pub(crate) u64);

/// Observable states of a command execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateKind {
    /// The command has begun executing.
    Started,
    /// The command has begun and not yet finished.
    Active,
    /// The command reached its goal normally.
    Completed,
    /// The command finished (normally, stopped, or wound down after cancel).
    Done,
    /// Cancellation of the command was requested.
    Cancelling,
    /// The command permits a successor to take over its devices.
    TakeoverAllowed,
}

/// A boolean-valued, time-varying signal over command executions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    /// Constant true.
    True,
    /// Constant false.
    False,
    /// A named state of one command.
    State {
        /// The observed command.
        command: CommandId,
        /// Which of its states.
        kind: StateKind,
    },
    /// A free boolean signal owned by the runtime (sensor, flag, ...).
    Signal(SignalId),
    /// True iff all operands are true. Empty AND is true.
    And(Vec<Condition>),
    /// True iff any operand is true. Empty OR is false.
    Or(Vec<Condition>),
    /// Negation.
    Not(Box<Condition>),
}

impl Condition {
    /// Atom observing `kind` of `command`.
    pub fn state(command: CommandId, kind: StateKind) -> Self {
        Condition::State { command, kind }
    }

    /// Conjunction of `self` and `other`, flattening nested ANDs.
    pub fn and(self, other: Condition) -> Self {
        match (self, other) {
            (Condition::True, c) | (c, Condition::True) => c,
            (Condition::False, _) | (_, Condition::False) => Condition::False,
            (Condition::And(mut a), Condition::And(b)) => {
                a.extend(b);
                Condition::And(a)
            }
            (Condition::And(mut a), c) => {
                a.push(c);
                Condition::And(a)
            }
            (c, Condition::And(mut b)) => {
                b.insert(0, c);
                Condition::And(b)
            }
            (a, b) => Condition::And(vec![a, b]),
        }
    }

    /// Disjunction of `self` and `other`, flattening nested ORs.
    pub fn or(self, other: Condition) -> Self {
        match (self, other) {
            (Condition::False, c) | (c, Condition::False) => c,
            (Condition::True, _) | (_, Condition::True) => Condition::True,
            (Condition::Or(mut a), Condition::Or(b)) => {
                a.extend(b);
                Condition::Or(a)
            }
            (Condition::Or(mut a), c) => {
                a.push(c);
                Condition::Or(a)
            }
            (c, Condition::Or(mut b)) => {
                b.insert(0, c);
                Condition::Or(b)
            }
            (a, b) => Condition::Or(vec![a, b]),
        }
    }

    /// Negation of `self`. Double negation collapses.
    pub fn negated(self) -> Self {
        match self {
            Condition::True => Condition::False,
            Condition::False => Condition::True,
            Condition::Not(inner) => *inner,
            c => Condition::Not(Box::new(c)),
        }
    }

    /// Conjunction over an iterator; empty input yields `True`.
    pub fn all(conds: impl IntoIterator<Item = Condition>) -> Self {
        conds
            .into_iter()
            .fold(Condition::True, |acc, c| acc.and(c))
    }

    /// Disjunction over an iterator; empty input yields `False`.
    pub fn any(conds: impl IntoIterator<Item = Condition>) -> Self {
        conds.into_iter().fold(Condition::False, |acc, c| acc.or(c))
    }

    /// Evaluates the condition against the given state lookup.
    ///
    /// `states` answers "is `kind` of `command` currently true";
    /// `signals` answers the same for free signals.
    pub fn eval(
        &self,
        states: &dyn Fn(CommandId, StateKind) -> bool,
        signals: &dyn Fn(SignalId) -> bool,
    ) -> bool {
        match self {
            Condition::True => true,
            Condition::False => false,
            Condition::State { command, kind } => states(*command, *kind),
            Condition::Signal(id) => signals(*id),
            Condition::And(cs) => cs.iter().all(|c| c.eval(states, signals)),
            Condition::Or(cs) => cs.iter().any(|c| c.eval(states, signals)),
            Condition::Not(c) => !c.eval(states, signals),
        }
    }
}
