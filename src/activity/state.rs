//! # Internal activity state machine.
//!
//! [`AState`] mirrors [`ActivityStatus`](crate::activity::ActivityStatus) 1:1
//! and is driven by two independent event sources: explicit `begin_execute`
//! calls and asynchronous command-status notifications. The transition
//! function is pure — `(state, event) -> step` — so the table is testable
//! without constructing activities or commands.
//!
//! ## Transition table
//! ```text
//! state       | Begin      | Ready      | Running   | Terminated(ok)     | Terminated(err)
//! ------------+------------+------------+-----------+--------------------+----------------
//! New         | Scheduled  | Scheduled  | ignored   | Scheduled, reapply | Scheduled, reapply
//! Scheduled   | illegal    | ignored    | Running   | Running, reapply   | Failed
//! Running     | illegal    | ignored    | ignored   | Completed          | Failed
//! Maintaining | illegal    | ignored    | ignored   | Completed          | Failed
//! Failed      | illegal    | ignored    | ignored   | ignored            | ignored
//! Completed   | illegal    | ignored    | ignored   | ignored            | ignored
//! ```
//! `MaintainStart` moves Running → Maintaining and is ignored elsewhere.
//! "reapply" rows cascade: the same event is processed again from the new
//! state, so a command that terminates straight out of NEW still walks
//! NEW → Scheduled → Running → Completed/Failed in order.

use crate::activity::status::ActivityStatus;
use crate::error::RtError;

/// Internal lifecycle state, bound 1:1 to [`ActivityStatus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AState {
    New,
    Scheduled,
    Running,
    Maintaining,
    Failed,
    Completed,
}

impl AState {
    /// The externally visible status of this state.
    pub(crate) fn status(self) -> ActivityStatus {
        match self {
            AState::New => ActivityStatus::New,
            AState::Scheduled => ActivityStatus::Scheduled,
            AState::Running => ActivityStatus::Running,
            AState::Maintaining => ActivityStatus::Maintaining,
            AState::Failed => ActivityStatus::Failed,
            AState::Completed => ActivityStatus::Completed,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, AState::Failed | AState::Completed)
    }
}

/// Events driving the machine.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum AEvent {
    /// Explicit `begin_execute` (admission succeeded).
    Begin,
    /// Command loaded (handle status READY).
    Ready,
    /// Command started executing (handle status RUNNING).
    Running,
    /// Command finished; `Some` carries the terminal error.
    Terminated(Option<RtError>),
    /// The declared maintaining condition fired.
    MaintainStart,
}

/// Result of applying one event.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Step {
    /// Move to the new state, walking every intermediate state in order.
    Transition {
        /// States entered, in order; the last one is the new current state.
        path: Vec<AState>,
    },
    /// Event carries no information in this state.
    Ignored,
    /// Programming error: the operation is not permitted in this state.
    Illegal,
}

/// Applies `event` to `state`, cascading the "then immediately
/// terminal-processed" rows of the table.
pub(crate) fn apply(state: AState, event: &AEvent) -> Step {
    let mut path = Vec::new();
    let mut current = state;
    loop {
        match single(current, event) {
            One::Next(next) => {
                path.push(next);
                current = next;
                // Terminated events cascade through intermediate states.
                if matches!(event, AEvent::Terminated(_)) && !current.is_terminal() {
                    continue;
                }
                return Step::Transition { path };
            }
            One::Ignored => {
                return if path.is_empty() {
                    Step::Ignored
                } else {
                    Step::Transition { path }
                };
            }
            One::Illegal => {
                return if path.is_empty() {
                    Step::Illegal
                } else {
                    Step::Transition { path }
                };
            }
        }
    }
}

enum One {
    Next(AState),
    Ignored,
    Illegal,
}

fn single(state: AState, event: &AEvent) -> One {
    match (state, event) {
        // New
        (AState::New, AEvent::Begin) => One::Next(AState::Scheduled),
        (AState::New, AEvent::Ready) => One::Next(AState::Scheduled),
        (AState::New, AEvent::Running) => One::Ignored,
        (AState::New, AEvent::Terminated(_)) => One::Next(AState::Scheduled),
        (AState::New, AEvent::MaintainStart) => One::Ignored,

        // Scheduled
        (AState::Scheduled, AEvent::Begin) => One::Illegal,
        (AState::Scheduled, AEvent::Ready) => One::Ignored,
        (AState::Scheduled, AEvent::Running) => One::Next(AState::Running),
        (AState::Scheduled, AEvent::Terminated(None)) => One::Next(AState::Running),
        (AState::Scheduled, AEvent::Terminated(Some(_))) => One::Next(AState::Failed),
        (AState::Scheduled, AEvent::MaintainStart) => One::Ignored,

        // Running
        (AState::Running, AEvent::Begin) => One::Illegal,
        (AState::Running, AEvent::Ready | AEvent::Running) => One::Ignored,
        (AState::Running, AEvent::Terminated(None)) => One::Next(AState::Completed),
        (AState::Running, AEvent::Terminated(Some(_))) => One::Next(AState::Failed),
        (AState::Running, AEvent::MaintainStart) => One::Next(AState::Maintaining),

        // Maintaining
        (AState::Maintaining, AEvent::Begin) => One::Illegal,
        (AState::Maintaining, AEvent::Ready | AEvent::Running) => One::Ignored,
        (AState::Maintaining, AEvent::Terminated(None)) => One::Next(AState::Completed),
        (AState::Maintaining, AEvent::Terminated(Some(_))) => One::Next(AState::Failed),
        (AState::Maintaining, AEvent::MaintainStart) => One::Ignored,

        // Terminal states
        (AState::Failed | AState::Completed, AEvent::Begin) => One::Illegal,
        (AState::Failed | AState::Completed, _) => One::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminated_ok() -> AEvent {
        AEvent::Terminated(None)
    }

    fn terminated_err() -> AEvent {
        AEvent::Terminated(Some(RtError::new("boom", "axis")))
    }

    fn end_state(step: Step) -> AState {
        match step {
            Step::Transition { path } => *path.last().expect("non-empty path"),
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn test_begin_schedules_new() {
        assert_eq!(end_state(apply(AState::New, &AEvent::Begin)), AState::Scheduled);
    }

    #[test]
    fn test_begin_illegal_everywhere_else() {
        for s in [
            AState::Scheduled,
            AState::Running,
            AState::Maintaining,
            AState::Failed,
            AState::Completed,
        ] {
            assert_eq!(apply(s, &AEvent::Begin), Step::Illegal, "state {s:?}");
        }
    }

    #[test]
    fn test_termination_from_new_cascades_all_states() {
        // New → Scheduled → Running → Completed, in order.
        match apply(AState::New, &terminated_ok()) {
            Step::Transition { path } => assert_eq!(
                path,
                vec![AState::Scheduled, AState::Running, AState::Completed]
            ),
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn test_termination_with_error_from_new() {
        match apply(AState::New, &terminated_err()) {
            Step::Transition { path } => {
                assert_eq!(*path.last().unwrap(), AState::Failed);
                assert_eq!(path[0], AState::Scheduled);
            }
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn test_scheduled_termination_ok_cascades_through_running() {
        match apply(AState::Scheduled, &terminated_ok()) {
            Step::Transition { path } => {
                assert_eq!(path, vec![AState::Running, AState::Completed])
            }
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn test_scheduled_termination_err_fails_directly() {
        assert_eq!(
            end_state(apply(AState::Scheduled, &terminated_err())),
            AState::Failed
        );
    }

    #[test]
    fn test_running_terminates() {
        assert_eq!(
            end_state(apply(AState::Running, &terminated_ok())),
            AState::Completed
        );
        assert_eq!(
            end_state(apply(AState::Running, &terminated_err())),
            AState::Failed
        );
    }

    #[test]
    fn test_maintain_start_only_from_running() {
        assert_eq!(
            end_state(apply(AState::Running, &AEvent::MaintainStart)),
            AState::Maintaining
        );
        for s in [AState::New, AState::Scheduled, AState::Maintaining] {
            assert_eq!(apply(s, &AEvent::MaintainStart), Step::Ignored, "state {s:?}");
        }
    }

    #[test]
    fn test_maintaining_terminates() {
        assert_eq!(
            end_state(apply(AState::Maintaining, &terminated_ok())),
            AState::Completed
        );
        assert_eq!(
            end_state(apply(AState::Maintaining, &terminated_err())),
            AState::Failed
        );
    }

    #[test]
    fn test_terminal_states_reject_command_events() {
        for s in [AState::Failed, AState::Completed] {
            assert_eq!(apply(s, &AEvent::Ready), Step::Ignored);
            assert_eq!(apply(s, &AEvent::Running), Step::Ignored);
            assert_eq!(apply(s, &terminated_ok()), Step::Ignored);
            assert_eq!(apply(s, &terminated_err()), Step::Ignored);
        }
    }

    #[test]
    fn test_running_event_ignored_in_new() {
        assert_eq!(apply(AState::New, &AEvent::Running), Step::Ignored);
    }
}
