//! # Activity status order and the central monotonicity guard.
//!
//! [`ActivityStatus`] is the externally visible phase of an activity. The
//! phases form a total order; the invariant "once past RUNNING, never back
//! to RUNNING or earlier" is enforced **centrally** in [`StatusCell`], not
//! by each transition site.
//!
//! ## Rules
//! - `New < Scheduled < Running < Maintaining < Completed < Failed` (index order).
//! - Once the index exceeds `Running`, updates with index ≤ `Running` are rejected.
//! - `Completed` and `Failed` are terminal; nothing replaces them.
//! - Subscribers get an immediate replay of the current status (watch channel).

use tokio::sync::watch;

/// Externally visible phase of an activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActivityStatus {
    /// Created, not yet admitted.
    New,
    /// Admitted by the scheduler; command loaded or chained.
    Scheduled,
    /// The command's started condition fired.
    Running,
    /// Primary goal reached; devices still held (e.g. holding position).
    Maintaining,
    /// Finished normally (or wound down after cancellation).
    Completed,
    /// Finished with a stored error.
    Failed,
}

impl ActivityStatus {
    /// Phase index used by the monotonicity guard.
    #[inline]
    pub fn index(self) -> u8 {
        match self {
            ActivityStatus::New => 0,
            ActivityStatus::Scheduled => 1,
            ActivityStatus::Running => 2,
            ActivityStatus::Maintaining => 3,
            ActivityStatus::Completed => 4,
            ActivityStatus::Failed => 5,
        }
    }

    /// True for the phases `end_execute` waits for.
    #[inline]
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            ActivityStatus::Maintaining | ActivityStatus::Completed | ActivityStatus::Failed
        )
    }

    /// True for phases no event may leave.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, ActivityStatus::Completed | ActivityStatus::Failed)
    }

    /// Returns a short stable label (snake_case) for logs/events.
    pub fn as_label(self) -> &'static str {
        match self {
            ActivityStatus::New => "new",
            ActivityStatus::Scheduled => "scheduled",
            ActivityStatus::Running => "running",
            ActivityStatus::Maintaining => "maintaining",
            ActivityStatus::Completed => "completed",
            ActivityStatus::Failed => "failed",
        }
    }
}

/// Outcome of a [`StatusCell::set`] request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusChange {
    /// The new status was applied and broadcast.
    Applied,
    /// The status already had this value.
    Unchanged,
    /// Rejected: would move the status backward past `Running`.
    RejectedMonotonic,
    /// Rejected: the current status is terminal.
    RejectedTerminal,
}

/// Single owner of one activity's status, with central invariant enforcement.
///
/// Wraps a [`watch`] channel: every subscriber immediately observes the
/// current value, and per-activity notifications are sequential.
pub struct StatusCell {
    tx: watch::Sender<ActivityStatus>,
}

impl StatusCell {
    /// Creates a cell in status `New`.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ActivityStatus::New);
        Self { tx }
    }

    /// Returns the current status.
    pub fn get(&self) -> ActivityStatus {
        *self.tx.borrow()
    }

    /// Subscribes to status changes (current value already observed).
    pub fn subscribe(&self) -> watch::Receiver<ActivityStatus> {
        self.tx.subscribe()
    }

    /// Requests a status change, enforcing the monotonicity guard.
    pub fn set(&self, status: ActivityStatus) -> StatusChange {
        let mut outcome = StatusChange::Unchanged;
        self.tx.send_if_modified(|current| {
            if *current == status {
                outcome = StatusChange::Unchanged;
                return false;
            }
            if current.is_terminal() {
                outcome = StatusChange::RejectedTerminal;
                return false;
            }
            if current.index() > ActivityStatus::Running.index()
                && status.index() <= ActivityStatus::Running.index()
            {
                outcome = StatusChange::RejectedMonotonic;
                return false;
            }
            *current = status;
            outcome = StatusChange::Applied;
            true
        });
        outcome
    }

    /// Awaits a status for which `pred` returns true and returns it.
    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(ActivityStatus) -> bool,
    ) -> ActivityStatus {
        let mut rx = self.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if pred(current) {
                return current;
            }
            if rx.changed().await.is_err() {
                return current;
            }
        }
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_apply() {
        let cell = StatusCell::new();
        assert_eq!(cell.set(ActivityStatus::Scheduled), StatusChange::Applied);
        assert_eq!(cell.set(ActivityStatus::Running), StatusChange::Applied);
        assert_eq!(cell.set(ActivityStatus::Maintaining), StatusChange::Applied);
        assert_eq!(cell.set(ActivityStatus::Completed), StatusChange::Applied);
    }

    #[test]
    fn test_backward_past_running_rejected() {
        let cell = StatusCell::new();
        cell.set(ActivityStatus::Scheduled);
        cell.set(ActivityStatus::Running);
        cell.set(ActivityStatus::Maintaining);
        assert_eq!(
            cell.set(ActivityStatus::Running),
            StatusChange::RejectedMonotonic
        );
        assert_eq!(
            cell.set(ActivityStatus::Scheduled),
            StatusChange::RejectedMonotonic
        );
        assert_eq!(cell.get(), ActivityStatus::Maintaining);
    }

    #[test]
    fn test_terminal_rejects_everything() {
        let cell = StatusCell::new();
        cell.set(ActivityStatus::Scheduled);
        cell.set(ActivityStatus::Running);
        cell.set(ActivityStatus::Failed);
        assert_eq!(
            cell.set(ActivityStatus::Completed),
            StatusChange::RejectedTerminal
        );
        assert_eq!(cell.get(), ActivityStatus::Failed);
    }

    #[test]
    fn test_maintaining_to_completed_allowed() {
        let cell = StatusCell::new();
        cell.set(ActivityStatus::Scheduled);
        cell.set(ActivityStatus::Running);
        cell.set(ActivityStatus::Maintaining);
        assert_eq!(cell.set(ActivityStatus::Completed), StatusChange::Applied);
    }

    #[test]
    fn test_subscriber_replays_current() {
        let cell = StatusCell::new();
        cell.set(ActivityStatus::Scheduled);
        let rx = cell.subscribe();
        assert_eq!(*rx.borrow(), ActivityStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_wait_for_settled() {
        let cell = std::sync::Arc::new(StatusCell::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_for(|s| s.is_settled()).await })
        };
        cell.set(ActivityStatus::Scheduled);
        cell.set(ActivityStatus::Running);
        cell.set(ActivityStatus::Completed);
        assert_eq!(waiter.await.unwrap(), ActivityStatus::Completed);
    }
}
