//! # Conditional composition.
//!
//! Executes exactly one of two branches depending on a boolean [`Condition`]
//! evaluated at execution time: the if-branch starts when the condition is
//! true, the else-branch when it is false (defaulting to an instant no-op
//! over the same devices). A decision latch records which branch won the
//! first time either branch starts; [`Conditional::decision`] and non-local
//! property queries await it.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::activity::{Activity, ActivityBody, ActivityRef, Predecessors, Prepared, ReadyCommand};
use crate::command::{Command, Condition, TransactionMember, WatchMode};
use crate::error::ActivityError;
use crate::scheduler::SchedulerRef;

/// Which branch of a [`Conditional`] won the start race.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Branch {
    /// The condition was true; the if-branch ran.
    If,
    /// The condition was false; the else-branch ran.
    Else,
}

/// Two-way conditional over a runtime condition.
pub struct Conditional {
    body: Arc<ActivityBody>,
    condition: Condition,
    if_branch: ActivityRef,
    else_branch: Option<ActivityRef>,
    decision: Arc<watch::Sender<Option<Branch>>>,
}

impl Conditional {
    /// Creates a conditional; `else_branch` defaults to an instant no-op
    /// over the if-branch's devices.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        scheduler: SchedulerRef,
        condition: Condition,
        if_branch: ActivityRef,
        else_branch: Option<ActivityRef>,
    ) -> Arc<Self> {
        let mut controlled = if_branch.body().controlled_devices();
        let mut affected = if_branch.body().affected_devices();
        if let Some(e) = &else_branch {
            controlled = controlled.union(&e.body().controlled_devices());
            affected = affected.union(&e.body().affected_devices());
        }
        let (decision, _rx) = watch::channel(None);
        Arc::new(Self {
            body: ActivityBody::new(name, scheduler, controlled, affected),
            condition,
            if_branch,
            else_branch,
            decision: Arc::new(decision),
        })
    }

    /// This conditional as a schedulable handle.
    pub fn handle(self: &Arc<Self>) -> ActivityRef {
        Arc::clone(self) as ActivityRef
    }

    /// The branch taken, if the race is already resolved.
    pub fn try_decision(&self) -> Option<Branch> {
        *self.decision.borrow()
    }

    /// Awaits the branch decision.
    pub async fn decision(&self) -> Branch {
        let mut rx = self.decision.subscribe();
        loop {
            if let Some(branch) = *rx.borrow_and_update() {
                return branch;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as the conditional; unreachable in
                // practice, but don't spin if it ever closes.
                futures::future::pending::<()>().await;
            }
        }
    }

    fn record(decision: &Arc<watch::Sender<Option<Branch>>>, branch: Branch) {
        decision.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(branch);
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl Activity for Conditional {
    fn body(&self) -> &Arc<ActivityBody> {
        &self.body
    }

    async fn prepare(&self, predecessors: &Predecessors) -> Result<Prepared, ActivityError> {
        let if_ready = match self.if_branch.prepare(predecessors).await? {
            Prepared::Ready(ready) => ready,
            not_ready => return Ok(not_ready),
        };
        let else_ready: ReadyCommand = match &self.else_branch {
            Some(activity) => match activity.prepare(predecessors).await? {
                Prepared::Ready(ready) => ready,
                not_ready => return Ok(not_ready),
            },
            None => {
                // Instant no-op holding the same devices.
                let mut noop = Command::wait(format!("{}:noop", self.body.name()), None);
                noop.seal();
                ReadyCommand {
                    command: noop,
                    controlled: if_ready.controlled.clone(),
                    maintaining: None,
                }
            }
        };

        let if_started = if_ready.command.started();
        let else_started = else_ready.command.started();
        let done = if_ready.command.done().or(else_ready.command.done());
        let takeover = if_ready
            .command
            .takeover_allowed()
            .or(else_ready.command.takeover_allowed());
        let maintaining = match (if_ready.maintaining.clone(), else_ready.maintaining.clone()) {
            (Some(a), Some(b)) => Some(a.or(b)),
            (a, b) => a.or(b),
        };
        let controlled = if_ready.controlled.union(&else_ready.controlled);

        let mut txn = Command::transaction(format!("{}:cond", self.body.name()), Vec::new());
        // Complementary guards: once one branch started, the other never can.
        txn.push_member(TransactionMember::started_when(
            if_ready.command,
            self.condition.clone().and(else_started.clone().negated()),
        ))?;
        txn.push_member(TransactionMember::started_when(
            else_ready.command,
            self.condition
                .clone()
                .negated()
                .and(if_started.clone().negated()),
        ))?;
        txn.override_done(done)?;
        txn.override_takeover(takeover)?;

        // Decision latch: released the first time either branch starts.
        let decision = Arc::clone(&self.decision);
        txn.watch(
            if_started,
            WatchMode::Once,
            Arc::new(move || Self::record(&decision, Branch::If)),
        )?;
        let decision = Arc::clone(&self.decision);
        txn.watch(
            else_started,
            WatchMode::Once,
            Arc::new(move || Self::record(&decision, Branch::Else)),
        )?;

        self.body.set_controlled(controlled);
        self.body.assemble(txn, maintaining, predecessors).await
    }

    /// Until the decision is known, non-local property queries defer.
    fn property_sources(&self) -> Vec<ActivityRef> {
        match self.try_decision() {
            Some(Branch::If) => vec![Arc::clone(&self.if_branch)],
            Some(Branch::Else) => self.else_branch.iter().map(Arc::clone).collect(),
            None => Vec::new(),
        }
    }

    async fn property_barrier(&self) {
        self.body.properties().wait_populated().await;
        self.decision().await;
    }
}
