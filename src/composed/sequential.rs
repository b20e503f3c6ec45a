//! # Sequential composition.
//!
//! Runs member activities in declaration order inside one transaction:
//! member i starts the first time member i−1's done condition fires (and the
//! transaction is not cancelling). A member marked **continuous** whose
//! successor controls a superset of its devices hands off early: the
//! successor additionally starts at the member's takeover-allowed condition,
//! and the successor's start gracefully stops the member (blending).
//!
//! Takeover-allowed and done conditions of the transaction derive from the
//! last member.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;

use crate::activity::{Activity, ActivityBody, ActivityRef, Predecessors, Prepared, ReadyCommand};
use crate::command::{Command, Condition, TransactionMember};
use crate::device::DeviceSet;
use crate::error::ActivityError;
use crate::scheduler::SchedulerRef;

struct SeqMember {
    activity: ActivityRef,
    continuous: bool,
}

/// Builder for [`Sequential`].
pub struct SequentialBuilder {
    name: Cow<'static, str>,
    scheduler: SchedulerRef,
    members: Vec<SeqMember>,
}

impl SequentialBuilder {
    /// Appends a member.
    pub fn then(mut self, activity: ActivityRef) -> Self {
        self.members.push(SeqMember {
            activity,
            continuous: false,
        });
        self
    }

    /// Appends a member that may be taken over by its successor before its
    /// done condition fires (blending).
    pub fn then_continuous(mut self, activity: ActivityRef) -> Self {
        self.members.push(SeqMember {
            activity,
            continuous: true,
        });
        self
    }

    /// Builds the composed activity.
    pub fn build(self) -> ActivityRef {
        let mut controlled = DeviceSet::new();
        let mut affected = DeviceSet::new();
        for m in &self.members {
            controlled = controlled.union(&m.activity.body().controlled_devices());
            affected = affected.union(&m.activity.body().affected_devices());
        }
        Arc::new(Sequential {
            body: ActivityBody::new(self.name, self.scheduler, controlled, affected),
            members: self.members,
        })
    }
}

/// Ordered composition of member activities.
pub struct Sequential {
    body: Arc<ActivityBody>,
    members: Vec<SeqMember>,
}

impl Sequential {
    /// Starts building a sequence.
    pub fn builder(
        name: impl Into<Cow<'static, str>>,
        scheduler: SchedulerRef,
    ) -> SequentialBuilder {
        SequentialBuilder {
            name: name.into(),
            scheduler,
            members: Vec::new(),
        }
    }
}

#[async_trait]
impl Activity for Sequential {
    fn body(&self) -> &Arc<ActivityBody> {
        &self.body
    }

    async fn prepare(&self, predecessors: &Predecessors) -> Result<Prepared, ActivityError> {
        if self.members.is_empty() {
            return Err(ActivityError::Rejected {
                reason: "sequence has no members".into(),
            });
        }

        // Each member is prepared against the map updated with its predecessor.
        let mut map = predecessors.clone();
        let mut readies: Vec<ReadyCommand> = Vec::with_capacity(self.members.len());
        for member in &self.members {
            match member.activity.prepare(&map).await? {
                Prepared::Ready(ready) => readies.push(ready),
                Prepared::NotYetComplete { blocking } => {
                    return Ok(Prepared::NotYetComplete { blocking })
                }
            }
            map = map.updated_with(&member.activity);
        }

        let mut txn = Command::transaction(format!("{}:seq", self.body.name()), Vec::new());
        let not_cancelling = txn.cancelling().negated();

        // Member conditions are cheap descriptions; wire everything before
        // moving the commands into the transaction.
        let dones: Vec<Condition> = readies.iter().map(|r| r.command.done()).collect();
        let takeovers: Vec<Condition> = readies
            .iter()
            .map(|r| r.command.takeover_allowed())
            .collect();
        let starteds: Vec<Condition> = readies.iter().map(|r| r.command.started()).collect();
        // blends[i]: member i hands off to member i+1 at takeover-allowed.
        let blends: Vec<bool> = (0..readies.len().saturating_sub(1))
            .map(|i| {
                self.members[i].continuous
                    && readies[i + 1].controlled.is_superset_of(&readies[i].controlled)
            })
            .collect();

        let last = readies.len() - 1;
        let done_override = dones[last].clone();
        let last_maintaining = readies[last].maintaining.clone();
        let takeover_override = (self.members[last].continuous || last_maintaining.is_some())
            .then(|| takeovers[last].clone());

        let mut controlled = DeviceSet::new();
        for ready in &readies {
            controlled = controlled.union(&ready.controlled);
        }

        for (i, ready) in readies.into_iter().enumerate() {
            let mut member = if i == 0 {
                TransactionMember::auto(ready.command)
            } else {
                let mut start = dones[i - 1].clone();
                if blends[i - 1] {
                    start = start.or(takeovers[i - 1].clone());
                }
                TransactionMember::started_when(
                    ready.command,
                    start.and(not_cancelling.clone()),
                )
            };
            if i < last && blends[i] {
                member.stop_when = Some(starteds[i + 1].clone());
            }
            txn.push_member(member)?;
        }
        txn.override_done(done_override)?;
        if let Some(takeover) = takeover_override {
            txn.override_takeover(takeover)?;
        }

        self.body.set_controlled(controlled);
        self.body.assemble(txn, last_maintaining, predecessors).await
    }

    fn property_sources(&self) -> Vec<ActivityRef> {
        self.members
            .iter()
            .rev()
            .map(|m| Arc::clone(&m.activity))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityOps, ActivityStatus};
    use crate::device::Device;
    use crate::testkit::*;

    #[tokio::test]
    async fn test_members_start_strictly_in_order() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, pa) = motion(&rig.scheduler, "a", &[&arm]);
        let (b, pb) = motion(&rig.scheduler, "b", &[&arm]);
        let (c, pc) = motion(&rig.scheduler, "c", &[&arm]);
        let seq = Sequential::builder("seq", rig.scheduler.clone())
            .then(Arc::clone(&a))
            .then(Arc::clone(&b))
            .then(Arc::clone(&c))
            .build();

        seq.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        assert_eq!(b.status(), ActivityStatus::Scheduled);
        assert_eq!(c.status(), ActivityStatus::Scheduled);

        rig.runtime.complete(pa.id());
        wait_status(&b, ActivityStatus::Running).await;
        assert_eq!(c.status(), ActivityStatus::Scheduled);

        rig.runtime.complete(pb.id());
        wait_status(&c, ActivityStatus::Running).await;

        rig.runtime.complete(pc.id());
        seq.end_execute().await.unwrap();
        assert_eq!(seq.status(), ActivityStatus::Completed);
        assert_eq!(a.status(), ActivityStatus::Completed);
        assert_eq!(c.status(), ActivityStatus::Completed);
    }

    #[tokio::test]
    async fn test_continuous_member_hands_off_at_takeover_allowed() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, pa) = motion(&rig.scheduler, "a", &[&arm]);
        let (b, pb) = motion(&rig.scheduler, "b", &[&arm]);
        let seq = Sequential::builder("blend", rig.scheduler.clone())
            .then_continuous(Arc::clone(&a))
            .then(Arc::clone(&b))
            .build();

        seq.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        settle().await;
        assert_eq!(b.status(), ActivityStatus::Scheduled);

        // The successor starts at takeover-allowed, not at done: the first
        // member is never completed manually.
        rig.runtime.allow_takeover(pa.id());
        wait_status(&b, ActivityStatus::Running).await;
        wait_status(&a, ActivityStatus::Completed).await;

        rig.runtime.complete(pb.id());
        seq.end_execute().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_reaches_active_member_only() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, _pa) = motion(&rig.scheduler, "a", &[&arm]);
        let (b, _pb) = motion(&rig.scheduler, "b", &[&arm]);
        let seq = Sequential::builder("seq", rig.scheduler.clone())
            .then(Arc::clone(&a))
            .then(Arc::clone(&b))
            .build();

        seq.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;

        seq.cancel_execute().unwrap();
        seq.end_execute().await.unwrap();
        assert_eq!(seq.status(), ActivityStatus::Completed);
        // The active member wound down; the pending one never ran.
        assert_eq!(a.status(), ActivityStatus::Completed);
        assert_eq!(b.status(), ActivityStatus::Completed);
    }

    #[tokio::test]
    async fn test_member_failure_fails_the_sequence() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, pa) = motion(&rig.scheduler, "a", &[&arm]);
        let (b, _pb) = motion(&rig.scheduler, "b", &[&arm]);
        let seq = Sequential::builder("seq", rig.scheduler.clone())
            .then(Arc::clone(&a))
            .then(Arc::clone(&b))
            .build();

        seq.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        rig.runtime
            .fail(pa.id(), crate::error::RtError::new("overload", "axis 1"));

        let err = seq.end_execute().await.unwrap_err();
        assert_eq!(err.as_label(), "command_failed");
        assert_eq!(seq.status(), ActivityStatus::Failed);
    }
}
