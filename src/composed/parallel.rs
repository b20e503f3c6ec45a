//! # Parallel composition.
//!
//! Starts all members together inside one transaction. Derived conditions:
//! - done = AND over members of member-done
//! - takeover-allowed = AND over members of (member takeover-allowed OR
//!   member not active)
//! - maintaining = (AND over members of (member-done OR member-maintaining))
//!   AND (OR over members of member-maintaining)
//!
//! Members sharing an affected device are rejected when the group is built:
//! running them concurrently would violate the one-controller-per-device
//! invariant.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;

use crate::activity::{Activity, ActivityBody, ActivityRef, Predecessors, Prepared};
use crate::command::{Command, Condition, TransactionMember};
use crate::device::DeviceSet;
use crate::error::{ActivityError, SchedulingError};
use crate::scheduler::SchedulerRef;

/// Builder for [`Parallel`].
pub struct ParallelBuilder {
    name: Cow<'static, str>,
    scheduler: SchedulerRef,
    members: Vec<ActivityRef>,
}

impl ParallelBuilder {
    /// Adds a member.
    pub fn with(mut self, activity: ActivityRef) -> Self {
        self.members.push(activity);
        self
    }

    /// Builds the composed activity.
    ///
    /// Fails with [`SchedulingError::Conflict`] when two members share an
    /// affected device.
    pub fn build(self) -> Result<ActivityRef, ActivityError> {
        let mut controlled = DeviceSet::new();
        let mut affected = DeviceSet::new();
        for member in &self.members {
            let member_affected = member.body().affected_devices();
            if let Some(shared) = affected.first_shared(&member_affected) {
                return Err(SchedulingError::Conflict {
                    activity: Arc::from(member.name()),
                    device: Arc::from(shared.name()),
                }
                .into());
            }
            controlled = controlled.union(&member.body().controlled_devices());
            affected = affected.union(&member_affected);
        }
        Ok(Arc::new(Parallel {
            body: ActivityBody::new(self.name, self.scheduler, controlled, affected),
            members: self.members,
        }))
    }
}

/// Concurrent composition of member activities over disjoint devices.
pub struct Parallel {
    body: Arc<ActivityBody>,
    members: Vec<ActivityRef>,
}

impl Parallel {
    /// Starts building a parallel group.
    pub fn builder(
        name: impl Into<Cow<'static, str>>,
        scheduler: SchedulerRef,
    ) -> ParallelBuilder {
        ParallelBuilder {
            name: name.into(),
            scheduler,
            members: Vec::new(),
        }
    }
}

#[async_trait]
impl Activity for Parallel {
    fn body(&self) -> &Arc<ActivityBody> {
        &self.body
    }

    async fn prepare(&self, predecessors: &Predecessors) -> Result<Prepared, ActivityError> {
        if self.members.is_empty() {
            return Err(ActivityError::Rejected {
                reason: "parallel group has no members".into(),
            });
        }

        // All members are prepared against the same predecessor map.
        let mut readies = Vec::with_capacity(self.members.len());
        for member in &self.members {
            match member.prepare(predecessors).await? {
                Prepared::Ready(ready) => readies.push(ready),
                Prepared::NotYetComplete { blocking } => {
                    return Ok(Prepared::NotYetComplete { blocking })
                }
            }
        }

        let done = Condition::all(readies.iter().map(|r| r.command.done()));
        let takeover = Condition::all(
            readies
                .iter()
                .map(|r| r.command.takeover_allowed().or(r.command.active().negated())),
        );
        let all_done_or_maintaining = Condition::all(readies.iter().map(|r| {
            let maintaining = r.maintaining.clone().unwrap_or(Condition::False);
            r.command.done().or(maintaining)
        }));
        let any_maintaining = Condition::any(
            readies
                .iter()
                .filter_map(|r| r.maintaining.clone()),
        );
        let maintaining = match any_maintaining {
            Condition::False => None,
            any => Some(all_done_or_maintaining.and(any)),
        };

        let mut controlled = DeviceSet::new();
        for ready in &readies {
            controlled = controlled.union(&ready.controlled);
        }

        let mut txn = Command::transaction(format!("{}:par", self.body.name()), Vec::new());
        for ready in readies {
            txn.push_member(TransactionMember::auto(ready.command))?;
        }
        txn.override_done(done)?;
        txn.override_takeover(takeover)?;

        self.body.set_controlled(controlled);
        self.body.assemble(txn, maintaining, predecessors).await
    }

    fn property_sources(&self) -> Vec<ActivityRef> {
        self.members.iter().rev().map(Arc::clone).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityOps, ActivityStatus};
    use crate::device::Device;
    use crate::error::RtError;
    use crate::testkit::*;

    #[tokio::test]
    async fn test_done_only_when_all_members_done() {
        let rig = rig();
        let arm = Device::new("arm");
        let gripper = Device::new("gripper");
        let (a, pa) = motion(&rig.scheduler, "a", &[&arm]);
        let (b, pb) = motion(&rig.scheduler, "b", &[&gripper]);
        let par = Parallel::builder("par", rig.scheduler.clone())
            .with(Arc::clone(&a))
            .with(Arc::clone(&b))
            .build()
            .unwrap();

        par.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        wait_status(&b, ActivityStatus::Running).await;

        rig.runtime.complete(pa.id());
        settle().await;
        assert_eq!(par.status(), ActivityStatus::Running);

        rig.runtime.complete(pb.id());
        par.end_execute().await.unwrap();
        assert_eq!(par.status(), ActivityStatus::Completed);
    }

    #[tokio::test]
    async fn test_member_failure_cancels_siblings_and_fails_group() {
        let rig = rig();
        let arm = Device::new("arm");
        let gripper = Device::new("gripper");
        let (a, pa) = motion(&rig.scheduler, "a", &[&arm]);
        let (b, _pb) = motion(&rig.scheduler, "b", &[&gripper]);
        let par = Parallel::builder("par", rig.scheduler.clone())
            .with(Arc::clone(&a))
            .with(Arc::clone(&b))
            .build()
            .unwrap();

        par.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        wait_status(&b, ActivityStatus::Running).await;

        rig.runtime.fail(pa.id(), RtError::new("overload", "axis 4"));
        match par.end_execute().await {
            Err(ActivityError::Runtime { error }) => {
                assert!(error.has_class("overload"))
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
        // The sibling wound down without its own error.
        wait_status(&b, ActivityStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_members_sharing_a_device_are_rejected() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, _pa) = motion(&rig.scheduler, "a", &[&arm]);
        let (b, _pb) = motion(&rig.scheduler, "b", &[&arm]);
        let err = Parallel::builder("par", rig.scheduler.clone())
            .with(a)
            .with(b)
            .build()
            .err()
            .unwrap();
        assert_eq!(err.as_label(), "scheduling_conflict");
    }
}
