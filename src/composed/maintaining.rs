//! # Main activity with a maintaining phase.
//!
//! The maintain member starts when the main command's done condition fires;
//! the group's takeover-allowed and done conditions derive from the maintain
//! member, and the owning activity's status flips to MAINTAINING while the
//! maintain member is active. Cancelling the group cancels whichever member
//! is active.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;

use crate::activity::{Activity, ActivityBody, ActivityRef, Predecessors, Prepared};
use crate::command::{Command, TransactionMember};
use crate::error::ActivityError;
use crate::scheduler::SchedulerRef;

/// Main activity plus a device-holding maintain phase.
pub struct WithMaintaining {
    body: Arc<ActivityBody>,
    main: ActivityRef,
    maintain: ActivityRef,
}

impl WithMaintaining {
    /// Creates the group.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        scheduler: SchedulerRef,
        main: ActivityRef,
        maintain: ActivityRef,
    ) -> Arc<Self> {
        let controlled = main
            .body()
            .controlled_devices()
            .union(&maintain.body().controlled_devices());
        let affected = main
            .body()
            .affected_devices()
            .union(&maintain.body().affected_devices());
        Arc::new(Self {
            body: ActivityBody::new(name, scheduler, controlled, affected),
            main,
            maintain,
        })
    }

    /// This group as a schedulable handle.
    pub fn handle(self: &Arc<Self>) -> ActivityRef {
        Arc::clone(self) as ActivityRef
    }
}

#[async_trait]
impl Activity for WithMaintaining {
    fn body(&self) -> &Arc<ActivityBody> {
        &self.body
    }

    async fn prepare(&self, predecessors: &Predecessors) -> Result<Prepared, ActivityError> {
        let main_ready = match self.main.prepare(predecessors).await? {
            Prepared::Ready(ready) => ready,
            not_ready => return Ok(not_ready),
        };
        let maintain_map = predecessors.updated_with(&self.main);
        let maintain_ready = match self.maintain.prepare(&maintain_map).await? {
            Prepared::Ready(ready) => ready,
            not_ready => return Ok(not_ready),
        };

        let main_done = main_ready.command.done();
        let maintain_done = maintain_ready.command.done();
        let maintain_takeover = maintain_ready.command.takeover_allowed();
        let maintain_active = maintain_ready.command.active();

        let mut txn = Command::transaction(format!("{}:hold", self.body.name()), Vec::new());
        txn.push_member(TransactionMember::auto(main_ready.command))?;
        txn.push_member(TransactionMember::started_when(
            maintain_ready.command,
            main_done,
        ))?;
        txn.override_done(maintain_done)?;
        txn.override_takeover(maintain_takeover)?;

        self.body
            .set_controlled(main_ready.controlled.union(&maintain_ready.controlled));
        self.body
            .assemble(txn, Some(maintain_active), predecessors)
            .await
    }

    fn property_sources(&self) -> Vec<ActivityRef> {
        vec![Arc::clone(&self.maintain), Arc::clone(&self.main)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityOps, ActivityStatus};
    use crate::device::Device;
    use crate::testkit::*;

    #[tokio::test]
    async fn test_flips_to_maintaining_while_holding() {
        let rig = rig();
        let arm = Device::new("arm");
        let (main, pm) = motion(&rig.scheduler, "main", &[&arm]);
        let (maintain, ph) = motion(&rig.scheduler, "hold", &[&arm]);
        let group = WithMaintaining::new(
            "move-and-hold",
            rig.scheduler.clone(),
            Arc::clone(&main),
            Arc::clone(&maintain),
        );

        group.handle().begin_execute().await.unwrap();
        wait_status(&main, ActivityStatus::Running).await;
        assert_eq!(group.handle().status(), ActivityStatus::Running);

        rig.runtime.complete(pm.id());
        wait_exact(&group.handle(), ActivityStatus::Maintaining).await;
        wait_status(&maintain, ActivityStatus::Running).await;

        rig.runtime.complete(ph.id());
        wait_status(&group.handle(), ActivityStatus::Completed).await;
        group.handle().end_execute().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_while_maintaining_winds_down() {
        let rig = rig();
        let arm = Device::new("arm");
        let (main, pm) = motion(&rig.scheduler, "main", &[&arm]);
        let (maintain, _ph) = motion(&rig.scheduler, "hold", &[&arm]);
        let group = WithMaintaining::new(
            "move-and-hold",
            rig.scheduler.clone(),
            Arc::clone(&main),
            Arc::clone(&maintain),
        );

        group.handle().begin_execute().await.unwrap();
        wait_status(&main, ActivityStatus::Running).await;
        rig.runtime.complete(pm.id());
        wait_exact(&group.handle(), ActivityStatus::Maintaining).await;

        group.handle().cancel_execute().unwrap();
        // A cancelled maintain phase never rolls back past RUNNING.
        wait_status(&group.handle(), ActivityStatus::Completed).await;
        group.handle().end_execute().await.unwrap();
    }
}
