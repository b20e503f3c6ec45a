//! # Main activity with a cancel handler.
//!
//! The handler starts when the main command's done condition and the group's
//! cancel condition are both true — it runs only if cancellation arrived,
//! and it is allowed to start during cancellation. The group's
//! takeover-allowed condition equals the main command's; the group is done
//! once the main command is done and, if cancellation happened, the handler
//! finished too.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;

use crate::activity::{Activity, ActivityBody, ActivityRef, Predecessors, Prepared};
use crate::command::{Command, TransactionMember};
use crate::error::ActivityError;
use crate::scheduler::SchedulerRef;

/// Main activity plus a cancellation handler.
pub struct WithCancelHandler {
    body: Arc<ActivityBody>,
    main: ActivityRef,
    handler: ActivityRef,
}

impl WithCancelHandler {
    /// Creates the group.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        scheduler: SchedulerRef,
        main: ActivityRef,
        handler: ActivityRef,
    ) -> Arc<Self> {
        let controlled = main
            .body()
            .controlled_devices()
            .union(&handler.body().controlled_devices());
        let affected = main
            .body()
            .affected_devices()
            .union(&handler.body().affected_devices());
        Arc::new(Self {
            body: ActivityBody::new(name, scheduler, controlled, affected),
            main,
            handler,
        })
    }

    /// This group as a schedulable handle.
    pub fn handle(self: &Arc<Self>) -> ActivityRef {
        Arc::clone(self) as ActivityRef
    }
}

#[async_trait]
impl Activity for WithCancelHandler {
    fn body(&self) -> &Arc<ActivityBody> {
        &self.body
    }

    async fn prepare(&self, predecessors: &Predecessors) -> Result<Prepared, ActivityError> {
        let main_ready = match self.main.prepare(predecessors).await? {
            Prepared::Ready(ready) => ready,
            not_ready => return Ok(not_ready),
        };
        let handler_ready = match self.handler.prepare(predecessors).await? {
            Prepared::Ready(ready) => ready,
            not_ready => return Ok(not_ready),
        };

        let mut txn = Command::transaction(format!("{}:cancel", self.body.name()), Vec::new());
        let cancelling = txn.cancelling();

        let main_done = main_ready.command.done();
        let main_takeover = main_ready.command.takeover_allowed();
        let handler_done = handler_ready.command.done();

        txn.push_member(TransactionMember::auto(main_ready.command))?;
        txn.push_member(
            TransactionMember::started_when(
                handler_ready.command,
                main_done.clone().and(cancelling.clone()),
            )
            .allow_start_during_cancel(),
        )?;
        txn.override_done(main_done.and(handler_done.or(cancelling.negated())))?;
        txn.override_takeover(main_takeover)?;

        self.body
            .set_controlled(main_ready.controlled.union(&handler_ready.controlled));
        self.body
            .assemble(txn, main_ready.maintaining, predecessors)
            .await
    }

    fn property_sources(&self) -> Vec<ActivityRef> {
        vec![Arc::clone(&self.handler), Arc::clone(&self.main)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityOps, ActivityStatus};
    use crate::device::Device;
    use crate::testkit::*;

    #[tokio::test]
    async fn test_handler_runs_after_cancellation() {
        let rig = rig();
        let arm = Device::new("arm");
        let (main, _pm) = motion(&rig.scheduler, "main", &[&arm]);
        let (handler, ph) = motion(&rig.scheduler, "handler", &[&arm]);
        let group = WithCancelHandler::new(
            "guarded",
            rig.scheduler.clone(),
            Arc::clone(&main),
            Arc::clone(&handler),
        );

        group.handle().begin_execute().await.unwrap();
        wait_status(&main, ActivityStatus::Running).await;

        group.handle().cancel_execute().unwrap();
        // The cancelled main winds down; only then does the handler run.
        wait_status(&handler, ActivityStatus::Running).await;
        rig.runtime.complete(ph.id());

        group.handle().end_execute().await.unwrap();
        assert_eq!(group.handle().status(), ActivityStatus::Completed);
    }

    #[tokio::test]
    async fn test_handler_skipped_without_cancellation() {
        let rig = rig();
        let arm = Device::new("arm");
        let (main, pm) = motion(&rig.scheduler, "main", &[&arm]);
        let (handler, _ph) = motion(&rig.scheduler, "handler", &[&arm]);
        let group = WithCancelHandler::new(
            "guarded",
            rig.scheduler.clone(),
            Arc::clone(&main),
            Arc::clone(&handler),
        );

        group.handle().begin_execute().await.unwrap();
        wait_status(&main, ActivityStatus::Running).await;
        settle().await;
        assert_eq!(handler.status(), ActivityStatus::Scheduled);

        rig.runtime.complete(pm.id());
        group.handle().end_execute().await.unwrap();
        assert_eq!(group.handle().status(), ActivityStatus::Completed);
    }
}
