//! # Main activity with triggered sub-activities.
//!
//! One main activity plus N `(condition, activity)` triggers: each trigger's
//! command starts the first time its condition fires (immediately when the
//! condition is absent). The group's takeover-allowed and done conditions
//! require that no trigger is still active; cancelling the group cancels the
//! main command.
//!
//! This combinator is sugar over the trigger machinery of
//! [`ActivityBody::attach_trigger`]: the triggers are attached at
//! construction and materialized into a transaction at seal time.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;

use crate::activity::{Activity, ActivityBody, ActivityRef, Predecessors, Prepared};
use crate::command::Condition;
use crate::error::ActivityError;
use crate::scheduler::SchedulerRef;

/// Main activity with condition-triggered sub-activities.
pub struct WithSubactivities {
    body: Arc<ActivityBody>,
    main: ActivityRef,
    triggers: Vec<ActivityRef>,
}

impl WithSubactivities {
    /// Creates the group. `triggers` must not be empty.
    ///
    /// Trigger devices become affected-but-not-controlled devices of the
    /// group: excluded from concurrent admission, not subject to takeover
    /// reasoning.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        scheduler: SchedulerRef,
        main: ActivityRef,
        triggers: Vec<(Option<Condition>, ActivityRef)>,
    ) -> Result<Arc<Self>, ActivityError> {
        if triggers.is_empty() {
            return Err(ActivityError::Rejected {
                reason: "no triggers attached".into(),
            });
        }
        let controlled = main.body().controlled_devices();
        let mut affected = main.body().affected_devices();
        for (_, trigger) in &triggers {
            affected = affected.union(&trigger.body().affected_devices());
        }
        let body = ActivityBody::new(name, scheduler, controlled, affected);
        let mut trigger_refs = Vec::with_capacity(triggers.len());
        for (when, trigger) in triggers {
            body.attach_trigger(when, Arc::clone(&trigger))?;
            trigger_refs.push(trigger);
        }
        Ok(Arc::new(Self {
            body,
            main,
            triggers: trigger_refs,
        }))
    }

    /// This group as a schedulable handle.
    pub fn handle(self: &Arc<Self>) -> ActivityRef {
        Arc::clone(self) as ActivityRef
    }
}

#[async_trait]
impl Activity for WithSubactivities {
    fn body(&self) -> &Arc<ActivityBody> {
        &self.body
    }

    async fn prepare(&self, predecessors: &Predecessors) -> Result<Prepared, ActivityError> {
        let ready = match self.main.prepare(predecessors).await? {
            Prepared::Ready(ready) => ready,
            not_ready => return Ok(not_ready),
        };
        self.body.set_controlled(ready.controlled.clone());
        // assemble wraps the sealed main command and the prepared triggers
        // into the transaction described in the module docs.
        self.body
            .assemble(ready.command, ready.maintaining, predecessors)
            .await
    }

    fn property_sources(&self) -> Vec<ActivityRef> {
        let mut sources: Vec<ActivityRef> = self.triggers.iter().rev().map(Arc::clone).collect();
        sources.push(Arc::clone(&self.main));
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityOps, ActivityStatus};
    use crate::device::Device;
    use crate::testkit::*;

    #[tokio::test]
    async fn test_trigger_starts_on_condition_and_gates_done() {
        let rig = rig();
        let arm = Device::new("arm");
        let io = Device::new("io");
        let fire = rig.runtime.signal(false);
        let (main, pm) = motion(&rig.scheduler, "main", &[&arm]);
        let (sub, ps) = motion(&rig.scheduler, "sub", &[&io]);
        let group = WithSubactivities::new(
            "traced-move",
            rig.scheduler.clone(),
            Arc::clone(&main),
            vec![(Some(fire.condition()), Arc::clone(&sub))],
        )
        .unwrap();

        group.handle().begin_execute().await.unwrap();
        wait_status(&main, ActivityStatus::Running).await;
        settle().await;
        assert_eq!(sub.status(), ActivityStatus::Scheduled);

        fire.set(true);
        wait_status(&sub, ActivityStatus::Running).await;

        // The group is not done while the trigger is still active.
        rig.runtime.complete(pm.id());
        settle().await;
        assert_eq!(group.handle().status(), ActivityStatus::Running);

        rig.runtime.complete(ps.id());
        group.handle().end_execute().await.unwrap();
        assert_eq!(group.handle().status(), ActivityStatus::Completed);
    }

    #[tokio::test]
    async fn test_group_without_triggers_is_rejected() {
        let rig = rig();
        let arm = Device::new("arm");
        let (main, _pm) = motion(&rig.scheduler, "main", &[&arm]);
        assert!(WithSubactivities::new(
            "bare",
            rig.scheduler.clone(),
            main,
            Vec::new(),
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_trigger_devices_are_affected_not_controlled() {
        let rig = rig();
        let arm = Device::new("arm");
        let io = Device::new("io");
        let fire = rig.runtime.signal(false);
        let (main, _pm) = motion(&rig.scheduler, "main", &[&arm]);
        let (sub, _ps) = motion(&rig.scheduler, "sub", &[&io]);
        let group = WithSubactivities::new(
            "traced-move",
            rig.scheduler.clone(),
            main,
            vec![(Some(fire.condition()), sub)],
        )
        .unwrap();

        let handle = group.handle();
        assert!(handle.affected_devices().contains(&io));
        assert!(!handle.controlled_devices().contains(&io));
    }
}
