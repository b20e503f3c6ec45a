//! # Activity trait and execution operations.
//!
//! [`Activity`] is the contract every schedulable unit implements: expose its
//! shared [`ActivityBody`] and build its command in `prepare`. The execution
//! surface — `begin_execute`/`execute`/`end_execute`/`cancel_execute`,
//! status access, property queries — lives on [`ActivityOps`], implemented
//! for the shared handle type [`ActivityRef`].
//!
//! [`RtActivityFn`] is the function-backed leaf: a closure builds a fresh
//! command per preparation, which keeps retried preparations free of shared
//! mutable state.

use std::any::TypeId;
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::activity::body::{ActivityBody, ActivityId};
use crate::activity::property::PropertyValue;
use crate::activity::status::ActivityStatus;
use crate::command::{Command, Condition};
use crate::device::{DeviceId, DeviceRef, DeviceSet};
use crate::error::{ActivityError, SchedulingError};
use crate::scheduler::SchedulerRef;

/// Shared handle to an activity.
pub type ActivityRef = Arc<dyn Activity>;

/// Outcome of preparing an activity against its predecessors.
pub enum Prepared {
    /// The command is sealed and ready for admission.
    Ready(ReadyCommand),
    /// A predecessor has not finished yet; the caller force-finishes it and
    /// retries (explicit result instead of exception-based control flow).
    NotYetComplete {
        /// The unfinished predecessor.
        blocking: ActivityRef,
    },
}

impl Prepared {
    /// Convenience constructor for the retry case.
    pub fn not_yet_complete(blocking: ActivityRef) -> Self {
        Prepared::NotYetComplete { blocking }
    }
}

/// A sealed command plus the admission data derived from preparation.
pub struct ReadyCommand {
    /// The sealed command to load.
    pub command: Command,
    /// Devices the activity will drive.
    pub controlled: DeviceSet,
    /// Condition flipping the activity to MAINTAINING, if any
    /// (exposed so `Parallel` can compose member maintaining conditions).
    pub maintaining: Option<Condition>,
}

/// Per-device predecessor map computed by the scheduler.
#[derive(Clone, Default)]
pub struct Predecessors {
    map: HashMap<DeviceId, ActivityRef>,
}

impl Predecessors {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, device: DeviceId, activity: ActivityRef) {
        self.map.insert(device, activity);
    }

    /// The predecessor assigned to `device`, if any.
    pub fn for_device(&self, device: &DeviceRef) -> Option<&ActivityRef> {
        self.map.get(&device.id())
    }

    /// Returns a copy where every affected device of `activity` maps to it
    /// (used by `Sequential` to prepare member i against member i-1).
    pub fn updated_with(&self, activity: &ActivityRef) -> Predecessors {
        let mut out = self.clone();
        for device in activity.body().affected_devices().iter() {
            out.map.insert(device.id(), Arc::clone(activity));
        }
        out
    }

    /// Distinct predecessors (deduplicated by activity identity).
    pub fn distinct(&self) -> Vec<ActivityRef> {
        let mut seen: Vec<ActivityId> = Vec::new();
        let mut out = Vec::new();
        for activity in self.map.values() {
            let id = activity.body().id();
            if !seen.contains(&id) {
                seen.push(id);
                out.push(Arc::clone(activity));
            }
        }
        out
    }

    /// True when no device has a predecessor.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A schedulable unit of work affecting one or more devices.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// The shared core of this activity.
    fn body(&self) -> &Arc<ActivityBody>;

    /// Builds (and seals) the activity's command against the given
    /// predecessor map. Called from `begin_execute`, possibly repeatedly
    /// when predecessors must be force-finished first.
    async fn prepare(&self, predecessors: &Predecessors) -> Result<Prepared, ActivityError>;

    /// Members searched by property queries, in reverse declaration order.
    fn property_sources(&self) -> Vec<ActivityRef> {
        Vec::new()
    }

    /// Awaited before non-local property reads resolve. The default waits
    /// for this activity's bag to be populated; `Conditional` additionally
    /// awaits its branch decision.
    async fn property_barrier(&self) {
        self.body().properties().wait_populated().await;
    }

    /// Display name.
    fn name(&self) -> &str {
        self.body().name()
    }
}

/// Execution operations on a shared activity handle.
#[async_trait]
pub trait ActivityOps {
    /// Admits the activity: computes predecessors, prepares (force-finishing
    /// unfinished predecessors as needed), and schedules the command.
    /// Requires status NEW; returns once admission completed.
    async fn begin_execute(&self) -> Result<(), ActivityError>;

    /// Convenience: `begin_execute` followed by `end_execute`.
    async fn execute(&self) -> Result<(), ActivityError>;

    /// Awaits MAINTAINING, COMPLETED or FAILED; a stored failure is raised
    /// exactly once (subsequent calls return `Ok`).
    async fn end_execute(&self) -> Result<(), ActivityError>;

    /// Forwards cancellation to the running command. Requires status ≠ NEW.
    fn cancel_execute(&self) -> Result<(), ActivityError>;

    /// Current status.
    fn status(&self) -> ActivityStatus;

    /// Subscribes to status changes (current value replays immediately).
    fn watch_status(&self) -> watch::Receiver<ActivityStatus>;

    /// Controlled ∪ additional affected devices.
    fn affected_devices(&self) -> DeviceSet;

    /// Devices this activity drives.
    fn controlled_devices(&self) -> DeviceSet;

    /// Non-blocking property lookup: local bag first, then members in
    /// reverse declaration order.
    fn try_property<T: std::any::Any + Send + Sync>(
        &self,
        device: &DeviceRef,
    ) -> Option<Arc<T>>;

    /// Future-style property lookup: awaits the activity's property barrier,
    /// then resolves like [`ActivityOps::try_property`].
    async fn property<T: std::any::Any + Send + Sync>(
        &self,
        device: &DeviceRef,
    ) -> Option<Arc<T>>;
}

#[async_trait]
impl ActivityOps for ActivityRef {
    async fn begin_execute(&self) -> Result<(), ActivityError> {
        let body = self.body();
        if body.status() != ActivityStatus::New {
            return Err(SchedulingError::IllegalState {
                operation: "begin_execute",
                status: body.status(),
            }
            .into());
        }
        let scheduler = body.scheduler().clone();

        // Retry until preparation succeeds or a different error occurs:
        // an unfinished predecessor is force-finished, then prepare reruns.
        let ready = loop {
            let predecessors = scheduler.predecessors(&body.affected_devices()).await;
            match self.prepare(&predecessors).await? {
                Prepared::Ready(ready) => break ready,
                Prepared::NotYetComplete { blocking } => {
                    blocking.end_execute().await.map_err(|e| {
                        SchedulingError::PreviousActivityFailed {
                            source: Box::new(e),
                        }
                    })?;
                }
            }
        };

        body.set_controlled(ready.controlled.clone());
        body.properties().mark_populated();

        let handle = scheduler
            .schedule(Arc::clone(self), &ready.controlled, ready.command)
            .await?;
        body.store_handle(handle);
        body.apply_begin();
        Ok(())
    }

    async fn execute(&self) -> Result<(), ActivityError> {
        self.begin_execute().await?;
        self.end_execute().await
    }

    async fn end_execute(&self) -> Result<(), ActivityError> {
        self.body().end_wait().await
    }

    fn cancel_execute(&self) -> Result<(), ActivityError> {
        self.body().cancel()
    }

    fn status(&self) -> ActivityStatus {
        self.body().status()
    }

    fn watch_status(&self) -> watch::Receiver<ActivityStatus> {
        self.body().watch_status()
    }

    fn affected_devices(&self) -> DeviceSet {
        self.body().affected_devices()
    }

    fn controlled_devices(&self) -> DeviceSet {
        self.body().controlled_devices()
    }

    fn try_property<T: std::any::Any + Send + Sync>(
        &self,
        device: &DeviceRef,
    ) -> Option<Arc<T>> {
        find_property_raw(self, device.id(), TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
    }

    async fn property<T: std::any::Any + Send + Sync>(
        &self,
        device: &DeviceRef,
    ) -> Option<Arc<T>> {
        self.property_barrier().await;
        self.try_property::<T>(device)
    }
}

/// Type-erased property search: local bag, then members in reverse
/// declaration order (first hit wins).
fn find_property_raw(
    activity: &ActivityRef,
    device: DeviceId,
    type_id: TypeId,
) -> Option<PropertyValue> {
    if let Some(value) = activity.body().properties().get_raw(device, type_id) {
        return Some(value);
    }
    for source in activity.property_sources() {
        if let Some(value) = find_property_raw(&source, device, type_id) {
            return Some(value);
        }
    }
    None
}

/// Arguments handed to an [`RtActivityFn`] preparation closure.
pub struct PrepareArgs {
    /// The predecessor map for this preparation round.
    pub predecessors: Predecessors,
    /// The activity's shared core (property bag, declarations).
    pub body: Arc<ActivityBody>,
}

impl PrepareArgs {
    /// Seals `raw` with the activity's declarations and returns the
    /// prepared command.
    pub async fn assemble(&self, raw: Command) -> Result<Prepared, ActivityError> {
        self.body.assemble(raw, None, &self.predecessors).await
    }

    /// Like [`PrepareArgs::assemble`] with an explicit maintaining condition.
    pub async fn assemble_maintaining(
        &self,
        raw: Command,
        maintaining: Condition,
    ) -> Result<Prepared, ActivityError> {
        self.body
            .assemble(raw, Some(maintaining), &self.predecessors)
            .await
    }
}

/// Function-backed activity.
///
/// Wraps a closure that builds a **fresh** command per preparation.
///
/// ## Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use activisor::{
///     ActivityRef, Command, DeviceSet, PrepareArgs, RtActivityFn, SchedulerRef,
/// };
///
/// fn linear_move(scheduler: &SchedulerRef, arm: &activisor::DeviceRef) -> ActivityRef {
///     RtActivityFn::arc(
///         "lin",
///         scheduler.clone(),
///         DeviceSet::from_iter([Arc::clone(arm)]),
///         |cx: PrepareArgs| async move { cx.assemble(Command::atomic("lin")).await },
///     )
/// }
/// ```
pub struct RtActivityFn<F> {
    body: Arc<ActivityBody>,
    f: F,
}

impl<F, Fut> RtActivityFn<F>
where
    F: Fn(PrepareArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Prepared, ActivityError>> + Send + 'static,
{
    /// Creates the activity and returns it as a shared handle.
    pub fn arc(
        name: impl Into<Cow<'static, str>>,
        scheduler: SchedulerRef,
        controlled: DeviceSet,
        f: F,
    ) -> ActivityRef {
        Arc::new(Self {
            body: ActivityBody::new(name, scheduler, controlled, DeviceSet::new()),
            f,
        })
    }
}

#[async_trait]
impl<F, Fut> Activity for RtActivityFn<F>
where
    F: Fn(PrepareArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Prepared, ActivityError>> + Send + 'static,
{
    fn body(&self) -> &Arc<ActivityBody> {
        &self.body
    }

    async fn prepare(&self, predecessors: &Predecessors) -> Result<Prepared, ActivityError> {
        (self.f)(PrepareArgs {
            predecessors: predecessors.clone(),
            body: Arc::clone(&self.body),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WatchMode;
    use crate::device::Device;
    use crate::error::RtError;
    use crate::testkit::*;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    #[tokio::test]
    async fn test_end_and_cancel_require_begun_activity() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, _p) = motion(&rig.scheduler, "a", &[&arm]);
        assert_eq!(a.end_execute().await.unwrap_err().as_label(), "illegal_state");
        assert_eq!(a.cancel_execute().unwrap_err().as_label(), "illegal_state");
    }

    #[tokio::test]
    async fn test_declarations_are_sealed_by_admission() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, p) = motion(&rig.scheduler, "a", &[&arm]);
        a.begin_execute().await.unwrap();
        let err = a
            .body()
            .declare_ignored("late")
            .unwrap_err();
        assert!(matches!(err, ActivityError::Sealed));
        rig.runtime.complete(p.id());
        a.end_execute().await.unwrap();
    }

    #[tokio::test]
    async fn test_declared_raise_fails_the_activity() {
        let rig = rig();
        let arm = Device::new("arm");
        let tripwire = rig.runtime.signal(false);
        let (a, _p) = motion(&rig.scheduler, "a", &[&arm]);
        a.body()
            .declare_raise(tripwire.condition(), RtError::new("guard", "tripped"))
            .unwrap();

        a.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        tripwire.set(true);

        match a.end_execute().await {
            Err(ActivityError::Runtime { error }) => assert_eq!(error.class.as_ref(), "guard"),
            other => panic!("expected guard error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ignored_class_completes_normally() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, p) = motion(&rig.scheduler, "a", &[&arm]);
        a.body().declare_ignored("glitch").unwrap();

        a.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        rig.runtime.fail(p.id(), RtError::new("glitch", "transient"));
        a.end_execute().await.unwrap();
        assert_eq!(a.status(), ActivityStatus::Completed);
    }

    #[tokio::test]
    async fn test_propagation_replaces_error_class() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, p) = motion(&rig.scheduler, "a", &[&arm]);
        a.body()
            .declare_propagation("overload", RtError::new("estop", "mapped from overload"))
            .unwrap();

        a.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        rig.runtime.fail(p.id(), RtError::new("overload", "axis 6"));
        match a.end_execute().await {
            Err(ActivityError::Runtime { error }) => assert_eq!(error.class.as_ref(), "estop"),
            other => panic!("expected mapped error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_when_condition_cancels_command() {
        let rig = rig();
        let arm = Device::new("arm");
        let abort = rig.runtime.signal(false);
        let (a, _p) = motion(&rig.scheduler, "a", &[&arm]);
        a.body().cancel_when(abort.condition()).unwrap();

        a.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        abort.set(true);
        a.end_execute().await.unwrap();
        assert_eq!(a.status(), ActivityStatus::Completed);
    }

    #[tokio::test]
    async fn test_state_listener_fires_once() {
        let rig = rig();
        let arm = Device::new("arm");
        let ping = rig.runtime.signal(false);
        let fired = Arc::new(AtomicBool::new(false));
        let (a, p) = motion(&rig.scheduler, "a", &[&arm]);
        {
            let fired = Arc::clone(&fired);
            a.body()
                .watch_state(
                    ping.condition(),
                    WatchMode::Once,
                    Arc::new(move || fired.store(true, AtomicOrdering::SeqCst)),
                )
                .unwrap();
        }

        a.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        assert!(!fired.load(AtomicOrdering::SeqCst));
        ping.set(true);
        settle().await;
        assert!(fired.load(AtomicOrdering::SeqCst));

        rig.runtime.complete(p.id());
        a.end_execute().await.unwrap();
    }

    #[tokio::test]
    async fn test_properties_resolve_after_admission() {
        #[derive(Debug, PartialEq)]
        struct FinalPose(f64);

        let rig = rig();
        let arm = Device::new("arm");
        let arm2 = Arc::clone(&arm);
        let a = RtActivityFn::arc(
            "a",
            rig.scheduler.clone(),
            DeviceSet::from_iter([Arc::clone(&arm)]),
            move |cx: PrepareArgs| {
                let arm = Arc::clone(&arm2);
                async move {
                    cx.body.properties().insert(&arm, FinalPose(0.7));
                    cx.assemble(crate::command::Command::atomic("a")).await
                }
            },
        );

        assert!(a.try_property::<FinalPose>(&arm).is_none());
        a.begin_execute().await.unwrap();
        let pose = a.property::<FinalPose>(&arm).await.unwrap();
        assert_eq!(pose.0, 0.7);
    }
}
