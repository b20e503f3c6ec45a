//! # ActivityScheduler: admission, hand-off, and device assignment.
//!
//! The scheduler is the only component with authority over admission order
//! and device hand-off. It is an explicit service object constructed once at
//! process start (via [`ActivityScheduler::builder`]) and passed by handle
//! ([`SchedulerRef`]) to every activity constructor.
//!
//! ## Admission protocol (`schedule`)
//! ```text
//! schedule(activity, controlled, command)
//!   ├─► conflict check against the waiting set (shared affected device → fail)
//!   ├─► register as waiting
//!   ├─► per-device predecessors from the assignment map
//!   │     └─ FAILED predecessor → force-finish; first raise aborts admission
//!   ├─► while >1 predecessor is SCHEDULED/RUNNING/MAINTAINING: await a change
//!   ├─► single live predecessor:
//!   │     ├─ controlled ⊇ prev.controlled → load_after (takeover), consume prev end
//!   │     ├─ prev MAINTAINING            → IllegalSuccessor{stranded devices}
//!   │     └─ else                        → await prev terminal, then load_after
//!   ├─► no predecessor → load directly
//!   ├─► update assignment map for every affected device; watch new devices
//!   └─► deregister from waiting (always, also on failure)
//! ```
//!
//! ## Rules
//! - The assignment map is updated only on the admission success path.
//! - Command ids are recorded as originated **before** loading, so the load
//!   observer never mistakes our own loads for foreign ones.
//! - Background listeners (subscriber fan-out, load observer, device
//!   watchers) stop when [`ActivityScheduler::shutdown`] cancels the root token.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::activity::{Activity, ActivityId, ActivityRef, ActivityStatus, Predecessors};
use crate::command::{Command, CommandHandle, CommandId, RuntimeRef};
use crate::device::{DeviceId, DeviceRef, DeviceSet};
use crate::error::{ActivityError, SchedulingError};
use crate::events::{Bus, Event, EventKind};
use crate::subscribers::{Subscribe, SubscriberSet};

use super::config::SchedulerConfig;

/// Shared handle to the scheduling service.
pub type SchedulerRef = Arc<ActivityScheduler>;

/// Builder for constructing the scheduler with optional subscribers.
pub struct SchedulerBuilder {
    runtime: RuntimeRef,
    cfg: SchedulerConfig,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl SchedulerBuilder {
    /// Creates a new builder over the given command runtime.
    pub fn new(runtime: RuntimeRef) -> Self {
        Self {
            runtime,
            cfg: SchedulerConfig::default(),
            subscribers: Vec::new(),
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, cfg: SchedulerConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Sets event subscribers (the scheduler's hook listeners).
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Builds the scheduler and starts its background listeners.
    pub fn build(self) -> SchedulerRef {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let subs = Arc::new(SubscriberSet::new(self.subscribers, bus.clone()));
        let scheduler = Arc::new(ActivityScheduler {
            cfg: self.cfg,
            runtime: self.runtime,
            bus,
            subs,
            assignments: RwLock::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            known_commands: Mutex::new(HashSet::new()),
            watched_devices: Mutex::new(HashSet::new()),
            token: CancellationToken::new(),
        });
        scheduler.spawn_subscriber_listener();
        scheduler.spawn_load_observer();
        scheduler
    }
}

/// Process-wide coordinator for activity admission and device hand-off.
pub struct ActivityScheduler {
    cfg: SchedulerConfig,
    runtime: RuntimeRef,
    bus: Bus,
    subs: Arc<SubscriberSet>,
    /// Most recently admitted activity per device.
    assignments: RwLock<HashMap<DeviceId, ActivityRef>>,
    /// Activities currently inside `schedule()`, with their affected sets.
    waiting: Mutex<HashMap<ActivityId, DeviceSet>>,
    /// Command ids this scheduler originated (pruned by the load observer).
    known_commands: Mutex<HashSet<CommandId>>,
    watched_devices: Mutex<HashSet<DeviceId>>,
    token: CancellationToken,
}

impl ActivityScheduler {
    /// Starts building a scheduler over `runtime`.
    pub fn builder(runtime: RuntimeRef) -> SchedulerBuilder {
        SchedulerBuilder::new(runtime)
    }

    /// The scheduler's event bus.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// The command runtime.
    pub fn runtime(&self) -> &RuntimeRef {
        &self.runtime
    }

    /// The configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    /// Stops background listeners. Running activities are unaffected.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// The per-device predecessor map for the given affected set.
    pub async fn predecessors(&self, affected: &DeviceSet) -> Predecessors {
        let map = self.assignments.read().await;
        let mut out = Predecessors::new();
        for device in affected.iter() {
            if let Some(prev) = map.get(&device.id()) {
                out.insert(device.id(), Arc::clone(prev));
            }
        }
        out
    }

    /// The activity currently assigned to `device`, if any.
    pub async fn assigned(&self, device: &DeviceRef) -> Option<ActivityRef> {
        self.assignments.read().await.get(&device.id()).cloned()
    }

    /// Forwards cancellation to the activity assigned to `device`.
    /// Returns false when no activity is assigned.
    pub async fn cancel_device(&self, device: &DeviceRef) -> Result<bool, ActivityError> {
        match self.assigned(device).await {
            Some(activity) => {
                activity.body().cancel()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Forwards `end_execute` to the activity assigned to `device`.
    /// Returns false when no activity is assigned.
    pub async fn end_device(&self, device: &DeviceRef) -> Result<bool, ActivityError> {
        match self.assigned(device).await {
            Some(activity) => {
                activity.body().end_wait().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Admits `activity` with the given controlled set and sealed command.
    ///
    /// See the module docs for the full protocol. Called by
    /// [`ActivityOps::begin_execute`](crate::activity::ActivityOps::begin_execute).
    pub async fn schedule(
        self: &Arc<Self>,
        activity: ActivityRef,
        controlled: &DeviceSet,
        command: Command,
    ) -> Result<CommandHandle, ActivityError> {
        let affected = activity.body().affected_devices();
        let own_id = activity.body().id();
        let name: Arc<str> = Arc::from(activity.name());

        // Step 1: a device claimed by another in-flight admission fails fast.
        let conflict = {
            let mut waiting = self.waiting.lock().expect("waiting lock");
            let shared = waiting.iter().find_map(|(id, devices)| {
                if *id != own_id {
                    devices.first_shared(&affected).map(|d| Arc::from(d.name()))
                } else {
                    None
                }
            });
            match shared {
                Some(device) => Some(device),
                None => {
                    waiting.insert(own_id, affected.clone());
                    None
                }
            }
        };
        if let Some(device) = conflict {
            self.bus.publish(
                Event::new(EventKind::SchedulingConflict)
                    .with_activity(Arc::clone(&name))
                    .with_device(Arc::clone(&device)),
            );
            return Err(SchedulingError::Conflict {
                activity: name,
                device,
            }
            .into());
        }

        let result = self
            .admit(&activity, controlled, &affected, name, command)
            .await;

        // Step 8: deregister from the waiting set, success or failure.
        self.waiting
            .lock()
            .expect("waiting lock")
            .remove(&own_id);
        result
    }

    async fn admit(
        self: &Arc<Self>,
        activity: &ActivityRef,
        controlled: &DeviceSet,
        affected: &DeviceSet,
        name: Arc<str>,
        command: Command,
    ) -> Result<CommandHandle, ActivityError> {
        let own_id = activity.body().id();

        // Step 3: per-device predecessors; force-finish failed ones.
        let mut previous: HashMap<DeviceId, ActivityRef> = HashMap::new();
        {
            let map = self.assignments.read().await;
            for device in affected.iter() {
                if let Some(prev) = map.get(&device.id()) {
                    if prev.body().id() != own_id {
                        previous.insert(device.id(), Arc::clone(prev));
                    }
                }
            }
        }
        for prev in distinct(&previous) {
            if prev.body().status() == ActivityStatus::Failed {
                match prev.body().end_wait().await {
                    // Failure already raised elsewhere: skip this predecessor.
                    Ok(()) => {}
                    Err(e) => {
                        self.bus.publish(
                            Event::new(EventKind::PredecessorFailureConsumed)
                                .with_activity(prev.name())
                                .with_reason(e.as_label()),
                        );
                        return Err(SchedulingError::PreviousActivityFailed {
                            source: Box::new(e),
                        }
                        .into());
                    }
                }
                let prev_id = prev.body().id();
                previous.retain(|_, a| a.body().id() != prev_id);
            }
        }

        // Step 4: at most one physically active predecessor may remain.
        // Statuses are read through freshly subscribed receivers so a change
        // between the check and the wait cannot be missed.
        let prev_alive = loop {
            let mut watches: Vec<(ActivityRef, watch::Receiver<ActivityStatus>)> =
                distinct(&previous)
                    .into_iter()
                    .map(|a| {
                        let rx = a.body().watch_status();
                        (a, rx)
                    })
                    .collect();
            watches.retain(|(_, rx)| {
                matches!(
                    *rx.borrow(),
                    ActivityStatus::Scheduled
                        | ActivityStatus::Running
                        | ActivityStatus::Maintaining
                )
            });
            if watches.len() <= 1 {
                break watches.into_iter().next().map(|(a, _)| a);
            }
            let changes = watches
                .iter_mut()
                .map(|(_, rx)| Box::pin(rx.changed()))
                .collect::<Vec<_>>();
            let _ = futures::future::select_all(changes).await;
        };

        // Record the id as originated before anything can be loaded.
        self.known_commands
            .lock()
            .expect("known lock")
            .insert(command.id());

        // Subscribe before loading so the hook forwarder misses no change.
        let status_rx = activity.body().watch_status();

        // Steps 5/6: start, take over, or sequence.
        let handle = match prev_alive {
            None => self.runtime.load(command).await?,
            Some(prev) => {
                let prev_controlled = prev.body().controlled_devices();
                match prev.body().handle() {
                    // An admitted predecessor always has a handle; be safe.
                    None => self.runtime.load(command).await?,
                    Some(prev_handle) => {
                        if controlled.is_superset_of(&prev_controlled) {
                            self.bus.publish(
                                Event::new(EventKind::TakeoverChained)
                                    .with_activity(Arc::clone(&name))
                                    .with_predecessor(prev.name()),
                            );
                            let handle =
                                self.runtime.load_after(command, &prev_handle).await?;
                            self.consume_end_async(Arc::clone(&prev));
                            handle
                        } else if prev.body().status() == ActivityStatus::Maintaining {
                            let stranded = prev_controlled.difference(controlled);
                            return Err(SchedulingError::IllegalSuccessor {
                                devices: stranded.names(),
                            }
                            .into());
                        } else {
                            self.bus.publish(
                                Event::new(EventKind::SequencedAfter)
                                    .with_activity(Arc::clone(&name))
                                    .with_predecessor(prev.name()),
                            );
                            let terminal = prev.body().wait_terminal().await;
                            if terminal == ActivityStatus::Failed {
                                if let Err(e) = prev.body().end_wait().await {
                                    return Err(SchedulingError::PreviousActivityFailed {
                                        source: Box::new(e),
                                    }
                                    .into());
                                }
                            }
                            self.runtime.load_after(command, &prev_handle).await?
                        }
                    }
                }
            }
        };

        // Step 7: assignment map and device watchers, success path only.
        {
            let mut map = self.assignments.write().await;
            for device in affected.iter() {
                map.insert(device.id(), Arc::clone(activity));
            }
        }
        for device in affected.iter() {
            self.watch_device(Arc::clone(device));
        }
        self.bus.publish(
            Event::new(EventKind::ActivityScheduled).with_activity(Arc::clone(&name)),
        );
        self.spawn_status_forwarder(name, status_rx);
        Ok(handle)
    }

    /// Asynchronously consumes the predecessor's end after a takeover, so a
    /// late failure is observed (and reported) rather than lost.
    fn consume_end_async(&self, prev: ActivityRef) {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            if let Err(e) = prev.body().end_wait().await {
                bus.publish(
                    Event::new(EventKind::PredecessorFailureConsumed)
                        .with_activity(prev.name())
                        .with_reason(e.as_label()),
                );
            }
        });
    }

    /// Forwards an admitted activity's status changes to the hooks until it
    /// reaches a terminal status.
    fn spawn_status_forwarder(
        &self,
        name: Arc<str>,
        mut rx: watch::Receiver<ActivityStatus>,
    ) {
        let bus = self.bus.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                let status = *rx.borrow_and_update();
                bus.publish(
                    Event::new(EventKind::StatusChanged)
                        .with_activity(Arc::clone(&name))
                        .with_status(status),
                );
                if status.is_terminal() {
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Fans bus events out to the subscriber set.
    fn spawn_subscriber_listener(self: &Arc<Self>) {
        let mut rx = self.bus.subscribe();
        let subs = Arc::clone(&self.subs);
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(ev) => {
                            // Overflow/panic reports are not fanned back out;
                            // that would feed the queue that just overflowed.
                            if !matches!(
                                ev.kind,
                                EventKind::SubscriberOverflow | EventKind::SubscriberPanicked
                            ) {
                                subs.emit(&ev);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        });
    }

    /// Invalidates all assignments when a command the scheduler did not
    /// originate is loaded through the runtime.
    fn spawn_load_observer(self: &Arc<Self>) {
        let mut rx = self.runtime.observe_loads();
        let weak = Arc::downgrade(self);
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => {
                        let Some(scheduler) = weak.upgrade() else { break };
                        match msg {
                            Ok(id) => scheduler.on_command_loaded(id).await,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                }
            }
        });
    }

    async fn on_command_loaded(&self, id: CommandId) {
        let known = self
            .known_commands
            .lock()
            .expect("known lock")
            .remove(&id);
        if known {
            return;
        }
        // The devices of a foreign command are unknowable; drop everything.
        self.assignments.write().await.clear();
        self.bus.publish(
            Event::new(EventKind::ForeignCommandLoaded).with_reason(format!("{id:?}")),
        );
    }

    /// Clears the assignment of any device that leaves the operational state.
    fn watch_device(self: &Arc<Self>, device: DeviceRef) {
        {
            let mut watched = self.watched_devices.lock().expect("watched lock");
            if !watched.insert(device.id()) {
                return;
            }
        }
        let weak = Arc::downgrade(self);
        let token = self.token.clone();
        tokio::spawn(async move {
            let mut rx = device.watch_state();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *rx.borrow();
                        if !state.is_operational() {
                            let Some(scheduler) = weak.upgrade() else { break };
                            scheduler.assignments.write().await.remove(&device.id());
                            scheduler.bus.publish(
                                Event::new(EventKind::DeviceNotOperational)
                                    .with_device(device.name()),
                            );
                        }
                    }
                }
            }
        });
    }
}

/// Distinct activities of a predecessor map (deduplicated by identity).
fn distinct(previous: &HashMap<DeviceId, ActivityRef>) -> Vec<ActivityRef> {
    let mut seen: Vec<ActivityId> = Vec::new();
    let mut out = Vec::new();
    for activity in previous.values() {
        let id = activity.body().id();
        if !seen.contains(&id) {
            seen.push(id);
            out.push(Arc::clone(activity));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityOps;
    use crate::command::Command;
    use crate::device::{Device, DeviceState};
    use crate::error::RtError;
    use crate::testkit::*;

    #[tokio::test]
    async fn test_admission_runs_and_completes() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, probe) = motion(&rig.scheduler, "a", &[&arm]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let mut rx = a.watch_status();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                loop {
                    let status = *rx.borrow_and_update();
                    seen.lock().unwrap().push(status);
                    if status.is_terminal() || rx.changed().await.is_err() {
                        break;
                    }
                }
            });
        }

        a.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        rig.runtime.complete(probe.id());
        a.end_execute().await.unwrap();
        assert_eq!(a.status(), ActivityStatus::Completed);

        // The device maps to the last admitted activity.
        let assigned = rig.scheduler.assigned(&arm).await.unwrap();
        assert_eq!(assigned.body().id(), a.body().id());

        // Status indexes only ever move forward.
        let seen = seen.lock().unwrap();
        assert!(seen
            .windows(2)
            .all(|pair| pair[0].index() < pair[1].index()));
    }

    #[tokio::test]
    async fn test_begin_twice_is_illegal() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, probe) = motion(&rig.scheduler, "a", &[&arm]);
        a.begin_execute().await.unwrap();
        let err = a.begin_execute().await.unwrap_err();
        assert_eq!(err.as_label(), "illegal_state");
        rig.runtime.complete(probe.id());
        a.end_execute().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_execute_raises_stored_failure_once() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, probe) = motion(&rig.scheduler, "a", &[&arm]);
        a.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        rig.runtime.fail(probe.id(), RtError::new("overload", "axis 2"));
        wait_status(&a, ActivityStatus::Failed).await;

        match a.end_execute().await {
            Err(ActivityError::Runtime { error }) => {
                assert_eq!(error.class.as_ref(), "overload")
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
        // The latch makes the second call return normally.
        a.end_execute().await.unwrap();
    }

    #[tokio::test]
    async fn test_takeover_starts_at_takeover_allowed_not_done() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, pa) = motion(&rig.scheduler, "a", &[&arm]);
        a.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;

        let mut events = rig.scheduler.bus().subscribe();
        let (b, pb) = motion(&rig.scheduler, "b", &[&arm]);
        b.begin_execute().await.unwrap();
        settle().await;
        // Chained, not started: the predecessor still runs.
        assert_eq!(b.status(), ActivityStatus::Scheduled);
        assert_eq!(a.status(), ActivityStatus::Running);

        rig.runtime.allow_takeover(pa.id());
        wait_status(&b, ActivityStatus::Running).await;
        wait_status(&a, ActivityStatus::Completed).await;

        rig.runtime.complete(pb.id());
        b.end_execute().await.unwrap();

        let mut saw_takeover = false;
        while let Ok(ev) = events.try_recv() {
            if ev.kind == EventKind::TakeoverChained {
                assert_eq!(ev.activity.as_deref(), Some("b"));
                assert_eq!(ev.predecessor.as_deref(), Some("a"));
                saw_takeover = true;
            }
        }
        assert!(saw_takeover);
    }

    #[tokio::test]
    async fn test_sequencing_waits_and_concurrent_claim_conflicts() {
        let rig = rig();
        let d1 = Device::new("d1");
        let d2 = Device::new("d2");
        let (a, pa) = motion(&rig.scheduler, "a", &[&d1, &d2]);
        a.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;

        // B controls a strict subset: no takeover, admission waits.
        let (b, pb) = motion(&rig.scheduler, "b", &[&d1]);
        let b_begin = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.begin_execute().await })
        };
        settle().await;
        assert_eq!(b.status(), ActivityStatus::New);

        // A third activity claiming d1 while B is inside schedule() fails.
        let (c, _pc) = motion(&rig.scheduler, "c", &[&d1]);
        match c.begin_execute().await {
            Err(ActivityError::Scheduling(SchedulingError::Conflict { device, .. })) => {
                assert_eq!(device.as_ref(), "d1")
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        rig.runtime.complete(pa.id());
        b_begin.await.unwrap().unwrap();
        wait_status(&b, ActivityStatus::Running).await;
        rig.runtime.complete(pb.id());
        b.end_execute().await.unwrap();
    }

    #[tokio::test]
    async fn test_maintaining_predecessor_rejects_partial_successor() {
        let rig = rig();
        let d1 = Device::new("d1");
        let d2 = Device::new("d2");
        let hold = rig.runtime.signal(false);

        let (a, _pa) = motion(&rig.scheduler, "a", &[&d1, &d2]);
        a.body().maintain_when(hold.condition()).unwrap();
        a.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        hold.set(true);
        wait_exact(&a, ActivityStatus::Maintaining).await;

        let (b, _pb) = motion(&rig.scheduler, "b", &[&d1]);
        match b.begin_execute().await {
            Err(ActivityError::Scheduling(SchedulingError::IllegalSuccessor { devices })) => {
                assert_eq!(devices, vec![Arc::from("d2")])
            }
            other => panic!("expected illegal successor, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_predecessor_wraps_then_clears() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, pa) = motion(&rig.scheduler, "a", &[&arm]);
        a.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        rig.runtime.fail(pa.id(), RtError::new("estop", "pressed"));
        wait_status(&a, ActivityStatus::Failed).await;

        // First admission over the failed predecessor consumes its failure.
        let (b, _pb) = motion(&rig.scheduler, "b", &[&arm]);
        match b.begin_execute().await {
            Err(ActivityError::Scheduling(SchedulingError::PreviousActivityFailed {
                source,
            })) => assert_eq!(source.as_label(), "command_failed"),
            other => panic!("expected previous-activity-failed, got {other:?}"),
        }

        // The failure was raised once; the next admission skips the
        // predecessor and starts directly.
        let (c, pc) = motion(&rig.scheduler, "c", &[&arm]);
        c.begin_execute().await.unwrap();
        wait_status(&c, ActivityStatus::Running).await;
        rig.runtime.complete(pc.id());
        c.end_execute().await.unwrap();
    }

    #[tokio::test]
    async fn test_waits_until_single_predecessor_remains() {
        let rig = rig();
        let d1 = Device::new("d1");
        let d2 = Device::new("d2");
        let (a, pa) = motion(&rig.scheduler, "a", &[&d1]);
        let (b, pb) = motion(&rig.scheduler, "b", &[&d2]);
        a.begin_execute().await.unwrap();
        b.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;
        wait_status(&b, ActivityStatus::Running).await;

        // C spans both devices; two predecessors are alive, so it blocks.
        let (c, pc) = motion(&rig.scheduler, "c", &[&d1, &d2]);
        let c_begin = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.begin_execute().await })
        };
        settle().await;
        assert_eq!(c.status(), ActivityStatus::New);

        // One predecessor finishes; C chains onto the remaining one.
        rig.runtime.complete(pa.id());
        c_begin.await.unwrap().unwrap();
        wait_status(&c, ActivityStatus::Scheduled).await;

        rig.runtime.complete(pb.id());
        wait_status(&c, ActivityStatus::Running).await;
        rig.runtime.complete(pc.id());
        c.end_execute().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_load_invalidates_assignments() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, _pa) = motion(&rig.scheduler, "a", &[&arm]);
        a.begin_execute().await.unwrap();
        assert!(rig.scheduler.assigned(&arm).await.is_some());

        // A command loaded outside the scheduler invalidates the map.
        let mut foreign = Command::atomic("foreign");
        foreign.seal();
        use crate::command::CommandRuntime;
        rig.runtime.load(foreign).await.unwrap();
        settle().await;
        assert!(rig.scheduler.assigned(&arm).await.is_none());
    }

    #[tokio::test]
    async fn test_device_leaving_operational_clears_assignment() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, _pa) = motion(&rig.scheduler, "a", &[&arm]);
        a.begin_execute().await.unwrap();
        assert!(rig.scheduler.assigned(&arm).await.is_some());

        arm.set_state(DeviceState::Offline);
        settle().await;
        assert!(rig.scheduler.assigned(&arm).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_device_forwards_to_assigned_activity() {
        let rig = rig();
        let arm = Device::new("arm");
        let (a, _pa) = motion(&rig.scheduler, "a", &[&arm]);
        a.begin_execute().await.unwrap();
        wait_status(&a, ActivityStatus::Running).await;

        assert!(rig.scheduler.cancel_device(&arm).await.unwrap());
        // A cancelled command winds down without an error.
        a.end_execute().await.unwrap();
        assert_eq!(a.status(), ActivityStatus::Completed);

        let idle = Device::new("idle");
        assert!(!rig.scheduler.cancel_device(&idle).await.unwrap());
    }
}
