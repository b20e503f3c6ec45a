//! Shared helpers for the crate's unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::activity::{Activity, ActivityOps, ActivityRef, ActivityStatus, PrepareArgs, RtActivityFn};
use crate::command::sim::SimRuntime;
use crate::command::{Command, CommandId};
use crate::device::{DeviceRef, DeviceSet};
use crate::scheduler::{ActivityScheduler, SchedulerRef};

/// A scheduler over a fresh sim runtime.
pub(crate) struct TestRig {
    pub runtime: Arc<SimRuntime>,
    pub scheduler: SchedulerRef,
}

pub(crate) fn rig() -> TestRig {
    let runtime = SimRuntime::new();
    let scheduler = ActivityScheduler::builder(runtime.clone()).build();
    TestRig { runtime, scheduler }
}

/// Records the command id of the most recent preparation of a test motion.
#[derive(Clone)]
pub(crate) struct Probe(Arc<Mutex<Option<CommandId>>>);

impl Probe {
    pub fn id(&self) -> CommandId {
        self.0.lock().unwrap().expect("motion not prepared yet")
    }
}

/// A leaf activity backed by one atomic command, with a probe exposing the
/// command id so tests can drive the sim runtime.
pub(crate) fn motion(
    scheduler: &SchedulerRef,
    name: &'static str,
    devices: &[&DeviceRef],
) -> (ActivityRef, Probe) {
    let probe = Probe(Arc::new(Mutex::new(None)));
    let slot = Arc::clone(&probe.0);
    let activity = RtActivityFn::arc(
        name,
        scheduler.clone(),
        DeviceSet::from_iter(devices.iter().map(|d| Arc::clone(*d))),
        move |cx: PrepareArgs| {
            let slot = Arc::clone(&slot);
            async move {
                let cmd = Command::atomic(name);
                *slot.lock().unwrap() = Some(cmd.id());
                cx.assemble(cmd).await
            }
        },
    );
    (activity, probe)
}

/// Awaits a status at or past `target` in phase order.
pub(crate) async fn wait_status(activity: &ActivityRef, target: ActivityStatus) {
    let mut rx = activity.watch_status();
    tokio::time::timeout(Duration::from_secs(2), async {
        rx.wait_for(|s| s.index() >= target.index()).await.unwrap();
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "timed out waiting for {:?} (activity '{}' is {:?})",
            target,
            activity.name(),
            activity.status()
        )
    });
}

/// Awaits exactly `target` (for phases that must be observed themselves).
pub(crate) async fn wait_exact(activity: &ActivityRef, target: ActivityStatus) {
    let mut rx = activity.watch_status();
    tokio::time::timeout(Duration::from_secs(2), async {
        rx.wait_for(|s| *s == target).await.unwrap();
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "timed out waiting for exactly {:?} (activity '{}' is {:?})",
            target,
            activity.name(),
            activity.status()
        )
    });
}

/// A short pause letting spawned drivers settle.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}
