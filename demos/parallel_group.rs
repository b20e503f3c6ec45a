//! An arm motion and a gripper motion running as one parallel group.
//!
//! Run with: `cargo run --example parallel_group`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use activisor::{
    command::sim::SimRuntime, ActivityOps, ActivityRef, ActivityScheduler, Command, CommandId,
    Device, DeviceRef, DeviceSet, Parallel, PrepareArgs, RtActivityFn, SchedulerRef,
};

/// A leaf motion that records the id of its prepared command, so this demo
/// can drive the sim runtime the way a controller would report progress.
fn motion(
    scheduler: &SchedulerRef,
    name: &'static str,
    device: &DeviceRef,
) -> (ActivityRef, Arc<Mutex<Option<CommandId>>>) {
    let slot = Arc::new(Mutex::new(None));
    let recorder = Arc::clone(&slot);
    let activity = RtActivityFn::arc(
        name,
        scheduler.clone(),
        DeviceSet::from_iter([Arc::clone(device)]),
        move |cx: PrepareArgs| {
            let recorder = Arc::clone(&recorder);
            async move {
                let cmd = Command::atomic(name);
                *recorder.lock().unwrap() = Some(cmd.id());
                cx.assemble(cmd).await
            }
        },
    );
    (activity, slot)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let runtime = SimRuntime::new();
    let scheduler = ActivityScheduler::builder(runtime.clone()).build();
    let arm = Device::new("arm");
    let gripper = Device::new("gripper");

    let (swing, swing_cmd) = motion(&scheduler, "swing", &arm);
    let (open, open_cmd) = motion(&scheduler, "open", &gripper);

    let group = Parallel::builder("swing+open", scheduler.clone())
        .with(Arc::clone(&swing))
        .with(Arc::clone(&open))
        .build()?;

    group.begin_execute().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("swing={:?} open={:?}", swing.status(), open.status());

    // Both members must finish before the group is done.
    runtime.complete(open_cmd.lock().unwrap().unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("gripper done, group={:?}", group.status());

    runtime.complete(swing_cmd.lock().unwrap().unwrap());
    group.end_execute().await?;
    println!("group={:?}", group.status());
    Ok(())
}
