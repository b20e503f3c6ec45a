//! A conditional activity choosing between two gripper actions based on a
//! runtime signal, with the built-in log subscriber attached.
//!
//! Run with: `cargo run --example conditional_branch --features logging`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use activisor::{
    command::sim::SimRuntime, ActivityOps, ActivityRef, ActivityScheduler, Command, CommandId,
    Conditional, Device, DeviceRef, DeviceSet, LogWriter, PrepareArgs, RtActivityFn,
    SchedulerRef, Subscribe,
};

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
    let scheduler = ActivityScheduler::builder(runtime.clone())
        .with_subscribers(vec![Arc::new(LogWriter::new()) as Arc<dyn Subscribe>])
        .build();
    let gripper = Device::new("gripper");

    // A sensor the controller flips at runtime.
    let part_present = runtime.signal(true);

    let (grasp, grasp_cmd) = motion(&scheduler, "grasp", &gripper);
    let (release, _release_cmd) = motion(&scheduler, "release", &gripper);

    let branch = Conditional::new(
        "grasp-or-release",
        scheduler.clone(),
        part_present.condition(),
        grasp,
        Some(release),
    );

    branch.handle().begin_execute().await?;
    println!("decision: {:?}", branch.decision().await);

    runtime.complete(grasp_cmd.lock().unwrap().unwrap());
    branch.handle().end_execute().await?;
    println!("finished: {:?}", branch.handle().status());

    // Give the log subscriber a moment to drain.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
