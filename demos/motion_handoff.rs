//! Two motions on one arm, the second taking over seamlessly when the
//! first signals takeover-allowed.
//!
//! Run with: `cargo run --example motion_handoff`

use std::sync::Arc;
use std::time::Duration;

use activisor::{
    command::sim::SimRuntime, Activity, ActivityOps, ActivityScheduler, Command, Device,
    DeviceSet, PrepareArgs, RtActivityFn,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let runtime = SimRuntime::new();
    let scheduler = ActivityScheduler::builder(runtime.clone()).build();
    let arm = Device::new("arm");

    let approach = RtActivityFn::arc(
        "approach",
        scheduler.clone(),
        DeviceSet::from_iter([Arc::clone(&arm)]),
        |cx: PrepareArgs| async move { cx.assemble(Command::atomic("approach")).await },
    );
    let pick = RtActivityFn::arc(
        "pick",
        scheduler.clone(),
        DeviceSet::from_iter([Arc::clone(&arm)]),
        |cx: PrepareArgs| async move { cx.assemble(Command::atomic("pick")).await },
    );

    approach.begin_execute().await?;
    let approach_cmd = approach.body().handle().expect("admitted").command();

    // Admitted while the approach still runs: equal device sets allow takeover.
    pick.begin_execute().await?;
    let pick_cmd = pick.body().handle().expect("admitted").command();
    println!("approach={:?} pick={:?}", approach.status(), pick.status());

    // The sim stands in for the real-time runtime: the approach reaches its
    // blending window and the pick command assumes control of the arm.
    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.allow_takeover(approach_cmd);
    approach.end_execute().await?;
    println!("handed off: approach={:?} pick={:?}", approach.status(), pick.status());

    runtime.complete(pick_cmd);
    pick.end_execute().await?;
    println!("done: pick={:?}", pick.status());
    Ok(())
}
