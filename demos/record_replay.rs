//! Record & Replay Example
//!
//! This example demonstrates the full engine cycle on a small worker
//! scenario with:
//! - A main routine handing work to a worker over an unbuffered channel
//! - A second channel whose send is never received (a leaked operation)
//! - Flushing per-routine trace files and loading them back
//! - Partner matching and leak detection on the loaded trace
//! - A replay that reproduces the recorded completion order and reports
//!   its verdict against the exit-code fence

use crre::{
    load, CallKind, ChannelOp, ElementKind, MutexOp, ObjectId, OpId, Recorder, RecorderConfig,
    ReplayScheduler, RoutineId, SourceLocation, TurnOutcome,
};
use std::error::Error;
use std::time::Duration;

fn channel(id: u64, op: ChannelOp, op_id: u64) -> ElementKind {
    ElementKind::Channel {
        id: ObjectId(id),
        op,
        op_id: OpId(op_id),
        buffered: false,
        partner: None,
    }
}

fn lock(id: u64, op: MutexOp) -> ElementKind {
    ElementKind::Mutex {
        id: ObjectId(id),
        rw: false,
        op,
        success: true,
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    let dir = tempfile::tempdir()?;
    let trace_dir = dir.path().join("demo_trace");

    // ------------------------------------------------------------------
    // First run: record.
    // ------------------------------------------------------------------
    let recorder = Recorder::new(RecorderConfig::new(&trace_dir));
    let main_routine = recorder.register();
    let worker = recorder.register();

    main_routine.record_completed(lock(1, MutexOp::Lock), SourceLocation::new("demo.rs", 10));
    main_routine.record_completed(lock(1, MutexOp::Unlock), SourceLocation::new("demo.rs", 12));

    // The handoff: send and recv pair up on channel 2.
    let send = main_routine.record(channel(2, ChannelOp::Send, 1), SourceLocation::new("demo.rs", 14));
    let recv = worker.record(channel(2, ChannelOp::Recv, 1), SourceLocation::new("demo.rs", 30));
    main_routine.complete(send);
    worker.complete(recv);

    // The bug: the worker sends a result on channel 3, but the main routine
    // returned early and nobody ever receives it.
    worker.record(channel(3, ChannelOp::Send, 0), SourceLocation::new("demo.rs", 33));

    main_routine.finish();
    worker.finish();
    recorder.set_expected_exit(0);

    let summary = recorder.flush()?;
    println!(
        "recorded {} elements across {} routines into {}",
        summary.elements,
        summary.routines,
        summary.path.display()
    );

    // ------------------------------------------------------------------
    // Load: partner matching and leak detection.
    // ------------------------------------------------------------------
    let trace = load(&trace_dir)?;
    for leak in trace.leak_candidates() {
        println!("leak candidate: {:?} at {}", leak.kind, leak.location);
    }
    let send_element = &trace.routines[&RoutineId(1)][2];
    if let ElementKind::Channel {
        partner: Some(partner),
        ..
    } = &send_element.kind
    {
        println!("handoff send paired with recv at {}", partner);
    }

    // ------------------------------------------------------------------
    // Second run: replay under the recorded order.
    // ------------------------------------------------------------------
    let scheduler = ReplayScheduler::builder()
        .with_trace(trace)
        .with_timeout(Duration::from_secs(10))
        .build()?;

    let replayed_main = scheduler.clone();
    let main_thread = std::thread::spawn(move || {
        for (kind, line) in [
            (CallKind::Mutex { rw: false, op: MutexOp::Lock }, 10),
            (CallKind::Mutex { rw: false, op: MutexOp::Unlock }, 12),
            (CallKind::Channel(ChannelOp::Send), 14),
        ] {
            match replayed_main.await_turn(
                RoutineId(1),
                kind,
                &SourceLocation::new("demo.rs", line),
            ) {
                TurnOutcome::Proceed(guard) => guard.complete(true),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
    });
    match scheduler.await_turn(
        RoutineId(2),
        CallKind::Channel(ChannelOp::Recv),
        &SourceLocation::new("demo.rs", 30),
    ) {
        TurnOutcome::Proceed(guard) => guard.complete(true),
        other => panic!("unexpected outcome: {:?}", other),
    }
    main_thread.join().expect("replayed main routine panicked");

    let verdict = scheduler.finish(0);
    println!("{}", verdict.summary());
    Ok(())
}
