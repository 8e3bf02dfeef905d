use crre::{
    load, CallKind, ChannelOp, ElementKind, MutexOp, ReplayScheduler, RoutineId, SourceLocation,
    TurnOutcome,
};
use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn write_trace(dir: &Path, routine: u64, lines: &[&str]) {
    fs::write(
        dir.join(format!("trace_{}.log", routine)),
        lines.join("\n") + "\n",
    )
    .unwrap();
}

fn proceed(outcome: TurnOutcome) -> crre::OperationGuard {
    match outcome {
        TurnOutcome::Proceed(guard) => guard,
        other => panic!("expected proceed, got {:?}", other),
    }
}

/// Scenario A: two routines, one unbuffered channel. The send was issued at
/// tick 5 and completed at tick 12; the recv was issued at 6 and completed
/// at 12. The loader links them as partners and the replay releases both
/// real operations together once both cursors reach the pair.
#[test]
fn test_unbuffered_pair_replays_through_a_real_rendezvous() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(dir.path(), 1, &["C,5,12,3,S,7,f,send.rs:10"]);
    write_trace(dir.path(), 2, &["C,6,12,3,R,7,f,recv.rs:20"]);

    let trace = load(dir.path()).unwrap();
    let send = &trace.routines[&RoutineId(1)][0];
    match &send.kind {
        ElementKind::Channel { partner, .. } => {
            assert_eq!(partner.as_ref().unwrap().to_string(), "recv.rs:20")
        }
        other => panic!("expected channel element, got {:?}", other),
    }

    let scheduler = ReplayScheduler::new(trace).unwrap();
    // The real operation: a rendezvous channel, so the send cannot complete
    // until the recv runs. If the scheduler demanded send-completion before
    // releasing the recv, this test would deadlock.
    let (tx, rx) = mpsc::sync_channel::<u32>(0);

    let s = scheduler.clone();
    let sender = thread::spawn(move || {
        let guard = proceed(s.await_turn(
            RoutineId(1),
            CallKind::Channel(ChannelOp::Send),
            &SourceLocation::new("send.rs", 10),
        ));
        tx.send(99).unwrap();
        guard.complete(true);
    });
    let r = scheduler.clone();
    let receiver = thread::spawn(move || {
        let guard = proceed(r.await_turn(
            RoutineId(2),
            CallKind::Channel(ChannelOp::Recv),
            &SourceLocation::new("recv.rs", 20),
        ));
        let value = rx.recv().unwrap();
        guard.complete(true);
        value
    });

    sender.join().unwrap();
    assert_eq!(receiver.join().unwrap(), 99);

    let verdict = scheduler.finish(0);
    assert!(verdict.passed(), "verdict: {}", verdict.summary());
}

/// Scenario D: a rewritten trace carries an `X` marker with expected exit
/// code 33. The scheduler reaches its terminal state, compares the actual
/// exit code, and reports the mismatch without crashing.
#[test]
fn test_exit_code_fence_mismatch_is_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(
        dir.path(),
        1,
        &["M,1,2,4,f,L,t,main.rs:8", "X,33,2"],
    );

    let trace = load(dir.path()).unwrap();
    let scheduler = ReplayScheduler::new(trace).unwrap();

    proceed(scheduler.await_turn(
        RoutineId(1),
        CallKind::Mutex {
            rw: false,
            op: MutexOp::Lock,
        },
        &SourceLocation::new("main.rs", 8),
    ))
    .complete(true);
    assert!(scheduler.is_terminal());

    let verdict = scheduler.finish(0);
    assert!(verdict.reached_end);
    assert_eq!(verdict.expected_exit_code, Some(33));
    assert_eq!(verdict.exit_code_match, Some(false));
    assert!(!verdict.passed());
    assert!(verdict.summary().contains("exit code"));

    let verdict = scheduler.finish(33);
    assert!(verdict.passed(), "verdict: {}", verdict.summary());
}

/// Three routines racing for one mutex: whatever the OS scheduler does, the
/// replay must reproduce the recorded completion order.
#[test]
fn test_recorded_lock_order_beats_os_scheduling() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(dir.path(), 1, &["M,1,40,9,f,L,t,worker.rs:5"]);
    write_trace(dir.path(), 2, &["M,2,20,9,f,L,t,worker.rs:5"]);
    write_trace(dir.path(), 3, &["M,3,30,9,f,L,t,worker.rs:5"]);

    let trace = load(dir.path()).unwrap();
    let scheduler = ReplayScheduler::new(trace).unwrap();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for routine in [1u64, 2, 3] {
        let scheduler = scheduler.clone();
        let order = Arc::clone(&order);
        handles.push(thread::spawn(move || {
            // Stagger arrivals against the recorded order.
            thread::sleep(Duration::from_millis(30 * (3 - routine)));
            let guard = proceed(scheduler.await_turn(
                RoutineId(routine),
                CallKind::Mutex {
                    rw: false,
                    op: MutexOp::Lock,
                },
                &SourceLocation::new("worker.rs", 5),
            ));
            order.lock().push(routine);
            guard.complete(true);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Completion ticks were 20 (routine 2), 30 (routine 3), 40 (routine 1).
    assert_eq!(*order.lock(), vec![2, 3, 1]);
    assert!(scheduler.finish(0).passed());
}

/// A recompiled program that takes a different path does not hang the
/// replay: the unsatisfiable recorded elements are skipped and surface in
/// the teardown verdict.
#[test]
fn test_diverged_run_reaches_teardown_with_mismatches() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(
        dir.path(),
        1,
        &[
            "M,1,2,9,f,L,t,old_path.rs:5",
            "M,3,4,9,f,U,t,old_path.rs:6",
            "M,5,6,9,f,L,t,shared.rs:7",
        ],
    );

    let trace = load(dir.path()).unwrap();
    let scheduler = ReplayScheduler::new(trace).unwrap();

    // The live run skips the old code path entirely and goes straight to
    // the surviving call site.
    proceed(scheduler.await_turn(
        RoutineId(1),
        CallKind::Mutex {
            rw: false,
            op: MutexOp::Lock,
        },
        &SourceLocation::new("shared.rs", 7),
    ))
    .complete(true);

    let verdict = scheduler.finish(0);
    assert!(verdict.reached_end);
    assert_eq!(verdict.divergences.len(), 2);
    assert_eq!(verdict.skipped_slots, 2);
    assert_eq!(verdict.completed_slots, 1);
    assert!(!verdict.passed());
    assert!(verdict.summary().contains("divergences"));
}

/// A blocked element from the original run (the leak being reproduced) is
/// released last and never completes; the verdict still reaches its end.
#[test]
fn test_recorded_leak_does_not_block_teardown() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(
        dir.path(),
        1,
        &["M,1,2,9,f,L,t,main.rs:5", "C,3,0,4,S,0,f,main.rs:9"],
    );

    let trace = load(dir.path()).unwrap();
    let scheduler = ReplayScheduler::new(trace).unwrap();

    proceed(scheduler.await_turn(
        RoutineId(1),
        CallKind::Mutex {
            rw: false,
            op: MutexOp::Lock,
        },
        &SourceLocation::new("main.rs", 5),
    ))
    .complete(true);

    // The terminal state only covers operations that completed in the
    // original run; the leaked send is not required to run at all.
    assert!(scheduler.is_terminal());

    // If the leaked send *is* reached, it is released (and then blocks in
    // the real program, reproducing the leak).
    let guard = proceed(scheduler.await_turn(
        RoutineId(1),
        CallKind::Channel(ChannelOp::Send),
        &SourceLocation::new("main.rs", 9),
    ));
    drop(guard);

    let verdict = scheduler.finish(0);
    assert!(verdict.reached_end, "verdict: {}", verdict.summary());
}

/// The watchdog is disarmed once the schedule drains; a terminal replay
/// with an armed watchdog must not kill the process afterwards.
#[test]
fn test_watchdog_disarms_on_terminal_state() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(dir.path(), 1, &["M,1,2,9,f,L,t,main.rs:5"]);

    let trace = load(dir.path()).unwrap();
    let scheduler = ReplayScheduler::builder()
        .with_trace(trace)
        .with_timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    proceed(scheduler.await_turn(
        RoutineId(1),
        CallKind::Mutex {
            rw: false,
            op: MutexOp::Lock,
        },
        &SourceLocation::new("main.rs", 5),
    ))
    .complete(true);

    // Outlive the watchdog deadline; the process must survive because the
    // terminal state was reached first.
    thread::sleep(Duration::from_millis(250));
    assert!(scheduler.finish(0).passed());
}
