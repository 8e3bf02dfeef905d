//! Replay scheduler: the run-time authority that imposes the recorded
//! completion order onto a second execution
//!
//! The loaded trace is flattened into one global schedule of slots, stably
//! sorted by recorded completion. `await_turn` is the single synchronization
//! point the instrumented program calls at every primitive site: it blocks
//! cooperatively until the global turn reaches the caller's cursor slot,
//! verifies the live call against the recorded one, and releases the real
//! operation. For two slots with strictly ordered completions the first
//! real operation finishes before the second starts; slots with equal
//! completion (the two ends of one channel communication) are admitted
//! together. A live call that does not match its recorded slot is a
//! divergence: the slot is skipped and the mismatch surfaces in the
//! teardown verdict instead of hanging the replay.

use crate::element::{CallKind, ElementKind};
use crate::error::ReplayError;
use crate::loader::RecordedTrace;
use crate::types::{Completion, ReplayFence, RoutineId, SourceLocation, EXIT_CODE_TIMEOUT};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// What the recorded trace expected at a diverged position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedOp {
    pub kind: CallKind,
    pub location: SourceLocation,
}

/// One mismatch between the recorded trace and the live run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub routine: RoutineId,
    /// `None` when the live run performed an operation with no recorded
    /// counterpart left for its routine.
    pub expected: Option<ExpectedOp>,
    pub actual_kind: CallKind,
    pub actual_location: SourceLocation,
}

/// Decision handed back to the instrumented call site
#[derive(Debug)]
pub enum TurnOutcome {
    /// The call matches the recorded order; perform the real operation and
    /// then complete the guard.
    Proceed(OperationGuard),
    /// Atomic replay is disabled for this trace; run without blocking or
    /// cursor advancement.
    Passthrough,
    /// The live run diverged past everything recorded for this routine;
    /// run unsynchronized.
    Unsynchronized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Pending,
    Released,
    Completed,
    Skipped,
}

struct Slot {
    routine: RoutineId,
    kind: CallKind,
    location: SourceLocation,
    issued: u64,
    completed: Completion,
    state: SlotState,
}

struct RoutineCursor {
    /// Global slot indexes belonging to this routine, in replay order.
    slots: Vec<usize>,
    /// Position of the next not-yet-released slot.
    next: usize,
}

struct SchedulerState {
    slots: Vec<Slot>,
    /// Index of the next schedule slot to release.
    turn: usize,
    cursors: HashMap<RoutineId, RoutineCursor>,
    divergences: Vec<Divergence>,
    /// Completed-in-the-original slots not yet done in the replay; the
    /// terminal state is reached when this hits zero.
    outstanding: usize,
    /// Highest recorded `issued` tick among released slots.
    last_released_issued: u64,
    /// Count of guards completed with `success == false`.
    failed_operations: usize,
    finished: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    condvar: Condvar,
    atomics_enabled: bool,
    fence: Option<ReplayFence>,
    /// Issue tick the replay must advance to for the fence to count as
    /// reached. Capped at the schedule's own last completed issue tick:
    /// the recorded fence value also covers issues (routine ends, leaked
    /// operations) that never become replayable slots.
    fence_goal: Option<u64>,
}

impl SchedulerState {
    fn hop_skipped(&mut self) {
        while self
            .slots
            .get(self.turn)
            .is_some_and(|s| s.state != SlotState::Pending)
        {
            self.turn += 1;
        }
    }

    fn note_done(&mut self, index: usize) {
        if self.slots[index].completed.is_complete() {
            self.outstanding -= 1;
            if self.outstanding == 0 {
                self.finished = true;
            }
        }
    }

    /// Whether any earlier slot with a strictly smaller recorded completion
    /// has not finished its real operation yet
    fn earlier_incomplete(&self, index: usize) -> bool {
        let bar = self.slots[index].completed;
        self.slots[..index].iter().any(|s| {
            s.completed < bar && matches!(s.state, SlotState::Pending | SlotState::Released)
        })
    }
}

/// The replay scheduler
///
/// Cheap to clone; clones share one schedule. Hand one clone to every
/// routine of the re-executed program.
#[derive(Clone)]
pub struct ReplayScheduler {
    shared: Arc<Shared>,
}

impl ReplayScheduler {
    /// Create a builder
    pub fn builder() -> ReplaySchedulerBuilder {
        ReplaySchedulerBuilder::new()
    }

    /// Build a scheduler directly from a loaded trace, without a watchdog
    pub fn new(trace: RecordedTrace) -> Result<Self, ReplayError> {
        Self::builder().with_trace(trace).build()
    }

    /// Block until the recorded order admits this call, then release it
    ///
    /// The wait is cooperative (a condition variable keyed to the global
    /// turn), never a busy spin. Divergent calls do not hang: recorded
    /// slots the live run contradicts are skipped and reported at
    /// teardown.
    pub fn await_turn(
        &self,
        routine: RoutineId,
        kind: CallKind,
        location: &SourceLocation,
    ) -> TurnOutcome {
        if !self.shared.atomics_enabled && matches!(kind, CallKind::Atomic(_)) {
            return TurnOutcome::Passthrough;
        }

        let mut state = self.shared.state.lock();
        loop {
            let next = state.cursors.get(&routine).and_then(|cursor| {
                cursor.slots.get(cursor.next).copied()
            });
            let Some(slot_index) = next else {
                state.divergences.push(Divergence {
                    routine,
                    expected: None,
                    actual_kind: kind,
                    actual_location: location.clone(),
                });
                return TurnOutcome::Unsynchronized;
            };

            let matches = {
                let slot = &state.slots[slot_index];
                slot.kind == kind && slot.location == *location
            };

            if matches {
                while state.turn != slot_index {
                    self.shared.condvar.wait(&mut state);
                }
                while state.earlier_incomplete(slot_index) {
                    self.shared.condvar.wait(&mut state);
                }

                state.slots[slot_index].state = SlotState::Released;
                state.last_released_issued = state
                    .last_released_issued
                    .max(state.slots[slot_index].issued);
                if let Some(cursor) = state.cursors.get_mut(&routine) {
                    cursor.next += 1;
                }
                state.turn += 1;
                state.hop_skipped();
                self.shared.condvar.notify_all();

                return TurnOutcome::Proceed(OperationGuard {
                    shared: Arc::clone(&self.shared),
                    slot: slot_index,
                    done: false,
                });
            }

            // The live run took a different path: the recorded slot is
            // unsatisfiable at this position. Skip it, report at teardown,
            // and retry against the routine's next slot.
            let expected = ExpectedOp {
                kind: state.slots[slot_index].kind,
                location: state.slots[slot_index].location.clone(),
            };
            tracing::debug!(
                %routine,
                expected = %expected.location,
                actual = %location,
                "replay divergence; skipping recorded element"
            );
            state.divergences.push(Divergence {
                routine,
                expected: Some(expected),
                actual_kind: kind,
                actual_location: location.clone(),
            });
            state.slots[slot_index].state = SlotState::Skipped;
            state.note_done(slot_index);
            if let Some(cursor) = state.cursors.get_mut(&routine) {
                cursor.next += 1;
            }
            state.hop_skipped();
            self.shared.condvar.notify_all();
        }
    }

    /// Whether every slot that completed in the original run has been
    /// completed or skipped in the replay
    pub fn is_terminal(&self) -> bool {
        self.shared.state.lock().outstanding == 0
    }

    /// Tear down and produce the verdict
    ///
    /// Compares the observed outcome against the replay fence, if the trace
    /// carried one. The comparison is a diagnostic: it reports mismatches,
    /// it never panics or exits.
    pub fn finish(&self, actual_exit_code: i32) -> ReplayVerdict {
        let mut state = self.shared.state.lock();
        state.finished = true;
        self.shared.condvar.notify_all();

        let mut released = 0;
        let mut completed = 0;
        let mut skipped = 0;
        for slot in &state.slots {
            match slot.state {
                SlotState::Pending => {}
                SlotState::Released => released += 1,
                SlotState::Completed => completed += 1,
                SlotState::Skipped => skipped += 1,
            }
        }

        let fence = self.shared.fence;
        ReplayVerdict {
            reached_end: state.outstanding == 0,
            total_slots: state.slots.len(),
            completed_slots: completed,
            released_slots: released,
            skipped_slots: skipped,
            failed_operations: state.failed_operations,
            divergences: state.divergences.clone(),
            expected_exit_code: fence.map(|f| f.expected_exit_code),
            actual_exit_code,
            exit_code_match: fence.map(|f| f.expected_exit_code == actual_exit_code),
            reached_fence: self
                .shared
                .fence_goal
                .map(|goal| state.last_released_issued >= goal),
        }
    }
}

/// Proof that a call was released; completes its slot once the real
/// operation finished
pub struct OperationGuard {
    shared: Arc<Shared>,
    slot: usize,
    done: bool,
}

impl std::fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGuard")
            .field("slot", &self.slot)
            .field("done", &self.done)
            .finish()
    }
}

impl OperationGuard {
    /// Mark the real operation finished, reporting whether the runtime
    /// accepted it
    pub fn complete(mut self, success: bool) {
        self.mark(success);
    }

    fn mark(&mut self, success: bool) {
        if self.done {
            return;
        }
        self.done = true;
        let mut state = self.shared.state.lock();
        state.slots[self.slot].state = SlotState::Completed;
        if !success {
            state.failed_operations += 1;
        }
        state.note_done(self.slot);
        self.shared.condvar.notify_all();
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        // A guard dropped without an explicit outcome (panic in the real
        // operation) still completes its slot, so later turns are not
        // starved.
        self.mark(false);
    }
}

/// Outcome report produced at teardown
#[derive(Debug, Clone, Serialize)]
pub struct ReplayVerdict {
    /// Every slot that completed in the original run was completed or
    /// skipped in the replay.
    pub reached_end: bool,
    pub total_slots: usize,
    pub completed_slots: usize,
    /// Released but never completed; either still running at teardown or
    /// reproducing a recorded leak.
    pub released_slots: usize,
    pub skipped_slots: usize,
    /// Real operations the runtime rejected during the replay.
    pub failed_operations: usize,
    #[serde(skip)]
    pub divergences: Vec<Divergence>,
    pub expected_exit_code: Option<i32>,
    pub actual_exit_code: i32,
    /// `None` when the trace carried no fence.
    pub exit_code_match: Option<bool>,
    /// Whether the replay advanced at least to the fence position. `None`
    /// when the trace carried no fence.
    pub reached_fence: Option<bool>,
}

impl ReplayVerdict {
    /// Whether the replay reproduced the recorded run
    pub fn passed(&self) -> bool {
        self.reached_end
            && self.divergences.is_empty()
            && self.exit_code_match != Some(false)
            && self.reached_fence != Some(false)
    }

    /// Generate a summary report
    pub fn summary(&self) -> String {
        if self.passed() {
            return format!(
                "Replay reproduced the recorded run: {} of {} operations completed",
                self.completed_slots, self.total_slots
            );
        }

        let mut parts = Vec::new();
        if !self.reached_end {
            parts.push(format!(
                "{} recorded operations never ran",
                self.total_slots - self.completed_slots - self.skipped_slots
            ));
        }
        if !self.divergences.is_empty() {
            parts.push(format!("{} divergences", self.divergences.len()));
        }
        if self.exit_code_match == Some(false) {
            parts.push(format!(
                "exit code {} differs from expected {}",
                self.actual_exit_code,
                self.expected_exit_code.unwrap_or_default()
            ));
        }
        if self.reached_fence == Some(false) {
            parts.push("replay stopped short of the recorded fence".to_string());
        }
        format!("Replay differed: {}", parts.join(", "))
    }

    /// First divergence, if any
    pub fn first_divergence(&self) -> Option<&Divergence> {
        self.divergences.first()
    }
}

/// Builder for constructing replay schedulers with a fluent API
pub struct ReplaySchedulerBuilder {
    trace: Option<RecordedTrace>,
    timeout: Option<Duration>,
}

impl ReplaySchedulerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            trace: None,
            timeout: None,
        }
    }

    /// Set the loaded trace to replay
    pub fn with_trace(mut self, trace: RecordedTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Arm the watchdog: if the scheduler has not reached its terminal
    /// state when the duration elapses, the process exits with
    /// [`EXIT_CODE_TIMEOUT`]. This is the single hard cancellation point
    /// of a replay.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the scheduler (and start the watchdog, if armed)
    pub fn build(self) -> Result<ReplayScheduler, ReplayError> {
        let trace = self.trace.ok_or(ReplayError::EmptySchedule)?;
        let atomics_enabled = trace.atomics_enabled;
        let fence = trace.fence;

        let mut slots = Vec::new();
        let mut cursors: HashMap<RoutineId, RoutineCursor> = HashMap::new();
        for (routine, elements) in &trace.routines {
            for element in elements {
                match &element.kind {
                    ElementKind::RoutineEnd => continue,
                    ElementKind::Atomic { .. } if !atomics_enabled => continue,
                    _ => {}
                }
                slots.push(Slot {
                    routine: *routine,
                    kind: element.kind.call_kind(),
                    location: element.location.clone(),
                    issued: element.issued,
                    completed: element.completed,
                    state: SlotState::Pending,
                });
            }
        }
        if slots.is_empty() {
            return Err(ReplayError::EmptySchedule);
        }

        // Replay order across routines; the sort is stable, so elements of
        // one routine keep their recorded relative order.
        slots.sort_by_key(|s| s.completed);
        for (index, slot) in slots.iter().enumerate() {
            cursors
                .entry(slot.routine)
                .or_insert_with(|| RoutineCursor {
                    slots: Vec::new(),
                    next: 0,
                })
                .slots
                .push(index);
        }

        let outstanding = slots.iter().filter(|s| s.completed.is_complete()).count();
        let last_completed_issue = slots
            .iter()
            .filter(|s| s.completed.is_complete())
            .map(|s| s.issued)
            .max()
            .unwrap_or(0);
        let fence_goal = fence.map(|f| f.last_issued.min(last_completed_issue));
        let scheduler = ReplayScheduler {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState {
                    slots,
                    turn: 0,
                    cursors,
                    divergences: Vec::new(),
                    outstanding,
                    last_released_issued: 0,
                    failed_operations: 0,
                    finished: outstanding == 0,
                }),
                condvar: Condvar::new(),
                atomics_enabled,
                fence,
                fence_goal,
            }),
        };

        if let Some(timeout) = self.timeout {
            start_watchdog(Arc::clone(&scheduler.shared), timeout);
        }
        Ok(scheduler)
    }
}

impl Default for ReplaySchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn start_watchdog(shared: Arc<Shared>, timeout: Duration) {
    thread::Builder::new()
        .name("crre-replay-watchdog".to_string())
        .spawn(move || {
            let deadline = Instant::now() + timeout;
            let mut state = shared.state.lock();
            loop {
                if state.finished {
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    drop(state);
                    tracing::error!(
                        "replay watchdog expired before the terminal state; terminating"
                    );
                    std::process::exit(EXIT_CODE_TIMEOUT);
                }
                shared.condvar.wait_for(&mut state, deadline - now);
            }
        })
        .expect("failed to spawn replay watchdog thread");
}
