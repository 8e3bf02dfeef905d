//! Trace loader and partner matcher
//!
//! Reads every routine trace file of a directory, decodes lines into typed
//! elements, links the two ends of each channel communication, and sorts
//! each routine's sequence into replay order. Loading is all-or-nothing: a
//! malformed line fails the whole load, so a corrupted or version-mismatched
//! trace is never silently partially trusted. The one deliberate exception
//! is atomic metadata: an atomic line without a source location downgrades
//! the trace to atomics-disabled instead of failing.

use crate::element::{decode_line, ChannelOp, ElementKind, ParsedLine, TraceElement};
use crate::error::DecodeError;
use crate::fingerprint::file_digest;
use crate::timing::{parse_trace_file_name, TimingSummary};
use crate::types::{Completion, ObjectId, OpId, ReplayFence, RoutineId, SourceLocation};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// A fully loaded trace: one replay-ordered element sequence per routine
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTrace {
    /// Per-routine sequences, each stably sorted by completion so that
    /// never-completed elements sit at the tail.
    pub routines: BTreeMap<RoutineId, Vec<TraceElement>>,
    /// Process-level replay expectations from the `X` marker, if present.
    pub fence: Option<ReplayFence>,
    /// False when the trace was recorded without atomic location metadata;
    /// the replay scheduler must then treat atomic call sites as
    /// pass-through.
    pub atomics_enabled: bool,
}

impl RecordedTrace {
    /// Total number of elements across all routines
    pub fn element_count(&self) -> usize {
        self.routines.values().map(Vec::len).sum()
    }

    /// Completed channel operations that never found a partner
    ///
    /// Legitimate after a full load: a buffered send whose message was
    /// never received, for example. Together with
    /// [`leak_candidates`](Self::leak_candidates) these are the raw
    /// material for leak analysis.
    pub fn unmatched(&self) -> Vec<&TraceElement> {
        self.routines
            .values()
            .flatten()
            .filter(|e| {
                e.completed.is_complete()
                    && matches!(
                        &e.kind,
                        ElementKind::Channel {
                            op: ChannelOp::Send | ChannelOp::Recv,
                            partner: None,
                            ..
                        }
                    )
            })
            .collect()
    }

    /// Elements that never completed in the original run
    pub fn leak_candidates(&self) -> Vec<&TraceElement> {
        self.routines
            .values()
            .flatten()
            .filter(|e| !e.completed.is_complete())
            .collect()
    }
}

struct PendingOp {
    routine: RoutineId,
    index: usize,
    location: SourceLocation,
}

/// Partner match table, scoped to one ingestion pass
///
/// First arrival of a `(channel, operation)` pair parks; second arrival
/// consumes the entry and produces the bidirectional link. Entries left
/// after the whole directory has been scanned are structurally unmatched
/// operations, not errors.
struct PartnerTable {
    pending: HashMap<(ObjectId, OpId), PendingOp>,
    // Locations to write back into the first-arrived side, applied once
    // all files are ingested and indexes are still pre-sort.
    backlinks: Vec<(RoutineId, usize, SourceLocation)>,
}

impl PartnerTable {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            backlinks: Vec::new(),
        }
    }

    /// Offer one completed send/recv; links it if its partner already
    /// arrived
    fn offer(&mut self, routine: RoutineId, index: usize, element: &mut TraceElement) {
        let (key, location) = match &element.kind {
            ElementKind::Channel {
                id,
                op: ChannelOp::Send | ChannelOp::Recv,
                op_id,
                ..
            } => ((*id, *op_id), element.location.clone()),
            _ => return,
        };
        if !element.completed.is_complete() {
            return;
        }

        match self.pending.remove(&key) {
            Some(partner) => {
                if let ElementKind::Channel {
                    partner: slot, ..
                } = &mut element.kind
                {
                    *slot = Some(partner.location);
                }
                self.backlinks.push((partner.routine, partner.index, location));
            }
            None => {
                self.pending.insert(
                    key,
                    PendingOp {
                        routine,
                        index,
                        location,
                    },
                );
            }
        }
    }

    fn apply_backlinks(self, routines: &mut BTreeMap<RoutineId, Vec<TraceElement>>) {
        for (routine, index, location) in self.backlinks {
            if let Some(element) = routines.get_mut(&routine).and_then(|v| v.get_mut(index)) {
                if let ElementKind::Channel {
                    partner: slot, ..
                } = &mut element.kind
                {
                    *slot = Some(location);
                }
            }
        }
    }
}

/// Load a trace directory into one ordered sequence per routine
///
/// Fails with a [`DecodeError`] on the first unrecognized operation code,
/// unknown sub-code, non-numeric required field or wrong field count; no
/// partial trace is returned. Files that do not follow the routine-trace
/// naming convention (the timing summary, rewrite-info, anything foreign)
/// are ignored.
pub fn load(dir: impl AsRef<Path>) -> Result<RecordedTrace, DecodeError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(DecodeError::MissingDirectory {
            path: dir.display().to_string(),
        });
    }

    verify_fingerprints(dir);

    let mut trace_files: Vec<(RoutineId, std::path::PathBuf)> = Vec::new();
    let entries = fs::read_dir(dir).map_err(|source| DecodeError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| DecodeError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let name = entry.file_name();
        if let Some(routine) = name.to_str().and_then(parse_trace_file_name) {
            trace_files.push((routine, entry.path()));
        }
    }
    // Deterministic ingestion order, so repeated loads are structurally
    // identical.
    trace_files.sort_by_key(|(routine, _)| *routine);

    let mut routines: BTreeMap<RoutineId, Vec<TraceElement>> = BTreeMap::new();
    let mut table = PartnerTable::new();
    let mut fence = None;
    let mut atomics_enabled = true;

    for (routine, path) in trace_files {
        let body = fs::read_to_string(&path).map_err(|source| DecodeError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut elements = Vec::new();
        for (number, line) in body.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            if !atomics_enabled && line.starts_with("A,") {
                continue;
            }
            let parsed = decode_line(routine, line)
                .map_err(|e| e.at_line(path.display().to_string(), number + 1))?;
            match parsed {
                ParsedLine::Element(mut element) => {
                    table.offer(routine, elements.len(), &mut element);
                    elements.push(element);
                }
                ParsedLine::Fence(f) => fence = Some(f),
                ParsedLine::Skip => {}
                ParsedLine::AtomicWithoutLocation => {
                    if atomics_enabled {
                        tracing::warn!(
                            path = %path.display(),
                            line = number + 1,
                            "atomic element without location metadata; disabling atomic replay"
                        );
                        atomics_enabled = false;
                    }
                }
            }
        }
        routines.insert(routine, elements);
    }

    table.apply_backlinks(&mut routines);

    if !atomics_enabled {
        // Atomic elements ingested before the degrade trigger would leave
        // the trace half-replayable; drop them all.
        for elements in routines.values_mut() {
            elements.retain(|e| !e.kind.is_atomic());
        }
    }

    for elements in routines.values_mut() {
        elements.sort_by_key(|e| e.order_key());
    }

    Ok(RecordedTrace {
        routines,
        fence,
        atomics_enabled,
    })
}

/// Check recorded file digests against the files on disk, if the timing
/// summary carries them. Diagnostic only: the analyzer legitimately
/// rewrites trace files, so a mismatch is logged, never fatal.
fn verify_fingerprints(dir: &Path) {
    let Some(summary) = TimingSummary::read_from(dir) else {
        return;
    };
    for timing in &summary.routines {
        let Some(expected) = timing.parsed_digest() else {
            continue;
        };
        let path = dir.join(&timing.file);
        match file_digest(&path) {
            Ok(actual) if actual == expected => {}
            Ok(_) => {
                tracing::warn!(
                    file = %path.display(),
                    "trace file digest differs from the recorded fingerprint (rewritten trace?)"
                );
            }
            Err(error) => {
                tracing::debug!(file = %path.display(), %error, "could not fingerprint trace file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_trace(dir: &Path, routine: u64, lines: &[&str]) -> PathBuf {
        let path = dir.join(format!("trace_{}.log", routine));
        fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    #[test]
    fn test_load_links_partners_across_files() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(dir.path(), 1, &["C,5,12,3,S,7,f,send.rs:10"]);
        write_trace(dir.path(), 2, &["C,6,12,3,R,7,f,recv.rs:20"]);

        let trace = load(dir.path()).unwrap();
        let send = &trace.routines[&RoutineId(1)][0];
        let recv = &trace.routines[&RoutineId(2)][0];

        match (&send.kind, &recv.kind) {
            (
                ElementKind::Channel { partner: Some(a), .. },
                ElementKind::Channel { partner: Some(b), .. },
            ) => {
                assert_eq!(a.to_string(), "recv.rs:20");
                assert_eq!(b.to_string(), "send.rs:10");
            }
            other => panic!("expected linked channel pair, got {:?}", other),
        }
        assert!(trace.unmatched().is_empty());
    }

    #[test]
    fn test_blocked_send_is_leak_candidate_not_partnered() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(dir.path(), 1, &["C,5,0,3,S,0,f,send.rs:10"]);

        let trace = load(dir.path()).unwrap();
        assert_eq!(trace.leak_candidates().len(), 1);
        assert!(trace.unmatched().is_empty());
    }

    #[test]
    fn test_completed_send_without_receiver_is_unmatched() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(dir.path(), 1, &["C,5,9,3,S,7,t,send.rs:10"]);

        let trace = load(dir.path()).unwrap();
        assert_eq!(trace.unmatched().len(), 1);
        assert!(trace.leak_candidates().is_empty());
    }

    #[test]
    fn test_never_completed_sorts_last() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(
            dir.path(),
            1,
            &[
                "C,1,0,3,S,0,f,a.rs:1",
                "M,2,9,4,f,L,t,a.rs:2",
                "M,3,4,4,f,L,t,a.rs:3",
            ],
        );

        let trace = load(dir.path()).unwrap();
        let sequence = &trace.routines[&RoutineId(1)];
        assert_eq!(sequence[0].completed, Completion::At(4));
        assert_eq!(sequence[1].completed, Completion::At(9));
        assert_eq!(sequence[2].completed, Completion::Never);
    }

    #[test]
    fn test_fence_is_consumed_not_kept_as_element() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(
            dir.path(),
            1,
            &["M,1,2,4,f,L,t,a.rs:2", "X,33,4711"],
        );

        let trace = load(dir.path()).unwrap();
        assert_eq!(
            trace.fence,
            Some(ReplayFence {
                expected_exit_code: 33,
                last_issued: 4711
            })
        );
        assert_eq!(trace.routines[&RoutineId(1)].len(), 1);
    }

    #[test]
    fn test_unknown_code_fails_whole_load() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(dir.path(), 1, &["M,1,2,4,f,L,t,a.rs:2"]);
        write_trace(dir.path(), 2, &["Z,1,2,3"]);

        let err = load(dir.path()).unwrap_err();
        assert!(matches!(err, DecodeError::Line { .. }));
    }

    #[test]
    fn test_missing_directory_fails() {
        let err = load("/nonexistent/trace/dir").unwrap_err();
        assert!(matches!(err, DecodeError::MissingDirectory { .. }));
    }

    #[test]
    fn test_non_trace_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(dir.path(), 1, &["M,1,2,4,f,L,t,a.rs:2"]);
        fs::write(dir.path().join("times.json"), b"{}").unwrap();
        fs::write(dir.path().join("rewrite_info.log"), b"t#A01#detail").unwrap();
        fs::write(dir.path().join("notes.txt"), b"Z,not,a,trace").unwrap();

        let trace = load(dir.path()).unwrap();
        assert_eq!(trace.routines.len(), 1);
    }

    #[test]
    fn test_atomic_degrade_purges_atomics_but_keeps_rest() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(
            dir.path(),
            1,
            &[
                "A,1,2,9,L,a.rs:1",
                "M,3,4,4,f,L,t,a.rs:2",
                "A,5,6,9,S",
                "A,7,8,9,L,a.rs:3",
            ],
        );

        let trace = load(dir.path()).unwrap();
        assert!(!trace.atomics_enabled);
        let sequence = &trace.routines[&RoutineId(1)];
        assert_eq!(sequence.len(), 1);
        assert!(matches!(sequence[0].kind, ElementKind::Mutex { .. }));
    }

    #[test]
    fn test_idempotent_load() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(
            dir.path(),
            1,
            &["C,5,12,3,S,7,f,send.rs:10", "M,2,9,4,f,L,t,a.rs:2"],
        );
        write_trace(dir.path(), 2, &["C,6,12,3,R,7,f,recv.rs:20"]);

        let first = load(dir.path()).unwrap();
        let second = load(dir.path()).unwrap();
        assert_eq!(first, second);
    }
}
