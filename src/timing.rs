//! Timing summary written alongside the per-routine trace files
//!
//! The summary is a side channel: it never feeds back into the traced run
//! and the loader treats it as a non-trace file. It exists for tooling
//! (wall-clock bounds of the recording, per-routine element counts) and for
//! fingerprint verification at load time.

use crate::fingerprint::TraceDigest;
use crate::types::RoutineId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// File name of the timing summary inside a trace directory
pub const TIMING_FILE_NAME: &str = "times.json";

/// File name of the analyzer's rewrite-info file, which may sit next to the
/// trace files of a rewritten trace; the loader skips it.
pub const REWRITE_INFO_FILE_NAME: &str = "rewrite_info.log";

/// Trace file name for a routine
pub fn trace_file_name(routine: RoutineId) -> String {
    format!("trace_{}.log", routine)
}

/// Recover the routine id from a trace file name
///
/// Returns `None` for any name that does not follow the routine-trace
/// convention; the loader ignores such files.
pub fn parse_trace_file_name(name: &str) -> Option<RoutineId> {
    let digits = name.strip_prefix("trace_")?.strip_suffix(".log")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(RoutineId)
}

/// Per-routine entry in the timing summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineTiming {
    pub routine: RoutineId,
    /// Trace file name relative to the trace directory.
    pub file: String,
    /// Number of elements recorded for this routine.
    pub elements: usize,
    /// Hex-encoded blake3 digest of the trace file as written.
    pub digest: String,
}

impl RoutineTiming {
    /// Decode the hex digest, if well-formed
    pub fn parsed_digest(&self) -> Option<TraceDigest> {
        TraceDigest::parse(&self.digest)
    }
}

/// Summary of one recording run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSummary {
    /// Wall-clock time the recorder was created.
    pub started_at: DateTime<Utc>,
    /// Wall-clock time of the flush.
    pub finished_at: DateTime<Utc>,
    /// Last logical tick handed out by the recording clock.
    pub last_tick: u64,
    pub routines: Vec<RoutineTiming>,
}

impl TimingSummary {
    /// Write the summary as pretty-printed JSON into `dir`
    pub fn write_to(&self, dir: &Path) -> io::Result<()> {
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join(TIMING_FILE_NAME), body)
    }

    /// Read a summary back from `dir`
    ///
    /// Returns `None` when the file is absent or unreadable as a summary;
    /// the timing side channel is best-effort and never fails a load.
    pub fn read_from(dir: &Path) -> Option<Self> {
        let bytes = fs::read(dir.join(TIMING_FILE_NAME)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}
