//! Core identity and timestamp types for the CRRE

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;

/// Exit code reserved for a replay terminated by the watchdog timer.
///
/// Distinguishable from any expected exit code a replay fence would carry
/// and from signal-flush exits (`128 + signo`), so calling tooling can tell
/// "replay succeeded", "replay diverged" and "replay hung" apart.
pub const EXIT_CODE_TIMEOUT: i32 = 124;

/// Identity of a logical thread (routine)
///
/// Also the numeric component of per-routine trace file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutineId(pub u64);

impl fmt::Display for RoutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a synchronization object
///
/// Channels, mutexes, rwmutexes, once cells, waitgroups, select statements,
/// condition variables and atomic variables are allocated ids from a single
/// namespace by the recording runtime, so one newtype covers them all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one channel communication, shared by both of its ends
///
/// A send and the receive it paired with carry the same `OpId`; the partner
/// matcher keys its table on `(ObjectId, OpId)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to one recorded element inside a routine's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId(pub usize);

/// Completion state of a recorded operation
///
/// Replaces the wire format's `0`-means-blocked sentinel with an explicit
/// state. The derived ordering is the replay order contract: completions
/// compare by tick, and `Never` sorts after every `At(_)`, so elements that
/// blocked forever in the original run land at the tail of their routine's
/// sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Completion {
    /// The operation completed at this logical tick (always > 0).
    At(u64),
    /// The operation never completed; a candidate leak.
    Never,
}

impl Completion {
    /// Decode from the wire representation, where `0` means "never completed"
    pub fn from_wire(raw: u64) -> Self {
        if raw == 0 {
            Completion::Never
        } else {
            Completion::At(raw)
        }
    }

    /// Encode to the wire representation
    pub fn to_wire(self) -> u64 {
        match self {
            Completion::At(tick) => tick,
            Completion::Never => 0,
        }
    }

    /// Whether the operation completed
    pub fn is_complete(self) -> bool {
        matches!(self, Completion::At(_))
    }
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// Source position of an instrumented call site
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl SourceLocation {
    /// Create a new source location
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

impl FromStr for SourceLocation {
    type Err = DecodeError;

    /// Parse a `file:line` token. The line number is taken from the last
    /// `:`-separated component so paths containing colons stay intact.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (file, line) = s.rsplit_once(':').ok_or_else(|| DecodeError::InvalidField {
            field: "source location",
            value: s.to_string(),
        })?;
        let line = line.parse().map_err(|_| DecodeError::InvalidField {
            field: "source line",
            value: s.to_string(),
        })?;
        Ok(Self {
            file: file.to_string(),
            line,
        })
    }
}

/// Process-level replay expectations re-armed by the `X` marker line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFence {
    /// Exit code the original run finished with.
    pub expected_exit_code: i32,
    /// Last `issued` tick observed in the original run.
    pub last_issued: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_ordering() {
        assert!(Completion::At(1) < Completion::At(2));
        assert!(Completion::At(u64::MAX) < Completion::Never);
        assert_eq!(Completion::Never, Completion::Never);
    }

    #[test]
    fn test_completion_wire_round_trip() {
        assert_eq!(Completion::from_wire(0), Completion::Never);
        assert_eq!(Completion::from_wire(17), Completion::At(17));
        assert_eq!(Completion::At(17).to_wire(), 17);
        assert_eq!(Completion::Never.to_wire(), 0);
    }

    #[test]
    fn test_source_location_round_trip() {
        let loc = SourceLocation::new("src/worker.rs", 42);
        let parsed: SourceLocation = loc.to_string().parse().unwrap();
        assert_eq!(parsed, loc);
    }

    #[test]
    fn test_source_location_keeps_colons_in_path() {
        let parsed: SourceLocation = "C:/proj/main.rs:7".parse().unwrap();
        assert_eq!(parsed.file, "C:/proj/main.rs");
        assert_eq!(parsed.line, 7);
    }

    #[test]
    fn test_source_location_rejects_bad_line() {
        assert!("main.rs:seven".parse::<SourceLocation>().is_err());
        assert!("nocolon".parse::<SourceLocation>().is_err());
    }
}
