//! Error types for the CRRE

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CRREError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    #[error("Fuzz error: {0}")]
    Fuzz(#[from] FuzzError),
}

/// Unrecoverable trace-loading failures.
///
/// A corrupted or version-mismatched trace can never be partially trusted,
/// so every variant here aborts the whole load.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown operation code '{code}'")]
    UnknownOpCode { code: String },

    #[error("unknown {kind} sub-code '{code}'")]
    UnknownSubCode { kind: &'static str, code: String },

    #[error("invalid {field} field: '{value}'")]
    InvalidField {
        field: &'static str,
        value: String,
    },

    #[error("wrong field count: expected {expected}, found {found}")]
    FieldCount {
        expected: &'static str,
        found: usize,
    },

    #[error("{path}:{number}: {source}")]
    Line {
        path: String,
        number: usize,
        source: Box<DecodeError>,
    },

    #[error("trace directory not found: {path}")]
    MissingDirectory { path: String },

    #[error("failed to read trace file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl DecodeError {
    /// Attach file/line context to a raw decode error
    pub fn at_line(self, path: impl Into<String>, number: usize) -> Self {
        DecodeError::Line {
            path: path.into(),
            number,
            source: Box::new(self),
        }
    }
}

/// Unrecoverable recording failures.
///
/// Recording exists to produce a trustworthy trace; a silent partial write
/// is worse than a crash, so flush I/O errors propagate.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to write trace file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install signal flush listener")]
    SignalSetup {
        #[source]
        source: std::io::Error,
    },
}

/// Failures that prevent a replay from starting at all.
///
/// Divergence during a running replay is not an error; it is recorded and
/// surfaced in the teardown verdict.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("recorded trace contains no replayable elements")]
    EmptySchedule,

    #[error("replay trace not found: {path}")]
    MissingTrace { path: String },
}

/// Failures loading a fuzz preference file.
///
/// A *missing* preference file is not an error; recording simply proceeds
/// with no override.
#[derive(Debug, Error)]
pub enum FuzzError {
    #[error("malformed preference line '{line}': {reason}")]
    MalformedPreference { line: String, reason: String },

    #[error("failed to read preference file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
