//! Concurrency Record & Replay Engine (CRRE)
//!
//! A library for diagnosing concurrency bugs by recording every
//! synchronization event of an instrumented run and driving a second run
//! that reproduces the recorded completion order operation for operation.

pub mod element;
pub mod error;
pub mod fingerprint;
pub mod fuzz;
pub mod loader;
pub mod recorder;
pub mod replay;
pub mod timing;
pub mod types;

// Re-export core types
pub use element::{
    AtomicOp, CallKind, ChannelOp, CondOp, ElementKind, MutexOp, SelectChoice, TraceElement,
    WaitGroupOp,
};
pub use error::{CRREError, DecodeError, FuzzError, RecordError, ReplayError};
pub use fingerprint::TraceDigest;
pub use fuzz::FuzzPreferences;
pub use loader::{load, RecordedTrace};
pub use recorder::{FlushSummary, Recorder, RecorderConfig, RoutineRecorder};
pub use replay::{
    Divergence, OperationGuard, ReplayScheduler, ReplaySchedulerBuilder, ReplayVerdict,
    TurnOutcome,
};
pub use timing::{TimingSummary, TIMING_FILE_NAME};
pub use types::{
    Completion, ElementId, ObjectId, OpId, ReplayFence, RoutineId, SourceLocation,
    EXIT_CODE_TIMEOUT,
};
