//! Trace writer: per-routine buffering during execution, one file per
//! routine at shutdown
//!
//! The recorder is an explicitly constructed, explicitly owned context the
//! instrumented runtime threads through every call site; there are no
//! process-wide singletons. Each routine records into its own buffer, so the
//! hot path never contends with other routines; the shared logical clock is
//! a single atomic counter.

use crate::element::{ElementKind, TraceElement};
use crate::error::RecordError;
use crate::fingerprint::bytes_digest;
use crate::timing::{trace_file_name, RoutineTiming, TimingSummary};
use crate::types::{Completion, ElementId, RoutineId, SourceLocation};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Configuration for a recording run
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Directory the per-routine trace files are flushed into.
    pub trace_dir: PathBuf,
}

impl RecorderConfig {
    /// Create a new configuration
    pub fn new(trace_dir: impl Into<PathBuf>) -> Self {
        Self {
            trace_dir: trace_dir.into(),
        }
    }
}

/// What a flush did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushSummary {
    /// Trace directory that was written.
    pub path: PathBuf,
    /// Number of routine files written.
    pub routines: usize,
    /// Total elements serialized.
    pub elements: usize,
    /// False when an earlier flush already ran and this call was a no-op.
    pub performed: bool,
}

struct RoutineBuffer {
    routine: RoutineId,
    // Touched only by the owning routine on the hot path; the flush path
    // takes it exactly once at shutdown. Never contended cross-routine.
    elements: Mutex<Vec<TraceElement>>,
}

struct RecorderInner {
    config: RecorderConfig,
    clock: AtomicU64,
    next_routine: AtomicU64,
    routines: Mutex<Vec<Arc<RoutineBuffer>>>,
    flushed: AtomicBool,
    started_at: DateTime<Utc>,
    expected_exit: Mutex<Option<i32>>,
}

impl RecorderInner {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn flush(&self) -> Result<FlushSummary, RecordError> {
        if self.flushed.swap(true, Ordering::SeqCst) {
            return Ok(FlushSummary {
                path: self.config.trace_dir.clone(),
                routines: 0,
                elements: 0,
                performed: false,
            });
        }

        let dir = &self.config.trace_dir;
        if dir.exists() {
            fs::remove_dir_all(dir).map_err(|source| RecordError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }
        fs::create_dir_all(dir).map_err(|source| RecordError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let buffers: Vec<Arc<RoutineBuffer>> = self.routines.lock().clone();
        let fence = self
            .expected_exit
            .lock()
            .map(|code| (code, self.clock.load(Ordering::SeqCst)));

        // One worker per routine, all joined before flush returns.
        let results: Mutex<Vec<Result<RoutineTiming, RecordError>>> =
            Mutex::new(Vec::with_capacity(buffers.len()));
        rayon::scope(|scope| {
            for buffer in &buffers {
                let results = &results;
                let fence = &fence;
                scope.spawn(move |_| {
                    let outcome = write_routine_file(dir.clone(), buffer, fence);
                    results.lock().push(outcome);
                });
            }
        });

        let mut routines = Vec::new();
        let mut elements = 0;
        for outcome in results.into_inner() {
            let timing = outcome?;
            elements += timing.elements;
            routines.push(timing);
        }
        routines.sort_by_key(|t| t.routine);

        let summary = TimingSummary {
            started_at: self.started_at,
            finished_at: Utc::now(),
            last_tick: self.clock.load(Ordering::SeqCst),
            routines,
        };
        summary.write_to(dir).map_err(|source| RecordError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        Ok(FlushSummary {
            path: dir.clone(),
            routines: summary.routines.len(),
            elements,
            performed: true,
        })
    }
}

fn write_routine_file(
    dir: PathBuf,
    buffer: &RoutineBuffer,
    fence: &Option<(i32, u64)>,
) -> Result<RoutineTiming, RecordError> {
    let elements = buffer.elements.lock();
    let mut body = String::new();
    for element in elements.iter() {
        body.push_str(&element.encode());
        body.push('\n');
    }
    // The replay fence rides in routine 1's file.
    if buffer.routine == RoutineId(1) {
        if let Some((exit_code, last_tick)) = fence {
            body.push_str(&format!("X,{},{}\n", exit_code, last_tick));
        }
    }

    let name = trace_file_name(buffer.routine);
    let path = dir.join(&name);
    fs::write(&path, body.as_bytes()).map_err(|source| RecordError::Io {
        path: path.display().to_string(),
        source,
    })?;

    Ok(RoutineTiming {
        routine: buffer.routine,
        file: name,
        elements: elements.len(),
        digest: bytes_digest(body.as_bytes()).to_string(),
    })
}

/// Owned recording context for one instrumented run
///
/// Construct once at startup, hand a [`RoutineRecorder`] to every routine,
/// and flush exactly once at shutdown. Dropping an unflushed recorder
/// flushes as scoped cleanup, so the trace survives panics and early
/// returns.
pub struct Recorder {
    inner: Arc<RecorderInner>,
}

impl Recorder {
    /// Create a new recorder
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                config,
                clock: AtomicU64::new(0),
                next_routine: AtomicU64::new(1),
                routines: Mutex::new(Vec::new()),
                flushed: AtomicBool::new(false),
                started_at: Utc::now(),
                expected_exit: Mutex::new(None),
            }),
        }
    }

    /// Register a routine and obtain its recording handle
    ///
    /// Routine ids are handed out starting at 1; the first registration is
    /// the main routine.
    pub fn register(&self) -> RoutineRecorder {
        let routine = RoutineId(self.inner.next_routine.fetch_add(1, Ordering::SeqCst));
        let buffer = Arc::new(RoutineBuffer {
            routine,
            elements: Mutex::new(Vec::new()),
        });
        self.inner.routines.lock().push(Arc::clone(&buffer));
        RoutineRecorder {
            inner: Arc::clone(&self.inner),
            buffer,
        }
    }

    /// Record the exit code the run is expected to finish with
    ///
    /// At flush this becomes the `X` fence line in routine 1's file,
    /// together with the last logical tick the clock handed out.
    pub fn set_expected_exit(&self, code: i32) {
        *self.inner.expected_exit.lock() = Some(code);
    }

    /// Current value of the shared logical clock
    pub fn last_tick(&self) -> u64 {
        self.inner.clock.load(Ordering::SeqCst)
    }

    /// Flush all routine buffers to the configured trace directory.
    ///
    /// **Destructive**: physically deletes any pre-existing trace directory
    /// of the same name before writing. Idempotent: the first call writes,
    /// later calls (including the drop path and the signal path) are no-ops.
    /// Any I/O failure aborts the flush; a partial trace is never reported
    /// as success.
    pub fn flush(&self) -> Result<FlushSummary, RecordError> {
        self.inner.flush()
    }

    /// Install a background listener that flushes on SIGINT/SIGTERM and
    /// exits with `128 + signo`, so interrupted runs still leave a usable
    /// trace.
    pub fn install_signal_flush(&self) -> Result<(), RecordError> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals =
            Signals::new([SIGINT, SIGTERM]).map_err(|source| RecordError::SignalSetup { source })?;
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("crre-signal-flush".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    if let Err(error) = inner.flush() {
                        tracing::error!(%error, "signal-triggered trace flush failed");
                    }
                    std::process::exit(128 + signal);
                }
            })
            .map_err(|source| RecordError::SignalSetup { source })?;
        Ok(())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if !self.inner.flushed.load(Ordering::SeqCst) {
            if let Err(error) = self.inner.flush() {
                tracing::error!(%error, "trace flush on drop failed");
            }
        }
    }
}

/// Per-routine recording handle
///
/// Blocking primitives call [`record`](Self::record) when the operation is
/// issued and [`complete`](Self::complete) (or
/// [`complete_with`](Self::complete_with), when the final payload is only
/// known afterwards) once it finishes; an element whose completion never
/// arrives stays `Never` and is flushed as a candidate leak. Non-blocking
/// primitives use [`record_completed`](Self::record_completed).
pub struct RoutineRecorder {
    inner: Arc<RecorderInner>,
    buffer: Arc<RoutineBuffer>,
}

impl RoutineRecorder {
    /// The routine this handle records for
    pub fn routine(&self) -> RoutineId {
        self.buffer.routine
    }

    /// Record the issue of a blocking operation
    pub fn record(&self, kind: ElementKind, location: SourceLocation) -> ElementId {
        let issued = self.inner.tick();
        let mut elements = self.buffer.elements.lock();
        elements.push(TraceElement {
            routine: self.buffer.routine,
            issued,
            completed: Completion::Never,
            location,
            kind,
        });
        ElementId(elements.len() - 1)
    }

    /// Mark a previously recorded operation as completed now
    pub fn complete(&self, id: ElementId) {
        let tick = self.inner.tick();
        let mut elements = self.buffer.elements.lock();
        if let Some(element) = elements.get_mut(id.0) {
            element.completed = Completion::At(tick);
        }
    }

    /// Mark an operation completed and replace its payload with the final
    /// outcome observed by the runtime (success flags, chosen select branch,
    /// pairing ids)
    pub fn complete_with(&self, id: ElementId, kind: ElementKind) {
        let tick = self.inner.tick();
        let mut elements = self.buffer.elements.lock();
        if let Some(element) = elements.get_mut(id.0) {
            element.completed = Completion::At(tick);
            element.kind = kind;
        }
    }

    /// Record an operation that completed immediately
    pub fn record_completed(&self, kind: ElementKind, location: SourceLocation) -> ElementId {
        let id = self.record(kind, location);
        self.complete(id);
        id
    }

    /// Record the end of this routine's sequence
    pub fn finish(&self) {
        self.record(ElementKind::RoutineEnd, SourceLocation::new("", 0));
    }
}
