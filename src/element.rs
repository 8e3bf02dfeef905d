//! Trace element model and the line-oriented text codec
//!
//! One element is one recorded synchronization event. On disk an element is
//! a single comma-separated line whose first field is a one-letter operation
//! code; booleans are literal `t`/`f` tokens, source locations are
//! `file:line`, and a never-completed operation writes `0` in its completion
//! field. Decoding is an exhaustive match over a closed sum type: an unknown
//! code or a non-numeric required field is a hard decode failure.

use crate::error::DecodeError;
use crate::types::{Completion, ObjectId, OpId, ReplayFence, RoutineId, SourceLocation};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Direction of a channel operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelOp {
    Send,
    Recv,
    Close,
}

/// Mutex and rwmutex operations
///
/// The read-side variants are only valid together with the `rw` flag on the
/// element; the loader does not enforce that pairing, it preserves what the
/// recorder wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutexOp {
    Lock,
    TryLock,
    Unlock,
    RLock,
    TryRLock,
    RUnlock,
}

/// Waitgroup operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitGroupOp {
    Wait,
    AddDone,
}

/// Which branch a select statement took
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectChoice {
    /// Index into the select's case list.
    Case(usize),
    /// The default branch ran because no case was ready.
    Default,
}

/// Condition variable operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CondOp {
    Wait,
    Signal,
    Broadcast,
}

/// Atomic variable operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomicOp {
    Load,
    Store,
    Add,
    Swap,
    CompareAndSwap,
}

/// Kind-specific payload of a trace element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementKind {
    /// A new routine was started.
    Spawn { child: RoutineId },

    /// A channel send, receive or close.
    ///
    /// `partner` is never on disk; the partner matcher fills in the other
    /// side's source location after both ends of a communication have been
    /// ingested.
    Channel {
        id: ObjectId,
        op: ChannelOp,
        op_id: OpId,
        buffered: bool,
        partner: Option<SourceLocation>,
    },

    /// A mutex or rwmutex operation. `success == false` means the runtime
    /// rejected the call (e.g. unlock of an unlocked mutex).
    Mutex {
        id: ObjectId,
        rw: bool,
        op: MutexOp,
        success: bool,
    },

    /// A once execution; `winner` is true only for the routine that actually
    /// ran the protected function.
    Once { id: ObjectId, winner: bool },

    /// A waitgroup wait or counter adjustment.
    WaitGroup {
        id: ObjectId,
        op: WaitGroupOp,
        delta: i64,
        value: i64,
    },

    /// A multi-way channel choice, with the per-branch channel identities.
    Select {
        id: ObjectId,
        cases: Vec<ObjectId>,
        chosen: SelectChoice,
    },

    /// A condition variable operation.
    Cond { id: ObjectId, op: CondOp },

    /// An atomic variable operation.
    Atomic { id: ObjectId, op: AtomicOp },

    /// End of a routine's recorded sequence. Written by the recorder,
    /// skipped by the loader.
    RoutineEnd,
}

/// Flattened, allocation-free descriptor of what a live call site is doing
///
/// The replay scheduler compares the `CallKind` of each incoming call
/// against the one expected at the routine's cursor instead of matching on
/// call-site text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Spawn,
    Channel(ChannelOp),
    Mutex { rw: bool, op: MutexOp },
    Once,
    WaitGroup(WaitGroupOp),
    Select,
    Cond(CondOp),
    Atomic(AtomicOp),
    RoutineEnd,
}

impl ElementKind {
    /// The call-site descriptor this element expects during replay
    pub fn call_kind(&self) -> CallKind {
        match self {
            ElementKind::Spawn { .. } => CallKind::Spawn,
            ElementKind::Channel { op, .. } => CallKind::Channel(*op),
            ElementKind::Mutex { rw, op, .. } => CallKind::Mutex { rw: *rw, op: *op },
            ElementKind::Once { .. } => CallKind::Once,
            ElementKind::WaitGroup { op, .. } => CallKind::WaitGroup(*op),
            ElementKind::Select { .. } => CallKind::Select,
            ElementKind::Cond { op, .. } => CallKind::Cond(*op),
            ElementKind::Atomic { op, .. } => CallKind::Atomic(*op),
            ElementKind::RoutineEnd => CallKind::RoutineEnd,
        }
    }

    /// Whether this is an atomic element
    pub fn is_atomic(&self) -> bool {
        matches!(self, ElementKind::Atomic { .. })
    }
}

/// One recorded synchronization event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceElement {
    /// Routine that executed the operation.
    pub routine: RoutineId,
    /// Logical tick at which the operation was issued.
    pub issued: u64,
    /// Logical tick at which it completed, or `Never`.
    pub completed: Completion,
    /// Call site of the primitive.
    pub location: SourceLocation,
    /// Kind-specific payload.
    pub kind: ElementKind,
}

impl TraceElement {
    /// Sort key for replay order: completion first, ties kept stable by the
    /// per-routine recording order the elements already have.
    pub fn order_key(&self) -> Completion {
        self.completed
    }

    /// Encode this element as one trace line
    pub fn encode(&self) -> String {
        let mut line = String::new();
        match &self.kind {
            ElementKind::Spawn { child } => {
                let _ = write!(
                    line,
                    "G,{},{},{},{}",
                    self.issued, self.completed, child, self.location
                );
            }
            ElementKind::Channel {
                id,
                op,
                op_id,
                buffered,
                partner: _,
            } => {
                let _ = write!(
                    line,
                    "C,{},{},{},{},{},{},{}",
                    self.issued,
                    self.completed,
                    id,
                    channel_op_code(*op),
                    op_id,
                    bool_token(*buffered),
                    self.location
                );
            }
            ElementKind::Mutex {
                id,
                rw,
                op,
                success,
            } => {
                let _ = write!(
                    line,
                    "M,{},{},{},{},{},{},{}",
                    self.issued,
                    self.completed,
                    id,
                    bool_token(*rw),
                    mutex_op_code(*op),
                    bool_token(*success),
                    self.location
                );
            }
            ElementKind::Once { id, winner } => {
                let _ = write!(
                    line,
                    "O,{},{},{},{},{}",
                    self.issued,
                    self.completed,
                    id,
                    bool_token(*winner),
                    self.location
                );
            }
            ElementKind::WaitGroup {
                id,
                op,
                delta,
                value,
            } => {
                let _ = write!(
                    line,
                    "W,{},{},{},{},{},{},{}",
                    self.issued,
                    self.completed,
                    id,
                    waitgroup_op_code(*op),
                    delta,
                    value,
                    self.location
                );
            }
            ElementKind::Select { id, cases, chosen } => {
                let joined = cases
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join("~");
                let chosen = match chosen {
                    SelectChoice::Case(index) => index.to_string(),
                    SelectChoice::Default => "D".to_string(),
                };
                let _ = write!(
                    line,
                    "S,{},{},{},{},{},{}",
                    self.issued, self.completed, id, joined, chosen, self.location
                );
            }
            ElementKind::Cond { id, op } => {
                let _ = write!(
                    line,
                    "D,{},{},{},{},{}",
                    self.issued,
                    self.completed,
                    id,
                    cond_op_code(*op),
                    self.location
                );
            }
            ElementKind::Atomic { id, op } => {
                let _ = write!(
                    line,
                    "A,{},{},{},{},{}",
                    self.issued,
                    self.completed,
                    id,
                    atomic_op_code(*op),
                    self.location
                );
            }
            ElementKind::RoutineEnd => {
                let _ = write!(line, "E,{}", self.issued);
            }
        }
        line
    }
}

/// Result of decoding one trace line
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// An ordinary element.
    Element(TraceElement),
    /// An `X` marker carrying process-level replay expectations; consumed
    /// by the loader, never part of an element sequence.
    Fence(ReplayFence),
    /// A line the loader ignores (`N` declarations, `E` routine ends).
    Skip,
    /// An `A` line without location metadata: the trigger to disable atomic
    /// replay for the remainder of the load.
    AtomicWithoutLocation,
}

/// Decode one trace line for the given routine
pub fn decode_line(routine: RoutineId, line: &str) -> Result<ParsedLine, DecodeError> {
    let fields: Vec<&str> = line.split(',').collect();
    let code = fields[0];
    match code {
        "G" => {
            expect_fields(&fields, 5, "5")?;
            Ok(ParsedLine::Element(TraceElement {
                routine,
                issued: parse_u64("issued", fields[1])?,
                completed: Completion::from_wire(parse_u64("completed", fields[2])?),
                location: fields[4].parse()?,
                kind: ElementKind::Spawn {
                    child: RoutineId(parse_u64("child routine", fields[3])?),
                },
            }))
        }
        "C" => {
            expect_fields(&fields, 8, "8")?;
            Ok(ParsedLine::Element(TraceElement {
                routine,
                issued: parse_u64("issued", fields[1])?,
                completed: Completion::from_wire(parse_u64("completed", fields[2])?),
                location: fields[7].parse()?,
                kind: ElementKind::Channel {
                    id: ObjectId(parse_u64("channel id", fields[3])?),
                    op: parse_channel_op(fields[4])?,
                    op_id: OpId(parse_u64("operation id", fields[5])?),
                    buffered: parse_bool("buffered flag", fields[6])?,
                    partner: None,
                },
            }))
        }
        "M" => {
            expect_fields(&fields, 8, "8")?;
            Ok(ParsedLine::Element(TraceElement {
                routine,
                issued: parse_u64("issued", fields[1])?,
                completed: Completion::from_wire(parse_u64("completed", fields[2])?),
                location: fields[7].parse()?,
                kind: ElementKind::Mutex {
                    id: ObjectId(parse_u64("lock id", fields[3])?),
                    rw: parse_bool("rw flag", fields[4])?,
                    op: parse_mutex_op(fields[5])?,
                    success: parse_bool("success flag", fields[6])?,
                },
            }))
        }
        "O" => {
            expect_fields(&fields, 6, "6")?;
            Ok(ParsedLine::Element(TraceElement {
                routine,
                issued: parse_u64("issued", fields[1])?,
                completed: Completion::from_wire(parse_u64("completed", fields[2])?),
                location: fields[5].parse()?,
                kind: ElementKind::Once {
                    id: ObjectId(parse_u64("once id", fields[3])?),
                    winner: parse_bool("winner flag", fields[4])?,
                },
            }))
        }
        "W" => {
            expect_fields(&fields, 8, "8")?;
            Ok(ParsedLine::Element(TraceElement {
                routine,
                issued: parse_u64("issued", fields[1])?,
                completed: Completion::from_wire(parse_u64("completed", fields[2])?),
                location: fields[7].parse()?,
                kind: ElementKind::WaitGroup {
                    id: ObjectId(parse_u64("waitgroup id", fields[3])?),
                    op: parse_waitgroup_op(fields[4])?,
                    delta: parse_i64("delta", fields[5])?,
                    value: parse_i64("counter value", fields[6])?,
                },
            }))
        }
        "S" => {
            expect_fields(&fields, 7, "7")?;
            let cases = parse_case_list(fields[4])?;
            let chosen = if fields[5] == "D" {
                SelectChoice::Default
            } else {
                let index = fields[5].parse().map_err(|_| DecodeError::InvalidField {
                    field: "chosen case index",
                    value: fields[5].to_string(),
                })?;
                SelectChoice::Case(index)
            };
            Ok(ParsedLine::Element(TraceElement {
                routine,
                issued: parse_u64("issued", fields[1])?,
                completed: Completion::from_wire(parse_u64("completed", fields[2])?),
                location: fields[6].parse()?,
                kind: ElementKind::Select {
                    id: ObjectId(parse_u64("select id", fields[3])?),
                    cases,
                    chosen,
                },
            }))
        }
        "D" => {
            expect_fields(&fields, 6, "6")?;
            Ok(ParsedLine::Element(TraceElement {
                routine,
                issued: parse_u64("issued", fields[1])?,
                completed: Completion::from_wire(parse_u64("completed", fields[2])?),
                location: fields[5].parse()?,
                kind: ElementKind::Cond {
                    id: ObjectId(parse_u64("condvar id", fields[3])?),
                    op: parse_cond_op(fields[4])?,
                },
            }))
        }
        "A" => {
            // A degraded recording drops the location field from atomic
            // lines; the loader downgrades to atomics-disabled instead of
            // failing the load.
            if fields.len() == 5 {
                return Ok(ParsedLine::AtomicWithoutLocation);
            }
            expect_fields(&fields, 6, "5 or 6")?;
            Ok(ParsedLine::Element(TraceElement {
                routine,
                issued: parse_u64("issued", fields[1])?,
                completed: Completion::from_wire(parse_u64("completed", fields[2])?),
                location: fields[5].parse()?,
                kind: ElementKind::Atomic {
                    id: ObjectId(parse_u64("atomic id", fields[3])?),
                    op: parse_atomic_op(fields[4])?,
                },
            }))
        }
        "N" | "E" => Ok(ParsedLine::Skip),
        "X" => {
            expect_fields(&fields, 3, "3")?;
            let expected_exit_code =
                fields[1].parse().map_err(|_| DecodeError::InvalidField {
                    field: "expected exit code",
                    value: fields[1].to_string(),
                })?;
            Ok(ParsedLine::Fence(ReplayFence {
                expected_exit_code,
                last_issued: parse_u64("last issued", fields[2])?,
            }))
        }
        _ => Err(DecodeError::UnknownOpCode {
            code: code.to_string(),
        }),
    }
}

fn expect_fields(fields: &[&str], want: usize, expected: &'static str) -> Result<(), DecodeError> {
    if fields.len() != want {
        return Err(DecodeError::FieldCount {
            expected,
            found: fields.len(),
        });
    }
    Ok(())
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, DecodeError> {
    value.parse().map_err(|_| DecodeError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn parse_i64(field: &'static str, value: &str) -> Result<i64, DecodeError> {
    value.parse().map_err(|_| DecodeError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, DecodeError> {
    match value {
        "t" => Ok(true),
        "f" => Ok(false),
        _ => Err(DecodeError::InvalidField {
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_case_list(value: &str) -> Result<Vec<ObjectId>, DecodeError> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    value
        .split('~')
        .map(|token| parse_u64("select case channel", token).map(ObjectId))
        .collect()
}

fn parse_channel_op(value: &str) -> Result<ChannelOp, DecodeError> {
    match value {
        "S" => Ok(ChannelOp::Send),
        "R" => Ok(ChannelOp::Recv),
        "C" => Ok(ChannelOp::Close),
        _ => Err(DecodeError::UnknownSubCode {
            kind: "channel",
            code: value.to_string(),
        }),
    }
}

fn parse_mutex_op(value: &str) -> Result<MutexOp, DecodeError> {
    match value {
        "L" => Ok(MutexOp::Lock),
        "T" => Ok(MutexOp::TryLock),
        "U" => Ok(MutexOp::Unlock),
        "R" => Ok(MutexOp::RLock),
        "TR" => Ok(MutexOp::TryRLock),
        "RU" => Ok(MutexOp::RUnlock),
        _ => Err(DecodeError::UnknownSubCode {
            kind: "mutex",
            code: value.to_string(),
        }),
    }
}

fn parse_waitgroup_op(value: &str) -> Result<WaitGroupOp, DecodeError> {
    match value {
        "W" => Ok(WaitGroupOp::Wait),
        "A" => Ok(WaitGroupOp::AddDone),
        _ => Err(DecodeError::UnknownSubCode {
            kind: "waitgroup",
            code: value.to_string(),
        }),
    }
}

fn parse_cond_op(value: &str) -> Result<CondOp, DecodeError> {
    match value {
        "W" => Ok(CondOp::Wait),
        "S" => Ok(CondOp::Signal),
        "B" => Ok(CondOp::Broadcast),
        _ => Err(DecodeError::UnknownSubCode {
            kind: "condvar",
            code: value.to_string(),
        }),
    }
}

fn parse_atomic_op(value: &str) -> Result<AtomicOp, DecodeError> {
    match value {
        "L" => Ok(AtomicOp::Load),
        "S" => Ok(AtomicOp::Store),
        "A" => Ok(AtomicOp::Add),
        "W" => Ok(AtomicOp::Swap),
        "C" => Ok(AtomicOp::CompareAndSwap),
        _ => Err(DecodeError::UnknownSubCode {
            kind: "atomic",
            code: value.to_string(),
        }),
    }
}

fn bool_token(value: bool) -> char {
    if value {
        't'
    } else {
        'f'
    }
}

fn channel_op_code(op: ChannelOp) -> char {
    match op {
        ChannelOp::Send => 'S',
        ChannelOp::Recv => 'R',
        ChannelOp::Close => 'C',
    }
}

fn mutex_op_code(op: MutexOp) -> &'static str {
    match op {
        MutexOp::Lock => "L",
        MutexOp::TryLock => "T",
        MutexOp::Unlock => "U",
        MutexOp::RLock => "R",
        MutexOp::TryRLock => "TR",
        MutexOp::RUnlock => "RU",
    }
}

fn waitgroup_op_code(op: WaitGroupOp) -> char {
    match op {
        WaitGroupOp::Wait => 'W',
        WaitGroupOp::AddDone => 'A',
    }
}

fn cond_op_code(op: CondOp) -> char {
    match op {
        CondOp::Wait => 'W',
        CondOp::Signal => 'S',
        CondOp::Broadcast => 'B',
    }
}

fn atomic_op_code(op: AtomicOp) -> char {
    match op {
        AtomicOp::Load => 'L',
        AtomicOp::Store => 'S',
        AtomicOp::Add => 'A',
        AtomicOp::Swap => 'W',
        AtomicOp::CompareAndSwap => 'C',
    }
}
