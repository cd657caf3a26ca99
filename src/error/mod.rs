//! VM failure taxonomy.
//!
//! Unified error system carried over from the teacher's coded, dry-message
//! style (`[{kind}] {message}`), re-grounded on the runtime taxonomy the
//! core actually surfaces instead of on lexer/parser errors, which belong
//! to the out-of-scope compiler front-end.

use thiserror::Error;

pub type VmResult<T> = Result<T, VmError>;

/// The error kinds a VM dispatch loop can terminate with (§4.4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CompileError,
    Runtime,
    Type,
    Arity,
    StackOverflow,
    StackUnderflow,
    DivisionByZero,
    OutOfBounds,
    UndefinedVariable,
    Capability,
    NotImplemented,
    SendFailed,
    OutOfMemory,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CompileError => "CompileError",
            ErrorKind::Runtime => "Runtime",
            ErrorKind::Type => "Type",
            ErrorKind::Arity => "Arity",
            ErrorKind::StackOverflow => "StackOverflow",
            ErrorKind::StackUnderflow => "StackUnderflow",
            ErrorKind::DivisionByZero => "DivisionByZero",
            ErrorKind::OutOfBounds => "OutOfBounds",
            ErrorKind::UndefinedVariable => "UndefinedVariable",
            ErrorKind::Capability => "Capability",
            ErrorKind::NotImplemented => "NotImplemented",
            ErrorKind::SendFailed => "SendFailed",
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::Timeout => "Timeout",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A VM-surfaced error: kind, short message, and the source line pulled
/// from the chunk's per-instruction line table (§4.4.5). Line defaults to
/// 0 ("unknown") and is filled in by the dispatch loop via `with_line`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{kind}] {message} (line {line})")]
pub struct VmError {
    pub kind: ErrorKind,
    pub message: String,
    pub line: usize,
}

impl VmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), line: 0 }
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = line;
        self
    }
}

/// Outcome of running a VM to an instruction boundary (§4.4.5, §5): every
/// dispatch loop returns exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// Execution finished normally, producing a value.
    Ok(T),
    /// `HALT` was executed.
    Halt,
    /// The reduction budget was exhausted; reschedule later.
    Yield,
    /// Blocked waiting on a mailbox message or timer (§4.4.4).
    Waiting,
    /// An error terminated the dispatch loop.
    Err(VmError),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }
}

/// Allocation failure surfaced by the heap (§4.3.8). Kept distinct from
/// `VmError` because a heap can be driven without a VM present (the
/// `vm?`-optional allocation contract of §4.3.2) and must never be
/// silently retried.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    #[error("out of memory")]
    OutOfMemory,
}

/// Capability and path-sandbox denials surfaced by the host-I/O seam
/// (§6.3, §6.4). Turned into `VmError::Capability` or a `Result::Err`
/// value depending on the opcode's contract (§7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("capability denied: {0}")]
    CapabilityDenied(String),
    #[error("path denied: {0}")]
    PathDenied(String),
    #[error("{0}")]
    Other(String),
}
