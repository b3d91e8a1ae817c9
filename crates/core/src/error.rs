//! Error and status codes shared by the compiler and the runtime.
//!
//! Mirrors `aapi.h`/`aql.h`'s status codes, but as a `Result`-friendly enum
//! rather than an integer plus a thread-local message buffer: every fallible
//! operation in this workspace returns `Result<T, AqlError>` and propagates
//! with `?`, per the translation note in `spec.md` §9.

use std::fmt;

/// Mirrors the embedding API's `AQL_OK`/`AQL_ERR*` status codes (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Yield = 1,
    ErrRun = 2,
    ErrSyntax = 3,
    ErrMem = 4,
    ErrErr = 5,
}

impl Status {
    pub fn as_code(self) -> i32 {
        self as i32
    }
}

/// A compiled-time or run-time failure. One variant per §7 "Kinds".
#[derive(Debug, Clone)]
pub enum AqlError {
    /// Malformed source: carries the source name, 1-based line, and the
    /// near-token text the lexer/parser was looking at when it gave up.
    Syntax {
        source: String,
        line: u32,
        near: String,
        message: String,
    },
    /// Division by zero, bad operand type, undefined global, stack
    /// overflow, C-stack overflow, etc.
    Runtime { line: Option<u32>, message: String },
    /// The allocator returned `None`/failed. Carries no heap-allocated
    /// payload of its own so reporting an OOM cannot itself allocate,
    /// matching the source's preallocated out-of-memory string.
    Memory,
    /// An error handler raised while already handling an error.
    ErrorInHandler(String),
}

impl AqlError {
    pub fn syntax(source: impl Into<String>, line: u32, near: impl Into<String>, message: impl Into<String>) -> Self {
        AqlError::Syntax {
            source: source.into(),
            line,
            near: near.into(),
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        AqlError::Runtime {
            line: None,
            message: message.into(),
        }
    }

    pub fn runtime_at(line: u32, message: impl Into<String>) -> Self {
        AqlError::Runtime {
            line: Some(line),
            message: message.into(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            AqlError::Syntax { .. } => Status::ErrSyntax,
            AqlError::Runtime { .. } => Status::ErrRun,
            AqlError::Memory => Status::ErrMem,
            AqlError::ErrorInHandler(_) => Status::ErrErr,
        }
    }
}

impl fmt::Display for AqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AqlError::Syntax { source, line, near, message } => {
                write!(f, "{source}:{line}: {message} near '{near}'")
            }
            AqlError::Runtime { line: Some(line), message } => write!(f, "line {line}: {message}"),
            AqlError::Runtime { line: None, message } => write!(f, "{message}"),
            AqlError::Memory => write!(f, "not enough memory"),
            AqlError::ErrorInHandler(message) => write!(f, "error in error handling: {message}"),
        }
    }
}

impl std::error::Error for AqlError {}

pub type AqlResult<T> = Result<T, AqlError>;
