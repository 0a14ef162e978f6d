//! Error taxonomy of the runtime.
//!
//! Load, resolve and instantiation errors are returned before any module code
//! runs. [`MemoryError`] is local and recoverable. [`Trap`] and
//! [`HostFailure`] only ever appear inside a terminal state.

use std::fmt;

use thiserror::Error;

use crate::binary::sections::SectionId;
use crate::model::{FuncType, Limits};

/// Where in the binary a load failure was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Header,
    Section(SectionId),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Header => f.write_str("module header"),
            Origin::Section(id) => write!(f, "{id} section"),
        }
    }
}

fn entry_suffix(index: &Option<u32>) -> String {
    index.map(|i| format!(" entry {i}")).unwrap_or_default()
}

/// Structural or validation failure while loading a module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed module: {reason} ({origin}{}, offset {offset})", entry_suffix(.index))]
pub struct MalformedModule {
    pub origin: Origin,
    /// Absolute byte offset within the module.
    pub offset: usize,
    /// Offending entry within the section (function, export, segment...).
    pub index: Option<u32>,
    pub reason: String,
}

impl MalformedModule {
    pub fn new(origin: Origin, offset: usize, reason: impl Into<String>) -> Self {
        Self { origin, offset, index: None, reason: reason.into() }
    }

    pub fn at_entry(origin: Origin, index: u32, reason: impl Into<String>) -> Self {
        Self { origin, offset: 0, index: Some(index), reason: reason.into() }
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Memory-policy violations reported by [`crate::runtime::Memory`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("out of bounds access: offset {offset}, length {len}, memory size {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("memory grow limit exceeded: {current} + {delta} pages exceeds maximum {max}")]
    GrowLimitExceeded { current: u32, delta: u32, max: u32 },

    #[error("invalid memory limits: min {min} pages, max {max} pages")]
    InvalidLimits { min: u32, max: u32 },
}

/// Mismatch between what a module imports and what the host offers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unresolved import: {namespace}.{name} ({kind})")]
    UnresolvedImport { namespace: String, name: String, kind: &'static str },

    #[error("signature mismatch for {namespace}.{name}: module expects {expected}, host provides {found}")]
    SignatureMismatch { namespace: String, name: String, expected: FuncType, found: FuncType },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstantiationError {
    #[error("export not found: {name}")]
    MissingExport { name: String },

    #[error("export {name} is not a function")]
    EntryNotFunction { name: String },

    #[error("entry export {name} must take no parameters, found {found}")]
    EntrySignature { name: String, found: FuncType },

    #[error("host table does not match import {index}: expected {expected}, found {found}")]
    ImportBinding { index: u32, expected: String, found: String },

    #[error("memory limits {provided} do not satisfy declared limits {declared}")]
    MemoryMismatch { declared: Limits, provided: Limits },

    #[error("element segment {segment} does not fit the table")]
    ElementOutOfBounds { segment: u32 },

    #[error("data segment {segment} does not fit the memory")]
    DataOutOfBounds { segment: u32 },

    #[error("invalid constant expression in {context}: {reason}")]
    ConstExpr { context: &'static str, reason: &'static str },
}

/// Module-side fault. Terminal for the instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Trap {
    #[error("unreachable executed")]
    Unreachable,

    #[error("out of bounds memory access at {offset} (length {len})")]
    OutOfBounds { offset: u64, len: u64 },

    #[error("integer divide by zero")]
    IntegerDivideByZero,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("invalid conversion to integer")]
    InvalidConversionToInteger,

    #[error("undefined table element")]
    UndefinedElement,

    #[error("uninitialized table element")]
    UninitializedElement,

    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,

    #[error("call stack exhausted")]
    StackExhausted,

    #[error("invalid opcode {opcode:#04x} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },

    #[error("invalid code: {0}")]
    InvalidCode(&'static str),
}

impl From<MemoryError> for Trap {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfBounds { offset, len, .. } => Trap::OutOfBounds { offset, len },
            // Growth failures are reported to the module as -1 and never reach here
            // through the interpreter; host code converting one is a bounds problem.
            MemoryError::GrowLimitExceeded { .. } | MemoryError::InvalidLimits { .. } => {
                Trap::OutOfBounds { offset: 0, len: 0 }
            }
        }
    }
}

/// Misuse of the instance lifecycle by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("instance was already started")]
    AlreadyStarted,

    #[error("instance is not suspended")]
    NotSuspended,

    #[error("resume token does not match the pending suspension")]
    TokenMismatch,

    #[error("instance is not idle")]
    NotIdle,

    #[error("module has no resume export")]
    NoResumeExport,

    #[error("instance has already terminated")]
    Terminated,
}

/// Host-side failure. Terminal for the instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostFailure {
    #[error("cancelled")]
    Cancelled,

    #[error("I/O failure on handle {handle}: {message}")]
    Io { handle: u32, message: String },

    #[error("host function {name} failed: {message}")]
    Function { name: String, message: String },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("driver failure: {0}")]
    Driver(String),
}

/// Any failure that stops a module from reaching execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] MalformedModule),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Instantiate(#[from] InstantiationError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}
