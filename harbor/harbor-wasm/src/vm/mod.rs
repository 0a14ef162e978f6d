//! Bytecode interpreter: value stack, call frames and the execution loop.

pub mod frames;
pub mod instructions;
pub mod interpreter;
pub mod stack;

use crate::binary::BinaryReadError;
use crate::error::{HostFailure, MemoryError, Trap};

pub use interpreter::{ExecOutcome, Executor, Machine};

/// Why execution stopped abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Trap(Trap),
    Host(HostFailure),
}

impl From<Trap> for Fault {
    fn from(t: Trap) -> Self {
        Fault::Trap(t)
    }
}

impl From<HostFailure> for Fault {
    fn from(f: HostFailure) -> Self {
        Fault::Host(f)
    }
}

impl From<MemoryError> for Fault {
    fn from(e: MemoryError) -> Self {
        Fault::Trap(e.into())
    }
}

// Bodies are validated at load time; a bad immediate here means the code is corrupt.
impl From<BinaryReadError> for Fault {
    fn from(_: BinaryReadError) -> Self {
        Fault::Trap(Trap::InvalidCode("malformed immediate"))
    }
}
