//! harbor-wasm: sandboxed WebAssembly host runtime.
//!
//! Load a module with [`load`], resolve its imports against a
//! [`HostRegistry`], size its [`Memory`], then [`Engine::instantiate`] and
//! drive the resulting [`Instance`].

pub mod binary;
pub mod engine;
pub mod error;
pub mod host;
pub mod model;
pub mod runtime;
pub mod validate;
pub mod vm;

pub use engine::{CancelHandle, Engine, EngineConfig, Instance, RunOutcome, Suspension, TerminalState};
pub use error::{
    Error, HostFailure, InstantiationError, LifecycleError, MalformedModule, MemoryError, ResolveError, Trap,
};
pub use host::{Capabilities, Capability, HostConfig, HostRegistry, HostState, HostTable};
pub use model::{Module, ValType, Value};
pub use runtime::Memory;

/// Parse and validate a binary module. Nothing is executed.
pub fn load(bytes: &[u8]) -> Result<Module, MalformedModule> {
    binary::sections::parse_module(bytes)
}
