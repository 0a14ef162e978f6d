//! Host function registry and the per-module host table.
//!
//! A [`HostRegistry`] holds every host function that may be offered to a
//! module, keyed by `(namespace, name)`. Resolving a module against it yields
//! a [`HostTable`]: one entry per function import, in import order, with the
//! signature already checked.

pub mod capabilities;
pub mod clock;
pub mod continuations;
pub mod io;
pub mod native;
pub mod state;
pub mod wasi;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

pub use capabilities::{Capabilities, Capability};
pub use clock::{Clock, ManualClock, SystemClock};
pub use continuations::{Completion, Continuations, TimerRequest, Token};
pub use io::{Handle, IoTable, SharedBuffer};
pub use state::{HostConfig, HostState};

use crate::error::{HostFailure, ResolveError};
use crate::model::{FuncType, ImportDesc, Module, Value};
use crate::runtime::Memory;

/// Why a host call suspended the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// Cooperative yield; resumable right away.
    Yield,
    /// Waiting for at least one pending operation to complete.
    AwaitCompletion,
}

/// Results handed to the module when a suspended host call resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeWith {
    Values(Vec<Value>),
    /// Number of ready completions at resume time, as an `i32`.
    ReadyCount,
}

/// What the engine does after a host call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAction {
    Return(Vec<Value>),
    Suspend { reason: SuspendReason, resume: ResumeWith },
    Exit(i32),
}

/// View of the calling instance given to host functions.
pub struct HostContext<'a> {
    pub memory: Option<&'a mut Memory>,
    pub state: &'a mut HostState,
}

impl<'a> HostContext<'a> {
    pub fn new(memory: Option<&'a mut Memory>, state: &'a mut HostState) -> Self {
        Self { memory, state }
    }

    pub fn memory(&mut self) -> Option<&mut Memory> {
        self.memory.as_deref_mut()
    }
}

pub type HostFn =
    dyn Fn(&mut HostContext<'_>, &[Value]) -> Result<HostAction, HostFailure> + Send + Sync;

/// A host implementation with its signature and the capability gating it.
#[derive(Clone)]
pub struct HostFunction {
    pub namespace: String,
    pub name: String,
    pub ty: FuncType,
    pub capability: Capabilities,
    pub func: Arc<HostFn>,
}

impl HostFunction {
    pub fn new<F>(namespace: &str, name: &str, ty: FuncType, capability: Capabilities, f: F) -> Self
    where
        F: Fn(&mut HostContext<'_>, &[Value]) -> Result<HostAction, HostFailure> + Send + Sync + 'static,
    {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ty,
            capability,
            func: Arc::new(f),
        }
    }

    pub fn call(&self, ctx: &mut HostContext<'_>, args: &[Value]) -> Result<HostAction, HostFailure> {
        (self.func)(ctx, args)
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    funcs: BTreeMap<(String, String), HostFunction>,
}

impl HostRegistry {
    /// Registry with no functions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in WASI and `harbor` functions allowed by `caps`.
    pub fn with_capabilities(caps: Capabilities) -> Self {
        let mut registry = Self::new();
        for f in wasi::functions().into_iter().chain(native::functions()) {
            if caps.contains(f.capability) {
                registry.insert(f);
            }
        }
        registry
    }

    pub fn insert(&mut self, f: HostFunction) -> &mut Self {
        self.funcs.insert((f.namespace.clone(), f.name.clone()), f);
        self
    }

    /// Add or replace a custom function. Custom functions are not gated by
    /// any capability.
    pub fn define<F>(&mut self, namespace: &str, name: &str, ty: FuncType, f: F) -> &mut Self
    where
        F: Fn(&mut HostContext<'_>, &[Value]) -> Result<HostAction, HostFailure> + Send + Sync + 'static,
    {
        self.insert(HostFunction::new(namespace, name, ty, Capabilities::empty(), f))
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&HostFunction> {
        self.funcs.get(&(namespace.to_string(), name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Bind every function import of `module`. Nothing is returned unless all
    /// imports resolve with matching signatures.
    pub fn resolve(&self, module: &Module) -> Result<HostTable, ResolveError> {
        let mut funcs = Vec::with_capacity(module.imported_funcs as usize);
        for imp in &module.imports {
            let unresolved = || ResolveError::UnresolvedImport {
                namespace: imp.namespace.clone(),
                name: imp.name.clone(),
                kind: imp.desc.kind(),
            };
            match &imp.desc {
                ImportDesc::Func(t) => {
                    let expected = module.types.get(*t as usize).cloned().unwrap_or_default();
                    let f = self.get(&imp.namespace, &imp.name).ok_or_else(unresolved)?;
                    if f.ty != expected {
                        return Err(ResolveError::SignatureMismatch {
                            namespace: imp.namespace.clone(),
                            name: imp.name.clone(),
                            expected,
                            found: f.ty.clone(),
                        });
                    }
                    debug!(import = %f.qualified_name(), ty = %f.ty, "import resolved");
                    funcs.push(f.clone());
                }
                // Satisfied by the instance memory at instantiation.
                ImportDesc::Memory(_) => {}
                ImportDesc::Table(_) | ImportDesc::Global(_) => return Err(unresolved()),
            }
        }
        Ok(HostTable { funcs })
    }
}

/// Resolved host functions for one module, in function-import order.
#[derive(Debug, Clone, Default)]
pub struct HostTable {
    funcs: Vec<HostFunction>,
}

impl HostTable {
    pub fn get(&self, idx: usize) -> Option<&HostFunction> {
        self.funcs.get(idx)
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostFunction> {
        self.funcs.iter()
    }
}

/* ---------- argument and pointer helpers shared by the built-ins ---------- */

pub(crate) fn arg_i32(args: &[Value], n: usize) -> i32 {
    args.get(n).and_then(Value::as_i32).unwrap_or_default()
}

pub(crate) fn arg_i64(args: &[Value], n: usize) -> i64 {
    args.get(n).and_then(Value::as_i64).unwrap_or_default()
}

/// Guest pointer argument as an unsigned offset.
pub(crate) fn arg_ptr(args: &[Value], n: usize) -> u64 {
    u64::from(arg_i32(args, n) as u32)
}

pub(crate) fn ret_i32(v: i32) -> Result<HostAction, HostFailure> {
    Ok(HostAction::Return(vec![Value::I32(v)]))
}
