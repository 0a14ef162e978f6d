//! Execution engine: binds a module to its memory and host table and produces
//! an [`Instance`] ready to run.

mod instance;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use instance::{Instance, RunOutcome, Suspension, TerminalState};

use crate::error::{InstantiationError, MemoryError};
use crate::host::{HostState, HostTable};
use crate::model::{ConstExpr, ExportDesc, FuncIdx, Limits, Module, Value};
use crate::runtime::{GlobalSlot, Memory, Table, MAX_PAGES};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Export run after the start function.
    pub entry: String,
    /// Export invoked when the entry returns with work still pending.
    pub resume_export: Option<String>,
    pub max_call_depth: usize,
    pub max_value_stack: usize,
    /// Upper bound on memory size regardless of the declared maximum.
    pub max_memory_pages: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            entry: "run".into(),
            resume_export: Some("resume".into()),
            max_call_depth: 1024,
            max_value_stack: 1 << 20,
            max_memory_pages: MAX_PAGES,
        }
    }
}

/// Shared cancellation flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Memory sized for `module`'s declared or imported memory, capped at
    /// `max_memory_pages`. `None` when the module has no memory.
    pub fn memory_for(&self, module: &Module) -> Result<Option<Memory>, MemoryError> {
        module
            .memory_type()
            .map(|ty| Memory::for_type(ty, self.config.max_memory_pages))
            .transpose()
    }

    /// Bind `module` to `memory`, `host` and `state`. No module code runs here;
    /// the start function runs when the instance is started.
    pub fn instantiate(
        &self,
        module: Arc<Module>,
        memory: Option<Memory>,
        host: Arc<HostTable>,
        state: HostState,
    ) -> Result<Instance, InstantiationError> {
        check_bindings(&module, &host)?;

        let mut memory = match (module.memory_type(), memory) {
            (Some(ty), Some(mem)) => {
                let declared = ty.limits;
                let fits_max = declared.max.map_or(true, |max| mem.max_pages() <= max);
                if mem.size_pages() < declared.min || !fits_max {
                    return Err(InstantiationError::MemoryMismatch {
                        declared,
                        provided: Limits::new(mem.size_pages(), Some(mem.max_pages())),
                    });
                }
                Some(mem)
            }
            (Some(ty), None) => {
                return Err(InstantiationError::MemoryMismatch {
                    declared: ty.limits,
                    provided: Limits::new(0, Some(0)),
                })
            }
            (None, _) => None,
        };

        let mut globals: Vec<GlobalSlot> = Vec::with_capacity(module.globals.len());
        for g in &module.globals {
            let v = eval_const(g.init, &globals, "global initializer")?;
            if v.ty() != g.ty.val_type {
                return Err(InstantiationError::ConstExpr {
                    context: "global initializer",
                    reason: "value type does not match the global",
                });
            }
            globals.push(GlobalSlot::new(g.ty, v));
        }

        let mut table = module.table_type().map(Table::new);
        for (i, seg) in module.elements.iter().enumerate() {
            let segment = i as u32;
            let offset = eval_offset(seg.offset, &globals, "element offset")?;
            table
                .as_mut()
                .ok_or(InstantiationError::ElementOutOfBounds { segment })?
                .init(offset, &seg.init)
                .map_err(|()| InstantiationError::ElementOutOfBounds { segment })?;
        }
        for (i, seg) in module.data.iter().enumerate() {
            let segment = i as u32;
            let offset = eval_offset(seg.offset, &globals, "data offset")?;
            memory
                .as_mut()
                .ok_or(InstantiationError::DataOutOfBounds { segment })?
                .write(u64::from(offset), &seg.init)
                .map_err(|_| InstantiationError::DataOutOfBounds { segment })?;
        }

        let entry = resolve_entry(&module, &self.config.entry)?;
        let resume = self.config.resume_export.as_deref().and_then(|name| {
            match resolve_entry(&module, name) {
                Ok(f) => Some(f),
                Err(InstantiationError::MissingExport { .. }) => None,
                Err(e) => {
                    warn!(error = %e, "ignoring unusable resume export");
                    None
                }
            }
        });

        info!(
            entry = %self.config.entry,
            imports = host.len(),
            memory_pages = memory.as_ref().map_or(0, Memory::size_pages),
            globals = globals.len(),
            resume = resume.is_some(),
            "instantiated module"
        );

        Ok(Instance::new(instance::Parts {
            module,
            memory,
            table,
            globals,
            host,
            state,
            config: self.config.clone(),
            entry,
            resume,
        }))
    }
}

/// The host table must list exactly this module's function imports, in order.
fn check_bindings(module: &Module, host: &HostTable) -> Result<(), InstantiationError> {
    let imports: Vec<_> = module.func_imports().collect();
    if imports.len() != host.len() {
        return Err(InstantiationError::ImportBinding {
            index: imports.len().min(host.len()) as u32,
            expected: format!("{} function imports", imports.len()),
            found: format!("{} host functions", host.len()),
        });
    }
    for (i, ((imp, ty), f)) in imports.iter().zip(host.iter()).enumerate() {
        let same_type = module.types.get(*ty as usize) == Some(&f.ty);
        if f.namespace != imp.namespace || f.name != imp.name || !same_type {
            return Err(InstantiationError::ImportBinding {
                index: i as u32,
                expected: format!("{}.{}", imp.namespace, imp.name),
                found: format!("{} {}", f.qualified_name(), f.ty),
            });
        }
    }
    Ok(())
}

fn eval_const(expr: ConstExpr, globals: &[GlobalSlot], context: &'static str) -> Result<Value, InstantiationError> {
    Ok(match expr {
        ConstExpr::I32(v) => Value::I32(v),
        ConstExpr::I64(v) => Value::I64(v),
        ConstExpr::F32(b) => Value::F32(b),
        ConstExpr::F64(b) => Value::F64(b),
        ConstExpr::GlobalGet(idx) => globals
            .get(idx as usize)
            .map(GlobalSlot::get)
            .ok_or(InstantiationError::ConstExpr { context, reason: "global.get of an uninitialized global" })?,
    })
}

fn eval_offset(expr: ConstExpr, globals: &[GlobalSlot], context: &'static str) -> Result<u32, InstantiationError> {
    match eval_const(expr, globals, context)? {
        Value::I32(v) => Ok(v as u32),
        _ => Err(InstantiationError::ConstExpr { context, reason: "offset is not an i32" }),
    }
}

fn resolve_entry(module: &Module, name: &str) -> Result<FuncIdx, InstantiationError> {
    match module.export(name) {
        None => Err(InstantiationError::MissingExport { name: name.into() }),
        Some(ExportDesc::Func(f)) => {
            let ty = module.func_type(f).cloned().unwrap_or_default();
            if !ty.params.is_empty() {
                return Err(InstantiationError::EntrySignature { name: name.into(), found: ty });
            }
            Ok(f)
        }
        Some(_) => Err(InstantiationError::EntryNotFunction { name: name.into() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Capabilities, HostConfig, HostRegistry, IoTable};

    fn parts(src: &str) -> (Arc<Module>, Option<Memory>, Arc<HostTable>, HostState) {
        let module = crate::load(&wat::parse_str(src).unwrap()).unwrap();
        let host = HostRegistry::with_capabilities(Capabilities::all()).resolve(&module).unwrap();
        let memory = Engine::default().memory_for(&module).unwrap();
        let state = HostState::with_io(HostConfig::default(), IoTable::empty());
        (Arc::new(module), memory, Arc::new(host), state)
    }

    fn instantiate(src: &str) -> Result<Instance, InstantiationError> {
        let (m, mem, host, state) = parts(src);
        Engine::default().instantiate(m, mem, host, state)
    }

    #[test]
    fn entry_export_checks() {
        assert_eq!(
            instantiate(r#"(module)"#).unwrap_err(),
            InstantiationError::MissingExport { name: "run".into() }
        );
        assert_eq!(
            instantiate(r#"(module (memory (export "run") 1))"#).unwrap_err(),
            InstantiationError::EntryNotFunction { name: "run".into() }
        );
        assert!(matches!(
            instantiate(r#"(module (func (export "run") (param i32)))"#),
            Err(InstantiationError::EntrySignature { .. })
        ));
    }

    #[test]
    fn data_segment_bounds() {
        assert_eq!(
            instantiate(r#"(module (memory 1) (data (i32.const 65535) "ab") (func (export "run")))"#).unwrap_err(),
            InstantiationError::DataOutOfBounds { segment: 0 }
        );
        let inst = instantiate(r#"(module (memory 1) (data (i32.const 8) "hi") (func (export "run")))"#).unwrap();
        assert_eq!(inst.memory().unwrap().read(8, 2).unwrap(), b"hi");
    }

    #[test]
    fn element_segment_bounds() {
        assert_eq!(
            instantiate(r#"(module (table 1 funcref) (elem (i32.const 1) $f) (func $f) (func (export "run")))"#)
                .unwrap_err(),
            InstantiationError::ElementOutOfBounds { segment: 0 }
        );
    }

    #[test]
    fn host_table_must_match_imports() {
        let (m, mem, _, state) = parts(r#"(module (import "harbor" "exit" (func (param i32))) (func (export "run")))"#);
        let err = Engine::default().instantiate(m, mem, Arc::new(HostTable::default()), state).unwrap_err();
        assert!(matches!(err, InstantiationError::ImportBinding { index: 0, .. }));
    }

    #[test]
    fn memory_must_satisfy_declared_limits() {
        let (m, _, host, state) = parts(r#"(module (memory 2) (func (export "run")))"#);
        let small = Memory::new(1, 4).unwrap();
        assert!(matches!(
            Engine::default().instantiate(m, Some(small), host, state),
            Err(InstantiationError::MemoryMismatch { .. })
        ));
    }

    #[test]
    fn globals_initialized_from_earlier_globals() {
        let inst = instantiate(
            r#"(module (global $a i32 (i32.const 5)) (global $b i32 (global.get $a)) (func (export "run")))"#,
        )
        .unwrap();
        assert_eq!(inst.global(1), Some(Value::I32(5)));
    }

    #[test]
    fn cancel_handle_is_shared() {
        let a = CancelHandle::new();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
    }
}
