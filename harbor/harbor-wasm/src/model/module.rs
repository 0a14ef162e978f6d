//! The module descriptor produced by the loader.

use std::collections::HashMap;

use super::types::{
    Export, ExportDesc, FuncIdx, FuncType, GlobalIdx, GlobalType, Import, ImportDesc, MemIdx,
    MemoryType, TableIdx, TableType, TypeIdx, ValType,
};

/// Run-length local declaration inside a function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalDecl {
    pub count: u32,
    pub val_type: ValType,
}

/// Constant expression used by global initializers and segment offsets.
/// Floats are kept as raw bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    GlobalGet(GlobalIdx),
}

impl Default for ConstExpr {
    fn default() -> Self {
        ConstExpr::I32(0)
    }
}

/// Resolved structure of one `block`/`loop`/`if`, keyed in [`ControlMap`] by
/// the position of its opening opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Position of the `else` opcode of an `if`, if present.
    pub else_pos: Option<usize>,
    /// Position of the matching `end` opcode.
    pub end_pos: usize,
    pub params: u32,
    pub results: u32,
}

/// Control-flow side table for a function body, built once at load time so
/// the interpreter never scans for matching `else`/`end` while running.
pub type ControlMap = HashMap<usize, BlockInfo>;

/// A defined function: locals, raw instruction bytes (ending in `end`) and its control map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeBody {
    pub locals: Vec<LocalDecl>,
    /// Absolute offset of the first instruction byte within the module.
    pub offset: usize,
    pub body: Vec<u8>,
    pub control: ControlMap,
}

impl CodeBody {
    pub fn local_count(&self) -> u64 {
        self.locals.iter().map(|d| u64::from(d.count)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

/// Active element segment: function indices written into a table at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ElementSegment {
    pub table: TableIdx,
    pub offset: ConstExpr,
    pub init: Vec<FuncIdx>,
}

/// Active data segment: bytes copied into memory at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataSegment {
    pub memory: MemIdx,
    pub offset: ConstExpr,
    pub init: Vec<u8>,
}

/// Immutable description of a loaded module.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Module {
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    /// Type index of each defined (non-imported) function, in module order.
    pub functions: Vec<TypeIdx>,
    pub tables: Vec<TableType>,
    pub memories: Vec<MemoryType>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<FuncIdx>,
    pub elements: Vec<ElementSegment>,
    pub data_count: Option<u32>,
    /// One body per entry of `functions`.
    pub codes: Vec<CodeBody>,
    pub data: Vec<DataSegment>,
    pub custom_sections: Vec<String>,

    pub imported_funcs: u32,
    pub imported_tables: u32,
    pub imported_memories: u32,
    pub imported_globals: u32,
}

impl Module {
    pub fn total_funcs(&self) -> u32 {
        self.imported_funcs + self.functions.len() as u32
    }

    pub fn total_tables(&self) -> u32 {
        self.imported_tables + self.tables.len() as u32
    }

    pub fn total_memories(&self) -> u32 {
        self.imported_memories + self.memories.len() as u32
    }

    pub fn total_globals(&self) -> u32 {
        self.imported_globals + self.globals.len() as u32
    }

    /// Function imports in declaration order with their type indices.
    pub fn func_imports(&self) -> impl Iterator<Item = (&Import, TypeIdx)> + '_ {
        self.imports.iter().filter_map(|imp| match imp.desc {
            ImportDesc::Func(ty) => Some((imp, ty)),
            _ => None,
        })
    }

    /// Type index of a function in the combined (imports first) index space.
    pub fn func_type_idx(&self, func: FuncIdx) -> Option<TypeIdx> {
        if func < self.imported_funcs {
            self.func_imports().nth(func as usize).map(|(_, ty)| ty)
        } else {
            self.functions.get((func - self.imported_funcs) as usize).copied()
        }
    }

    pub fn func_type(&self, func: FuncIdx) -> Option<&FuncType> {
        self.func_type_idx(func).and_then(|t| self.types.get(t as usize))
    }

    /// Type of a global in the combined (imports first) index space.
    pub fn global_type(&self, global: GlobalIdx) -> Option<GlobalType> {
        if global < self.imported_globals {
            self.imports
                .iter()
                .filter_map(|imp| match imp.desc {
                    ImportDesc::Global(gt) => Some(gt),
                    _ => None,
                })
                .nth(global as usize)
        } else {
            self.globals.get((global - self.imported_globals) as usize).map(|g| g.ty)
        }
    }

    /// The single linear memory, declared or imported.
    pub fn memory_type(&self) -> Option<&MemoryType> {
        self.imports
            .iter()
            .find_map(|imp| match &imp.desc {
                ImportDesc::Memory(mt) => Some(mt),
                _ => None,
            })
            .or_else(|| self.memories.first())
    }

    /// The single table, declared or imported.
    pub fn table_type(&self) -> Option<&TableType> {
        self.imports
            .iter()
            .find_map(|imp| match &imp.desc {
                ImportDesc::Table(tt) => Some(tt),
                _ => None,
            })
            .or_else(|| self.tables.first())
    }

    pub fn export(&self, name: &str) -> Option<ExportDesc> {
        self.exports.iter().find(|e| e.name == name).map(|e| e.desc)
    }

    /// Block arity `(params, results)` for a block type.
    pub fn block_arity(&self, bt: super::types::BlockType) -> Option<(u32, u32)> {
        use super::types::BlockType;
        match bt {
            BlockType::Empty => Some((0, 0)),
            BlockType::Value(_) => Some((0, 1)),
            BlockType::Func(idx) => self
                .types
                .get(idx as usize)
                .map(|ft| (ft.params.len() as u32, ft.results.len() as u32)),
        }
    }
}
