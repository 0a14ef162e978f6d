//! Module descriptor and the types it is built from.

pub mod module;
pub mod types;

pub use module::{
    BlockInfo, CodeBody, ConstExpr, ControlMap, DataSegment, ElementSegment, Global, LocalDecl,
    Module,
};
pub use types::{
    BlockType, Export, ExportDesc, FuncIdx, FuncType, GlobalIdx, GlobalType, Import, ImportDesc,
    Limits, MemIdx, MemoryType, RefType, TableIdx, TableType, TypeIdx, ValType, Value,
};
