//! Section ids, payload decoders and the top-level module parser.
//!
//! Every section is decoded from its own length-bounded slice, so a decoder
//! can never read into the next section. Offsets are rebased onto the whole
//! module before being reported.

use std::fmt;

use tracing::debug;

use super::{
    cursor::Cursor,
    leb128,
    reader::{read_byte_vec, read_len, read_name, read_vec},
    BinaryReadError, Result,
};
use crate::error::{MalformedModule, Origin};
use crate::model::{
    CodeBody, ConstExpr, DataSegment, ElementSegment, Export, ExportDesc, FuncType, Global,
    GlobalType, Import, ImportDesc, Limits, LocalDecl, MemoryType, Module, RefType, TableType,
    ValType,
};

const MAGIC: [u8; 4] = *b"\0asm";
const VERSION: u32 = 1;

/// Upper bound on the number of locals declared by one function.
const MAX_LOCALS: u64 = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionId {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
    DataCount = 12,
}

impl SectionId {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => SectionId::Custom,
            1 => SectionId::Type,
            2 => SectionId::Import,
            3 => SectionId::Function,
            4 => SectionId::Table,
            5 => SectionId::Memory,
            6 => SectionId::Global,
            7 => SectionId::Export,
            8 => SectionId::Start,
            9 => SectionId::Element,
            10 => SectionId::Code,
            11 => SectionId::Data,
            12 => SectionId::DataCount,
            _ => return None,
        })
    }

    /// Position in the canonical section order. Data-count sits between
    /// element and code even though its id is the largest.
    fn order(self) -> u8 {
        match self {
            SectionId::Custom => 0,
            SectionId::Type => 1,
            SectionId::Import => 2,
            SectionId::Function => 3,
            SectionId::Table => 4,
            SectionId::Memory => 5,
            SectionId::Global => 6,
            SectionId::Export => 7,
            SectionId::Start => 8,
            SectionId::Element => 9,
            SectionId::DataCount => 10,
            SectionId::Code => 11,
            SectionId::Data => 12,
        }
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SectionId::Custom => "custom",
            SectionId::Type => "type",
            SectionId::Import => "import",
            SectionId::Function => "function",
            SectionId::Table => "table",
            SectionId::Memory => "memory",
            SectionId::Global => "global",
            SectionId::Export => "export",
            SectionId::Start => "start",
            SectionId::Element => "element",
            SectionId::Code => "code",
            SectionId::Data => "data",
            SectionId::DataCount => "data count",
        })
    }
}

/// Section id, payload length and the absolute offset of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub id: SectionId,
    pub payload_len: usize,
    pub payload_offset: usize,
}

/// Read a section header. Unknown ids are rejected.
pub fn read_section_header(cur: &mut Cursor) -> Result<SectionHeader> {
    let at = cur.offset();
    let id_byte = cur.read_u8()?;
    let id = SectionId::from_byte(id_byte)
        .ok_or(BinaryReadError::Malformed { offset: at, msg: "unknown section id" })?;
    let payload_len = leb128::read_uleb_u32(cur)? as usize;
    Ok(SectionHeader { id, payload_len, payload_offset: cur.offset() })
}

/* ---------- type decoders ---------- */

fn read_val_type(cur: &mut Cursor) -> Result<ValType> {
    let at = cur.offset();
    let b = cur.read_u8()?;
    ValType::from_byte(b).ok_or(BinaryReadError::Malformed { offset: at, msg: "invalid value type" })
}

fn read_ref_type(cur: &mut Cursor) -> Result<RefType> {
    let at = cur.offset();
    match cur.read_u8()? {
        0x70 => Ok(RefType::FuncRef),
        _ => Err(BinaryReadError::Malformed { offset: at, msg: "only funcref tables are supported" }),
    }
}

fn read_limits(cur: &mut Cursor) -> Result<Limits> {
    let at = cur.offset();
    match cur.read_u8()? {
        0x00 => Ok(Limits::new(leb128::read_uleb_u32(cur)?, None)),
        0x01 => {
            let min = leb128::read_uleb_u32(cur)?;
            let max = leb128::read_uleb_u32(cur)?;
            if max < min {
                return Err(BinaryReadError::Malformed { offset: at, msg: "limits maximum below minimum" });
            }
            Ok(Limits::new(min, Some(max)))
        }
        _ => Err(BinaryReadError::Malformed { offset: at, msg: "invalid limits flag" }),
    }
}

fn read_func_type(cur: &mut Cursor) -> Result<FuncType> {
    let at = cur.offset();
    if cur.read_u8()? != 0x60 {
        return Err(BinaryReadError::Malformed { offset: at, msg: "expected function type (0x60)" });
    }
    let params = read_vec(cur, read_val_type)?;
    let results = read_vec(cur, read_val_type)?;
    Ok(FuncType { params, results })
}

fn read_table_type(cur: &mut Cursor) -> Result<TableType> {
    let elem = read_ref_type(cur)?;
    let limits = read_limits(cur)?;
    Ok(TableType { elem, limits })
}

fn read_memory_type(cur: &mut Cursor) -> Result<MemoryType> {
    let at = cur.offset();
    let limits = read_limits(cur)?;
    if limits.min > crate::runtime::MAX_PAGES || limits.max.is_some_and(|m| m > crate::runtime::MAX_PAGES) {
        return Err(BinaryReadError::Malformed { offset: at, msg: "memory size exceeds 65536 pages" });
    }
    Ok(MemoryType { limits })
}

fn read_global_type(cur: &mut Cursor) -> Result<GlobalType> {
    let val_type = read_val_type(cur)?;
    let at = cur.offset();
    let mutable = match cur.read_u8()? {
        0x00 => false,
        0x01 => true,
        _ => return Err(BinaryReadError::Malformed { offset: at, msg: "invalid global mutability" }),
    };
    Ok(GlobalType { val_type, mutable })
}

/// Decode a single-instruction constant expression followed by `end`.
fn read_const_expr(cur: &mut Cursor) -> Result<ConstExpr> {
    let at = cur.offset();
    let expr = match cur.read_u8()? {
        0x41 => ConstExpr::I32(leb128::read_sleb_i32(cur)?),
        0x42 => ConstExpr::I64(leb128::read_sleb_i64(cur)?),
        0x43 => ConstExpr::F32(cur.read_u32_le()?),
        0x44 => ConstExpr::F64(cur.read_u64_le()?),
        0x23 => ConstExpr::GlobalGet(leb128::read_uleb_u32(cur)?),
        _ => return Err(BinaryReadError::Malformed { offset: at, msg: "unsupported constant expression" }),
    };
    let end_at = cur.offset();
    if cur.read_u8()? != 0x0B {
        return Err(BinaryReadError::Malformed { offset: end_at, msg: "constant expression must end after one instruction" });
    }
    Ok(expr)
}

/* ---------- section payloads ---------- */

fn read_imports(cur: &mut Cursor, module: &mut Module) -> Result<()> {
    module.imports = read_vec(cur, |c| {
        let namespace = read_name(c)?;
        let name = read_name(c)?;
        let at = c.offset();
        let desc = match c.read_u8()? {
            0x00 => ImportDesc::Func(leb128::read_uleb_u32(c)?),
            0x01 => ImportDesc::Table(read_table_type(c)?),
            0x02 => ImportDesc::Memory(read_memory_type(c)?),
            0x03 => ImportDesc::Global(read_global_type(c)?),
            _ => return Err(BinaryReadError::Malformed { offset: at, msg: "invalid import kind" }),
        };
        Ok(Import { namespace, name, desc })
    })?;
    for imp in &module.imports {
        match imp.desc {
            ImportDesc::Func(_) => module.imported_funcs += 1,
            ImportDesc::Table(_) => module.imported_tables += 1,
            ImportDesc::Memory(_) => module.imported_memories += 1,
            ImportDesc::Global(_) => module.imported_globals += 1,
        }
    }
    Ok(())
}

fn read_exports(cur: &mut Cursor) -> Result<Vec<Export>> {
    read_vec(cur, |c| {
        let name = read_name(c)?;
        let at = c.offset();
        let kind = c.read_u8()?;
        let idx = leb128::read_uleb_u32(c)?;
        let desc = match kind {
            0x00 => ExportDesc::Func(idx),
            0x01 => ExportDesc::Table(idx),
            0x02 => ExportDesc::Memory(idx),
            0x03 => ExportDesc::Global(idx),
            _ => return Err(BinaryReadError::Malformed { offset: at, msg: "invalid export kind" }),
        };
        Ok(Export { name, desc })
    })
}

fn read_elements(cur: &mut Cursor) -> Result<Vec<ElementSegment>> {
    read_vec(cur, |c| {
        let at = c.offset();
        let (table, offset) = match leb128::read_uleb_u32(c)? {
            0 => (0, read_const_expr(c)?),
            2 => {
                let table = leb128::read_uleb_u32(c)?;
                let offset = read_const_expr(c)?;
                let kind_at = c.offset();
                if c.read_u8()? != 0x00 {
                    return Err(BinaryReadError::Malformed { offset: kind_at, msg: "invalid element kind" });
                }
                (table, offset)
            }
            _ => return Err(BinaryReadError::Malformed { offset: at, msg: "only active function element segments are supported" }),
        };
        let init = read_vec(c, leb128::read_uleb_u32)?;
        Ok(ElementSegment { table, offset, init })
    })
}

fn read_data(cur: &mut Cursor) -> Result<Vec<DataSegment>> {
    read_vec(cur, |c| {
        let at = c.offset();
        let memory = match leb128::read_uleb_u32(c)? {
            0 => 0,
            2 => leb128::read_uleb_u32(c)?,
            1 => return Err(BinaryReadError::Malformed { offset: at, msg: "passive data segments are not supported" }),
            _ => return Err(BinaryReadError::Malformed { offset: at, msg: "invalid data segment flag" }),
        };
        let offset = read_const_expr(c)?;
        let init = read_byte_vec(c)?;
        Ok(DataSegment { memory, offset, init })
    })
}

/// Code entries; `base` is the absolute offset of the payload so each body
/// can remember where its instructions start.
fn read_codes(cur: &mut Cursor, base: usize) -> Result<Vec<CodeBody>> {
    read_vec(cur, |c| {
        let size = read_len(c)?;
        let body_start = c.offset();
        let bytes = c.read_bytes(size)?;
        let mut sub = Cursor::new(bytes);

        let mut total = 0u64;
        let locals = read_vec(&mut sub, |s| {
            let at = s.offset();
            let count = leb128::read_uleb_u32(s)?;
            total += u64::from(count);
            if total > MAX_LOCALS {
                return Err(BinaryReadError::Malformed { offset: at, msg: "too many locals" });
            }
            Ok(LocalDecl { count, val_type: read_val_type(s)? })
        })
        .map_err(|e| e.rebased(body_start))?;

        let instr_start = sub.offset();
        let body = bytes[instr_start..].to_vec();
        Ok(CodeBody {
            locals,
            offset: base + body_start + instr_start,
            body,
            control: Default::default(),
        })
    })
}

/* ---------- module parser ---------- */

fn header_err(e: BinaryReadError) -> MalformedModule {
    MalformedModule::new(Origin::Header, e.offset(), e.reason())
}

/// Decode a module. Structural problems in any section, including failed
/// cross-validation, are reported as [`MalformedModule`].
pub fn parse_module(bytes: &[u8]) -> core::result::Result<Module, MalformedModule> {
    let mut cur = Cursor::new(bytes);
    let magic: [u8; 4] = cur.read_array().map_err(header_err)?;
    if magic != MAGIC {
        return Err(MalformedModule::new(Origin::Header, 0, "bad magic number"));
    }
    let version = cur.read_u32_le().map_err(header_err)?;
    if version != VERSION {
        return Err(MalformedModule::new(Origin::Header, 4, format!("unsupported version {version}")));
    }

    let mut module = Module::default();
    let mut last_order = 0u8;
    let mut function_count = None;

    while !cur.is_eof() {
        let header = read_section_header(&mut cur)
            .map_err(|e| MalformedModule::new(Origin::Header, e.offset(), e.reason()))?;
        let origin = Origin::Section(header.id);
        let payload = cur
            .read_bytes(header.payload_len)
            .map_err(|_| MalformedModule::new(origin, header.payload_offset, "section extends past end of module"))?;
        let base = header.payload_offset;
        let mut pcur = Cursor::new(payload);

        debug!(section = %header.id, offset = base, len = header.payload_len, "section");

        if header.id == SectionId::Custom {
            let name = read_name(&mut pcur).unwrap_or_else(|_| String::from("<unnamed>"));
            debug!(name = %name, len = header.payload_len, "skipping custom section");
            module.custom_sections.push(name);
            continue;
        }

        let order = header.id.order();
        if order == last_order {
            return Err(MalformedModule::new(origin, base, "duplicate section"));
        }
        if order < last_order {
            return Err(MalformedModule::new(origin, base, "section out of order"));
        }
        last_order = order;

        let decoded: Result<()> = (|| {
            match header.id {
                SectionId::Type => module.types = read_vec(&mut pcur, read_func_type)?,
                SectionId::Import => read_imports(&mut pcur, &mut module)?,
                SectionId::Function => {
                    module.functions = read_vec(&mut pcur, leb128::read_uleb_u32)?;
                    function_count = Some(module.functions.len());
                }
                SectionId::Table => module.tables = read_vec(&mut pcur, read_table_type)?,
                SectionId::Memory => module.memories = read_vec(&mut pcur, read_memory_type)?,
                SectionId::Global => {
                    module.globals = read_vec(&mut pcur, |c| {
                        let ty = read_global_type(c)?;
                        let init = read_const_expr(c)?;
                        Ok(Global { ty, init })
                    })?
                }
                SectionId::Export => module.exports = read_exports(&mut pcur)?,
                SectionId::Start => module.start = Some(leb128::read_uleb_u32(&mut pcur)?),
                SectionId::Element => module.elements = read_elements(&mut pcur)?,
                SectionId::DataCount => module.data_count = Some(leb128::read_uleb_u32(&mut pcur)?),
                SectionId::Code => module.codes = read_codes(&mut pcur, base)?,
                SectionId::Data => module.data = read_data(&mut pcur)?,
                SectionId::Custom => {}
            }
            if !pcur.is_eof() {
                return Err(BinaryReadError::Malformed {
                    offset: pcur.offset(),
                    msg: "section payload not fully consumed",
                });
            }
            Ok(())
        })();
        decoded.map_err(|e| {
            // Code bodies already rebase their locals errors onto the payload.
            MalformedModule::new(origin, base + e.offset(), e.reason())
        })?;
    }

    if function_count.unwrap_or(0) != module.codes.len() {
        return Err(MalformedModule::new(
            Origin::Section(SectionId::Code),
            bytes.len(),
            format!(
                "function section declares {} bodies but code section has {}",
                function_count.unwrap_or(0),
                module.codes.len()
            ),
        ));
    }
    if let Some(count) = module.data_count {
        if count as usize != module.data.len() {
            return Err(MalformedModule::new(
                Origin::Section(SectionId::DataCount),
                bytes.len(),
                format!("data count {count} does not match {} data segments", module.data.len()),
            ));
        }
    }

    crate::validate::validate_module(&mut module)?;

    debug!(
        types = module.types.len(),
        imports = module.imports.len(),
        functions = module.functions.len(),
        exports = module.exports.len(),
        custom = module.custom_sections.len(),
        "module decoded"
    );
    Ok(module)
}
