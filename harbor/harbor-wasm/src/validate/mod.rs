//! Cross-section validation and function body checks.
//!
//! Index spaces, export uniqueness, start signature, segment targets and the
//! structure of every function body are checked here. The body walk also
//! records the control map the interpreter uses to jump between `if`, `else`
//! and `end` without rescanning. Operand types are not tracked; a body that
//! misuses the value stack traps when it runs.

use std::collections::HashSet;

use crate::binary::{cursor::Cursor, leb128, reader::read_len, sections::SectionId, BinaryReadError};
use crate::error::{MalformedModule, Origin};
use crate::model::{
    BlockInfo, CodeBody, ConstExpr, ControlMap, ExportDesc, FuncIdx, GlobalIdx, ImportDesc, Module,
    ValType,
};
use crate::vm::instructions::{access_width, fc, op, read_block_type, read_memarg};

type VResult<T> = Result<T, MalformedModule>;

fn entry_err(id: SectionId, index: usize, reason: impl Into<String>) -> MalformedModule {
    MalformedModule::at_entry(Origin::Section(id), index as u32, reason)
}

/// Validate `m` and fill in the control map of every code body.
pub fn validate_module(m: &mut Module) -> VResult<()> {
    check_declarations(m)?;

    let mut maps = Vec::with_capacity(m.codes.len());
    for (i, code) in m.codes.iter().enumerate() {
        let func = m.imported_funcs + i as u32;
        maps.push(BodyValidator::new(m, func, code).run()?);
    }
    for (code, control) in m.codes.iter_mut().zip(maps) {
        code.control = control;
    }
    Ok(())
}

fn check_declarations(m: &Module) -> VResult<()> {
    let types = m.types.len();

    for (i, imp) in m.imports.iter().enumerate() {
        if let ImportDesc::Func(t) = imp.desc {
            if t as usize >= types {
                return Err(entry_err(SectionId::Import, i, format!("type index {t} out of range")));
            }
        }
    }
    for (i, &t) in m.functions.iter().enumerate() {
        if t as usize >= types {
            return Err(entry_err(SectionId::Function, i, format!("type index {t} out of range")));
        }
    }

    if m.total_tables() > 1 {
        return Err(entry_err(SectionId::Table, 1, "at most one table is supported"));
    }
    if m.total_memories() > 1 {
        return Err(entry_err(SectionId::Memory, 1, "at most one memory is supported"));
    }

    for (i, g) in m.globals.iter().enumerate() {
        let own = m.imported_globals + i as u32;
        let ty = const_expr_type(m, g.init, own)
            .map_err(|reason| entry_err(SectionId::Global, i, reason))?;
        if ty != g.ty.val_type {
            return Err(entry_err(
                SectionId::Global,
                i,
                format!("initializer has type {ty}, global is {}", g.ty.val_type),
            ));
        }
    }

    let mut names = HashSet::new();
    for (i, ex) in m.exports.iter().enumerate() {
        if !names.insert(ex.name.as_str()) {
            return Err(entry_err(SectionId::Export, i, format!("duplicate export name {:?}", ex.name)));
        }
        let (idx, bound, kind) = match ex.desc {
            ExportDesc::Func(f) => (f, m.total_funcs(), "function"),
            ExportDesc::Table(t) => (t, m.total_tables(), "table"),
            ExportDesc::Memory(mem) => (mem, m.total_memories(), "memory"),
            ExportDesc::Global(g) => (g, m.total_globals(), "global"),
        };
        if idx >= bound {
            return Err(entry_err(SectionId::Export, i, format!("{kind} index {idx} out of range")));
        }
    }

    if let Some(start) = m.start {
        let ty = m
            .func_type(start)
            .ok_or_else(|| entry_err(SectionId::Start, 0, format!("function index {start} out of range")))?;
        if !ty.params.is_empty() || !ty.results.is_empty() {
            return Err(entry_err(SectionId::Start, 0, format!("start function must be [] -> [], found {ty}")));
        }
    }

    for (i, seg) in m.elements.iter().enumerate() {
        if seg.table >= m.total_tables() {
            return Err(entry_err(SectionId::Element, i, format!("table index {} out of range", seg.table)));
        }
        check_offset_expr(m, seg.offset).map_err(|r| entry_err(SectionId::Element, i, r))?;
        if let Some(f) = seg.init.iter().find(|&&f| f >= m.total_funcs()) {
            return Err(entry_err(SectionId::Element, i, format!("function index {f} out of range")));
        }
    }

    for (i, seg) in m.data.iter().enumerate() {
        if seg.memory >= m.total_memories() {
            return Err(entry_err(SectionId::Data, i, format!("memory index {} out of range", seg.memory)));
        }
        check_offset_expr(m, seg.offset).map_err(|r| entry_err(SectionId::Data, i, r))?;
    }

    Ok(())
}

/// Type of a constant expression evaluated while initializing global `limit`
/// (only globals before it may be read).
fn const_expr_type(m: &Module, expr: ConstExpr, limit: GlobalIdx) -> Result<ValType, String> {
    Ok(match expr {
        ConstExpr::I32(_) => ValType::I32,
        ConstExpr::I64(_) => ValType::I64,
        ConstExpr::F32(_) => ValType::F32,
        ConstExpr::F64(_) => ValType::F64,
        ConstExpr::GlobalGet(g) => {
            if g >= limit {
                return Err(format!("global.get {g} refers to a global that is not yet initialized"));
            }
            match m.global_type(g) {
                Some(gt) if !gt.mutable => gt.val_type,
                Some(_) => return Err(format!("global.get {g} refers to a mutable global")),
                None => return Err(format!("global index {g} out of range")),
            }
        }
    })
}

fn check_offset_expr(m: &Module, expr: ConstExpr) -> Result<(), String> {
    match const_expr_type(m, expr, m.total_globals())? {
        ValType::I32 => Ok(()),
        other => Err(format!("segment offset must be i32, found {other}")),
    }
}

struct OpenBlock {
    pos: usize,
    is_if: bool,
    else_pos: Option<usize>,
    params: u32,
    results: u32,
}

/// Single pass over one function body.
struct BodyValidator<'a> {
    m: &'a Module,
    func: FuncIdx,
    code: &'a CodeBody,
    locals: u64,
    open: Vec<OpenBlock>,
    control: ControlMap,
}

impl<'a> BodyValidator<'a> {
    fn new(m: &'a Module, func: FuncIdx, code: &'a CodeBody) -> Self {
        let params = m.func_type(func).map(|t| t.params.len() as u64).unwrap_or(0);
        Self {
            m,
            func,
            code,
            locals: params + code.local_count(),
            open: Vec::new(),
            control: ControlMap::new(),
        }
    }

    fn err(&self, pos: usize, reason: impl Into<String>) -> MalformedModule {
        MalformedModule {
            origin: Origin::Section(SectionId::Code),
            offset: self.code.offset + pos,
            index: Some(self.func),
            reason: reason.into(),
        }
    }

    fn read_err(&self, e: BinaryReadError) -> MalformedModule {
        self.err(e.offset(), e.reason())
    }

    fn run(mut self) -> VResult<ControlMap> {
        let code = self.code;
        let body = &code.body;
        let mut cur = Cursor::new(body);
        // Depth 0 is the function body itself; it has no entry in the map.
        self.open.push(OpenBlock { pos: usize::MAX, is_if: false, else_pos: None, params: 0, results: 0 });

        while !cur.is_eof() {
            let pos = cur.offset();
            let opcode = cur.read_u8().map_err(|e| self.read_err(e))?;
            self.instruction(opcode, pos, &mut cur)?;
            if self.open.is_empty() {
                if !cur.is_eof() {
                    return Err(self.err(cur.offset(), "instructions after the final end"));
                }
                return Ok(self.control);
            }
        }
        Err(self.err(body.len(), "function body is missing its final end"))
    }

    fn need_memory(&self, pos: usize) -> VResult<()> {
        if self.m.total_memories() == 0 {
            return Err(self.err(pos, "memory instruction without a memory"));
        }
        Ok(())
    }

    fn check_depth(&self, pos: usize, depth: u32) -> VResult<()> {
        if depth as usize >= self.open.len() {
            return Err(self.err(pos, format!("branch depth {depth} out of range")));
        }
        Ok(())
    }

    fn reserved_zero(&self, cur: &mut Cursor) -> VResult<()> {
        let at = cur.offset();
        if cur.read_u8().map_err(|e| self.read_err(e))? != 0 {
            return Err(self.err(at, "reserved byte must be zero"));
        }
        Ok(())
    }

    fn instruction(&mut self, opcode: u8, pos: usize, cur: &mut Cursor) -> VResult<()> {
        macro_rules! imm {
            ($e:expr) => {
                $e.map_err(|e| self.read_err(e))?
            };
        }

        match opcode {
            op::UNREACHABLE | op::NOP | op::RETURN | op::DROP | op::SELECT => {}
            op::BLOCK | op::LOOP | op::IF => {
                let bt = imm!(read_block_type(cur));
                let (params, results) = self
                    .m
                    .block_arity(bt)
                    .ok_or_else(|| self.err(pos, "block type index out of range"))?;
                self.open.push(OpenBlock { pos, is_if: opcode == op::IF, else_pos: None, params, results });
            }
            op::ELSE => match self.open.last_mut() {
                Some(top) if top.is_if && top.else_pos.is_none() => top.else_pos = Some(pos),
                _ => return Err(self.err(pos, "else without a matching if")),
            },
            op::END => {
                if let Some(block) = self.open.pop() {
                    if block.pos != usize::MAX {
                        self.control.insert(
                            block.pos,
                            BlockInfo {
                                else_pos: block.else_pos,
                                end_pos: pos,
                                params: block.params,
                                results: block.results,
                            },
                        );
                    }
                }
            }
            op::BR | op::BR_IF => {
                let depth = imm!(leb128::read_uleb_u32(cur));
                self.check_depth(pos, depth)?;
            }
            op::BR_TABLE => {
                let count = imm!(read_len(cur));
                for _ in 0..=count {
                    let depth = imm!(leb128::read_uleb_u32(cur));
                    self.check_depth(pos, depth)?;
                }
            }
            op::CALL => {
                let f = imm!(leb128::read_uleb_u32(cur));
                if f >= self.m.total_funcs() {
                    return Err(self.err(pos, format!("call to function {f} out of range")));
                }
            }
            op::CALL_INDIRECT => {
                let t = imm!(leb128::read_uleb_u32(cur));
                if t as usize >= self.m.types.len() {
                    return Err(self.err(pos, format!("call_indirect type index {t} out of range")));
                }
                self.reserved_zero(cur)?;
                if self.m.total_tables() == 0 {
                    return Err(self.err(pos, "call_indirect without a table"));
                }
            }
            op::SELECT_TYPED => {
                let n = imm!(read_len(cur));
                if n != 1 {
                    return Err(self.err(pos, "typed select must name exactly one type"));
                }
                let at = cur.offset();
                let b = imm!(cur.read_u8());
                if ValType::from_byte(b).is_none() {
                    return Err(self.err(at, "invalid value type"));
                }
            }
            op::LOCAL_GET | op::LOCAL_SET | op::LOCAL_TEE => {
                let l = imm!(leb128::read_uleb_u32(cur));
                if u64::from(l) >= self.locals {
                    return Err(self.err(pos, format!("local index {l} out of range")));
                }
            }
            op::GLOBAL_GET | op::GLOBAL_SET => {
                let g = imm!(leb128::read_uleb_u32(cur));
                let gt = self
                    .m
                    .global_type(g)
                    .ok_or_else(|| self.err(pos, format!("global index {g} out of range")))?;
                if opcode == op::GLOBAL_SET && !gt.mutable {
                    return Err(self.err(pos, format!("global.set on immutable global {g}")));
                }
            }
            op::I32_LOAD..=op::I64_STORE32 => {
                let arg = imm!(read_memarg(cur));
                self.need_memory(pos)?;
                let width = access_width(opcode).unwrap_or(1);
                if arg.align >= 32 || (1u32 << arg.align) > width {
                    return Err(self.err(pos, "alignment larger than natural"));
                }
            }
            op::MEMORY_SIZE | op::MEMORY_GROW => {
                self.reserved_zero(cur)?;
                self.need_memory(pos)?;
            }
            op::I32_CONST => {
                imm!(leb128::read_sleb_i32(cur));
            }
            op::I64_CONST => {
                imm!(leb128::read_sleb_i64(cur));
            }
            op::F32_CONST => {
                imm!(cur.skip(4));
            }
            op::F64_CONST => {
                imm!(cur.skip(8));
            }
            op::I32_EQZ..=op::I64_EXTEND32_S => {}
            op::PREFIX_FC => {
                let sub = imm!(leb128::read_uleb_u32(cur));
                match sub {
                    fc::I32_TRUNC_SAT_F32_S..=fc::I64_TRUNC_SAT_F64_U => {}
                    fc::MEMORY_COPY => {
                        self.reserved_zero(cur)?;
                        self.reserved_zero(cur)?;
                        self.need_memory(pos)?;
                    }
                    fc::MEMORY_FILL => {
                        self.reserved_zero(cur)?;
                        self.need_memory(pos)?;
                    }
                    _ => return Err(self.err(pos, format!("unsupported instruction 0xfc {sub}"))),
                }
            }
            _ => return Err(self.err(pos, format!("unknown opcode {opcode:#04x}"))),
        }
        Ok(())
    }
}
