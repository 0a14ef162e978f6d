//! Resumable interpreter over validated function bodies.
//!
//! Structured control flow is driven by the per-function [`ControlMap`]
//! computed at load time, so `block`/`if` never scan for their `else`/`end`.
//! All execution state lives in a [`Machine`]; when a host call suspends, the
//! machine is simply left as is and [`Executor::resume`] pushes the host's
//! results and carries on from the instruction after the call.
//!
//! [`ControlMap`]: crate::model::ControlMap

use tracing::trace;

use crate::binary::{cursor::Cursor, leb128};
use crate::engine::CancelHandle;
use crate::error::{HostFailure, Trap};
use crate::host::{HostAction, HostContext, HostState, HostTable, ResumeWith, SuspendReason};
use crate::model::{FuncIdx, Module, Value};
use crate::runtime::{GlobalSlot, Memory, Table};
use crate::vm::frames::{BlockKind, CallFrame, Label};
use crate::vm::instructions::{fc, op, read_block_type, read_memarg, MemArg};
use crate::vm::stack::ValueStack;
use crate::vm::Fault;

/// How a run of the interpreter ended, short of a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The invoked function returned.
    Returned(Vec<Value>),
    /// A host call suspended; the machine holds the continuation.
    Suspended { reason: SuspendReason, resume: ResumeWith },
    /// A host call requested process exit.
    Exited(i32),
}

/// Call stack and operand stack of one instance.
#[derive(Debug)]
pub struct Machine {
    frames: Vec<CallFrame>,
    stack: ValueStack,
}

impl Machine {
    pub fn new(max_value_stack: usize) -> Self {
        Self { frames: Vec::new(), stack: ValueStack::new(max_value_stack) }
    }

    /// No function is executing.
    pub fn is_idle(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.stack.clear();
    }
}

/// Borrowed view of an instance for the duration of one interpreter run.
pub struct Executor<'a> {
    pub module: &'a Module,
    pub memory: Option<&'a mut Memory>,
    pub table: Option<&'a Table>,
    pub globals: &'a mut [GlobalSlot],
    pub host: &'a HostTable,
    pub state: &'a mut HostState,
    pub cancel: &'a CancelHandle,
    pub max_call_depth: usize,
}

enum Flow {
    Next,
    Call(FuncIdx),
    Return,
}

const NO_MEMORY: Trap = Trap::InvalidCode("no linear memory");
const BAD_LOCAL: Trap = Trap::InvalidCode("local index out of range");
const BAD_GLOBAL: Trap = Trap::InvalidCode("global index out of range");
const BAD_FUNC: Trap = Trap::InvalidCode("function index out of range");
const MISSING_BLOCK: Trap = Trap::InvalidCode("missing control entry");

impl<'a> Executor<'a> {
    /// Call `func` with `args` on an idle machine and run until it returns,
    /// suspends or exits.
    pub fn invoke(&mut self, m: &mut Machine, func: FuncIdx, args: &[Value]) -> Result<ExecOutcome, Fault> {
        for &a in args {
            m.stack.push(a)?;
        }
        trace!(func, args = args.len(), "invoke");
        if let Some(out) = self.call(m, func)? {
            return Ok(out);
        }
        self.run(m)
    }

    /// Continue a suspended machine, handing `values` to the suspended call.
    pub fn resume(&mut self, m: &mut Machine, values: Vec<Value>) -> Result<ExecOutcome, Fault> {
        check_cancel(self.cancel)?;
        for v in values {
            m.stack.push(v)?;
        }
        self.run(m)
    }

    fn memory(&self) -> Result<&Memory, Trap> {
        self.memory.as_deref().ok_or(NO_MEMORY)
    }

    fn memory_mut(&mut self) -> Result<&mut Memory, Trap> {
        self.memory.as_deref_mut().ok_or(NO_MEMORY)
    }

    fn load<const N: usize>(&self, stack: &mut ValueStack, cur: &mut Cursor<'_>) -> Result<[u8; N], Fault> {
        let arg = read_memarg(cur)?;
        let base = stack.pop_i32()?;
        Ok(self.memory()?.load::<N>(effective(arg, base))?)
    }

    fn store(&mut self, arg: MemArg, base: i32, bytes: &[u8]) -> Result<(), Fault> {
        Ok(self.memory_mut()?.write(effective(arg, base), bytes)?)
    }

    /// Enter `func`. Host calls complete here; `Some` means the host
    /// suspended or exited.
    fn call(&mut self, m: &mut Machine, func: FuncIdx) -> Result<Option<ExecOutcome>, Fault> {
        check_cancel(self.cancel)?;
        let module = self.module;
        let host_table = self.host;

        if func < module.imported_funcs {
            let host = host_table.get(func as usize).ok_or(BAD_FUNC)?;
            let args = m.stack.pop_n(host.ty.params.len())?;
            trace!(import = %host.qualified_name(), "host call");
            let mut ctx = HostContext::new(self.memory.as_deref_mut(), &mut *self.state);
            return match host.call(&mut ctx, &args)? {
                HostAction::Return(values) => {
                    let types_match = values.len() == host.ty.results.len()
                        && values.iter().zip(&host.ty.results).all(|(v, t)| v.ty() == *t);
                    if !types_match {
                        return Err(HostFailure::Function {
                            name: host.qualified_name(),
                            message: "returned values do not match its signature".into(),
                        }
                        .into());
                    }
                    for v in values {
                        m.stack.push(v)?;
                    }
                    Ok(None)
                }
                HostAction::Suspend { reason, resume } => Ok(Some(ExecOutcome::Suspended { reason, resume })),
                HostAction::Exit(code) => Ok(Some(ExecOutcome::Exited(code))),
            };
        }

        let def = (func - module.imported_funcs) as usize;
        let code = module.codes.get(def).ok_or(BAD_FUNC)?;
        let ty = module.func_type(func).ok_or(BAD_FUNC)?;
        if m.frames.len() >= self.max_call_depth {
            return Err(Trap::StackExhausted.into());
        }
        let mut locals = m.stack.pop_n(ty.params.len())?;
        if locals.iter().zip(&ty.params).any(|(v, t)| v.ty() != *t) {
            return Err(Trap::InvalidCode("argument type mismatch").into());
        }
        for decl in &code.locals {
            locals.extend(std::iter::repeat(decl.val_type.zero()).take(decl.count as usize));
        }
        m.frames.push(CallFrame::new(def, locals, m.stack.len(), ty.results.len(), code.body.len()));
        Ok(None)
    }

    fn run(&mut self, m: &mut Machine) -> Result<ExecOutcome, Fault> {
        let module = self.module;
        loop {
            let Some(frame) = m.frames.last_mut() else {
                let n = m.stack.len();
                return Ok(ExecOutcome::Returned(m.stack.pop_n(n)?));
            };
            let code = module.codes.get(frame.code).ok_or(BAD_FUNC)?;
            let pos = frame.pc;
            let mut cur = Cursor::at(&code.body, pos);
            let stack = &mut m.stack;
            let opcode = cur.read_u8()?;

            let flow = match opcode {
                op::UNREACHABLE => return Err(Trap::Unreachable.into()),
                op::NOP => Flow::Next,

                op::BLOCK | op::LOOP | op::IF => {
                    let info = *code.control.get(&pos).ok_or(MISSING_BLOCK)?;
                    read_block_type(&mut cur)?;
                    let cond = if opcode == op::IF { stack.pop_i32()? != 0 } else { true };
                    let (params, results) = (info.params as usize, info.results as usize);
                    let height = stack.len().checked_sub(params).ok_or(Trap::InvalidCode("value stack underflow"))?;
                    let label = match opcode {
                        op::LOOP => Label {
                            kind: BlockKind::Loop,
                            height,
                            branch_arity: params,
                            end_arity: results,
                            continuation: cur.offset(),
                        },
                        _ => Label {
                            kind: if opcode == op::IF { BlockKind::If } else { BlockKind::Block },
                            height,
                            branch_arity: results,
                            end_arity: results,
                            continuation: info.end_pos + 1,
                        },
                    };
                    frame.labels.push(label);
                    if !cond {
                        // Run the else arm, or go straight to `end` which pops the label.
                        cur.seek(info.else_pos.map_or(info.end_pos, |e| e + 1))?;
                    }
                    Flow::Next
                }
                // Falling into `else` finishes the then-arm.
                op::ELSE => take_branch(frame, stack, &mut cur, self.cancel, 0)?,
                op::END => {
                    if frame.labels.len() == 1 {
                        Flow::Return
                    } else {
                        let label = frame.labels.pop().ok_or(MISSING_BLOCK)?;
                        stack.unwind(label.height, label.end_arity)?;
                        Flow::Next
                    }
                }
                op::BR => {
                    let depth = leb128::read_uleb_u32(&mut cur)?;
                    take_branch(frame, stack, &mut cur, self.cancel, depth)?
                }
                op::BR_IF => {
                    let depth = leb128::read_uleb_u32(&mut cur)?;
                    if stack.pop_i32()? != 0 {
                        take_branch(frame, stack, &mut cur, self.cancel, depth)?
                    } else {
                        Flow::Next
                    }
                }
                op::BR_TABLE => {
                    let n = leb128::read_uleb_u32(&mut cur)?;
                    let i = stack.pop_i32()? as u32;
                    let mut chosen = None;
                    for k in 0..n {
                        let d = leb128::read_uleb_u32(&mut cur)?;
                        if k == i {
                            chosen = Some(d);
                        }
                    }
                    let default = leb128::read_uleb_u32(&mut cur)?;
                    take_branch(frame, stack, &mut cur, self.cancel, chosen.unwrap_or(default))?
                }
                op::RETURN => Flow::Return,
                op::CALL => Flow::Call(leb128::read_uleb_u32(&mut cur)?),
                op::CALL_INDIRECT => {
                    let type_idx = leb128::read_uleb_u32(&mut cur)?;
                    cur.read_u8()?;
                    let elem = stack.pop_i32()? as u32;
                    let table = self.table.ok_or(Trap::UndefinedElement)?;
                    let func = table.get(elem)?;
                    let expected = module.types.get(type_idx as usize);
                    if expected.is_none() || module.func_type(func) != expected {
                        return Err(Trap::IndirectCallTypeMismatch.into());
                    }
                    Flow::Call(func)
                }

                op::DROP => {
                    stack.pop()?;
                    Flow::Next
                }
                op::SELECT | op::SELECT_TYPED => {
                    if opcode == op::SELECT_TYPED {
                        let n = leb128::read_uleb_u32(&mut cur)?;
                        cur.skip(n as usize)?;
                    }
                    let c = stack.pop_i32()?;
                    let b = stack.pop()?;
                    let a = stack.pop()?;
                    if a.ty() != b.ty() {
                        return Err(Trap::InvalidCode("select operands differ in type").into());
                    }
                    stack.push(if c != 0 { a } else { b })?;
                    Flow::Next
                }

                op::LOCAL_GET => {
                    let idx = leb128::read_uleb_u32(&mut cur)? as usize;
                    let v = *frame.locals.get(idx).ok_or(BAD_LOCAL)?;
                    stack.push(v)?;
                    Flow::Next
                }
                op::LOCAL_SET | op::LOCAL_TEE => {
                    let idx = leb128::read_uleb_u32(&mut cur)? as usize;
                    let v = stack.pop()?;
                    let slot = frame.locals.get_mut(idx).ok_or(BAD_LOCAL)?;
                    if slot.ty() != v.ty() {
                        return Err(Trap::InvalidCode("local type mismatch").into());
                    }
                    *slot = v;
                    if opcode == op::LOCAL_TEE {
                        stack.push(v)?;
                    }
                    Flow::Next
                }
                op::GLOBAL_GET => {
                    let idx = leb128::read_uleb_u32(&mut cur)? as usize;
                    let g = self.globals.get(idx).ok_or(BAD_GLOBAL)?;
                    stack.push(g.get())?;
                    Flow::Next
                }
                op::GLOBAL_SET => {
                    let idx = leb128::read_uleb_u32(&mut cur)? as usize;
                    let v = stack.pop()?;
                    self.globals.get_mut(idx).ok_or(BAD_GLOBAL)?.set(v)?;
                    Flow::Next
                }

                /* ---------- memory ---------- */
                op::I32_LOAD => {
                    let b = self.load::<4>(stack, &mut cur)?;
                    stack.push_i32(i32::from_le_bytes(b))?;
                    Flow::Next
                }
                op::I64_LOAD => {
                    let b = self.load::<8>(stack, &mut cur)?;
                    stack.push_i64(i64::from_le_bytes(b))?;
                    Flow::Next
                }
                op::F32_LOAD => {
                    let b = self.load::<4>(stack, &mut cur)?;
                    stack.push(Value::F32(u32::from_le_bytes(b)))?;
                    Flow::Next
                }
                op::F64_LOAD => {
                    let b = self.load::<8>(stack, &mut cur)?;
                    stack.push(Value::F64(u64::from_le_bytes(b)))?;
                    Flow::Next
                }
                op::I32_LOAD8_S => {
                    let b = self.load::<1>(stack, &mut cur)?;
                    stack.push_i32(i32::from(i8::from_le_bytes(b)))?;
                    Flow::Next
                }
                op::I32_LOAD8_U => {
                    let b = self.load::<1>(stack, &mut cur)?;
                    stack.push_i32(i32::from(b[0]))?;
                    Flow::Next
                }
                op::I32_LOAD16_S => {
                    let b = self.load::<2>(stack, &mut cur)?;
                    stack.push_i32(i32::from(i16::from_le_bytes(b)))?;
                    Flow::Next
                }
                op::I32_LOAD16_U => {
                    let b = self.load::<2>(stack, &mut cur)?;
                    stack.push_i32(i32::from(u16::from_le_bytes(b)))?;
                    Flow::Next
                }
                op::I64_LOAD8_S => {
                    let b = self.load::<1>(stack, &mut cur)?;
                    stack.push_i64(i64::from(i8::from_le_bytes(b)))?;
                    Flow::Next
                }
                op::I64_LOAD8_U => {
                    let b = self.load::<1>(stack, &mut cur)?;
                    stack.push_i64(i64::from(b[0]))?;
                    Flow::Next
                }
                op::I64_LOAD16_S => {
                    let b = self.load::<2>(stack, &mut cur)?;
                    stack.push_i64(i64::from(i16::from_le_bytes(b)))?;
                    Flow::Next
                }
                op::I64_LOAD16_U => {
                    let b = self.load::<2>(stack, &mut cur)?;
                    stack.push_i64(i64::from(u16::from_le_bytes(b)))?;
                    Flow::Next
                }
                op::I64_LOAD32_S => {
                    let b = self.load::<4>(stack, &mut cur)?;
                    stack.push_i64(i64::from(i32::from_le_bytes(b)))?;
                    Flow::Next
                }
                op::I64_LOAD32_U => {
                    let b = self.load::<4>(stack, &mut cur)?;
                    stack.push_i64(i64::from(u32::from_le_bytes(b)))?;
                    Flow::Next
                }
                op::I32_STORE | op::I32_STORE8 | op::I32_STORE16 => {
                    let arg = read_memarg(&mut cur)?;
                    let v = stack.pop_i32()?.to_le_bytes();
                    let base = stack.pop_i32()?;
                    let width = match opcode {
                        op::I32_STORE8 => 1,
                        op::I32_STORE16 => 2,
                        _ => 4,
                    };
                    self.store(arg, base, &v[..width])?;
                    Flow::Next
                }
                op::I64_STORE | op::I64_STORE8 | op::I64_STORE16 | op::I64_STORE32 => {
                    let arg = read_memarg(&mut cur)?;
                    let v = stack.pop_i64()?.to_le_bytes();
                    let base = stack.pop_i32()?;
                    let width = match opcode {
                        op::I64_STORE8 => 1,
                        op::I64_STORE16 => 2,
                        op::I64_STORE32 => 4,
                        _ => 8,
                    };
                    self.store(arg, base, &v[..width])?;
                    Flow::Next
                }
                op::F32_STORE => {
                    let arg = read_memarg(&mut cur)?;
                    let v = stack.pop_f32_bits()?;
                    let base = stack.pop_i32()?;
                    self.store(arg, base, &v.to_le_bytes())?;
                    Flow::Next
                }
                op::F64_STORE => {
                    let arg = read_memarg(&mut cur)?;
                    let v = stack.pop_f64_bits()?;
                    let base = stack.pop_i32()?;
                    self.store(arg, base, &v.to_le_bytes())?;
                    Flow::Next
                }
                op::MEMORY_SIZE => {
                    cur.read_u8()?;
                    stack.push_i32(self.memory()?.size_pages() as i32)?;
                    Flow::Next
                }
                op::MEMORY_GROW => {
                    cur.read_u8()?;
                    let delta = stack.pop_i32()? as u32;
                    // Failure is reported to the module, never trapped.
                    let r = self.memory_mut()?.grow(delta).map_or(-1, |old| old as i32);
                    stack.push_i32(r)?;
                    Flow::Next
                }

                /* ---------- constants ---------- */
                op::I32_CONST => {
                    stack.push_i32(leb128::read_sleb_i32(&mut cur)?)?;
                    Flow::Next
                }
                op::I64_CONST => {
                    stack.push_i64(leb128::read_sleb_i64(&mut cur)?)?;
                    Flow::Next
                }
                op::F32_CONST => {
                    stack.push(Value::F32(cur.read_u32_le()?))?;
                    Flow::Next
                }
                op::F64_CONST => {
                    stack.push(Value::F64(cur.read_u64_le()?))?;
                    Flow::Next
                }

                op::PREFIX_FC => {
                    let sub = leb128::read_uleb_u32(&mut cur)?;
                    self.exec_fc(stack, &mut cur, sub)?;
                    Flow::Next
                }

                _ => {
                    exec_numeric(stack, opcode).map_err(|t| match t {
                        Trap::InvalidCode(_) if !is_numeric(opcode) => {
                            Trap::InvalidOpcode { opcode, offset: code.offset + pos }
                        }
                        other => other,
                    })?;
                    Flow::Next
                }
            };

            // Branches and calls may have moved the cursor; record where to continue.
            frame.pc = cur.offset();

            match flow {
                Flow::Next => {}
                Flow::Call(func) => {
                    if let Some(out) = self.call(m, func)? {
                        return Ok(out);
                    }
                }
                Flow::Return => {
                    let frame = m.frames.pop().ok_or(BAD_FUNC)?;
                    let function = frame.labels[0];
                    m.stack.unwind(function.height, function.end_arity)?;
                }
            }
        }
    }

    fn exec_fc(&mut self, stack: &mut ValueStack, cur: &mut Cursor<'_>, sub: u32) -> Result<(), Fault> {
        match sub {
            fc::I32_TRUNC_SAT_F32_S => unop_f32_to_i32(stack, |x| x as i32)?,
            fc::I32_TRUNC_SAT_F32_U => unop_f32_to_i32(stack, |x| x as u32 as i32)?,
            fc::I32_TRUNC_SAT_F64_S => {
                let x = stack.pop_f64()?;
                stack.push_i32(x as i32)?;
            }
            fc::I32_TRUNC_SAT_F64_U => {
                let x = stack.pop_f64()?;
                stack.push_i32(x as u32 as i32)?;
            }
            fc::I64_TRUNC_SAT_F32_S => {
                let x = stack.pop_f32()?;
                stack.push_i64(x as i64)?;
            }
            fc::I64_TRUNC_SAT_F32_U => {
                let x = stack.pop_f32()?;
                stack.push_i64(x as u64 as i64)?;
            }
            fc::I64_TRUNC_SAT_F64_S => {
                let x = stack.pop_f64()?;
                stack.push_i64(x as i64)?;
            }
            fc::I64_TRUNC_SAT_F64_U => {
                let x = stack.pop_f64()?;
                stack.push_i64(x as u64 as i64)?;
            }
            fc::MEMORY_COPY => {
                cur.read_u8()?;
                cur.read_u8()?;
                let n = u64::from(stack.pop_i32()? as u32);
                let src = u64::from(stack.pop_i32()? as u32);
                let dst = u64::from(stack.pop_i32()? as u32);
                self.memory_mut()?.copy_within(src, dst, n)?;
            }
            fc::MEMORY_FILL => {
                cur.read_u8()?;
                let n = u64::from(stack.pop_i32()? as u32);
                let value = stack.pop_i32()? as u8;
                let dst = u64::from(stack.pop_i32()? as u32);
                self.memory_mut()?.fill(dst, value, n)?;
            }
            _ => return Err(Trap::InvalidCode("unsupported 0xfc instruction").into()),
        }
        Ok(())
    }
}

fn check_cancel(cancel: &CancelHandle) -> Result<(), Fault> {
    if cancel.is_cancelled() {
        return Err(HostFailure::Cancelled.into());
    }
    Ok(())
}

#[inline]
fn effective(arg: MemArg, base: i32) -> u64 {
    u64::from(base as u32) + u64::from(arg.offset)
}

/// Branch to the label `depth` levels out. Loop back-edges are cancellation points.
fn take_branch(
    frame: &mut CallFrame,
    stack: &mut ValueStack,
    cur: &mut Cursor<'_>,
    cancel: &CancelHandle,
    depth: u32,
) -> Result<Flow, Fault> {
    let idx = frame
        .labels
        .len()
        .checked_sub(1 + depth as usize)
        .ok_or(Trap::InvalidCode("branch depth out of range"))?;
    let label = frame.labels[idx];
    match label.kind {
        BlockKind::Function => return Ok(Flow::Return),
        BlockKind::Loop => {
            check_cancel(cancel)?;
            frame.labels.truncate(idx + 1);
        }
        BlockKind::Block | BlockKind::If => frame.labels.truncate(idx),
    }
    stack.unwind(label.height, label.branch_arity)?;
    cur.seek(label.continuation)?;
    Ok(Flow::Next)
}

/* ---------- numeric helpers ---------- */

fn binop_i32<F>(stack: &mut ValueStack, f: F) -> Result<(), Trap>
where
    F: Fn(i32, i32) -> Result<i32, Trap>,
{
    let b = stack.pop_i32()?;
    let a = stack.pop_i32()?;
    stack.push_i32(f(a, b)?)
}

fn binop_i64<F>(stack: &mut ValueStack, f: F) -> Result<(), Trap>
where
    F: Fn(i64, i64) -> Result<i64, Trap>,
{
    let b = stack.pop_i64()?;
    let a = stack.pop_i64()?;
    stack.push_i64(f(a, b)?)
}

fn binop_f32<F: Fn(f32, f32) -> f32>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let b = stack.pop_f32()?;
    let a = stack.pop_f32()?;
    stack.push_f32(f(a, b))
}

fn binop_f64<F: Fn(f64, f64) -> f64>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let b = stack.pop_f64()?;
    let a = stack.pop_f64()?;
    stack.push_f64(f(a, b))
}

fn cmpop_i32<F: Fn(i32, i32) -> bool>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let b = stack.pop_i32()?;
    let a = stack.pop_i32()?;
    stack.push_bool(f(a, b))
}

fn cmpop_u32<F: Fn(u32, u32) -> bool>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    cmpop_i32(stack, |a, b| f(a as u32, b as u32))
}

fn cmpop_i64<F: Fn(i64, i64) -> bool>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let b = stack.pop_i64()?;
    let a = stack.pop_i64()?;
    stack.push_bool(f(a, b))
}

fn cmpop_u64<F: Fn(u64, u64) -> bool>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    cmpop_i64(stack, |a, b| f(a as u64, b as u64))
}

fn cmpop_f32<F: Fn(f32, f32) -> bool>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let b = stack.pop_f32()?;
    let a = stack.pop_f32()?;
    stack.push_bool(f(a, b))
}

fn cmpop_f64<F: Fn(f64, f64) -> bool>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let b = stack.pop_f64()?;
    let a = stack.pop_f64()?;
    stack.push_bool(f(a, b))
}

fn unop_i32<F: Fn(i32) -> i32>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let a = stack.pop_i32()?;
    stack.push_i32(f(a))
}

fn unop_i64<F: Fn(i64) -> i64>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let a = stack.pop_i64()?;
    stack.push_i64(f(a))
}

fn unop_f32<F: Fn(f32) -> f32>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let a = stack.pop_f32()?;
    stack.push_f32(f(a))
}

fn unop_f64<F: Fn(f64) -> f64>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let a = stack.pop_f64()?;
    stack.push_f64(f(a))
}

fn unop_f32_to_i32<F: Fn(f32) -> i32>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let a = stack.pop_f32()?;
    stack.push_i32(f(a))
}

/// Sign-bit operations work on raw bits so NaN payloads pass through.
fn bitop_f32<F: Fn(u32) -> u32>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let a = stack.pop_f32_bits()?;
    stack.push(Value::F32(f(a)))
}

fn bitop_f64<F: Fn(u64) -> u64>(stack: &mut ValueStack, f: F) -> Result<(), Trap> {
    let a = stack.pop_f64_bits()?;
    stack.push(Value::F64(f(a)))
}

const F32_SIGN: u32 = 0x8000_0000;
const F64_SIGN: u64 = 0x8000_0000_0000_0000;

fn fmin<T: Float>(a: T, b: T) -> T {
    if a.is_nan() || b.is_nan() {
        T::NAN
    } else if a == b {
        // Only differs for zeros: -0 wins.
        if a.is_sign_negative() { a } else { b }
    } else if a < b {
        a
    } else {
        b
    }
}

fn fmax<T: Float>(a: T, b: T) -> T {
    if a.is_nan() || b.is_nan() {
        T::NAN
    } else if a == b {
        if a.is_sign_positive() { a } else { b }
    } else if a > b {
        a
    } else {
        b
    }
}

trait Float: Copy + PartialOrd {
    const NAN: Self;
    fn is_nan(self) -> bool;
    fn is_sign_negative(self) -> bool;
    fn is_sign_positive(self) -> bool;
}

impl Float for f32 {
    const NAN: Self = f32::NAN;
    fn is_nan(self) -> bool {
        f32::is_nan(self)
    }
    fn is_sign_negative(self) -> bool {
        f32::is_sign_negative(self)
    }
    fn is_sign_positive(self) -> bool {
        f32::is_sign_positive(self)
    }
}

impl Float for f64 {
    const NAN: Self = f64::NAN;
    fn is_nan(self) -> bool {
        f64::is_nan(self)
    }
    fn is_sign_negative(self) -> bool {
        f64::is_sign_negative(self)
    }
    fn is_sign_positive(self) -> bool {
        f64::is_sign_positive(self)
    }
}

/// Truncate toward zero, trapping on NaN and on results outside the open
/// interval `(lo, hi)`.
fn trunc_checked(x: f64, lo: f64, hi: f64) -> Result<f64, Trap> {
    if x.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    let t = x.trunc();
    if t <= lo || t >= hi {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t)
}

fn trunc_i32_s(x: f64) -> Result<i32, Trap> {
    trunc_checked(x, -2_147_483_649.0, 2_147_483_648.0).map(|t| t as i32)
}

fn trunc_i32_u(x: f64) -> Result<i32, Trap> {
    trunc_checked(x, -1.0, 4_294_967_296.0).map(|t| t as u32 as i32)
}

fn trunc_i64_s(x: f64) -> Result<i64, Trap> {
    trunc_checked(x, -9_223_372_036_854_777_856.0, 9_223_372_036_854_775_808.0).map(|t| t as i64)
}

fn trunc_i64_u(x: f64) -> Result<i64, Trap> {
    trunc_checked(x, -1.0, 18_446_744_073_709_551_616.0).map(|t| t as u64 as i64)
}

fn i32_div_s(a: i32, b: i32) -> Result<i32, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    a.checked_div(b).ok_or(Trap::IntegerOverflow)
}

fn i64_div_s(a: i64, b: i64) -> Result<i64, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    a.checked_div(b).ok_or(Trap::IntegerOverflow)
}

fn nonzero<T: Default + PartialEq>(b: T) -> Result<T, Trap> {
    if b == T::default() {
        Err(Trap::IntegerDivideByZero)
    } else {
        Ok(b)
    }
}

fn is_numeric(opcode: u8) -> bool {
    (op::I32_EQZ..=op::I64_EXTEND32_S).contains(&opcode)
}

/// Stack-only instructions with no immediates (0x45..=0xC4).
fn exec_numeric(stack: &mut ValueStack, opcode: u8) -> Result<(), Trap> {
    match opcode {
        op::I32_EQZ => {
            let a = stack.pop_i32()?;
            stack.push_bool(a == 0)
        }
        op::I32_EQ => cmpop_i32(stack, |a, b| a == b),
        op::I32_NE => cmpop_i32(stack, |a, b| a != b),
        op::I32_LT_S => cmpop_i32(stack, |a, b| a < b),
        op::I32_LT_U => cmpop_u32(stack, |a, b| a < b),
        op::I32_GT_S => cmpop_i32(stack, |a, b| a > b),
        op::I32_GT_U => cmpop_u32(stack, |a, b| a > b),
        op::I32_LE_S => cmpop_i32(stack, |a, b| a <= b),
        op::I32_LE_U => cmpop_u32(stack, |a, b| a <= b),
        op::I32_GE_S => cmpop_i32(stack, |a, b| a >= b),
        op::I32_GE_U => cmpop_u32(stack, |a, b| a >= b),

        op::I64_EQZ => {
            let a = stack.pop_i64()?;
            stack.push_bool(a == 0)
        }
        op::I64_EQ => cmpop_i64(stack, |a, b| a == b),
        op::I64_NE => cmpop_i64(stack, |a, b| a != b),
        op::I64_LT_S => cmpop_i64(stack, |a, b| a < b),
        op::I64_LT_U => cmpop_u64(stack, |a, b| a < b),
        op::I64_GT_S => cmpop_i64(stack, |a, b| a > b),
        op::I64_GT_U => cmpop_u64(stack, |a, b| a > b),
        op::I64_LE_S => cmpop_i64(stack, |a, b| a <= b),
        op::I64_LE_U => cmpop_u64(stack, |a, b| a <= b),
        op::I64_GE_S => cmpop_i64(stack, |a, b| a >= b),
        op::I64_GE_U => cmpop_u64(stack, |a, b| a >= b),

        op::F32_EQ => cmpop_f32(stack, |a, b| a == b),
        op::F32_NE => cmpop_f32(stack, |a, b| a != b),
        op::F32_LT => cmpop_f32(stack, |a, b| a < b),
        op::F32_GT => cmpop_f32(stack, |a, b| a > b),
        op::F32_LE => cmpop_f32(stack, |a, b| a <= b),
        op::F32_GE => cmpop_f32(stack, |a, b| a >= b),

        op::F64_EQ => cmpop_f64(stack, |a, b| a == b),
        op::F64_NE => cmpop_f64(stack, |a, b| a != b),
        op::F64_LT => cmpop_f64(stack, |a, b| a < b),
        op::F64_GT => cmpop_f64(stack, |a, b| a > b),
        op::F64_LE => cmpop_f64(stack, |a, b| a <= b),
        op::F64_GE => cmpop_f64(stack, |a, b| a >= b),

        op::I32_CLZ => unop_i32(stack, |a| a.leading_zeros() as i32),
        op::I32_CTZ => unop_i32(stack, |a| a.trailing_zeros() as i32),
        op::I32_POPCNT => unop_i32(stack, |a| a.count_ones() as i32),
        op::I32_ADD => binop_i32(stack, |a, b| Ok(a.wrapping_add(b))),
        op::I32_SUB => binop_i32(stack, |a, b| Ok(a.wrapping_sub(b))),
        op::I32_MUL => binop_i32(stack, |a, b| Ok(a.wrapping_mul(b))),
        op::I32_DIV_S => binop_i32(stack, i32_div_s),
        op::I32_DIV_U => binop_i32(stack, |a, b| Ok((a as u32 / nonzero(b as u32)?) as i32)),
        op::I32_REM_S => binop_i32(stack, |a, b| Ok(a.wrapping_rem(nonzero(b)?))),
        op::I32_REM_U => binop_i32(stack, |a, b| Ok((a as u32 % nonzero(b as u32)?) as i32)),
        op::I32_AND => binop_i32(stack, |a, b| Ok(a & b)),
        op::I32_OR => binop_i32(stack, |a, b| Ok(a | b)),
        op::I32_XOR => binop_i32(stack, |a, b| Ok(a ^ b)),
        op::I32_SHL => binop_i32(stack, |a, b| Ok(a.wrapping_shl(b as u32))),
        op::I32_SHR_S => binop_i32(stack, |a, b| Ok(a.wrapping_shr(b as u32))),
        op::I32_SHR_U => binop_i32(stack, |a, b| Ok((a as u32).wrapping_shr(b as u32) as i32)),
        op::I32_ROTL => binop_i32(stack, |a, b| Ok(a.rotate_left(b as u32))),
        op::I32_ROTR => binop_i32(stack, |a, b| Ok(a.rotate_right(b as u32))),

        op::I64_CLZ => unop_i64(stack, |a| i64::from(a.leading_zeros())),
        op::I64_CTZ => unop_i64(stack, |a| i64::from(a.trailing_zeros())),
        op::I64_POPCNT => unop_i64(stack, |a| i64::from(a.count_ones())),
        op::I64_ADD => binop_i64(stack, |a, b| Ok(a.wrapping_add(b))),
        op::I64_SUB => binop_i64(stack, |a, b| Ok(a.wrapping_sub(b))),
        op::I64_MUL => binop_i64(stack, |a, b| Ok(a.wrapping_mul(b))),
        op::I64_DIV_S => binop_i64(stack, i64_div_s),
        op::I64_DIV_U => binop_i64(stack, |a, b| Ok((a as u64 / nonzero(b as u64)?) as i64)),
        op::I64_REM_S => binop_i64(stack, |a, b| Ok(a.wrapping_rem(nonzero(b)?))),
        op::I64_REM_U => binop_i64(stack, |a, b| Ok((a as u64 % nonzero(b as u64)?) as i64)),
        op::I64_AND => binop_i64(stack, |a, b| Ok(a & b)),
        op::I64_OR => binop_i64(stack, |a, b| Ok(a | b)),
        op::I64_XOR => binop_i64(stack, |a, b| Ok(a ^ b)),
        op::I64_SHL => binop_i64(stack, |a, b| Ok(a.wrapping_shl(b as u32))),
        op::I64_SHR_S => binop_i64(stack, |a, b| Ok(a.wrapping_shr(b as u32))),
        op::I64_SHR_U => binop_i64(stack, |a, b| Ok((a as u64).wrapping_shr(b as u32) as i64)),
        op::I64_ROTL => binop_i64(stack, |a, b| Ok(a.rotate_left((b & 63) as u32))),
        op::I64_ROTR => binop_i64(stack, |a, b| Ok(a.rotate_right((b & 63) as u32))),

        op::F32_ABS => bitop_f32(stack, |a| a & !F32_SIGN),
        op::F32_NEG => bitop_f32(stack, |a| a ^ F32_SIGN),
        op::F32_CEIL => unop_f32(stack, f32::ceil),
        op::F32_FLOOR => unop_f32(stack, f32::floor),
        op::F32_TRUNC => unop_f32(stack, f32::trunc),
        op::F32_NEAREST => unop_f32(stack, f32::round_ties_even),
        op::F32_SQRT => unop_f32(stack, f32::sqrt),
        op::F32_ADD => binop_f32(stack, |a, b| a + b),
        op::F32_SUB => binop_f32(stack, |a, b| a - b),
        op::F32_MUL => binop_f32(stack, |a, b| a * b),
        op::F32_DIV => binop_f32(stack, |a, b| a / b),
        op::F32_MIN => binop_f32(stack, fmin),
        op::F32_MAX => binop_f32(stack, fmax),
        op::F32_COPYSIGN => {
            let b = stack.pop_f32_bits()?;
            let a = stack.pop_f32_bits()?;
            stack.push(Value::F32((a & !F32_SIGN) | (b & F32_SIGN)))
        }

        op::F64_ABS => bitop_f64(stack, |a| a & !F64_SIGN),
        op::F64_NEG => bitop_f64(stack, |a| a ^ F64_SIGN),
        op::F64_CEIL => unop_f64(stack, f64::ceil),
        op::F64_FLOOR => unop_f64(stack, f64::floor),
        op::F64_TRUNC => unop_f64(stack, f64::trunc),
        op::F64_NEAREST => unop_f64(stack, f64::round_ties_even),
        op::F64_SQRT => unop_f64(stack, f64::sqrt),
        op::F64_ADD => binop_f64(stack, |a, b| a + b),
        op::F64_SUB => binop_f64(stack, |a, b| a - b),
        op::F64_MUL => binop_f64(stack, |a, b| a * b),
        op::F64_DIV => binop_f64(stack, |a, b| a / b),
        op::F64_MIN => binop_f64(stack, fmin),
        op::F64_MAX => binop_f64(stack, fmax),
        op::F64_COPYSIGN => {
            let b = stack.pop_f64_bits()?;
            let a = stack.pop_f64_bits()?;
            stack.push(Value::F64((a & !F64_SIGN) | (b & F64_SIGN)))
        }

        op::I32_WRAP_I64 => {
            let a = stack.pop_i64()?;
            stack.push_i32(a as i32)
        }
        op::I32_TRUNC_F32_S => {
            let a = stack.pop_f32()?;
            stack.push_i32(trunc_i32_s(f64::from(a))?)
        }
        op::I32_TRUNC_F32_U => {
            let a = stack.pop_f32()?;
            stack.push_i32(trunc_i32_u(f64::from(a))?)
        }
        op::I32_TRUNC_F64_S => {
            let a = stack.pop_f64()?;
            stack.push_i32(trunc_i32_s(a)?)
        }
        op::I32_TRUNC_F64_U => {
            let a = stack.pop_f64()?;
            stack.push_i32(trunc_i32_u(a)?)
        }
        op::I64_EXTEND_I32_S => {
            let a = stack.pop_i32()?;
            stack.push_i64(i64::from(a))
        }
        op::I64_EXTEND_I32_U => {
            let a = stack.pop_i32()?;
            stack.push_i64(i64::from(a as u32))
        }
        op::I64_TRUNC_F32_S => {
            let a = stack.pop_f32()?;
            stack.push_i64(trunc_i64_s(f64::from(a))?)
        }
        op::I64_TRUNC_F32_U => {
            let a = stack.pop_f32()?;
            stack.push_i64(trunc_i64_u(f64::from(a))?)
        }
        op::I64_TRUNC_F64_S => {
            let a = stack.pop_f64()?;
            stack.push_i64(trunc_i64_s(a)?)
        }
        op::I64_TRUNC_F64_U => {
            let a = stack.pop_f64()?;
            stack.push_i64(trunc_i64_u(a)?)
        }
        op::F32_CONVERT_I32_S => {
            let a = stack.pop_i32()?;
            stack.push_f32(a as f32)
        }
        op::F32_CONVERT_I32_U => {
            let a = stack.pop_i32()?;
            stack.push_f32(a as u32 as f32)
        }
        op::F32_CONVERT_I64_S => {
            let a = stack.pop_i64()?;
            stack.push_f32(a as f32)
        }
        op::F32_CONVERT_I64_U => {
            let a = stack.pop_i64()?;
            stack.push_f32(a as u64 as f32)
        }
        op::F32_DEMOTE_F64 => {
            let a = stack.pop_f64()?;
            stack.push_f32(a as f32)
        }
        op::F64_CONVERT_I32_S => {
            let a = stack.pop_i32()?;
            stack.push_f64(f64::from(a))
        }
        op::F64_CONVERT_I32_U => {
            let a = stack.pop_i32()?;
            stack.push_f64(f64::from(a as u32))
        }
        op::F64_CONVERT_I64_S => {
            let a = stack.pop_i64()?;
            stack.push_f64(a as f64)
        }
        op::F64_CONVERT_I64_U => {
            let a = stack.pop_i64()?;
            stack.push_f64(a as u64 as f64)
        }
        op::F64_PROMOTE_F32 => {
            let a = stack.pop_f32()?;
            stack.push_f64(f64::from(a))
        }
        op::I32_REINTERPRET_F32 => {
            let a = stack.pop_f32_bits()?;
            stack.push_i32(a as i32)
        }
        op::I64_REINTERPRET_F64 => {
            let a = stack.pop_f64_bits()?;
            stack.push_i64(a as i64)
        }
        op::F32_REINTERPRET_I32 => {
            let a = stack.pop_i32()?;
            stack.push(Value::F32(a as u32))
        }
        op::F64_REINTERPRET_I64 => {
            let a = stack.pop_i64()?;
            stack.push(Value::F64(a as u64))
        }

        op::I32_EXTEND8_S => unop_i32(stack, |a| i32::from(a as i8)),
        op::I32_EXTEND16_S => unop_i32(stack, |a| i32::from(a as i16)),
        op::I64_EXTEND8_S => unop_i64(stack, |a| i64::from(a as i8)),
        op::I64_EXTEND16_S => unop_i64(stack, |a| i64::from(a as i16)),
        op::I64_EXTEND32_S => unop_i64(stack, |a| i64::from(a as i32)),

        _ => Err(Trap::InvalidCode("unknown opcode")),
    }
}
