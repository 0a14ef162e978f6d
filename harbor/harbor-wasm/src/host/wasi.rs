//! `wasi_snapshot_preview1` subset.
//!
//! Functions return a WASI errno. Guest pointers that fall outside memory
//! yield `FAULT`; unknown handles yield `BADF`. A handle whose underlying
//! writer or reader fails is a host failure, not an errno.

use tracing::trace;

use super::io::IoFailure;
use super::{arg_i32, arg_i64, arg_ptr, ret_i32, Capabilities, HostAction, HostContext, HostFunction, ResumeWith, SuspendReason};
use crate::error::{HostFailure, MemoryError};
use crate::model::{FuncType, ValType, Value};
use crate::runtime::Memory;

pub const NAMESPACE: &str = "wasi_snapshot_preview1";

pub mod errno {
    pub const SUCCESS: i32 = 0;
    pub const BADF: i32 = 8;
    pub const FAULT: i32 = 21;
    pub const INVAL: i32 = 28;
}

const CLOCK_REALTIME: i32 = 0;
const CLOCK_MONOTONIC: i32 = 1;
const CLOCK_PROCESS_CPUTIME: i32 = 2;
const CLOCK_THREAD_CPUTIME: i32 = 3;

/// Size of an `iovec`/`ciovec` record: two little-endian u32 fields.
const IOVEC_SIZE: u64 = 8;

use ValType::{I32, I64};

type HostResult = Result<HostAction, HostFailure>;

/// Either an errno for the module or a failure that ends the instance.
enum CallError {
    Errno(i32),
    Fatal(HostFailure),
}

impl From<MemoryError> for CallError {
    fn from(_: MemoryError) -> Self {
        CallError::Errno(errno::FAULT)
    }
}

fn finish(result: Result<(), CallError>) -> HostResult {
    match result {
        Ok(()) => ret_i32(errno::SUCCESS),
        Err(CallError::Errno(e)) => ret_i32(e),
        Err(CallError::Fatal(f)) => Err(f),
    }
}

fn memory<'c>(ctx: &'c mut HostContext<'_>) -> Result<&'c mut Memory, CallError> {
    ctx.memory().ok_or(CallError::Errno(errno::FAULT))
}

fn io_error(fd: u32, err: IoFailure) -> CallError {
    match err {
        IoFailure::BadHandle => CallError::Errno(errno::BADF),
        IoFailure::Io(e) => CallError::Fatal(HostFailure::Io { handle: fd, message: e.to_string() }),
    }
}

pub fn functions() -> Vec<HostFunction> {
    let f = |name: &str, params: &[ValType], results: &[ValType], cap, func: fn(&mut HostContext<'_>, &[Value]) -> HostResult| {
        HostFunction::new(NAMESPACE, name, FuncType::new(params, results), cap, func)
    };
    vec![
        f("proc_exit", &[I32], &[], Capabilities::EXIT, proc_exit),
        f("sched_yield", &[], &[I32], Capabilities::SCHEDULING, sched_yield),
        f("clock_time_get", &[I32, I64, I32], &[I32], Capabilities::CLOCK, clock_time_get),
        f("random_get", &[I32, I32], &[I32], Capabilities::RANDOM, random_get),
        f("fd_write", &[I32, I32, I32, I32], &[I32], Capabilities::IO, fd_write),
        f("fd_read", &[I32, I32, I32, I32], &[I32], Capabilities::IO, fd_read),
        f("args_sizes_get", &[I32, I32], &[I32], Capabilities::ARGS, args_sizes_get),
        f("args_get", &[I32, I32], &[I32], Capabilities::ARGS, args_get),
        f("environ_sizes_get", &[I32, I32], &[I32], Capabilities::ARGS, environ_sizes_get),
        f("environ_get", &[I32, I32], &[I32], Capabilities::ARGS, environ_get),
    ]
}

fn proc_exit(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let code = arg_i32(args, 0);
    ctx.state.exit_code = Some(code);
    Ok(HostAction::Exit(code))
}

fn sched_yield(_: &mut HostContext<'_>, _: &[Value]) -> HostResult {
    Ok(HostAction::Suspend {
        reason: SuspendReason::Yield,
        resume: ResumeWith::Values(vec![Value::I32(errno::SUCCESS)]),
    })
}

fn clock_time_get(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let id = arg_i32(args, 0);
    let _precision = arg_i64(args, 1);
    let out = arg_ptr(args, 2);
    finish((|| {
        let now = match id {
            CLOCK_REALTIME => ctx.state.clock.wall_nanos(),
            CLOCK_MONOTONIC | CLOCK_PROCESS_CPUTIME | CLOCK_THREAD_CPUTIME => {
                ctx.state.clock.monotonic_nanos()
            }
            _ => return Err(CallError::Errno(errno::INVAL)),
        };
        memory(ctx)?.write_u64(out, now)?;
        Ok(())
    })())
}

fn random_get(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let (ptr, len) = (arg_ptr(args, 0), arg_ptr(args, 1));
    finish((|| {
        let HostContext { memory, state } = ctx;
        let mem = memory.as_deref_mut().ok_or(CallError::Errno(errno::FAULT))?;
        state.fill_random(mem.read_mut(ptr, len)?);
        Ok(())
    })())
}

/// Read the `(buf, len)` pairs of an iovec array.
fn iovecs(mem: &Memory, iovs: u64, count: u64) -> Result<Vec<(u64, u64)>, CallError> {
    let raw = mem.read(iovs, count.saturating_mul(IOVEC_SIZE))?;
    Ok(raw
        .chunks_exact(IOVEC_SIZE as usize)
        .map(|c| {
            let buf = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            let len = u32::from_le_bytes([c[4], c[5], c[6], c[7]]);
            (u64::from(buf), u64::from(len))
        })
        .collect())
}

fn fd_write(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let fd = arg_i32(args, 0) as u32;
    let (iovs, count, nwritten) = (arg_ptr(args, 1), arg_ptr(args, 2), arg_ptr(args, 3));
    finish((|| {
        let HostContext { memory, state } = ctx;
        let mem = memory.as_deref_mut().ok_or(CallError::Errno(errno::FAULT))?;
        // Check every range first so a bad iovec writes nothing.
        let vecs = iovecs(mem, iovs, count)?;
        let mut total = 0u64;
        for &(buf, len) in &vecs {
            mem.read(buf, len)?;
            total += len;
        }
        if total > u64::from(u32::MAX) {
            return Err(CallError::Errno(errno::INVAL));
        }
        mem.read(nwritten, 4)?;
        if !state.io.is_writer(fd) {
            return Err(CallError::Errno(errno::BADF));
        }
        for (buf, len) in vecs {
            state.io.write(fd, mem.read(buf, len)?).map_err(|e| io_error(fd, e))?;
        }
        trace!(fd, bytes = total, "fd_write");
        mem.write_u32(nwritten, total as u32)?;
        Ok(())
    })())
}

fn fd_read(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let fd = arg_i32(args, 0) as u32;
    let (iovs, count, nread) = (arg_ptr(args, 1), arg_ptr(args, 2), arg_ptr(args, 3));
    finish((|| {
        let HostContext { memory, state } = ctx;
        let mem = memory.as_deref_mut().ok_or(CallError::Errno(errno::FAULT))?;
        let vecs = iovecs(mem, iovs, count)?;
        for &(buf, len) in &vecs {
            mem.read(buf, len)?;
        }
        mem.read(nread, 4)?;
        let mut total = 0u64;
        for (buf, len) in vecs {
            let n = state
                .io
                .read(fd, mem.read_mut(buf, len)?)
                .map_err(|e| io_error(fd, e))? as u64;
            total += n;
            if n < len {
                break;
            }
        }
        mem.write_u32(nread, total as u32)?;
        Ok(())
    })())
}

/// Write NUL-terminated `strings` into `buf` and their addresses into `ptrs`.
fn write_strings(mem: &mut Memory, strings: &[String], ptrs: u64, buf: u64) -> Result<(), CallError> {
    let total: u64 = strings.iter().map(|s| s.len() as u64 + 1).sum();
    mem.read(ptrs, strings.len() as u64 * 4)?;
    mem.read(buf, total)?;
    let mut at = buf;
    for (i, s) in strings.iter().enumerate() {
        mem.write_u32(ptrs + i as u64 * 4, at as u32)?;
        mem.write(at, s.as_bytes())?;
        mem.write(at + s.len() as u64, &[0])?;
        at += s.len() as u64 + 1;
    }
    Ok(())
}

fn write_sizes(mem: &mut Memory, strings: &[String], count_ptr: u64, size_ptr: u64) -> Result<(), CallError> {
    let size: usize = strings.iter().map(|s| s.len() + 1).sum();
    mem.read(count_ptr, 4)?;
    mem.read(size_ptr, 4)?;
    mem.write_u32(count_ptr, strings.len() as u32)?;
    mem.write_u32(size_ptr, size as u32)?;
    Ok(())
}

fn args_sizes_get(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let (count, size) = (arg_ptr(args, 0), arg_ptr(args, 1));
    finish((|| {
        let argv = ctx.state.args.clone();
        write_sizes(memory(ctx)?, &argv, count, size)
    })())
}

fn args_get(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let (ptrs, buf) = (arg_ptr(args, 0), arg_ptr(args, 1));
    finish((|| {
        let argv = ctx.state.args.clone();
        write_strings(memory(ctx)?, &argv, ptrs, buf)
    })())
}

fn environ_sizes_get(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let (count, size) = (arg_ptr(args, 0), arg_ptr(args, 1));
    finish((|| {
        let env: Vec<String> = ctx.state.env_strings().collect();
        write_sizes(memory(ctx)?, &env, count, size)
    })())
}

fn environ_get(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let (ptrs, buf) = (arg_ptr(args, 0), arg_ptr(args, 1));
    finish((|| {
        let env: Vec<String> = ctx.state.env_strings().collect();
        write_strings(memory(ctx)?, &env, ptrs, buf)
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::io::{Handle, IoTable, SharedBuffer, STDOUT};
    use crate::host::{HostConfig, HostState, ManualClock};

    fn state() -> (HostState, SharedBuffer) {
        let out = SharedBuffer::new();
        let config = HostConfig {
            args: vec!["prog".into(), "a1".into()],
            env: vec![("K".into(), "V".into())],
            seed: Some(1),
        };
        let state = HostState::with_io(config, IoTable::empty())
            .with_handle(STDOUT, Handle::Writer(Box::new(out.clone())))
            .with_clock(ManualClock::new(1_000));
        (state, out)
    }

    fn call(f: fn(&mut HostContext<'_>, &[Value]) -> HostResult, mem: &mut Memory, state: &mut HostState, args: &[i32]) -> HostResult {
        let args: Vec<Value> = args.iter().map(|&a| Value::I32(a)).collect();
        let mut ctx = HostContext::new(Some(mem), state);
        f(&mut ctx, &args)
    }

    fn errno_of(r: HostResult) -> i32 {
        match r {
            Ok(HostAction::Return(v)) => v[0].as_i32().unwrap(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fd_write_gathers_iovecs() {
        let (mut st, out) = state();
        let mut mem = Memory::new(1, 1).unwrap();
        mem.write(100, b"hello ").unwrap();
        mem.write(200, b"world").unwrap();
        // two iovecs at 0
        mem.write_u32(0, 100).unwrap();
        mem.write_u32(4, 6).unwrap();
        mem.write_u32(8, 200).unwrap();
        mem.write_u32(12, 5).unwrap();
        assert_eq!(errno_of(call(fd_write, &mut mem, &mut st, &[1, 0, 2, 16])), errno::SUCCESS);
        assert_eq!(out.to_string_lossy(), "hello world");
        assert_eq!(mem.read_u32(16).unwrap(), 11);
    }

    #[test]
    fn fd_write_errors() {
        let (mut st, out) = state();
        let mut mem = Memory::new(1, 1).unwrap();
        assert_eq!(errno_of(call(fd_write, &mut mem, &mut st, &[7, 0, 0, 16])), errno::BADF);
        // iovec pointing past the end of memory
        mem.write_u32(0, 65_530).unwrap();
        mem.write_u32(4, 100).unwrap();
        assert_eq!(errno_of(call(fd_write, &mut mem, &mut st, &[1, 0, 1, 16])), errno::FAULT);
        assert!(out.contents().is_empty());
    }

    #[test]
    fn fd_write_rejects_totals_beyond_u32() {
        let (mut st, out) = state();
        let mut mem = Memory::new(9, 9).unwrap();
        // 65537 iovecs all covering the first 64 KiB: every range is valid,
        // the sum is not.
        let count = 65_537u32;
        let base = 65_536u64;
        for i in 0..u64::from(count) {
            mem.write_u32(base + i * 8, 0).unwrap();
            mem.write_u32(base + i * 8 + 4, 65_536).unwrap();
        }
        let args = [1, base as i32, count as i32, 16];
        assert_eq!(errno_of(call(fd_write, &mut mem, &mut st, &args)), errno::INVAL);
        assert!(out.contents().is_empty());
        assert_eq!(mem.read_u32(16).unwrap(), 0);
    }

    #[test]
    fn args_and_environ() {
        let (mut st, _) = state();
        let mut mem = Memory::new(1, 1).unwrap();
        assert_eq!(errno_of(call(args_sizes_get, &mut mem, &mut st, &[0, 4])), 0);
        assert_eq!(mem.read_u32(0).unwrap(), 2);
        assert_eq!(mem.read_u32(4).unwrap(), 8);

        assert_eq!(errno_of(call(args_get, &mut mem, &mut st, &[16, 64])), 0);
        assert_eq!(mem.read_u32(16).unwrap(), 64);
        assert_eq!(mem.read_u32(20).unwrap(), 69);
        assert_eq!(mem.read(64, 8).unwrap(), b"prog\0a1\0");

        assert_eq!(errno_of(call(environ_get, &mut mem, &mut st, &[32, 128])), 0);
        assert_eq!(mem.read(128, 4).unwrap(), b"K=V\0");
    }

    #[test]
    fn clock_reads_injected_time() {
        let (mut st, _) = state();
        let mut mem = Memory::new(1, 1).unwrap();
        let args = [Value::I32(CLOCK_MONOTONIC), Value::I64(0), Value::I32(8)];
        let mut ctx = HostContext::new(Some(&mut mem), &mut st);
        assert_eq!(errno_of(clock_time_get(&mut ctx, &args)), 0);
        assert_eq!(mem.read_u64(8).unwrap(), 1_000);

        let args = [Value::I32(99), Value::I64(0), Value::I32(8)];
        let mut ctx = HostContext::new(Some(&mut mem), &mut st);
        assert_eq!(errno_of(clock_time_get(&mut ctx, &args)), errno::INVAL);
    }

    #[test]
    fn proc_exit_requests_exit() {
        let (mut st, _) = state();
        let mut mem = Memory::new(1, 1).unwrap();
        assert_eq!(call(proc_exit, &mut mem, &mut st, &[42]).unwrap(), HostAction::Exit(42));
        assert_eq!(st.exit_code, Some(42));
    }

    #[test]
    fn random_get_without_memory_faults() {
        let (mut st, _) = state();
        let mut ctx = HostContext::new(None, &mut st);
        assert_eq!(errno_of(random_get(&mut ctx, &[Value::I32(0), Value::I32(4)])), errno::FAULT);
    }
}
