//! The `harbor` namespace: process exit, output, clocks, randomness, timers
//! and memory growth notifications for modules that do not speak WASI.
//!
//! Functions returning `i32` use negative WASI errno values for failures.

use tracing::debug;

use super::io::IoFailure;
use super::wasi::errno;
use super::{arg_i32, arg_i64, arg_ptr, ret_i32, Capabilities, HostAction, HostContext, HostFunction, ResumeWith, SuspendReason};
use crate::error::HostFailure;
use crate::model::{FuncType, ValType, Value};

pub const NAMESPACE: &str = "harbor";

use ValType::{I32, I64};

type HostResult = Result<HostAction, HostFailure>;

pub fn functions() -> Vec<HostFunction> {
    let f = |name: &str, params: &[ValType], results: &[ValType], cap, func: fn(&mut HostContext<'_>, &[Value]) -> HostResult| {
        HostFunction::new(NAMESPACE, name, FuncType::new(params, results), cap, func)
    };
    vec![
        f("exit", &[I32], &[], Capabilities::EXIT, exit),
        f("write", &[I32, I32, I32], &[I32], Capabilities::IO, write),
        f("nanotime", &[], &[I64], Capabilities::CLOCK, nanotime),
        f("walltime", &[], &[I64], Capabilities::CLOCK, walltime),
        f("random", &[I32, I32], &[I32], Capabilities::RANDOM, random),
        f("timer_schedule", &[I64], &[I32], Capabilities::TIMERS, timer_schedule),
        f("timer_clear", &[I32], &[I32], Capabilities::TIMERS, timer_clear),
        f("poll_completion", &[I32], &[I32], Capabilities::TIMERS, poll_completion),
        f("wait_completion", &[], &[I32], Capabilities::TIMERS, wait_completion),
        f("memory_grown", &[I32], &[], Capabilities::MEMORY, memory_grown),
    ]
}

fn exit(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let code = arg_i32(args, 0);
    ctx.state.exit_code = Some(code);
    Ok(HostAction::Exit(code))
}

/// `write(fd, ptr, len)`: bytes written, or a negative errno.
fn write(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let fd = arg_i32(args, 0) as u32;
    let (ptr, len) = (arg_ptr(args, 1), arg_ptr(args, 2));
    let HostContext { memory, state } = ctx;
    let Some(mem) = memory.as_deref_mut() else {
        return ret_i32(-errno::FAULT);
    };
    let Ok(bytes) = mem.read(ptr, len) else {
        return ret_i32(-errno::FAULT);
    };
    match state.io.write(fd, bytes) {
        Ok(n) => ret_i32(n as i32),
        Err(IoFailure::BadHandle) => ret_i32(-errno::BADF),
        Err(IoFailure::Io(e)) => Err(HostFailure::Io { handle: fd, message: e.to_string() }),
    }
}

fn nanotime(ctx: &mut HostContext<'_>, _: &[Value]) -> HostResult {
    Ok(HostAction::Return(vec![Value::I64(ctx.state.clock.monotonic_nanos() as i64)]))
}

fn walltime(ctx: &mut HostContext<'_>, _: &[Value]) -> HostResult {
    Ok(HostAction::Return(vec![Value::I64(ctx.state.clock.wall_nanos() as i64)]))
}

fn random(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let (ptr, len) = (arg_ptr(args, 0), arg_ptr(args, 1));
    let HostContext { memory, state } = ctx;
    match memory.as_deref_mut().map(|m| m.read_mut(ptr, len)) {
        Some(Ok(buf)) => {
            state.fill_random(buf);
            ret_i32(0)
        }
        _ => ret_i32(-errno::FAULT),
    }
}

/// `timer_schedule(delay_ms)`: token of the new timer. Negative delays fire
/// immediately.
fn timer_schedule(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let delay = arg_i64(args, 0).max(0) as u64;
    let token = ctx.state.continuations.schedule(delay);
    ret_i32(token as i32)
}

/// `timer_clear(token)`: 1 if the timer was still outstanding, else 0.
fn timer_clear(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let token = arg_i32(args, 0) as u32;
    ret_i32(i32::from(ctx.state.continuations.clear(token)))
}

/// `poll_completion(out)`: 1 and the token stored at `out` if a completion is
/// ready, 0 if none is.
fn poll_completion(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let out = arg_ptr(args, 0);
    let HostContext { memory, state } = ctx;
    let Some(mem) = memory.as_deref_mut() else {
        return ret_i32(-errno::FAULT);
    };
    if mem.read(out, 4).is_err() {
        return ret_i32(-errno::FAULT);
    }
    match state.continuations.pop_ready() {
        Some(token) => {
            mem.write_u32(out, token)
                .map_err(|e| HostFailure::Function { name: "harbor.poll_completion".into(), message: e.to_string() })?;
            ret_i32(1)
        }
        None => ret_i32(0),
    }
}

/// `wait_completion()`: number of ready completions. Suspends while timers
/// are pending and nothing is ready; returns 0 at once when nothing is
/// outstanding.
fn wait_completion(ctx: &mut HostContext<'_>, _: &[Value]) -> HostResult {
    let c = &ctx.state.continuations;
    if c.ready_len() > 0 || !c.has_pending() {
        return ret_i32(c.ready_len() as i32);
    }
    Ok(HostAction::Suspend { reason: SuspendReason::AwaitCompletion, resume: ResumeWith::ReadyCount })
}

fn memory_grown(ctx: &mut HostContext<'_>, args: &[Value]) -> HostResult {
    let pages = arg_i32(args, 0) as u32;
    debug!(pages, "module reported memory growth");
    ctx.state.memory_growth.push(pages);
    Ok(HostAction::Return(Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::io::{Handle, IoTable, SharedBuffer, STDERR};
    use crate::host::{HostConfig, HostState};
    use crate::runtime::Memory;

    fn state() -> HostState {
        HostState::with_io(HostConfig { seed: Some(3), ..HostConfig::default() }, IoTable::empty())
    }

    #[test]
    fn write_to_captured_stderr() {
        let err = SharedBuffer::new();
        let mut st = state().with_handle(STDERR, Handle::Writer(Box::new(err.clone())));
        let mut mem = Memory::new(1, 1).unwrap();
        mem.write(10, b"oops").unwrap();
        let mut ctx = HostContext::new(Some(&mut mem), &mut st);
        let r = write(&mut ctx, &[Value::I32(2), Value::I32(10), Value::I32(4)]).unwrap();
        assert_eq!(r, HostAction::Return(vec![Value::I32(4)]));
        assert_eq!(err.to_string_lossy(), "oops");

        let r = write(&mut ctx, &[Value::I32(5), Value::I32(10), Value::I32(4)]).unwrap();
        assert_eq!(r, HostAction::Return(vec![Value::I32(-errno::BADF)]));
    }

    #[test]
    fn timers_poll_in_completion_order() {
        let mut st = state();
        let mut mem = Memory::new(1, 1).unwrap();
        let mut ctx = HostContext::new(Some(&mut mem), &mut st);
        let schedule = |ctx: &mut HostContext<'_>, ms: i64| match timer_schedule(ctx, &[Value::I64(ms)]).unwrap() {
            HostAction::Return(v) => v[0].as_i32().unwrap() as u32,
            other => panic!("unexpected {other:?}"),
        };
        let slow = schedule(&mut ctx, 50);
        let fast = schedule(&mut ctx, 5);

        assert!(matches!(
            wait_completion(&mut ctx, &[]).unwrap(),
            HostAction::Suspend { reason: SuspendReason::AwaitCompletion, .. }
        ));

        ctx.state.continuations.complete(fast);
        ctx.state.continuations.complete(slow);
        assert_eq!(wait_completion(&mut ctx, &[]).unwrap(), HostAction::Return(vec![Value::I32(2)]));

        assert_eq!(poll_completion(&mut ctx, &[Value::I32(0)]).unwrap(), HostAction::Return(vec![Value::I32(1)]));
        assert_eq!(ctx.memory().unwrap().read_u32(0).unwrap(), fast);
        poll_completion(&mut ctx, &[Value::I32(0)]).unwrap();
        assert_eq!(ctx.memory().unwrap().read_u32(0).unwrap(), slow);
        assert_eq!(poll_completion(&mut ctx, &[Value::I32(0)]).unwrap(), HostAction::Return(vec![Value::I32(0)]));
    }

    #[test]
    fn cleared_timer_never_completes() {
        let mut st = state();
        let mut ctx = HostContext::new(None, &mut st);
        timer_schedule(&mut ctx, &[Value::I64(1)]).unwrap();
        assert_eq!(timer_clear(&mut ctx, &[Value::I32(1)]).unwrap(), HostAction::Return(vec![Value::I32(1)]));
        assert_eq!(wait_completion(&mut ctx, &[]).unwrap(), HostAction::Return(vec![Value::I32(0)]));
    }

    #[test]
    fn memory_growth_is_recorded() {
        let mut st = state();
        let mut ctx = HostContext::new(None, &mut st);
        memory_grown(&mut ctx, &[Value::I32(3)]).unwrap();
        assert_eq!(st.memory_growth, vec![3]);
    }
}
