//! A live instance and its lifecycle.
//!
//! `Created -> Running -> Terminated`. Running is entered once through
//! [`Instance::start`] (or [`Instance::run`]); a terminal state, once
//! recorded, never changes.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{CancelHandle, EngineConfig};
use crate::error::{HostFailure, LifecycleError, Trap};
use crate::host::{Completion, HostState, HostTable, ResumeWith, SuspendReason, TimerRequest};
use crate::model::{FuncIdx, Module, Value};
use crate::runtime::{GlobalSlot, Memory, Table};
use crate::vm::{ExecOutcome, Executor, Fault, Machine};

/// How an instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalState {
    NormalExit(i32),
    Trapped(Trap),
    HostError(HostFailure),
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalState::NormalExit(code) => write!(f, "exited with code {code}"),
            TerminalState::Trapped(trap) => write!(f, "trapped: {trap}"),
            TerminalState::HostError(err) => write!(f, "host error: {err}"),
        }
    }
}

/// A host call that is waiting to be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suspension {
    pub token: u64,
    pub reason: SuspendReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Suspended(Suspension),
    /// The entry (or resume) export returned and continuations are still
    /// outstanding; deliver completions and call [`Instance::invoke_resume`].
    Idle,
    Terminated(TerminalState),
}

#[derive(Debug)]
enum Phase {
    Created,
    Running,
    Terminated(TerminalState),
}

pub(super) struct Parts {
    pub module: Arc<Module>,
    pub memory: Option<Memory>,
    pub table: Option<Table>,
    pub globals: Vec<GlobalSlot>,
    pub host: Arc<HostTable>,
    pub state: HostState,
    pub config: EngineConfig,
    pub entry: FuncIdx,
    pub resume: Option<FuncIdx>,
}

pub struct Instance {
    module: Arc<Module>,
    memory: Option<Memory>,
    table: Option<Table>,
    globals: Vec<GlobalSlot>,
    host: Arc<HostTable>,
    state: HostState,
    config: EngineConfig,
    entry: FuncIdx,
    resume: Option<FuncIdx>,

    machine: Machine,
    phase: Phase,
    cancel: CancelHandle,
    /// The start function is running and the entry still has to follow.
    entry_queued: bool,
    pending: Option<(Suspension, ResumeWith)>,
    next_token: u64,
    /// Ready completions when the resume export was last invoked.
    ready_at_resume: Option<usize>,
    /// Accepted completions when the resume export was last invoked.
    completed_at_resume: Option<u64>,
}

impl Instance {
    pub(super) fn new(p: Parts) -> Self {
        let machine = Machine::new(p.config.max_value_stack);
        Self {
            module: p.module,
            memory: p.memory,
            table: p.table,
            globals: p.globals,
            host: p.host,
            state: p.state,
            config: p.config,
            entry: p.entry,
            resume: p.resume,
            machine,
            phase: Phase::Created,
            cancel: CancelHandle::new(),
            entry_queued: false,
            pending: None,
            next_token: 1,
            ready_at_resume: None,
            completed_at_resume: None,
        }
    }

    /// Share an existing cancellation flag with this instance.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }

    pub fn global(&self, idx: usize) -> Option<Value> {
        self.globals.get(idx).map(GlobalSlot::get)
    }

    pub fn host_state(&self) -> &HostState {
        &self.state
    }

    pub fn host_state_mut(&mut self) -> &mut HostState {
        &mut self.state
    }

    pub fn terminal_state(&self) -> Option<&TerminalState> {
        match &self.phase {
            Phase::Terminated(t) => Some(t),
            _ => None,
        }
    }

    pub fn pending_suspension(&self) -> Option<Suspension> {
        self.pending.as_ref().map(|(s, _)| *s)
    }

    /// Timers the module scheduled since the last call; a driver starts one
    /// real timer per request.
    pub fn take_timer_requests(&mut self) -> Vec<TimerRequest> {
        self.state.continuations.take_requests()
    }

    /// Run the start function, if any, then the entry export.
    pub fn start(&mut self) -> Result<RunOutcome, LifecycleError> {
        if !matches!(self.phase, Phase::Created) {
            return Err(LifecycleError::AlreadyStarted);
        }
        self.phase = Phase::Running;
        info!(entry = %self.config.entry, "instance started");
        let first = match self.module.start {
            Some(start) => {
                self.entry_queued = true;
                start
            }
            None => self.entry,
        };
        let r = self.invoke(first);
        Ok(self.settle(r))
    }

    /// Continue the suspension identified by `token`.
    pub fn resume(&mut self, token: u64) -> Result<RunOutcome, LifecycleError> {
        self.ensure_running()?;
        let (suspension, with) = self.pending.take().ok_or(LifecycleError::NotSuspended)?;
        if suspension.token != token {
            self.pending = Some((suspension, with));
            return Err(LifecycleError::TokenMismatch);
        }
        let values = match with {
            ResumeWith::Values(v) => v,
            ResumeWith::ReadyCount => vec![Value::I32(self.state.continuations.ready_len() as i32)],
        };
        debug!(token, reason = ?suspension.reason, "resuming");
        let r = {
            let (mut exec, machine) = self.split();
            exec.resume(machine, values)
        };
        Ok(self.settle(r))
    }

    /// Hand a completion to the module. Returns whether it was still wanted.
    pub fn deliver(&mut self, completion: Completion) -> bool {
        if self.terminal_state().is_some() {
            return false;
        }
        self.state.continuations.complete(completion.token)
    }

    /// Call the resume export on an idle instance.
    pub fn invoke_resume(&mut self) -> Result<RunOutcome, LifecycleError> {
        self.ensure_running()?;
        if self.pending.is_some() || !self.machine.is_idle() {
            return Err(LifecycleError::NotIdle);
        }
        let resume = self.resume.ok_or(LifecycleError::NoResumeExport)?;
        self.ready_at_resume = Some(self.state.continuations.ready_len());
        self.completed_at_resume = Some(self.state.continuations.completed());
        let r = self.invoke(resume);
        Ok(self.settle(r))
    }

    /// A completion arrived that the resume export has not yet been called
    /// for. Drivers of an idle instance wait for this before
    /// [`Instance::invoke_resume`].
    pub fn has_fresh_completion(&self) -> bool {
        let c = &self.state.continuations;
        match self.completed_at_resume {
            Some(seen) => c.completed() > seen,
            None => c.ready_len() > 0,
        }
    }

    /// End an idle instance, discarding outstanding continuations. A
    /// terminated instance reports its recorded state.
    pub fn finish(&mut self) -> Result<TerminalState, LifecycleError> {
        if let Phase::Terminated(t) = &self.phase {
            return Ok(t.clone());
        }
        if !matches!(self.phase, Phase::Running) || self.pending.is_some() || !self.machine.is_idle() {
            return Err(LifecycleError::NotIdle);
        }
        self.discard_pending();
        let code = self.state.exit_code.unwrap_or(0);
        Ok(self.terminate(TerminalState::NormalExit(code)))
    }

    /// Deterministic driver: yields resume at once, waits are satisfied by
    /// firing pending timers in virtual time.
    pub fn run(&mut self) -> TerminalState {
        let mut step = match self.start() {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "run called on a started instance");
                return TerminalState::HostError(e.into());
            }
        };
        loop {
            // Real timers are never started here.
            self.state.continuations.take_requests();
            let next = match step {
                RunOutcome::Terminated(t) => return t,
                RunOutcome::Suspended(s) => {
                    if s.reason == SuspendReason::AwaitCompletion && self.state.continuations.ready_len() == 0 {
                        self.state.continuations.fire_next_virtual();
                    }
                    self.resume(s.token)
                }
                RunOutcome::Idle => {
                    if self.has_fresh_completion() || self.state.continuations.fire_next_virtual().is_some() {
                        self.invoke_resume()
                    } else {
                        self.finish().map(RunOutcome::Terminated)
                    }
                }
            };
            step = match next {
                Ok(outcome) => outcome,
                Err(e) => RunOutcome::Terminated(self.fail(e.into())),
            };
        }
    }

    /// Record a driver-side failure as the terminal state.
    pub fn fail(&mut self, failure: HostFailure) -> TerminalState {
        if let Phase::Terminated(t) = &self.phase {
            return t.clone();
        }
        self.discard_pending();
        self.terminate(TerminalState::HostError(failure))
    }

    fn ensure_running(&self) -> Result<(), LifecycleError> {
        match self.phase {
            Phase::Running => Ok(()),
            Phase::Created => Err(LifecycleError::NotSuspended),
            Phase::Terminated(_) => Err(LifecycleError::Terminated),
        }
    }

    fn split(&mut self) -> (Executor<'_>, &mut Machine) {
        let exec = Executor {
            module: &self.module,
            memory: self.memory.as_mut(),
            table: self.table.as_ref(),
            globals: &mut self.globals,
            host: &self.host,
            state: &mut self.state,
            cancel: &self.cancel,
            max_call_depth: self.config.max_call_depth,
        };
        (exec, &mut self.machine)
    }

    fn invoke(&mut self, func: FuncIdx) -> Result<ExecOutcome, Fault> {
        self.machine.reset();
        let (mut exec, machine) = self.split();
        exec.invoke(machine, func, &[])
    }

    /// Turn an interpreter result into the next lifecycle step.
    fn settle(&mut self, mut result: Result<ExecOutcome, Fault>) -> RunOutcome {
        while self.entry_queued && matches!(result, Ok(ExecOutcome::Returned(_))) {
            self.entry_queued = false;
            result = self.invoke(self.entry);
        }
        let terminal = match result {
            Ok(ExecOutcome::Returned(_)) => return self.on_return(),
            Ok(ExecOutcome::Suspended { reason, resume }) => {
                let suspension = Suspension { token: self.next_token, reason };
                self.next_token += 1;
                self.pending = Some((suspension, resume));
                return RunOutcome::Suspended(suspension);
            }
            Ok(ExecOutcome::Exited(code)) => TerminalState::NormalExit(code),
            Err(Fault::Trap(trap)) => TerminalState::Trapped(trap),
            Err(Fault::Host(failure)) => TerminalState::HostError(failure),
        };
        self.discard_pending();
        RunOutcome::Terminated(self.terminate(terminal))
    }

    fn on_return(&mut self) -> RunOutcome {
        let c = &self.state.continuations;
        // A resume export that leaves completions unpolled would be called forever.
        let progressed = self.ready_at_resume.map_or(true, |before| c.ready_len() < before);
        let live = c.has_pending() || (c.ready_len() > 0 && progressed);
        if self.resume.is_some() && live {
            return RunOutcome::Idle;
        }
        self.discard_pending();
        let code = self.state.exit_code.unwrap_or(0);
        RunOutcome::Terminated(self.terminate(TerminalState::NormalExit(code)))
    }

    fn discard_pending(&mut self) {
        self.pending = None;
        let dropped = self.state.continuations.discard_all();
        if dropped > 0 {
            warn!(dropped, "discarding pending continuations");
        }
    }

    fn terminate(&mut self, state: TerminalState) -> TerminalState {
        match &state {
            TerminalState::NormalExit(code) => info!(code, "instance exited"),
            TerminalState::Trapped(trap) => warn!(%trap, "instance trapped"),
            TerminalState::HostError(err) => warn!(error = %err, "instance failed"),
        }
        self.machine.reset();
        self.phase = Phase::Terminated(state.clone());
        state
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("entry", &self.config.entry)
            .field("phase", &self.phase)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}
