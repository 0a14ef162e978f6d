//! harbor-run: drives harbor-wasm instances on a tokio runtime.
//!
//! Interpreter slices run on the blocking pool. Timer requests become tokio
//! sleeps whose completions are fed back in completion order; suspended
//! instances are resumed and idle ones get their `resume` export called until
//! nothing is left to wait for.

pub mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use harbor_wasm::host::{Completion, IoTable, SuspendReason};
use harbor_wasm::{
    CancelHandle, Engine, HostConfig, HostFailure, HostRegistry, HostState, InstantiationError, Instance,
    LifecycleError, MalformedModule, MemoryError, ResolveError, RunOutcome, TerminalState,
};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, trace, warn};

pub use config::RunConfig;

/// Exit status for failures before any module code ran.
pub const EXIT_SETUP_FAILURE: i32 = 125;
pub const EXIT_CANCELLED: i32 = 130;
pub const EXIT_TRAPPED: i32 = 134;
pub const EXIT_HOST_FAILURE: i32 = 135;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Load(#[from] MalformedModule),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Instantiate(#[from] InstantiationError),
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        EXIT_SETUP_FAILURE
    }
}

/// Process exit status for a terminal state.
pub fn exit_code(state: &TerminalState) -> i32 {
    match state {
        TerminalState::NormalExit(code) => code & 0xFF,
        TerminalState::Trapped(_) => EXIT_TRAPPED,
        TerminalState::HostError(HostFailure::Cancelled) => EXIT_CANCELLED,
        TerminalState::HostError(_) => EXIT_HOST_FAILURE,
    }
}

/// Cancels a controller's runs and wakes it if it is waiting on timers.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    cancel: CancelHandle,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Loads, instantiates and drives modules under one [`RunConfig`]. Stopping
/// the controller cancels every instance it prepared.
#[derive(Debug)]
pub struct RunController {
    config: RunConfig,
    engine: Engine,
    stop: StopHandle,
}

impl RunController {
    pub fn new(config: RunConfig) -> Self {
        let engine = Engine::new(config.engine.clone());
        Self { config, engine, stop: StopHandle::default() }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Load, resolve and instantiate `bytes`. No module code runs.
    pub fn prepare(&self, bytes: &[u8], host: HostConfig, io: IoTable) -> Result<Instance, RunError> {
        let module = harbor_wasm::load(bytes)?;
        let registry = HostRegistry::with_capabilities(self.config.capabilities());
        let table = registry.resolve(&module)?;
        let memory = self.engine.memory_for(&module)?;
        let state = HostState::with_io(host, io);
        let instance = self.engine.instantiate(Arc::new(module), memory, Arc::new(table), state)?;
        Ok(instance.with_cancel_handle(self.stop.cancel.clone()))
    }

    /// Run the module at `path` with process stdio. The module sees `path`
    /// as its first argument.
    pub async fn run_file(&self, path: &Path, args: Vec<String>) -> Result<TerminalState, RunError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| RunError::Read { path: path.to_path_buf(), source })?;
        info!(module = %path.display(), bytes = bytes.len(), "loading module");
        let argv = std::iter::once(path.display().to_string()).chain(args).collect();
        let instance = self.prepare(&bytes, self.config.host_config(argv), IoTable::stdio())?;
        Ok(self.drive(instance).await)
    }

    /// Drive `instance` to its terminal state.
    pub async fn drive(&self, instance: Instance) -> TerminalState {
        let deadline = self.config.run.deadline_ms.map(|ms| {
            let stop = self.stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                warn!(deadline_ms = ms, "deadline elapsed, cancelling");
                stop.stop();
            })
        });
        let state = Driver::new(self.stop.clone()).drive(instance).await;
        if let Some(task) = deadline {
            task.abort();
        }
        info!(%state, exit_code = exit_code(&state), "run finished");
        state
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Start,
    Resume(u64),
    InvokeResume,
    Finish,
}

/// State of one drive: outstanding timer tasks and the completion channel.
struct Driver {
    stop: StopHandle,
    timers: JoinSet<()>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl Driver {
    fn new(stop: StopHandle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { stop, timers: JoinSet::new(), tx, rx }
    }

    async fn drive(mut self, mut instance: Instance) -> TerminalState {
        let mut step = Step::Start;
        loop {
            let (returned, result) = match slice(instance, step).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "interpreter task failed");
                    return TerminalState::HostError(HostFailure::Driver(e.to_string()));
                }
            };
            instance = returned;
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => return instance.fail(e.into()),
            };
            self.start_timers(&mut instance);
            step = match outcome {
                RunOutcome::Terminated(state) => return state,
                RunOutcome::Suspended(s) => {
                    if s.reason == SuspendReason::AwaitCompletion {
                        self.await_until(&mut instance, |i| i.host_state().continuations.ready_len() > 0).await;
                    } else {
                        self.drain(&mut instance);
                    }
                    Step::Resume(s.token)
                }
                RunOutcome::Idle => {
                    // `resume` runs once per new completion, never for ones it left unread.
                    self.await_until(&mut instance, Instance::has_fresh_completion).await;
                    if instance.has_fresh_completion() || self.stop.is_stopped() {
                        Step::InvokeResume
                    } else {
                        Step::Finish
                    }
                }
            };
        }
    }

    fn start_timers(&mut self, instance: &mut Instance) {
        for req in instance.take_timer_requests() {
            let tx = self.tx.clone();
            trace!(token = req.token, delay_ms = req.delay.as_millis() as u64, "timer started");
            self.timers.spawn(async move {
                tokio::time::sleep(req.delay).await;
                // The receiver outlives every timer task.
                let _ = tx.send(Completion { token: req.token });
            });
        }
    }

    /// Deliver completions until `done` holds, nothing is pending, or the
    /// run is stopped.
    async fn await_until(&mut self, instance: &mut Instance, done: fn(&Instance) -> bool) {
        self.drain(instance);
        loop {
            if done(instance) || !instance.host_state().continuations.has_pending() || self.stop.is_stopped() {
                return;
            }
            tokio::select! {
                Some(completion) = self.rx.recv() => deliver(instance, completion),
                _ = self.stop.notify.notified() => {}
            }
        }
    }

    fn drain(&mut self, instance: &mut Instance) {
        while let Ok(completion) = self.rx.try_recv() {
            deliver(instance, completion);
        }
        while self.timers.try_join_next().is_some() {}
    }
}

fn deliver(instance: &mut Instance, completion: Completion) {
    if !instance.deliver(completion) {
        debug!(token = completion.token, "dropping completion nobody waits for");
    }
}

/// Run one interpreter step on the blocking pool.
async fn slice(
    mut instance: Instance,
    step: Step,
) -> Result<(Instance, Result<RunOutcome, LifecycleError>), JoinError> {
    tokio::task::spawn_blocking(move || {
        let result = match step {
            Step::Start => instance.start(),
            Step::Resume(token) => instance.resume(token),
            Step::InvokeResume => instance.invoke_resume(),
            Step::Finish => instance.finish().map(RunOutcome::Terminated),
        };
        (instance, result)
    })
    .await
}
