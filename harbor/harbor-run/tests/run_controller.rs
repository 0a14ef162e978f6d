use std::time::{Duration, Instant};

use harbor_run::{
    exit_code, RunConfig, RunController, RunError, EXIT_CANCELLED, EXIT_SETUP_FAILURE, EXIT_TRAPPED,
};
use harbor_wasm::host::io::STDOUT;
use harbor_wasm::host::{Handle, IoTable, SharedBuffer};
use harbor_wasm::{HostConfig, HostFailure, Instance, TerminalState, Trap};

fn captured(controller: &RunController, src: &str) -> (Instance, SharedBuffer) {
    let bytes = wat::parse_str(src).unwrap();
    let out = SharedBuffer::new();
    let mut io = IoTable::empty();
    io.insert(STDOUT, Handle::Writer(Box::new(out.clone())));
    let host = HostConfig { seed: Some(1), ..HostConfig::default() };
    let inst = controller.prepare(&bytes, host, io).unwrap();
    (inst, out)
}

const TIMERS: &str = r#"(module
    (import "harbor" "timer_schedule" (func $sched (param i64) (result i32)))
    (import "harbor" "wait_completion" (func $wait (result i32)))
    (import "harbor" "poll_completion" (func $poll (param i32) (result i32)))
    (import "harbor" "write" (func $write (param i32 i32 i32) (result i32)))
    (memory 1)
    (func (export "run") (local $n i32)
        (drop (call $sched (i64.const 90)))
        (drop (call $sched (i64.const 10)))
        (drop (call $sched (i64.const 50)))
        (block $done
            (loop $next
                (br_if $done (i32.ge_u (local.get $n) (i32.const 3)))
                (drop (call $wait))
                (if (call $poll (i32.const 0))
                    (then
                        (i32.store8 (i32.const 16) (i32.add (i32.const 48) (i32.load (i32.const 0))))
                        (drop (call $write (i32.const 1) (i32.const 16) (i32.const 1)))
                        (local.set $n (i32.add (local.get $n) (i32.const 1)))))
                (br $next)))))"#;

#[tokio::test]
async fn real_timers_complete_in_completion_order() {
    let controller = RunController::new(RunConfig::default());
    let (inst, out) = captured(&controller, TIMERS);
    let started = Instant::now();
    assert_eq!(controller.drive(inst).await, TerminalState::NormalExit(0));
    assert_eq!(out.to_string_lossy(), "231");
    assert!(started.elapsed() >= Duration::from_millis(90));
}

#[tokio::test]
async fn yields_are_resumed() {
    let controller = RunController::new(RunConfig::default());
    let (inst, _) = captured(
        &controller,
        r#"(module
            (import "wasi_snapshot_preview1" "sched_yield" (func $yield (result i32)))
            (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
            (func (export "run")
                (drop (call $yield))
                (drop (call $yield))
                (call $exit (i32.const 7))))"#,
    );
    let state = controller.drive(inst).await;
    assert_eq!(state, TerminalState::NormalExit(7));
    assert_eq!(exit_code(&state), 7);
}

#[tokio::test]
async fn resume_export_runs_after_each_completion() {
    let controller = RunController::new(RunConfig::default());
    let (inst, out) = captured(
        &controller,
        r#"(module
            (import "harbor" "timer_schedule" (func $sched (param i64) (result i32)))
            (import "harbor" "poll_completion" (func $poll (param i32) (result i32)))
            (import "harbor" "write" (func $write (param i32 i32 i32) (result i32)))
            (memory 1)
            (data (i32.const 16) "ab")
            (func (export "run")
                (drop (call $sched (i64.const 5)))
                (drop (call $sched (i64.const 25))))
            (func (export "resume")
                (block $empty
                    (loop $more
                        (br_if $empty (i32.eqz (call $poll (i32.const 0))))
                        (drop (call $write (i32.const 1) (i32.add (i32.const 15) (i32.load (i32.const 0))) (i32.const 1)))
                        (br $more)))))"#,
    );
    assert_eq!(controller.drive(inst).await, TerminalState::NormalExit(0));
    assert_eq!(out.to_string_lossy(), "ab");
}

#[tokio::test]
async fn resume_runs_once_per_completion_when_it_leaves_one_unread() {
    let controller = RunController::new(RunConfig::default());
    let (inst, out) = captured(
        &controller,
        r#"(module
            (import "harbor" "timer_schedule" (func $sched (param i64) (result i32)))
            (import "harbor" "write" (func $write (param i32 i32 i32) (result i32)))
            (memory 1)
            (data (i32.const 16) "r")
            (func (export "run")
                (drop (call $sched (i64.const 1)))
                (drop (call $sched (i64.const 200))))
            (func (export "resume")
                (drop (call $write (i32.const 1) (i32.const 16) (i32.const 1)))))"#,
    );
    assert_eq!(controller.drive(inst).await, TerminalState::NormalExit(0));
    assert_eq!(out.to_string_lossy(), "rr");
}

#[tokio::test]
async fn deadline_cancels_a_spinning_module() {
    let config = RunConfig::from_toml("[run]\ndeadline_ms = 30\n").unwrap();
    let controller = RunController::new(config);
    let (inst, _) = captured(&controller, r#"(module (func (export "run") (loop $l (br $l))))"#);
    let state = controller.drive(inst).await;
    assert_eq!(state, TerminalState::HostError(HostFailure::Cancelled));
    assert_eq!(exit_code(&state), EXIT_CANCELLED);
}

#[tokio::test]
async fn stop_wakes_a_module_waiting_on_timers() {
    let controller = RunController::new(RunConfig::default());
    let (inst, _) = captured(
        &controller,
        r#"(module
            (import "harbor" "timer_schedule" (func $sched (param i64) (result i32)))
            (import "harbor" "wait_completion" (func $wait (result i32)))
            (func (export "run")
                (drop (call $sched (i64.const 60000)))
                (drop (call $wait))))"#,
    );
    let stop = controller.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.stop();
    });
    let started = Instant::now();
    assert_eq!(controller.drive(inst).await, TerminalState::HostError(HostFailure::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn trap_maps_to_terminal_state() {
    let controller = RunController::new(RunConfig::default());
    let (inst, _) = captured(&controller, r#"(module (func (export "run") unreachable))"#);
    assert_eq!(controller.drive(inst).await, TerminalState::Trapped(Trap::Unreachable));
}

#[tokio::test]
async fn store_one_past_the_end_exits_trapped() {
    let controller = RunController::new(RunConfig::default());
    let (inst, _) = captured(
        &controller,
        r#"(module (memory 1 1)
            (func (export "run") (i32.store8 (i32.const 65536) (i32.const 7))))"#,
    );
    let state = controller.drive(inst).await;
    assert_eq!(state, TerminalState::Trapped(Trap::OutOfBounds { offset: 65536, len: 1 }));
    assert_eq!(exit_code(&state), EXIT_TRAPPED);
}

#[tokio::test]
async fn many_timers_all_complete() {
    let controller = RunController::new(RunConfig::default());
    let (inst, _) = captured(
        &controller,
        r#"(module
            (import "harbor" "timer_schedule" (func $sched (param i64) (result i32)))
            (import "harbor" "wait_completion" (func $wait (result i32)))
            (import "harbor" "poll_completion" (func $poll (param i32) (result i32)))
            (import "harbor" "exit" (func $exit (param i32)))
            (memory 1)
            (func (export "run") (local $i i32) (local $n i32)
                (loop $schedule
                    (drop (call $sched (i64.extend_i32_u (i32.rem_u (local.get $i) (i32.const 7)))))
                    (local.set $i (i32.add (local.get $i) (i32.const 1)))
                    (br_if $schedule (i32.lt_u (local.get $i) (i32.const 64))))
                (block $done
                    (loop $next
                        (br_if $done (i32.ge_u (local.get $n) (i32.const 64)))
                        (drop (call $wait))
                        (if (call $poll (i32.const 0))
                            (then (local.set $n (i32.add (local.get $n) (i32.const 1)))))
                        (br $next)))
                (call $exit (local.get $n))))"#,
    );
    assert_eq!(controller.drive(inst).await, TerminalState::NormalExit(64));
}

#[tokio::test]
async fn withheld_capability_fails_setup() {
    let config = RunConfig::from_toml("[host]\ncapabilities = [\"io\"]\n").unwrap();
    let controller = RunController::new(config);
    let bytes =
        wat::parse_str(r#"(module (import "harbor" "exit" (func (param i32))) (func (export "run")))"#).unwrap();
    let err = controller.prepare(&bytes, HostConfig::default(), IoTable::empty()).unwrap_err();
    assert!(matches!(err, RunError::Resolve(_)));
    assert_eq!(err.exit_code(), EXIT_SETUP_FAILURE);
}

#[tokio::test]
async fn run_file_passes_module_path_as_first_argument() {
    let bytes = wat::parse_str(
        r#"(module
            (import "wasi_snapshot_preview1" "args_sizes_get" (func $sizes (param i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
            (memory 1)
            (func (export "run")
                (drop (call $sizes (i32.const 0) (i32.const 4)))
                (call $exit (i32.load (i32.const 0)))))"#,
    )
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("argc.wasm");
    std::fs::write(&path, bytes).unwrap();

    let controller = RunController::new(RunConfig::default());
    let state = controller.run_file(&path, vec!["one".into(), "two".into()]).await.unwrap();
    assert_eq!(state, TerminalState::NormalExit(3));
}

#[tokio::test]
async fn missing_file_is_a_setup_failure() {
    let controller = RunController::new(RunConfig::default());
    let err = controller.run_file(std::path::Path::new("/nonexistent/x.wasm"), Vec::new()).await.unwrap_err();
    assert!(matches!(err, RunError::Read { .. }));
    assert_eq!(err.exit_code(), EXIT_SETUP_FAILURE);
}
