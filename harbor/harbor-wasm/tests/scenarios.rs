use std::sync::Arc;
use std::thread;
use std::time::Duration;

use harbor_wasm::host::io::STDOUT;
use harbor_wasm::host::{Handle, IoTable, SharedBuffer};
use harbor_wasm::{
    Capabilities, Engine, HostConfig, HostFailure, HostRegistry, HostState, Instance, ResolveError,
    TerminalState, Trap,
};

/// Load, resolve and instantiate `src` with every capability and stdout
/// captured into the returned buffer.
fn instantiate(src: &str, config: HostConfig) -> (Instance, SharedBuffer) {
    let bytes = wat::parse_str(src).expect("wat");
    let module = harbor_wasm::load(&bytes).expect("load");
    let host = HostRegistry::with_capabilities(Capabilities::all()).resolve(&module).expect("resolve");
    let engine = Engine::default();
    let memory = engine.memory_for(&module).expect("memory");
    let out = SharedBuffer::new();
    let state = HostState::with_io(config, IoTable::empty()).with_handle(STDOUT, Handle::Writer(Box::new(out.clone())));
    let inst = engine.instantiate(Arc::new(module), memory, Arc::new(host), state).expect("instantiate");
    (inst, out)
}

fn seeded(seed: u64) -> HostConfig {
    HostConfig { seed: Some(seed), ..HostConfig::default() }
}

#[test]
fn trivial_entry_exits_zero() {
    let (mut inst, out) = instantiate(r#"(module (func (export "run")))"#, seeded(0));
    assert_eq!(inst.run(), TerminalState::NormalExit(0));
    assert!(out.contents().is_empty());
}

#[test]
fn proc_exit_code_is_reported() {
    let (mut inst, _) = instantiate(
        r#"(module
            (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
            (func (export "run") (call $exit (i32.const 42)) unreachable))"#,
        seeded(0),
    );
    assert_eq!(inst.run(), TerminalState::NormalExit(42));
    assert_eq!(inst.host_state().exit_code, Some(42));
}

#[test]
fn store_one_past_the_end_traps() {
    let (mut inst, _) = instantiate(
        r#"(module (memory 1 1)
            (func (export "run") (i32.store8 (i32.const 65536) (i32.const 7))))"#,
        seeded(0),
    );
    assert_eq!(inst.run(), TerminalState::Trapped(Trap::OutOfBounds { offset: 65536, len: 1 }));
    assert_eq!(inst.memory().unwrap().size_bytes(), 65536);
    assert!(inst.memory().unwrap().data().iter().all(|&b| b == 0));
}

#[test]
fn unresolved_import_fails_before_execution() {
    let bytes = wat::parse_str(
        r#"(module
            (import "harbor" "write" (func $write (param i32 i32 i32) (result i32)))
            (import "env" "missing" (func))
            (memory 1)
            (data (i32.const 0) "hi")
            (start $main)
            (func $main (drop (call $write (i32.const 1) (i32.const 0) (i32.const 2))))
            (func (export "run")))"#,
    )
    .unwrap();
    let module = harbor_wasm::load(&bytes).unwrap();
    let err = HostRegistry::with_capabilities(Capabilities::all()).resolve(&module).unwrap_err();
    assert_eq!(
        err,
        ResolveError::UnresolvedImport { namespace: "env".into(), name: "missing".into(), kind: "func" }
    );
}

#[test]
fn withheld_capability_leaves_import_unresolved() {
    let bytes = wat::parse_str(
        r#"(module (import "harbor" "random" (func (param i32 i32) (result i32))) (func (export "run")))"#,
    )
    .unwrap();
    let module = harbor_wasm::load(&bytes).unwrap();
    let registry = HostRegistry::with_capabilities(Capabilities::all() - Capabilities::RANDOM);
    assert!(matches!(registry.resolve(&module), Err(ResolveError::UnresolvedImport { .. })));
}

#[test]
fn fd_write_reaches_captured_stdout() {
    let (mut inst, out) = instantiate(
        r#"(module
            (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 8) "hello\n")
            (func (export "run")
                (i32.store (i32.const 0) (i32.const 8))
                (i32.store (i32.const 4) (i32.const 6))
                (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 32)))))"#,
        seeded(0),
    );
    assert_eq!(inst.run(), TerminalState::NormalExit(0));
    assert_eq!(out.to_string_lossy(), "hello\n");
    assert_eq!(inst.memory().unwrap().read_u32(32).unwrap(), 6);
}

const RANDOM_DUMP: &str = r#"(module
    (import "harbor" "random" (func $random (param i32 i32) (result i32)))
    (import "harbor" "write" (func $write (param i32 i32 i32) (result i32)))
    (memory 1)
    (func (export "run")
        (drop (call $random (i32.const 0) (i32.const 16)))
        (drop (call $write (i32.const 1) (i32.const 0) (i32.const 16)))))"#;

#[test]
fn same_module_same_seed_same_output() {
    let module = Arc::new(harbor_wasm::load(&wat::parse_str(RANDOM_DUMP).unwrap()).unwrap());
    let host = Arc::new(HostRegistry::with_capabilities(Capabilities::all()).resolve(&module).unwrap());
    let engine = Engine::default();
    let run = |seed: u64| {
        let out = SharedBuffer::new();
        let state = HostState::with_io(seeded(seed), IoTable::empty())
            .with_handle(STDOUT, Handle::Writer(Box::new(out.clone())));
        let memory = engine.memory_for(&module).unwrap();
        let mut inst = engine.instantiate(Arc::clone(&module), memory, Arc::clone(&host), state).unwrap();
        assert_eq!(inst.run(), TerminalState::NormalExit(0));
        out.contents()
    };

    let first = run(7);
    assert_eq!(first.len(), 16);
    assert_eq!(first, run(7));
    assert_ne!(first, run(8));
}

#[test]
fn timers_complete_in_due_order() {
    let (mut inst, out) = instantiate(
        r#"(module
            (import "harbor" "timer_schedule" (func $sched (param i64) (result i32)))
            (import "harbor" "wait_completion" (func $wait (result i32)))
            (import "harbor" "poll_completion" (func $poll (param i32) (result i32)))
            (import "harbor" "write" (func $write (param i32 i32 i32) (result i32)))
            (memory 1)
            (func (export "run") (local $n i32)
                (drop (call $sched (i64.const 30)))
                (drop (call $sched (i64.const 10)))
                (drop (call $sched (i64.const 20)))
                (block $done
                    (loop $next
                        (br_if $done (i32.ge_u (local.get $n) (i32.const 3)))
                        (drop (call $wait))
                        (if (call $poll (i32.const 0))
                            (then
                                (i32.store8 (i32.const 16) (i32.add (i32.const 48) (i32.load (i32.const 0))))
                                (drop (call $write (i32.const 1) (i32.const 16) (i32.const 1)))
                                (local.set $n (i32.add (local.get $n) (i32.const 1)))))
                        (br $next)))))"#,
        seeded(0),
    );
    assert_eq!(inst.run(), TerminalState::NormalExit(0));
    assert_eq!(out.to_string_lossy(), "231");
}

#[test]
fn cleared_timer_never_completes() {
    let (mut inst, out) = instantiate(
        r#"(module
            (import "harbor" "timer_schedule" (func $sched (param i64) (result i32)))
            (import "harbor" "timer_clear" (func $clear (param i32) (result i32)))
            (import "harbor" "wait_completion" (func $wait (result i32)))
            (import "harbor" "poll_completion" (func $poll (param i32) (result i32)))
            (import "harbor" "write" (func $write (param i32 i32 i32) (result i32)))
            (memory 1)
            (func (export "run") (local $first i32)
                (local.set $first (call $sched (i64.const 5)))
                (drop (call $sched (i64.const 50)))
                (drop (call $clear (local.get $first)))
                (drop (call $wait))
                (drop (call $poll (i32.const 0)))
                (i32.store8 (i32.const 16) (i32.add (i32.const 48) (i32.load (i32.const 0))))
                (drop (call $write (i32.const 1) (i32.const 16) (i32.const 1)))))"#,
        seeded(0),
    );
    assert_eq!(inst.run(), TerminalState::NormalExit(0));
    assert_eq!(out.to_string_lossy(), "2");
}

#[test]
fn resume_export_drives_event_loop() {
    // Entry schedules a timer and returns; `resume` handles the completion.
    let (mut inst, out) = instantiate(
        r#"(module
            (import "harbor" "timer_schedule" (func $sched (param i64) (result i32)))
            (import "harbor" "poll_completion" (func $poll (param i32) (result i32)))
            (import "harbor" "write" (func $write (param i32 i32 i32) (result i32)))
            (import "harbor" "exit" (func $exit (param i32)))
            (memory 1)
            (data (i32.const 16) "tick")
            (func (export "run") (drop (call $sched (i64.const 100))))
            (func (export "resume")
                (if (call $poll (i32.const 0))
                    (then
                        (drop (call $write (i32.const 1) (i32.const 16) (i32.const 4)))
                        (call $exit (i32.const 3))))))"#,
        seeded(0),
    );
    assert_eq!(inst.run(), TerminalState::NormalExit(3));
    assert_eq!(out.to_string_lossy(), "tick");
}

#[test]
fn cancellation_stops_a_spinning_module() {
    let (mut inst, _) = instantiate(r#"(module (func (export "run") (loop $l (br $l))))"#, seeded(0));
    let cancel = inst.cancel_handle();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
    });
    assert_eq!(inst.run(), TerminalState::HostError(HostFailure::Cancelled));
    canceller.join().unwrap();
}

#[test]
fn args_and_environment_are_visible() {
    let config = HostConfig {
        args: vec!["prog.wasm".into(), "x".into()],
        env: vec![("A".into(), "1".into())],
        seed: Some(0),
    };
    let (mut inst, out) = instantiate(
        r#"(module
            (import "wasi_snapshot_preview1" "args_sizes_get" (func $sizes (param i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "environ_sizes_get" (func $env_sizes (param i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "environ_get" (func $env_get (param i32 i32) (result i32)))
            (import "harbor" "write" (func $write (param i32 i32 i32) (result i32)))
            (import "harbor" "exit" (func $exit (param i32)))
            (memory 1)
            (func (export "run")
                (drop (call $sizes (i32.const 0) (i32.const 4)))
                (drop (call $env_sizes (i32.const 8) (i32.const 12)))
                (drop (call $env_get (i32.const 64) (i32.const 128)))
                ;; "A=1" without its terminator
                (drop (call $write (i32.const 1) (i32.const 128) (i32.sub (i32.load (i32.const 12)) (i32.const 1))))
                (call $exit (i32.add (i32.mul (i32.load (i32.const 0)) (i32.const 10)) (i32.load (i32.const 8))))))"#,
        config,
    );
    assert_eq!(inst.run(), TerminalState::NormalExit(21));
    assert_eq!(out.to_string_lossy(), "A=1");
}
