use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use harbor_wasm::host::IoTable;
use harbor_wasm::{Capabilities, Engine, HostConfig, HostRegistry, HostState, Instance, Module, TerminalState};

const LOOP_SUM: &str = r#"(module
    (import "harbor" "exit" (func $exit (param i32)))
    (global $n (mut i32) (i32.const 0))
    (func (export "set") (param i32) (global.set $n (local.get 0)))
    (func (export "run") (local $i i32) (local $acc i32)
        (block $done
            (loop $next
                (br_if $done (i32.ge_u (local.get $i) (global.get $n)))
                (local.set $acc (i32.add (local.get $acc) (local.get $i)))
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (br $next)))
        (call $exit (i32.and (local.get $acc) (i32.const 0x7f)))))"#;

const FIB: &str = r#"(module
    (func $fib (param i32) (result i32)
        (if (result i32) (i32.lt_u (local.get 0) (i32.const 2))
            (then (local.get 0))
            (else (i32.add (call $fib (i32.sub (local.get 0) (i32.const 1)))
                           (call $fib (i32.sub (local.get 0) (i32.const 2)))))))
    (func (export "run") (drop (call $fib (i32.const 20)))))"#;

fn prepare(src: &str) -> (Arc<Module>, Arc<harbor_wasm::HostTable>) {
    let module = harbor_wasm::load(&wat::parse_str(src).unwrap()).unwrap();
    let host = HostRegistry::with_capabilities(Capabilities::all()).resolve(&module).unwrap();
    (Arc::new(module), Arc::new(host))
}

fn instance(engine: &Engine, module: &Arc<Module>, host: &Arc<harbor_wasm::HostTable>) -> Instance {
    let memory = engine.memory_for(module).unwrap();
    let state = HostState::with_io(HostConfig { seed: Some(0), ..HostConfig::default() }, IoTable::empty());
    engine.instantiate(module.clone(), memory, host.clone(), state).unwrap()
}

/// Same loop as `LOOP_SUM` but with the bound baked in, so `run` needs no setup call.
fn loop_module(n: u32) -> String {
    LOOP_SUM.replace("(global $n (mut i32) (i32.const 0))", &format!("(global $n (mut i32) (i32.const {n}))"))
}

fn bench_loop(c: &mut Criterion) {
    let engine = Engine::default();
    let mut group = c.benchmark_group("loop_sum");
    for &n in &[1_000u32, 10_000, 100_000] {
        let (module, host) = prepare(&loop_module(n));
        group.throughput(Throughput::Elements(u64::from(n)));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let mut inst = instance(&engine, &module, &host);
                let state = inst.run();
                assert!(matches!(state, TerminalState::NormalExit(_)));
                black_box(state);
            })
        });
    }
    group.finish();
}

fn bench_calls(c: &mut Criterion) {
    let engine = Engine::default();
    let (module, host) = prepare(FIB);
    c.bench_function("fib_20", |b| {
        b.iter(|| {
            let mut inst = instance(&engine, &module, &host);
            black_box(inst.run());
        })
    });
}

fn bench_load(c: &mut Criterion) {
    let bytes = wat::parse_str(FIB).unwrap();
    c.bench_function("load_fib", |b| b.iter(|| black_box(harbor_wasm::load(black_box(&bytes)).unwrap())));
}

criterion_group!(benches, bench_loop, bench_calls, bench_load);
criterion_main!(benches);
