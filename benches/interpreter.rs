//! End-to-end interpreter benchmarks: full compile + run of small
//! programs.
//!
//! Run with:
//!   cargo bench --bench interpreter

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use wick::{HeapSettings, InterpretResult, Vm};

fn run(source: &str) {
    let mut vm = Vm::with_output(HeapSettings::default(), Box::new(std::io::sink()));
    assert_eq!(vm.interpret(black_box(source)), InterpretResult::Ok);
}

fn bench_fib(c: &mut Criterion) {
    c.bench_function("fib 15", |b| {
        b.iter(|| {
            run("fun fib(n) { if (n < 2) return n; return fib(n - 2) + fib(n - 1); } fib(15);")
        })
    });
}

fn bench_string_churn(c: &mut Criterion) {
    c.bench_function("string churn", |b| {
        b.iter(|| {
            run("var s = \"\"; for (var i = 0; i < 200; i = i + 1) { s = s + \"chunk\"; }")
        })
    });
}

fn bench_instances(c: &mut Criterion) {
    c.bench_function("instance churn", |b| {
        b.iter(|| {
            run("class Point { init(x, y) { this.x = x; this.y = y; } \
                   sum() { return this.x + this.y; } } \
                 var total = 0; \
                 for (var i = 0; i < 200; i = i + 1) { \
                   total = total + Point(i, i).sum(); \
                 }")
        })
    });
}

fn bench_closures(c: &mut Criterion) {
    c.bench_function("closure counters", |b| {
        b.iter(|| {
            run("fun counter() { var n = 0; fun tick() { n = n + 1; return n; } return tick; } \
                 var tick = counter(); \
                 for (var i = 0; i < 500; i = i + 1) { tick(); }")
        })
    });
}

criterion_group!(
    benches,
    bench_fib,
    bench_string_churn,
    bench_instances,
    bench_closures
);
criterion_main!(benches);
