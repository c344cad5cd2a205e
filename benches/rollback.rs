//! Rollback latency benchmark.
//!
//! The state swap inside `rollback` has a soft <10ms target. It is a
//! benchmarked goal, not an enforced invariant; this bench is how it gets
//! checked.

use aegis::{StateManager, StaticResourceReader};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::Value;
use std::sync::Arc;

fn populated_manager(keys: usize) -> StateManager {
    let reader = Arc::new(StaticResourceReader::new(100, 1000));
    let manager = StateManager::new(16, reader);
    for i in 0..keys {
        manager.set_state(format!("key-{}", i), Value::from(i as u64));
    }
    manager
}

fn bench_rollback(c: &mut Criterion) {
    let mut group = c.benchmark_group("rollback");

    for keys in [16usize, 256, 4096] {
        let manager = populated_manager(keys);
        let snapshot = manager.capture_snapshot("bench");

        group.bench_with_input(BenchmarkId::from_parameter(keys), &keys, |b, _| {
            b.iter(|| {
                manager.set_state("key-0", Value::from(u64::MAX));
                manager.rollback(&snapshot).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_capture(c: &mut Criterion) {
    let mut group = c.benchmark_group("capture_snapshot");

    for keys in [16usize, 256, 4096] {
        let manager = populated_manager(keys);

        group.bench_with_input(BenchmarkId::from_parameter(keys), &keys, |b, _| {
            b.iter(|| manager.capture_snapshot("bench"));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_rollback, bench_capture);
criterion_main!(benches);
