//! Microbenchmarks for the ingestion path.
//!
//! Measures `Registry::update` latency by tier count, and the cost of
//! parsing and executing a full TCP statement.
//!
//! Run with: `cargo bench -p rrdb -- update`

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rrdb::{Engine, Registry, RegistryOptions};
use tempfile::tempdir;

const BASE_TS: u64 = 1_700_000_000;

const POLICIES: [(&str, &str); 3] = [
    ("1_tier", "1 sec for 10 mins"),
    ("3_tiers", "1 sec for 10 mins, 10 secs for 6 hours, 5 mins for 7 days"),
    (
        "5_tiers",
        "1 sec for 10 mins, 10 secs for 6 hours, 1 min for 1 day, 5 mins for 7 days, 1 hour for 1 year",
    ),
];

/// Creates a registry holding one metric named `bench`.
fn setup_registry(policy: &str) -> (Registry, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let registry =
        Registry::open(temp_dir.path().join("bench_data"), RegistryOptions::default()).unwrap();
    registry.create("bench", policy).unwrap();
    (registry, temp_dir)
}

fn bench_update_by_tiers(c: &mut Criterion) {
    let mut group = c.benchmark_group("update/tiers");

    for (label, policy) in POLICIES {
        let (registry, _dir) = setup_registry(policy);
        let mut ts = BASE_TS;

        group.bench_with_input(BenchmarkId::from_parameter(label), &policy, |b, _| {
            b.iter(|| {
                ts += 1;
                registry
                    .update(black_box("bench"), black_box(ts), black_box(42.5))
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn bench_update_same_bucket(c: &mut Criterion) {
    let (registry, _dir) = setup_registry(POLICIES[1].1);

    c.bench_function("update/same_bucket", |b| {
        b.iter(|| {
            registry
                .update(black_box("bench"), black_box(BASE_TS), black_box(1.0))
                .unwrap();
        });
    });
}

fn bench_update_statement(c: &mut Criterion) {
    let (registry, _dir) = setup_registry(POLICIES[1].1);
    let engine = Engine::new(registry);
    let mut ts = BASE_TS;

    c.bench_function("update/tcp_statement", |b| {
        b.iter(|| {
            ts += 1;
            let statement = format!("UPDATE 'bench' ADD 99.9 AT {ts};");
            black_box(engine.handle_tcp(black_box(&statement)));
        });
    });
}

criterion_group!(
    benches,
    bench_update_by_tiers,
    bench_update_same_bucket,
    bench_update_statement,
);
criterion_main!(benches);
