//! Benchmark suite for ralph-fleet subsystems.
//!
//! This module provides performance benchmarks for:
//! - Control processing (metrics, gain scheduling and alarms per iteration)
//! - Lease acquisition and release on the local filesystem
//! - Registry registration under the lease
//! - Checkpoint creation with zstd compression
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//!
//! # Save baseline for comparison
//! cargo bench -- --save-baseline main
//!
//! # Compare against baseline
//! cargo bench -- --baseline main
//! ```
//!
//! Criterion writes JSON estimates and HTML reports to `target/criterion/`.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

use ralph_fleet::control::{ControlConfig, ControlLoop, IterationOutcome, ProfileKind};
use ralph_fleet::lock::{FileLeaseLock, Holder, LeaseLock, LockConfig};
use ralph_fleet::{Fleet, FleetConfig, LoopConfig, LoopRecord, MockGitOperations, MockProcessProbe};

// ============================================================================
// Control Benchmarks
// ============================================================================

/// Time to process one iteration outcome, warmed to a given history length.
fn bench_control_process(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_process");
    let record = LoopRecord::new("bench-000000", &LoopConfig::new("bench").with_max_iterations(500));

    for history in [0usize, 10, 50] {
        let mut controller = ControlLoop::new(ControlConfig::default(), ProfileKind::Standard);
        for i in 0..history {
            let completion = (i as f64 / 60.0).min(0.95);
            controller.process(&IterationOutcome::new(completion, 0.9), &record);
        }

        group.bench_with_input(BenchmarkId::new("warm", history), &history, |b, _| {
            b.iter_batched(
                || controller.clone(),
                |mut controller| {
                    black_box(controller.process(black_box(&IterationOutcome::new(0.5, 0.85)), &record))
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

// ============================================================================
// Coordination Benchmarks
// ============================================================================

/// Uncontended lease acquire plus release.
fn bench_lease_cycle(c: &mut Criterion) {
    let temp = TempDir::new().expect("temp dir");
    let resource = temp.path().join("bench.json");
    let probe = Arc::new(MockProcessProbe::new().with_alive(&[std::process::id()]));
    let lock = FileLeaseLock::new(LockConfig::default(), probe);
    let holder = Holder::current("bench");

    c.bench_function("lease_acquire_release", |b| {
        b.iter(|| {
            let lease = lock
                .try_acquire(&resource, &holder, Duration::from_secs(30))
                .expect("acquire");
            black_box(&lease);
            lock.release(&resource, &holder).expect("release");
        });
    });
}

/// Creating loops into registries that already hold `n` entries.
fn bench_registry_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_register");

    for existing in [0usize, 16, 64] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("create_loop", existing),
            &existing,
            |b, &existing| {
                b.iter_batched(
                    || {
                        let temp = TempDir::new().expect("temp dir");
                        let probe = MockProcessProbe::new().with_alive(&[std::process::id()]);
                        let fleet = Fleet::with_components(
                            temp.path(),
                            FleetConfig::default().with_max_concurrent_loops(existing + 1),
                            Arc::new(probe),
                            Arc::new(MockGitOperations::new()),
                        )
                        .expect("fleet");
                        for i in 0..existing {
                            fleet
                                .registry()
                                .register(
                                    ralph_fleet::RegistryEntry::from_record(&LoopRecord::new(
                                        format!("seed-{i}"),
                                        &LoopConfig::new("seed"),
                                    )),
                                    false,
                                )
                                .expect("seed");
                        }
                        (fleet, temp)
                    },
                    |(fleet, _temp)| black_box(fleet.create_loop(&LoopConfig::new("bench"))),
                    criterion::BatchSize::PerIteration,
                );
            },
        );
    }

    group.finish();
}

// ============================================================================
// Checkpoint Benchmarks
// ============================================================================

/// Checkpoint creation for records carrying growing learning lists.
fn bench_checkpoint_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_create");

    for learnings in [0usize, 100, 1000] {
        let temp = TempDir::new().expect("temp dir");
        let fleet = Fleet::with_components(
            temp.path(),
            FleetConfig::default(),
            Arc::new(MockProcessProbe::new().with_alive(&[std::process::id()])),
            Arc::new(MockGitOperations::new().with_commit_hash("abc123")),
        )
        .expect("fleet");
        let mut record = fleet.create_loop(&LoopConfig::new("ckpt")).expect("create");
        for i in 0..learnings {
            record.add_learning(format!("learning number {i} about the codebase"));
        }

        group.bench_with_input(BenchmarkId::new("learnings", learnings), &record, |b, record| {
            b.iter(|| black_box(fleet.checkpoints().create(record).expect("checkpoint")));
        });
    }

    group.finish();
}

criterion_group!(control_benches, bench_control_process);

criterion_group!(
    coordination_benches,
    bench_lease_cycle,
    bench_registry_register
);

criterion_group!(checkpoint_benches, bench_checkpoint_create);

criterion_main!(control_benches, coordination_benches, checkpoint_benches);
