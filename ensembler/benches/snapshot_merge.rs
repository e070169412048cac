//! Benchmarks for snapshot aggregation using criterion.
//!
//! These benchmarks measure the evaluator's hot path:
//! - Turning worker step events into deltas
//! - Folding a batch of deltas into one
//! - Merging a batch into snapshots of growing ensembles

#![allow(missing_docs)]

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ensembler::*;

const STEPS_PER_REALIZATION: usize = 5;

/// One batching interval's worth of events for an ensemble of `size`
/// realizations: a resource report from every step.
fn running_events(size: usize) -> Vec<Event> {
    (0..size)
        .flat_map(|real| {
            (0..STEPS_PER_REALIZATION).map(move |step| Event::StepRunning {
                real: Iens(real),
                step: StepId(step),
                current_memory_usage: Some(512 * 1024 * 1024),
                max_memory_usage: Some(768 * 1024 * 1024),
                cpu_seconds: Some(12.5),
                time: Utc::now(),
            })
        })
        .collect()
}

fn started_snapshot(size: usize) -> Snapshot {
    let realizations: Vec<_> = (0..size)
        .map(|i| Realization::new(i, format!("/scratch/poly/realization-{i}/iter-0")))
        .collect();
    let mut snapshot = Snapshot::from_realizations(&realizations);
    snapshot.merge(&PartialSnapshot::new().with_status(EnsembleStatus::Started));
    for real in 0..size {
        for step in 0..STEPS_PER_REALIZATION {
            let event = Event::StepStarted {
                real: Iens(real),
                step: StepId(step),
                name: format!("poly_step_{step}"),
                stdout: Some(format!("poly_step_{step}.stdout.{step}").into()),
                stderr: Some(format!("poly_step_{step}.stderr.{step}").into()),
                time: Utc::now(),
            };
            if let Some(delta) = PartialSnapshot::from_step_event(&event) {
                snapshot.merge(&delta);
            }
        }
    }
    snapshot
}

fn fold(events: &[Event]) -> PartialSnapshot {
    let mut batch = PartialSnapshot::new();
    for event in events {
        if let Some(delta) = PartialSnapshot::from_step_event(event) {
            batch.merge(&delta);
        }
    }
    batch
}

/// Benchmark: event to delta conversion.
fn bench_from_step_event(c: &mut Criterion) {
    let mut group = c.benchmark_group("from_step_event");
    let events = running_events(1);
    group.throughput(Throughput::Elements(events.len() as u64));
    group.bench_function("step_running", |b| {
        b.iter(|| {
            for event in &events {
                black_box(PartialSnapshot::from_step_event(black_box(event)));
            }
        });
    });
    group.finish();
}

/// Benchmark: folding one batch of deltas.
fn bench_fold_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("fold_batch");
    for size in [10, 100, 1000] {
        let events = running_events(size);
        group.throughput(Throughput::Elements(events.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &events, |b, events| {
            b.iter(|| black_box(fold(events)));
        });
    }
    group.finish();
}

/// Benchmark: merging a folded batch into the canonical snapshot.
///
/// The snapshot is cloned per iteration so every merge sees the same state.
fn bench_merge_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_batch");
    group.sample_size(50);
    for size in [10, 100, 1000] {
        let snapshot = started_snapshot(size);
        let batch = fold(&running_events(size));
        group.throughput(Throughput::Elements((size * STEPS_PER_REALIZATION) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
            b.iter_batched(
                || snapshot.clone(),
                |mut snapshot| {
                    black_box(snapshot.merge(black_box(batch)));
                    snapshot
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

/// Benchmark: state histogram of a large snapshot, as status reporting does.
fn bench_count_states(c: &mut Criterion) {
    let snapshot = started_snapshot(1000);
    c.bench_function("aggregate_real_states_1000", |b| {
        b.iter(|| black_box(black_box(&snapshot).aggregate_real_states()));
    });
}

criterion_group!(
    benches,
    bench_from_step_event,
    bench_fold_batch,
    bench_merge_batch,
    bench_count_states
);
criterion_main!(benches);
