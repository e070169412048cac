//! Benchmarks for the length-prefixed wire codec using criterion.
//!
//! These benchmarks measure the performance of:
//! - Encoding worker step events and snapshot updates into frames
//! - Decoding frames back from a receive buffer
//! - Encoding a full snapshot, the largest frame a monitor receives

#![allow(missing_docs)]

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use ensembler::protocol::{decode_frame, encode_frame, DEFAULT_MAX_FRAME_BYTES};
use ensembler::*;

fn step_frame(seq: u64) -> Frame {
    Frame::Event {
        seq,
        event: Event::StepEnded {
            real: Iens(17),
            step: StepId(3),
            exit_code: 0,
            error: None,
            cpu_seconds: Some(81.25),
            max_memory_usage: Some(1_073_741_824),
            time: Utc::now(),
        },
    }
}

fn full_snapshot_frame(size: usize) -> Frame {
    let realizations: Vec<_> = (0..size)
        .map(|i| Realization::new(i, format!("/scratch/poly/realization-{i}/iter-0")))
        .collect();
    let mut snapshot = Snapshot::from_realizations(&realizations);
    for real in 0..size {
        for step in 0..4 {
            let event = Event::StepStarted {
                real: Iens(real),
                step: StepId(step),
                name: format!("poly_step_{step}"),
                stdout: Some(format!("poly_step_{step}.stdout.{step}").into()),
                stderr: None,
                time: Utc::now(),
            };
            if let Some(delta) = PartialSnapshot::from_step_event(&event) {
                snapshot.merge(&delta);
            }
        }
    }
    Frame::Event {
        seq: 1,
        event: Event::FullSnapshot {
            iteration: 0,
            snapshot,
        },
    }
}

/// Benchmark: encoding frames.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");

    let step = step_frame(42);
    let encoded = encode_frame(&step, DEFAULT_MAX_FRAME_BYTES).expect("encode should succeed");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("step_ended", |b| {
        b.iter(|| {
            let buf = encode_frame(black_box(&step), DEFAULT_MAX_FRAME_BYTES)
                .expect("encode should succeed");
            black_box(buf);
        });
    });

    let full = full_snapshot_frame(500);
    let encoded = encode_frame(&full, DEFAULT_MAX_FRAME_BYTES).expect("encode should succeed");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("full_snapshot_500", |b| {
        b.iter(|| {
            let buf = encode_frame(black_box(&full), DEFAULT_MAX_FRAME_BYTES)
                .expect("encode should succeed");
            black_box(buf);
        });
    });

    group.finish();
}

/// Benchmark: decoding a receive buffer holding many frames back to back.
fn bench_decode_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frame");

    let mut stream = Vec::new();
    for seq in 1..=256 {
        let frame = encode_frame(&step_frame(seq), DEFAULT_MAX_FRAME_BYTES)
            .expect("encode should succeed");
        stream.extend(frame);
    }
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("step_ended_x256", |b| {
        b.iter(|| {
            let mut offset = 0;
            while let Some((frame, used)) =
                decode_frame(black_box(&stream[offset..]), DEFAULT_MAX_FRAME_BYTES)
                    .expect("decode should succeed")
            {
                black_box(frame);
                offset += used;
            }
            assert_eq!(offset, stream.len());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode_stream);
criterion_main!(benches);
