//! Benchmarks for item ledger and progress bookkeeping

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use media_jobs_core::{
    ItemLedger, ItemOutcome, JobParameters, ProcessingJobType, ResumableProcessingState,
    StageTracker,
};
use uuid::Uuid;

fn item_ids(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("image-{:08}", i)).collect()
}

fn benchmark_ledger_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_record");
    for count in [1_000usize, 10_000, 100_000] {
        let ids = item_ids(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &ids, |b, ids| {
            b.iter(|| {
                let mut ledger = ItemLedger::new();
                for (i, id) in ids.iter().enumerate() {
                    let outcome = if i % 10 == 0 {
                        ItemOutcome::Failed
                    } else {
                        ItemOutcome::Processed
                    };
                    ledger.record(black_box(id), outcome);
                }
                ledger
            });
        });
    }
    group.finish();
}

fn benchmark_ledger_serialization(c: &mut Criterion) {
    let mut ledger = ItemLedger::new();
    for id in item_ids(10_000) {
        ledger.record(&id, ItemOutcome::Processed);
    }

    c.bench_function("ledger_to_json", |b| {
        b.iter(|| serde_json::to_string(black_box(&ledger)))
    });

    let json = serde_json::to_string(&ledger).unwrap();
    c.bench_function("ledger_from_json", |b| {
        b.iter(|| serde_json::from_str::<ItemLedger>(black_box(&json)))
    });
}

fn benchmark_resumable_increments(c: &mut Criterion) {
    let ids = item_ids(10_000);

    c.bench_function("resumable_increment_completed", |b| {
        b.iter(|| {
            let mut state = ResumableProcessingState::new(
                Uuid::new_v4(),
                ProcessingJobType::Thumbnail,
                Uuid::new_v4(),
                ids.len() as u64,
                JobParameters::default(),
            );
            state.start().unwrap();
            for id in &ids {
                state.increment_completed(black_box(id), 4096).unwrap();
            }
            state.get_progress()
        });
    });
}

fn benchmark_stage_aggregation(c: &mut Criterion) {
    let mut tracker = StageTracker::new();
    for name in ["scan", "metadata", "thumbnail", "cache", "index"] {
        tracker.add_stage(name, 1_000).unwrap();
        tracker.start_stage(name).unwrap();
        tracker.update_stage_progress(name, 500, 1_000).unwrap();
    }

    c.bench_function("stage_overall_progress", |b| {
        b.iter(|| black_box(&tracker).overall_progress())
    });
}

criterion_group!(
    benches,
    benchmark_ledger_record,
    benchmark_ledger_serialization,
    benchmark_resumable_increments,
    benchmark_stage_aggregation
);

criterion_main!(benches);
