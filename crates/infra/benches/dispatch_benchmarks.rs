use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use jobforge_core::{JobFailure, JobPayload, NewJob, RetryPolicy};
use jobforge_infra::jobs::{HandlerRegistry, JobService, ProgressReporter};
use jobforge_infra::log_store::InMemoryJobLogStore;
use jobforge_infra::store::InMemoryJobStore;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;

type BenchService = JobService<Arc<InMemoryJobStore>, Arc<InMemoryJobLogStore>>;

fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("noop", |payload: &JobPayload, _: &ProgressReporter<'_>| {
            Ok(json!({ "n": payload.as_value()["n"] }))
        })
        .unwrap();
    registry
        .register("progress", |_: &JobPayload, progress: &ProgressReporter<'_>| {
            for step in 1..=4 {
                progress.update(step * 25, None);
            }
            Ok(JsonValue::Null)
        })
        .unwrap();
    registry
        .register("fails", |_: &JobPayload, _: &ProgressReporter<'_>| -> Result<JsonValue, JobFailure> {
            Err(JobFailure::new("always"))
        })
        .unwrap();
    registry
}

fn seeded(job_type: &str, jobs: usize, max_concurrent: usize) -> BenchService {
    let service = JobService::new(InMemoryJobStore::arc(), InMemoryJobLogStore::arc(), registry())
        .with_retry_policy(RetryPolicy::default())
        .with_max_concurrent(max_concurrent);
    let batch = (0..jobs)
        .map(|n| NewJob::new(job_type, format!("job {n}"), json!({ "n": n })))
        .collect();
    service.create_jobs(batch).unwrap();
    service
}

fn bench_create_jobs(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_jobs");

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                let service =
                    JobService::new(InMemoryJobStore::arc(), InMemoryJobLogStore::arc(), registry());
                b.iter(|| {
                    let batch = (0..batch_size)
                        .map(|n| NewJob::new("noop", "bench", json!({ "n": n })))
                        .collect();
                    black_box(service.create_jobs(batch).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn bench_dispatch_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_throughput");

    for job_type in ["noop", "progress", "fails"] {
        for batch_size in [10usize, 100] {
            group.throughput(Throughput::Elements(batch_size as u64));
            group.bench_with_input(
                BenchmarkId::new(job_type, batch_size),
                &batch_size,
                |b, &batch_size| {
                    b.iter_batched(
                        || seeded(job_type, batch_size, 1),
                        |service| black_box(service.process_jobs_at(Utc::now(), batch_size).unwrap()),
                        BatchSize::SmallInput,
                    );
                },
            );
        }
    }

    group.finish();
}

fn bench_concurrent_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_dispatch");
    group.throughput(Throughput::Elements(200));

    for workers in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.iter_batched(
                || seeded("progress", 200, workers),
                |service| black_box(service.process_jobs_at(Utc::now(), 200).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_create_jobs,
    bench_dispatch_throughput,
    bench_concurrent_dispatch
);
criterion_main!(benches);
