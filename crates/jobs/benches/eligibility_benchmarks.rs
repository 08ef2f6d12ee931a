use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use jobmill_jobs::storage::{CachedJobStorage, InMemoryJobDatabase, JobStorage};
use jobmill_jobs::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};

const BACKLOG_SIZES: [usize; 3] = [100, 1_000, 10_000];

fn spec(i: usize) -> JobSpec {
    JobSpec {
        id: format!("job-{i}"),
        factory_key: format!("factory-{}", i % 8),
        // A third of the backlog is queue-less; the rest is spread over 50 queues.
        queue_key: (i % 3 != 0).then(|| format!("queue-{}", i % 50)),
        create_time: i as i64,
        last_run_attempt_time: 0,
        next_backoff_interval: 0,
        run_attempt: 0,
        max_attempts: Some(1),
        max_instances_for_factory: None,
        max_instances_for_queue: None,
        lifespan: None,
        serialized_data: None,
        serialized_input_data: None,
        is_running: false,
        is_memory_only: false,
        initial_delay: 0,
        global_priority: (i % 3) as i32 - 1,
        queue_priority: 0,
    }
}

/// Every fifth job waits on the job before it.
fn backlog(size: usize) -> Vec<FullSpec> {
    (0..size)
        .map(|i| {
            let mut full = FullSpec::new(spec(i));
            if i % 5 == 4 {
                full.dependency_specs.push(DependencySpec {
                    job_id: format!("job-{i}"),
                    depends_on_job_id: format!("job-{}", i - 1),
                    is_within_queue: false,
                    is_memory_only: false,
                });
            }
            full
        })
        .collect()
}

fn storage_with(size: usize) -> CachedJobStorage<InMemoryJobDatabase> {
    let storage = CachedJobStorage::new(InMemoryJobDatabase::new());
    storage.init().unwrap();
    storage.insert_jobs(backlog(size)).unwrap();
    storage
}

fn bench_next_eligible_job(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_eligible_job");

    for size in BACKLOG_SIZES {
        let storage = storage_with(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &storage, |b, storage| {
            b.iter(|| {
                storage.get_next_eligible_job(
                    black_box(i64::MAX / 2),
                    &|_: &[ConstraintSpec]| true,
                    &|_: &JobSpec| true,
                )
            });
        });
    }

    group.finish();
}

fn bench_eligible_job_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("eligible_job_count");

    for size in BACKLOG_SIZES {
        let storage = storage_with(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &storage, |b, storage| {
            b.iter(|| storage.get_eligible_job_count(black_box(i64::MAX / 2)));
        });
    }

    group.finish();
}

fn bench_claim_and_complete(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_and_complete");
    group.sample_size(20);

    // Drains a 1k backlog the way runners do: pick, mark running, delete.
    group.bench_function("drain_1000", |b| {
        b.iter_with_setup(
            || storage_with(1_000),
            |storage| {
                let now = i64::MAX / 2;
                while let Some(next) =
                    storage.get_next_eligible_job(now, &|_: &[ConstraintSpec]| true, &|_: &JobSpec| true)
                {
                    storage.mark_job_as_running(&next.id, now).unwrap();
                    storage.delete_job(&next.id).unwrap();
                }
            },
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_next_eligible_job,
    bench_eligible_job_count,
    bench_claim_and_complete,
);
criterion_main!(benches);
