use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::thread;

use payrun_core::{BatchId, EmployeeId, TenantId, WorkerId};
use payrun_infra::external::artifacts::InMemoryArtifactStore;
use payrun_infra::external::render::InMemoryRenderEngine;
use payrun_infra::queue_store::{InMemoryQueueStore, QueueStore};
use payrun_infra::worker::GenerationWorker;
use payrun_payroll::{QueueItem, RetryPolicy, Run};

fn seed_queue(employees: usize) -> (Arc<InMemoryQueueStore>, TenantId) {
    let store = InMemoryQueueStore::arc();
    let tenant = TenantId::new();
    let run = Run::new(tenant, BatchId::new(), employees as u64, 1);
    let run_id = run.id;
    let items: Vec<QueueItem> = (0..employees)
        .map(|_| QueueItem::new(tenant, run_id, EmployeeId::new(), 1, 3))
        .collect();
    store.create_run(run, items).unwrap();
    (store, tenant)
}

fn bench_claim_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_batch");

    for &batch_size in &[1usize, 10, 50] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter_batched(
                    || seed_queue(batch_size),
                    |(store, tenant)| {
                        let claimed = store
                            .claim_batch(Some(tenant), WorkerId::new(), batch_size)
                            .unwrap();
                        black_box(claimed)
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

fn bench_contended_claims(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_claims");
    group.sample_size(20);

    // Four claimants racing over one queue; measures the linearizable claim
    // under contention.
    group.bench_function("4_workers_200_items", |b| {
        b.iter_batched(
            || seed_queue(200),
            |(store, tenant)| {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        let store = store.clone();
                        thread::spawn(move || {
                            let worker = WorkerId::new();
                            let mut claimed = 0;
                            loop {
                                let batch =
                                    store.claim_batch(Some(tenant), worker, 10).unwrap();
                                if batch.is_empty() {
                                    break;
                                }
                                claimed += batch.len();
                            }
                            claimed
                        })
                    })
                    .collect();
                let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
                assert_eq!(total, 200);
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_full_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("worker_cycle");
    group.throughput(Throughput::Elements(50));

    group.bench_function("claim_render_store_50", |b| {
        b.iter_batched(
            || {
                let (store, tenant) = seed_queue(50);
                let worker = GenerationWorker::new(
                    store,
                    Arc::new(InMemoryRenderEngine::new()),
                    Arc::new(InMemoryArtifactStore::new()),
                )
                .with_retry_policy(RetryPolicy::default());
                (worker, tenant)
            },
            |(worker, tenant)| {
                let outcome = worker.run_cycle(Some(tenant), 50).unwrap();
                assert_eq!(outcome.succeeded, 50);
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_claim_throughput,
    bench_contended_claims,
    bench_full_cycle
);
criterion_main!(benches);
