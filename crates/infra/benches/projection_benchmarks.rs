use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;

use datahive_core::{CounterDeltas, DeletionDirective, SubjectRef};
use datahive_infra::index::InMemoryIndex;
use datahive_infra::task_store::InMemoryTaskStore;
use datahive_projection::{EnqueueRequest, RetryPolicy, SearchIndex, TaskStore};

fn bench_enqueue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");

    for batch in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let store = InMemoryTaskStore::new(RetryPolicy::default());
                let requests: Vec<_> = (0..batch)
                    .map(|i| EnqueueRequest::like_delta(SubjectRef::project(i as i64), 1))
                    .collect();
                black_box(store.enqueue_batch(requests).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_claim_and_complete_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_and_complete");

    for queue_depth in [100usize, 1_000] {
        group.throughput(Throughput::Elements(queue_depth as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(queue_depth),
            &queue_depth,
            |b, &queue_depth| {
                b.iter(|| {
                    let store = InMemoryTaskStore::new(RetryPolicy::default());
                    let requests: Vec<_> = (0..queue_depth)
                        .map(|i| EnqueueRequest::view_delta(SubjectRef::dataset(i as i64), 1))
                        .collect();
                    store.enqueue_batch(requests).unwrap();

                    loop {
                        let batch = store.claim_batch(Utc::now(), 100).unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        for task in batch {
                            store.mark_success(task.id).unwrap();
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_index_apply(c: &mut Criterion) {
    let subject = SubjectRef::project(1);
    let index = InMemoryIndex::new();
    index.seed(subject);
    let deltas = CounterDeltas {
        download: 1,
        like: 1,
        comment: 1,
        view: 1,
    };

    c.bench_function("index_apply", |b| {
        b.iter(|| {
            index
                .apply(
                    black_box(subject),
                    black_box(&deltas),
                    DeletionDirective::None,
                )
                .unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_enqueue_throughput,
    bench_claim_and_complete_cycle,
    bench_index_apply
);
criterion_main!(benches);
