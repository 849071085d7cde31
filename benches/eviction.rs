//! Performance benchmarks for batch planning and eviction.
//!
//! Run with: `cargo bench --bench eviction`
//!
//! ## Performance Targets
//!
//! | Operation | Target | Notes |
//! |-----------|--------|-------|
//! | Batch plan, 10k ids | <1ms | Runs once per sequence fetch |
//! | Eviction pass, 10k images | <10ms | Runs on the caller's thread |

use criterion::{
    black_box, criterion_group, criterion_main,
    BatchSize, BenchmarkId, Criterion, Throughput,
};

use imagery_graph::{
    BatchPlanner, CellId, CoreImage, EvictionManager, GraphConfiguration, ImageId, KeepSet,
    LngLat, SequenceId, Stores,
};

fn make_ids(n: usize) -> Vec<ImageId> {
    (0..n).map(|i| ImageId::new(format!("img_{i:06}"))).collect()
}

/// Stores holding `n` core images spread over cells of 100 images each.
fn make_stores(n: usize) -> Stores {
    let mut stores = Stores::default();
    for (i, id) in make_ids(n).into_iter().enumerate() {
        let cell = CellId::new(format!("0:{}", i / 100));
        stores.nodes.insert_core(CoreImage {
            id: id.clone(),
            position: LngLat::new(0.0, 0.0),
            sequence_id: SequenceId::new(format!("seq_{}", i / 500)),
        });
        stores.cells.populate(&cell, [id]);
    }
    stores
}

/// Benchmark planning with and without a reference image.
fn bench_batch_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_plan");
    let planner = BatchPlanner::default();

    for size in [201, 2_000, 10_000] {
        let ids = make_ids(size);
        let reference = ids[size / 2].clone();
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("no_reference", size), &ids, |b, ids| {
            b.iter(|| planner.plan(black_box(ids), None))
        });
        group.bench_with_input(BenchmarkId::new("centered_reference", size), &ids, |b, ids| {
            b.iter(|| planner.plan(black_box(ids), Some(&reference)))
        });
    }

    group.finish();
}

/// Benchmark a full eviction pass over pre-stored images and cells.
fn bench_eviction_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction_pass");
    let manager = EvictionManager::new(&GraphConfiguration::default());

    for size in [1_000, 10_000] {
        let keep = KeepSet::new(make_ids(size).into_iter().take(10));
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || make_stores(size),
                |mut stores| manager.evict(&mut stores, &keep),
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_batch_plan, bench_eviction_pass);
criterion_main!(benches);
