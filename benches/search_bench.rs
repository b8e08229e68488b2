//! Benchmarks for pipeline queries

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image_retrieval::{
    CollectionManager, CollectionSchema, EngineConfig, Norm, RetrievalPipeline, Vector,
};

fn create_random_vectors(n: usize, dim: usize) -> Vec<Vector> {
    (0..n)
        .map(|_| {
            let data: Vec<f32> = (0..dim).map(|_| rand::random::<f32>() + 0.01).collect();
            Vector::new(data)
        })
        .collect()
}

fn benchmark_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_query");

    for size in [1_000, 10_000].iter() {
        let manager = Arc::new(CollectionManager::open(EngineConfig::default()).unwrap());
        manager
            .create(
                "bench",
                CollectionSchema::new(128).with_norm(Norm::L2).with_nlist(64),
            )
            .unwrap();
        let pipeline = RetrievalPipeline::new(Arc::clone(&manager));

        let items = create_random_vectors(*size, 128)
            .into_iter()
            .enumerate()
            .map(|(i, v)| (format!("img{i}.jpg"), v))
            .collect();
        pipeline.ingest("bench", items).unwrap();
        pipeline.build_and_load("bench").unwrap();

        let queries = create_random_vectors(16, 128);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                pipeline
                    .query(black_box("bench"), black_box(&queries), black_box(10), None)
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_query);
criterion_main!(benches);
