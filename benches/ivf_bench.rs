//! IVF vs exhaustive search benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image_retrieval::{FlatIndex, Index, IvfIndex, KMeansParams, Metric, Vector};

fn create_random_vectors(n: usize, dim: usize) -> Vec<Vector> {
    (0..n)
        .map(|_| {
            let data: Vec<f32> = (0..dim).map(|_| rand::random::<f32>()).collect();
            Vector::new(data)
        })
        .collect()
}

fn benchmark_ivf_vs_flat(c: &mut Criterion) {
    let mut group = c.benchmark_group("ivf_vs_flat");
    group.sample_size(20);

    for &size in &[1_000, 10_000] {
        let dim = 128;
        let nlist = 64;
        let vectors = create_random_vectors(size, dim);
        let query = Vector::new(vec![0.5; dim]);

        let mut flat = FlatIndex::new(Metric::InnerProduct);
        let mut ivf = IvfIndex::new(dim, Metric::InnerProduct);
        for v in &vectors {
            let id = ivf.insert(v.clone()).unwrap();
            flat.add(id, v.clone()).unwrap();
        }
        ivf.build_index(nlist, &KMeansParams::default(), None).unwrap();

        group.bench_with_input(BenchmarkId::new("flat", size), &size, |b, _| {
            b.iter(|| flat.search(black_box(&query), black_box(10)).unwrap());
        });

        for nprobe in [1, 8, 38] {
            group.bench_with_input(
                BenchmarkId::new(format!("ivf_nprobe_{nprobe}"), size),
                &size,
                |b, _| {
                    b.iter(|| {
                        ivf.search(black_box(&query), black_box(10), black_box(nprobe))
                            .unwrap()
                    });
                },
            );
        }
    }

    group.finish();
}

fn benchmark_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("ivf_build");
    group.sample_size(10);

    let dim = 64;
    let vectors = create_random_vectors(5_000, dim);
    for &nlist in &[16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(nlist), &nlist, |b, &nlist| {
            b.iter(|| {
                let mut ivf = IvfIndex::new(dim, Metric::L2);
                for v in &vectors {
                    ivf.insert(v.clone()).unwrap();
                }
                ivf.build_index(nlist, &KMeansParams::default(), None).unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_ivf_vs_flat, benchmark_build);
criterion_main!(benches);
