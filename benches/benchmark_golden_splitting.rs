use criterion::{black_box, criterion_group, criterion_main, Criterion};
use geo::polygon;

use border_partitioner::partition::{golden_splitting, Adjacency, Subregion};

fn sq(x0: f64, y0: f64, x1: f64, y1: f64) -> geo::MultiPolygon<f64> {
    geo::MultiPolygon::new(vec![polygon![
        (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0),
    ]])
}

fn chain_of(n: i64) -> (Vec<Subregion>, Adjacency) {
    let subregions: Vec<Subregion> = (0..n)
        .map(|i| Subregion { id: i + 1, geom: sq(i as f64, 0.0, i as f64 + 1.0, 1.0), size_kb: 5.0 })
        .collect();
    let mut adjacency: Adjacency = Adjacency::default();
    for i in 0..n - 1 {
        adjacency.insert((i + 1, i + 2), 10.0);
    }
    (subregions, adjacency)
}

fn benchmark_golden_splitting(_c: &mut Criterion) {
    let (subregions, adjacency) = chain_of(100);
    let mut criterion = Criterion::default().sample_size(50);

    criterion.bench_function("golden_splitting_chain_100", |b| {
        b.iter(|| {
            let result = golden_splitting(black_box(&subregions), black_box(&adjacency), black_box(1_000.0));
            black_box(result);
        })
    });
}

criterion_group!(benches, benchmark_golden_splitting);
criterion_main!(benches);
