//! Benchmarks for execution grid sizing

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use veda_cl::dispatch::{grid_1d, grid_2d, grid_3d};

const LIMITS: [usize; 3] = [1024, 1024, 64];

fn bench_grid_1d(c: &mut Criterion) {
    let mut group = c.benchmark_group("grid_1d");
    for problem in [1usize, 1000, 1 << 20] {
        group.bench_with_input(BenchmarkId::from_parameter(problem), &problem, |b, &n| {
            b.iter(|| grid_1d(black_box(n), black_box(256), LIMITS).ok());
        });
    }
    group.finish();
}

fn bench_grid_2d(c: &mut Criterion) {
    c.bench_function("grid_2d_1080p", |b| {
        b.iter(|| grid_2d(black_box([1920, 1080]), black_box(256), LIMITS).ok());
    });
}

fn bench_grid_3d(c: &mut Criterion) {
    c.bench_function("grid_3d_volume", |b| {
        b.iter(|| grid_3d(black_box([256, 256, 256]), black_box(1000), LIMITS).ok());
    });
}

criterion_group!(benches, bench_grid_1d, bench_grid_2d, bench_grid_3d);
criterion_main!(benches);
