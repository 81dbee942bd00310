//! Benchmarks for per-dispatch bookkeeping on the host driver

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use veda_cl::prelude::*;

fn bench_fill_dispatch(c: &mut Criterion) {
    let rt = Runtime::new(Config::default()).unwrap();
    let buffer = rt.create_buffer(MemFlags::default(), 4096, None).unwrap();

    c.bench_function("fill_u32_dispatch", |b| {
        b.iter(|| {
            rt.fill_u32(buffer, black_box(7), 1024).unwrap();
        });
    });
    rt.finish().unwrap();
}

fn bench_bind_only(c: &mut Criterion) {
    let rt = Runtime::new(Config::default()).unwrap();
    let buffer = rt.create_buffer(MemFlags::default(), 64, None).unwrap();
    let kernel = rt.kernel_id("vcl.fill_u32").unwrap();

    c.bench_function("bind_three_arguments", |b| {
        b.iter(|| {
            rt.bind_buffer(kernel, 0, buffer).unwrap();
            rt.bind_scalar(kernel, 1, black_box(1u32)).unwrap();
            rt.bind_scalar(kernel, 2, black_box(16u32)).unwrap();
        });
    });
}

fn bench_read_back_dispatch(c: &mut Criterion) {
    let rt = Runtime::new(Config::default()).unwrap();
    let host = HostMemory::zeroed(4096);
    let flags = MemFlags::default().with_read_back();
    let buffer = rt.create_buffer(flags, 4096, Some(host)).unwrap();

    c.bench_function("fill_with_read_back", |b| {
        b.iter(|| {
            rt.fill_u32(buffer, black_box(3), 1024).unwrap();
        });
    });
}

criterion_group!(benches, bench_fill_dispatch, bench_bind_only, bench_read_back_dispatch);
criterion_main!(benches);
