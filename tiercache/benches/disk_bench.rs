use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use tiercache::{DiskConfig, DiskStorage, MemoryAttributes};

fn open(dir: &std::path::Path, capacity: u64) -> DiskStorage {
    let config = DiskConfig::new(dir).with_capacity(capacity);
    DiskStorage::open(&config, Arc::new(MemoryAttributes::new())).unwrap()
}

fn bench_disk_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("disk_put");

    for size in [1024usize, 64 * 1024] {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = open(dir.path(), u64::MAX / 2);
        let payload = vec![0xabu8; size];
        let mut i = 0u64;

        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                i += 1;
                storage
                    .put(black_box(&format!("key{}", i % 256)), payload)
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn bench_disk_get(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = open(dir.path(), u64::MAX / 2);
    for i in 0..256 {
        storage.put(&format!("key{}", i), &[1u8; 4096]).unwrap();
    }
    let mut i = 0u64;

    c.bench_function("disk_get_4k", |b| {
        b.iter(|| {
            i += 1;
            black_box(storage.get(&format!("key{}", i % 256)).unwrap());
        });
    });
}

fn bench_disk_sweep(c: &mut Criterion) {
    c.bench_function("disk_sweep_1000_entries", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let mut storage = open(dir.path(), 1000 * 512);
                for i in 0..1000 {
                    storage.put(&format!("key{}", i), &[2u8; 1024]).unwrap();
                }
                (dir, storage)
            },
            |(_dir, mut storage)| {
                black_box(storage.cleanup().unwrap());
            },
            BatchSize::PerIteration,
        );
    });
}

criterion_group!(benches, bench_disk_put, bench_disk_get, bench_disk_sweep);
criterion_main!(benches);
