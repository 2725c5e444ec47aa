use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use tiercache::{CleanupConfig, DiskConfig, TierCache};

fn no_timer() -> CleanupConfig {
    CleanupConfig {
        enabled: false,
        interval_secs: 60,
    }
}

fn bench_memory_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cache: TierCache<Vec<u8>> = rt.block_on(async {
        let cache = TierCache::builder(DiskConfig::new(dir.path()))
            .cleanup(no_timer())
            .build()
            .unwrap();
        cache.put_data("hot", vec![1u8; 1024], 1024, vec![1u8; 1024]);
        cache.flush().await.unwrap();
        cache
    });

    c.bench_function("tier_get_memory_hit", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(cache.get("hot", Some, |v| v.len() as u64).await);
        });
    });
}

fn bench_disk_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cache: TierCache<Vec<u8>> = rt.block_on(async {
        let cache = TierCache::builder(DiskConfig::new(dir.path()))
            .without_memory()
            .cleanup(no_timer())
            .build()
            .unwrap();
        cache.put_data("cold", Vec::new(), 0, vec![2u8; 16 * 1024]);
        cache.flush().await.unwrap();
        cache
    });

    c.bench_function("tier_get_disk_hit_16k", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(cache.get("cold", Some, |_| 0).await);
        });
    });
}

fn bench_put_and_flush(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cache: TierCache<Vec<u8>> = rt.block_on(async {
        TierCache::builder(DiskConfig::new(dir.path()))
            .cleanup(no_timer())
            .build()
            .unwrap()
    });

    c.bench_function("tier_put_encoded_flush", |b| {
        b.to_async(&rt).iter(|| async {
            cache.put_encoded("k", vec![3u8; 4096], 4096, |v| Some(v.clone()));
            cache.flush().await.unwrap();
        });
    });
}

criterion_group!(benches, bench_memory_hit, bench_disk_hit, bench_put_and_flush);
criterion_main!(benches);
