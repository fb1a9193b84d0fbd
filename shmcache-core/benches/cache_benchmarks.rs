//! Cache and allocator performance benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shmcache_core::{ArenaBuffer, BlockAllocator, CacheConfig, EntryType, Offset, ShmCache};
use tempfile::TempDir;

fn bench_config(dir: &TempDir, name: &str) -> CacheConfig {
    CacheConfig {
        segment_dir: Some(dir.path().to_path_buf()),
        pool_size: 16 * 1024 * 1024, // 16MB
        release_pages: false,
        ..CacheConfig::named(name)
    }
}

fn bench_cache_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_operations");
    let dir = TempDir::new().unwrap();
    let cache = ShmCache::attach(&bench_config(&dir, "bench_ops"), true).unwrap();

    for size in [64usize, 4096] {
        let value = vec![0xA5u8; size];
        group.bench_with_input(BenchmarkId::new("insert_release", size), &value, |b, value| {
            b.iter(|| {
                let handle = cache
                    .insert_or_reclaim(black_box("insert_bench_key"), value, EntryType::Blob)
                    .unwrap();
                cache.release(handle).unwrap();
            });
        });
        cache.cleanup_all().unwrap();
    }

    for i in 0..1000 {
        let key = format!("lookup_bench_key_{}", i);
        // The inserter's reference is never released, so the entry stays live
        cache.insert(&key, key.as_bytes(), EntryType::Text).unwrap();
    }

    group.bench_function("lookup_hit", |b| {
        b.iter(|| {
            let blob = cache.lookup(black_box("lookup_bench_key_42")).unwrap();
            black_box(blob.map(|blob| blob.len()));
        });
    });

    group.bench_function("lookup_miss", |b| {
        b.iter(|| {
            let blob = cache.lookup(black_box("nonexistent_key")).unwrap();
            black_box(blob.is_none());
        });
    });

    group.bench_function("lookup_no_ref", |b| {
        b.iter(|| {
            let handle = cache.lookup_entry(black_box("lookup_bench_key_42"), false).unwrap();
            black_box(handle);
        });
    });

    group.bench_function("stats", |b| {
        b.iter(|| black_box(cache.stats().unwrap().items));
    });

    group.finish();
}

fn bench_cleanup(c: &mut Criterion) {
    let mut group = c.benchmark_group("cleanup");
    let dir = TempDir::new().unwrap();
    let cache = ShmCache::attach(&bench_config(&dir, "bench_cleanup"), true).unwrap();

    group.bench_function("release_then_cleanup", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("cleanup_key_{}", i % 64);
            i += 1;
            let handle = cache.insert_or_reclaim(&key, b"payload", EntryType::Blob).unwrap();
            cache.release(handle).unwrap();
            black_box(cache.cleanup().unwrap());
        });
    });

    group.finish();
}

fn bench_allocator(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocator");
    let pool = 4 * 1024 * 1024;
    let buffer = ArenaBuffer::new(BlockAllocator::region_size(pool) as usize);
    let alloc = BlockAllocator::init(buffer.arena(), Offset::new(0), pool).unwrap();

    for size in [32usize, 1024, 64 * 1024] {
        group.bench_with_input(BenchmarkId::new("allocate_free", size), &size, |b, &size| {
            b.iter(|| {
                let at = alloc.allocate(black_box(size)).unwrap();
                alloc.free(at).unwrap();
            });
        });
    }

    // First-fit over a fragmented free chain
    let held: Vec<_> = (0..256).filter_map(|_| alloc.allocate(512)).collect();
    for at in held.iter().step_by(2) {
        alloc.free(*at).unwrap();
    }
    group.bench_function("allocate_fragmented", |b| {
        b.iter(|| {
            let at = alloc.allocate(black_box(2048)).unwrap();
            alloc.free(at).unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_cache_operations, bench_cleanup, bench_allocator);
criterion_main!(benches);
