//! Benchmarks for basic `CacheManager` operations:
//! - put/get latency at each tier depth
//! - cache hit vs cache miss
//! - lazy TTL expiration path
//! - health-driven invalidation

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use proxy_credential_cache::{CacheConfig, CacheEntry, CacheManager, NewCacheEntry, Secret, TierConfig};
use std::sync::Arc;
use tempfile::TempDir;

fn bench_config(dir: &TempDir) -> CacheConfig {
    CacheConfig::new()
        .with_l2_directory(dir.path().join("l2"))
        .with_l3_database_path(dir.path().join("l3.db"))
        .with_encryption_key(URL_SAFE.encode([7u8; 32]))
        .with_background_cleanup(false, 60)
}

fn setup_manager() -> (Arc<CacheManager>, TempDir) {
    let dir = TempDir::new().unwrap_or_else(|_| panic!("failed to create tempdir"));
    let manager = CacheManager::new(bench_config(&dir)).unwrap_or_else(|_| panic!("failed to build manager"));
    (manager, dir)
}

fn entry(key: &str) -> CacheEntry {
    CacheEntry::new(NewCacheEntry {
        key: key.to_string(),
        proxy_url: format!("http://{key}.proxy.example:8080"),
        username: Some(Secret::new("alice")),
        password: Some(Secret::new("hunter2")),
        source: "bench".into(),
        fetch_time: Utc::now(),
        ttl_seconds: 3600,
    })
    .unwrap_or_else(|_| panic!("failed to build entry"))
}

fn bench_put(c: &mut Criterion) {
    let (manager, _dir) = setup_manager();
    let mut counter = 0u64;
    c.bench_function("cache_put", |b| {
        b.iter(|| {
            counter += 1;
            let key = format!("put-{counter}");
            manager.put(black_box(&key), entry(&key)).unwrap();
        });
    });
}

fn bench_get_hit(c: &mut Criterion) {
    let (manager, _dir) = setup_manager();
    manager.put("hit", entry("hit")).unwrap();
    c.bench_function("cache_get_l1_hit", |b| {
        b.iter(|| {
            black_box(manager.get(black_box("hit")).unwrap());
        });
    });
}

fn bench_get_miss(c: &mut Criterion) {
    let (manager, _dir) = setup_manager();
    c.bench_function("cache_get_full_miss", |b| {
        b.iter(|| {
            black_box(manager.get(black_box("never-inserted")).unwrap());
        });
    });
}

fn bench_get_promotion_from_l3(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let write_only_l3 = bench_config(&dir).with_l1(TierConfig::disabled()).with_l2(
        TierConfig::disabled(),
        proxy_credential_cache::L2Backend::File,
    );
    {
        let writer = CacheManager::new(write_only_l3).unwrap();
        for i in 0..1000 {
            let key = format!("deep-{i}");
            writer.put(&key, entry(&key)).unwrap();
        }
    }

    let manager = CacheManager::new(bench_config(&dir)).unwrap();
    let mut counter = 0u64;
    c.bench_function("cache_get_promotes_from_l3", |b| {
        b.iter(|| {
            let key = format!("deep-{}", counter % 1000);
            counter += 1;
            black_box(manager.get(black_box(&key)).unwrap());
        });
    });
}

fn bench_invalidate_by_health(c: &mut Criterion) {
    let (manager, _dir) = setup_manager();
    manager.put("flaky", entry("flaky")).unwrap();
    c.bench_function("invalidate_by_health_below_threshold", |b| {
        b.iter(|| {
            manager.invalidate_by_health(black_box("flaky")).unwrap();
        });
    });
}

fn bench_entry_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_put_by_entry_count");
    for tier_entries in [100usize, 1_000, 10_000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(tier_entries),
            &tier_entries,
            |b, &n| {
                let (manager, _dir) = setup_manager();
                for i in 0..n {
                    let key = format!("seed-{i}");
                    manager.put(&key, entry(&key)).unwrap();
                }
                b.iter(|| {
                    manager.put("probe", entry("probe")).unwrap();
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_put,
    bench_get_hit,
    bench_get_miss,
    bench_get_promotion_from_l3,
    bench_invalidate_by_health,
    bench_entry_sizes,
);
criterion_main!(benches);
