//! Benchmarks isolating the cost each tier adds to the stack: L1-only,
//! L1+L2, and the full three-tier configuration, plus the LRU-eviction and
//! promotion paths that only exist once more than one tier is enabled.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use proxy_credential_cache::{CacheConfig, CacheEntry, CacheManager, L2Backend, NewCacheEntry, Secret, TierConfig};
use std::sync::Arc;
use tempfile::TempDir;

fn base_config(dir: &TempDir) -> CacheConfig {
    CacheConfig::new()
        .with_l2_directory(dir.path().join("l2"))
        .with_l3_database_path(dir.path().join("l3.db"))
        .with_encryption_key(URL_SAFE.encode([13u8; 32]))
        .with_background_cleanup(false, 60)
}

fn l1_only(dir: &TempDir) -> CacheConfig {
    base_config(dir)
        .with_l2(TierConfig::disabled(), L2Backend::File)
        .with_l3(TierConfig::disabled())
}

fn l1_plus_l2(dir: &TempDir) -> CacheConfig {
    base_config(dir).with_l3(TierConfig::disabled())
}

fn full_three_tier(dir: &TempDir) -> CacheConfig {
    base_config(dir)
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

fn tier_depths() -> Vec<(&'static str, fn(&TempDir) -> CacheConfig)> {
    vec![
        ("l1_only", l1_only as fn(&TempDir) -> CacheConfig),
        ("l1_plus_l2", l1_plus_l2 as fn(&TempDir) -> CacheConfig),
        ("l1_l2_l3", full_three_tier as fn(&TempDir) -> CacheConfig),
    ]
}

fn bench_write_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_by_tier_depth");
    for (label, build) in tier_depths() {
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            let dir = TempDir::new().unwrap();
            let manager = CacheManager::new(build(&dir)).unwrap();
            let mut counter = 0u64;
            b.iter(|| {
                counter += 1;
                let key = format!("k-{counter}");
                manager.put(black_box(&key), entry(&key)).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_read_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_hit_by_tier_depth");
    for (label, build) in tier_depths() {
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            let dir = TempDir::new().unwrap();
            let manager = CacheManager::new(build(&dir)).unwrap();
            manager.put("warm", entry("warm")).unwrap();
            b.iter(|| {
                black_box(manager.get(black_box("warm")).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_lru_eviction(c: &mut Criterion) {
    c.bench_function("l1_lru_eviction_and_demotion", |b| {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(
            CacheManager::new(full_three_tier(&dir).with_l1(TierConfig::enabled(Some(100)))).unwrap(),
        );
        for i in 0..100 {
            let key = format!("seed-{i}");
            manager.put(&key, entry(&key)).unwrap();
        }
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("evicting-{counter}");
            manager.put(black_box(&key), entry(&key)).unwrap();
        });
    });
}

fn bench_promotion_from_l2(c: &mut Criterion) {
    c.bench_function("l1_promotion_from_l2_hit", |b| {
        let dir = TempDir::new().unwrap();
        let write_config = base_config(&dir).with_l1(TierConfig::disabled());
        {
            let writer = CacheManager::new(write_config).unwrap();
            for i in 0..500 {
                let key = format!("l2-{i}");
                writer.put(&key, entry(&key)).unwrap();
            }
        }

        let manager = CacheManager::new(full_three_tier(&dir)).unwrap();
        let mut counter = 0u64;
        b.iter(|| {
            let key = format!("l2-{}", counter % 500);
            counter += 1;
            black_box(manager.get(black_box(&key)).unwrap());
        });
    });
}

fn bench_tier_stats_overhead(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let manager = CacheManager::new(full_three_tier(&dir)).unwrap();
    for i in 0..1000 {
        let key = format!("stats-{i}");
        manager.put(&key, entry(&key)).unwrap();
    }
    c.bench_function("get_statistics_snapshot", |b| {
        b.iter(|| {
            black_box(manager.get_statistics());
        });
    });
}

criterion_group!(
    benches,
    bench_write_depth,
    bench_read_depth,
    bench_lru_eviction,
    bench_promotion_from_l2,
    bench_tier_stats_overhead,
);
criterion_main!(benches);
