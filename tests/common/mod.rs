//! Shared test infrastructure for integration tests.
//!
//! Every test gets a private temp directory for L2/file and L3/database
//! storage and a fixed encryption key, so tests never touch the real
//! filesystem cache location or depend on environment state.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::Utc;
use proxy_credential_cache::{CacheConfig, CacheEntry, NewCacheEntry, Secret, TierConfig};
use tempfile::TempDir;

pub fn test_encryption_key() -> String {
    URL_SAFE.encode([42u8; 32])
}

/// A `CacheConfig` rooted at a fresh temp directory, with the background
/// sweeper disabled so tests control TTL expiration deterministically.
pub fn test_config(dir: &TempDir) -> CacheConfig {
    CacheConfig::new()
        .with_l2_directory(dir.path().join("l2"))
        .with_l3_database_path(dir.path().join("l3.db"))
        .with_encryption_key(test_encryption_key())
        .with_background_cleanup(false, 60)
}

/// Small-capacity L1 variant, useful for exercising LRU eviction and
/// promotion without inserting thousands of entries.
pub fn small_l1_config(dir: &TempDir, l1_capacity: usize) -> CacheConfig {
    test_config(dir).with_l1(TierConfig::enabled(Some(l1_capacity)))
}

pub fn proxy_entry(key: &str, ttl_seconds: u64) -> CacheEntry {
    CacheEntry::new(NewCacheEntry {
        key: key.to_string(),
        proxy_url: format!("http://{key}.proxy.example:8080"),
        username: Some(Secret::new("alice")),
        password: Some(Secret::new("hunter2")),
        source: "integration-test".into(),
        fetch_time: Utc::now(),
        ttl_seconds,
    })
    .unwrap()
}
