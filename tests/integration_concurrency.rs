//! Concurrent mutation from many threads (spec §5): the orchestrator's
//! re-entrant lock must keep every public method linearizable per key, and
//! no combination of concurrent `put`/`get`/`delete`/`invalidate_by_health`
//! may panic, deadlock, or corrupt the LRU/index bookkeeping inside a tier.

mod common;

use std::thread;

use common::{proxy_entry, small_l1_config, test_config};
use proxy_credential_cache::CacheManager;
use tempfile::tempdir;

#[test]
fn concurrent_puts_of_distinct_keys_are_all_observable() {
    let dir = tempdir().unwrap();
    let manager = CacheManager::new(test_config(&dir)).unwrap();

    thread::scope(|scope| {
        for t in 0..8 {
            let manager = &manager;
            scope.spawn(move || {
                for i in 0..50 {
                    let key = format!("t{t}-k{i}");
                    manager.put(&key, proxy_entry(&key, 3600)).unwrap();
                }
            });
        }
    });

    for t in 0..8 {
        for i in 0..50 {
            let key = format!("t{t}-k{i}");
            assert!(
                manager.get(&key).unwrap().is_some(),
                "key {key} written by a concurrent thread should be retrievable"
            );
        }
    }
}

#[test]
fn concurrent_readers_and_writers_on_the_same_key_never_panic() {
    let dir = tempdir().unwrap();
    let manager = CacheManager::new(test_config(&dir)).unwrap();
    manager.put("shared", proxy_entry("shared", 3600)).unwrap();

    thread::scope(|scope| {
        for _ in 0..4 {
            let manager = &manager;
            scope.spawn(move || {
                for _ in 0..200 {
                    let _ = manager.get("shared").unwrap();
                }
            });
        }
        for _ in 0..4 {
            let manager = &manager;
            scope.spawn(move || {
                for _ in 0..200 {
                    manager.put("shared", proxy_entry("shared", 3600)).unwrap();
                }
            });
        }
    });

    assert!(manager.get("shared").unwrap().is_some());
}

#[test]
fn concurrent_health_invalidation_evicts_exactly_once_at_threshold() {
    // Every thread reports a failure for the same key; the orchestrator
    // lock serializes the check-then-evict sequence, so regardless of
    // interleaving the entry must end up evicted (never left dangling
    // above the threshold, never evicted more than the threshold allows
    // to race past it).
    let dir = tempdir().unwrap();
    let manager = CacheManager::new(test_config(&dir).with_failure_threshold(10)).unwrap();
    manager.put("flaky", proxy_entry("flaky", 3600)).unwrap();

    thread::scope(|scope| {
        for _ in 0..10 {
            let manager = &manager;
            scope.spawn(move || {
                manager.invalidate_by_health("flaky").unwrap();
            });
        }
    });

    assert!(
        manager.get("flaky").unwrap().is_none(),
        "ten concurrent failures against a threshold of ten must evict the entry"
    );
}

#[test]
fn concurrent_eviction_pressure_keeps_l1_within_capacity() {
    let dir = tempdir().unwrap();
    let manager = CacheManager::new(small_l1_config(&dir, 10)).unwrap();

    thread::scope(|scope| {
        for t in 0..4 {
            let manager = &manager;
            scope.spawn(move || {
                for i in 0..100 {
                    let key = format!("pressure-{t}-{i}");
                    manager.put(&key, proxy_entry(&key, 3600)).unwrap();
                }
            });
        }
    });

    let stats = manager.get_statistics();
    assert!(
        stats.tiers[0].current_size <= 10,
        "L1 size must never exceed its configured capacity under concurrent writes"
    );
}

#[test]
fn concurrent_deletes_of_the_same_key_are_idempotent() {
    let dir = tempdir().unwrap();
    let manager = CacheManager::new(test_config(&dir)).unwrap();
    manager.put("doomed", proxy_entry("doomed", 3600)).unwrap();

    thread::scope(|scope| {
        for _ in 0..6 {
            let manager = &manager;
            scope.spawn(move || {
                manager.delete("doomed").unwrap();
            });
        }
    });

    assert!(manager.get("doomed").unwrap().is_none());
}
