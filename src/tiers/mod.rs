//! Tier interface and the cross-cutting degradation decorator (spec §4.3).
//!
//! The dynamic class hierarchy of `proxywhirl/cache/tiers.py`'s `CacheTier`
//! ABC becomes a trait plus three concrete variants, per spec.md §9's
//! design note. The per-tier failure counter/threshold that the Python ABC
//! mixes into every subclass is instead factored into [`Guarded`], a
//! decorator any concrete tier is wrapped in — the same "wrap a backend,
//! add cross-cutting bookkeeping" shape as the teacher's
//! `CacheTier` struct in `cache_manager.rs`, which wraps
//! `Arc<dyn L2CacheBackend>` with tier-level stats and promotion metadata.

mod database;
mod file;
mod memory;

pub use database::DatabaseTier;
pub use file::FileTier;
pub use memory::MemoryTier;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::{DateTime, Utc};

use crate::error::{CacheError, CacheResult};
use crate::model::CacheEntry;

/// Which concrete storage a tier is backed by. Carried purely for
/// statistics and log lines, mirroring `TierType` in
/// `proxywhirl/cache/tiers.py`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
    L1Memory,
    L2File,
    L2Database,
    L3Database,
}

/// Uniform operation set every tier variant implements (spec.md §4.3).
///
/// `put` returns the entry evicted by tier-internal capacity management,
/// if any — the Rust expression of spec.md §4.4.4's "L1 eviction
/// callback": rather than a closure the memory tier invokes mid-call (which
/// would need to reborrow the orchestrator's own locked state), the evicted
/// record is handed back to the caller, who performs the demotion write
/// while still holding the orchestrator lock. `Tier` implementations other
/// than [`MemoryTier`] return `None` here unless their own capacity limit
/// is exceeded, in which case the evicted record is used only for that
/// tier's own `evictions_lru` statistic.
pub trait Tier: Send + Sync {
    fn kind(&self) -> TierKind;
    fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>>;
    fn put(&self, key: &str, entry: CacheEntry) -> CacheResult<Option<(String, CacheEntry)>>;
    fn delete(&self, key: &str) -> CacheResult<bool>;
    fn clear(&self) -> CacheResult<usize>;
    fn size(&self) -> usize;
    fn keys(&self) -> Vec<String>;
    fn cleanup_expired(&self, now: DateTime<Utc>) -> CacheResult<usize>;

    fn contains(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn is_degraded(&self) -> bool {
        false
    }
}

/// Wraps any [`Tier`] with a failure counter and threshold. A method
/// failure increments the counter; at the threshold the tier marks itself
/// disabled and subsequent operations short-circuit (miss on read, soft
/// failure on write) without touching the inner tier. A successful
/// operation resets the counter and re-enables the tier.
pub struct Guarded<T> {
    inner: T,
    failures: AtomicU32,
    threshold: u32,
    disabled: AtomicBool,
}

impl<T: Tier> Guarded<T> {
    pub fn new(inner: T, threshold: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(0),
            threshold,
            disabled: AtomicBool::new(false),
        }
    }

    fn record_failure(&self) {
        let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.threshold && !self.disabled.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                tier = ?self.inner.kind(),
                failures = count,
                "tier exceeded failure threshold; disabling"
            );
        }
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
        if self.disabled.swap(false, Ordering::SeqCst) {
            tracing::info!(tier = ?self.inner.kind(), "tier recovered; re-enabling");
        }
    }

    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }
}

impl<T: Tier> Tier for Guarded<T> {
    fn kind(&self) -> TierKind {
        self.inner.kind()
    }

    fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        if self.is_disabled() {
            return Ok(None);
        }
        match self.inner.get(key) {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(_) => {
                self.record_failure();
                Ok(None)
            }
        }
    }

    fn put(&self, key: &str, entry: CacheEntry) -> CacheResult<Option<(String, CacheEntry)>> {
        if self.is_disabled() {
            return Err(CacheError::TierDegraded);
        }
        match self.inner.put(key, entry) {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        if self.is_disabled() {
            return Ok(false);
        }
        match self.inner.delete(key) {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(_) => {
                self.record_failure();
                Ok(false)
            }
        }
    }

    fn clear(&self) -> CacheResult<usize> {
        if self.is_disabled() {
            return Ok(0);
        }
        match self.inner.clear() {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(_) => {
                self.record_failure();
                Ok(0)
            }
        }
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    fn cleanup_expired(&self, now: DateTime<Utc>) -> CacheResult<usize> {
        if self.is_disabled() {
            return Ok(0);
        }
        match self.inner.cleanup_expired(now) {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(_) => {
                self.record_failure();
                Ok(0)
            }
        }
    }

    fn is_degraded(&self) -> bool {
        self.is_disabled()
    }
}
