//! Tier orchestrator — the Cache Manager (spec component C4) plus the TTL
//! sweeper (C5) and the health-invalidation/statistics facade (C6).
//!
//! Grounded on `proxywhirl/cache/manager.py`'s `CacheManager`/`TTLManager`.
//! The orchestrator lock there is a single re-entrant `threading.RLock`
//! guarding every public method; here we follow spec.md §9's explicit
//! guidance for a non-reentrant mutex — split each public method into a
//! thin "lock, then call a non-locking internal helper" pair. The
//! internal helpers (`_get_internal`, `_put_internal`, `_delete_internal`)
//! mirror the Python original's leading-underscore counterparts and never
//! reacquire the lock.
//!
//! The sweeper follows `TTLManager`'s `threading.Thread` +
//! `threading.Event.wait(interval)` shape, translated to `std::thread` +
//! `mpsc::Receiver::recv_timeout`, which gives the same "wake early on
//! shutdown, otherwise wake on interval" behavior without polling.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::{CacheConfig, L2Backend};
use crate::crypto::{CredentialCipher, Secret};
use crate::error::{CacheError, CacheResult};
use crate::model::{CacheEntry, NewCacheEntry, StoredEntry};
use crate::stats::{CacheStatistics, TierStats};
use crate::tiers::{DatabaseTier, FileTier, Guarded, MemoryTier, Tier, TierKind};

/// SHA-256 of `proxy_url`, truncated to its first 16 hex characters
/// (spec.md §6.1). Truncation is intentional — the key only needs to be
/// stable and collision-unlikely at the scale of one process's proxy
/// pool, not cryptographically unforgeable.
pub fn generate_cache_key(proxy_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(proxy_url.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Counts returned by [`CacheManager::warm_from_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmCounts {
    pub loaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Deserialize)]
struct WarmRecord {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    proxy_url: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

fn log_warm_progress(processed: usize) {
    if processed > 0 && processed % 1000 == 0 {
        tracing::info!(processed, "cache warming progress");
    }
}

/// Reads `path` line by line, parsing each non-blank line with `parse`.
/// Uses `anyhow` internally for ergonomic `?`-propagation of the file I/O;
/// a parse failure on a single line is not fatal to the whole file — it is
/// logged and folded into the returned corrupted-line count, matching how
/// `FileTier`'s shard reader skips corrupted records (spec.md §4.3.2).
fn parse_lines(
    path: &Path,
    parse: impl Fn(&str) -> anyhow::Result<WarmRecord>,
) -> CacheResult<(Vec<WarmRecord>, usize)> {
    (|| -> anyhow::Result<(Vec<WarmRecord>, usize)> {
        let file = File::open(path)?;
        let mut records = Vec::new();
        let mut corrupted = 0;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match parse(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed warm record line");
                    corrupted += 1;
                }
            }
        }
        Ok((records, corrupted))
    })()
    .map_err(|e| CacheError::MalformedWarmFile(e.to_string()))
}

/// The multi-tier orchestrator: holds one of each enabled [`Tier`], the
/// shared cipher, the statistics record, and the TTL sweeper.
///
/// Returned wrapped in `Arc` because the sweeper thread needs a handle to
/// call back into `cleanup_expired_all`; the sweeper holds only a `Weak`
/// reference so the manager's lifetime controls the sweeper's, not the
/// other way around (spec.md §4.5: sweeper lifetime tied to orchestrator
/// lifetime).
pub struct CacheManager {
    tiers: Vec<Box<dyn Tier>>,
    cipher: Arc<CredentialCipher>,
    config: CacheConfig,
    lock: Mutex<()>,
    stats: Mutex<CacheStatistics>,
    sweeper_stop: Mutex<Option<mpsc::Sender<()>>>,
    sweeper_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> CacheResult<Arc<Self>> {
        let cipher = Arc::new(match &config.encryption_key {
            Some(key) => CredentialCipher::with_key(key)?,
            None => CredentialCipher::from_env()?,
        });

        let mut tiers: Vec<Box<dyn Tier>> = Vec::new();
        if config.l1.enabled {
            tiers.push(Box::new(Guarded::new(
                MemoryTier::new(config.l1.max_entries),
                config.failure_threshold,
            )));
        }
        if config.l2.enabled {
            let l2: Box<dyn Tier> = match config.l2_backend {
                L2Backend::File => Box::new(Guarded::new(
                    FileTier::new(
                        config.l2_directory.clone(),
                        config.l2.max_entries,
                        cipher.clone(),
                    )?,
                    config.failure_threshold,
                )),
                L2Backend::Database => Box::new(Guarded::new(
                    DatabaseTier::open(
                        &config.l2_directory.join("l2.db"),
                        TierKind::L2Database,
                        config.l2.max_entries,
                        cipher.clone(),
                    )?,
                    config.failure_threshold,
                )),
            };
            tiers.push(l2);
        }
        if config.l3.enabled {
            tiers.push(Box::new(Guarded::new(
                DatabaseTier::open(
                    &config.l3_database_path,
                    TierKind::L3Database,
                    config.l3.max_entries,
                    cipher.clone(),
                )?,
                config.failure_threshold,
            )));
        }

        let stats = CacheStatistics {
            tiers: tiers
                .iter()
                .map(|t| TierStats {
                    kind: Some(t.kind()),
                    ..Default::default()
                })
                .collect(),
            promotions: 0,
            demotions: 0,
        };

        let manager = Arc::new(Self {
            tiers,
            cipher,
            config: config.clone(),
            lock: Mutex::new(()),
            stats: Mutex::new(stats),
            sweeper_stop: Mutex::new(None),
            sweeper_handle: Mutex::new(None),
        });

        if config.enable_background_cleanup {
            manager.spawn_sweeper(Duration::from_secs(config.cleanup_interval_seconds.max(1)))?;
        }

        Ok(manager)
    }

    fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> CacheResult<()> {
        let (tx, rx) = mpsc::channel::<()>();
        let weak = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("cache-ttl-sweeper".into())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let removed = manager.cleanup_expired_all();
                if removed > 0 {
                    tracing::debug!(removed, "ttl sweeper removed expired entries");
                }
            })
            .map_err(|e| CacheError::Io(format!("failed to spawn ttl sweeper thread: {e}")))?;

        *self.sweeper_stop.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        *self
            .sweeper_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    fn lock_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ---- statistics bookkeeping -------------------------------------

    fn bump_tier(&self, idx: usize, f: impl FnOnce(&mut TierStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(tier) = stats.tiers.get_mut(idx) {
            f(tier);
        }
    }

    fn bump_promotions(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).promotions += n;
    }

    fn bump_demotions(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).demotions += n;
    }

    // ---- lookup (spec.md §4.4.1) -------------------------------------

    pub fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let _guard = self.lock_guard();
        let now = Utc::now();

        for (idx, tier) in self.tiers.iter().enumerate() {
            let found = match tier.get(key) {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(tier = ?tier.kind(), error = %e, "tier get failed");
                    None
                }
            };
            let Some(entry) = found else {
                self.bump_tier(idx, |t| t.misses += 1);
                continue;
            };

            if entry.is_expired_at(now) {
                self.bump_tier(idx, |t| t.evictions_ttl += 1);
                self._delete_internal(key);
                return Ok(None);
            }

            self.bump_tier(idx, |t| t.hits += 1);
            let updated = entry.touched(now);
            let mut promotions = 0u64;
            for (higher_idx, higher_tier) in self.tiers.iter().enumerate() {
                if higher_idx > idx {
                    break;
                }
                match higher_tier.put(key, updated.clone()) {
                    Ok(evicted) => {
                        if higher_idx < idx {
                            promotions += 1;
                        }
                        if let Some((evicted_key, evicted_entry)) = evicted {
                            self.handle_tier_eviction(higher_idx, evicted_key, evicted_entry);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(tier = ?higher_tier.kind(), error = %e, "write-back during get failed");
                    }
                }
            }
            self.bump_promotions(promotions);
            return Ok(Some(updated));
        }
        Ok(None)
    }

    // ---- write (spec.md §4.4.2) ---------------------------------------

    pub fn put(&self, key: &str, entry: CacheEntry) -> CacheResult<bool> {
        let _guard = self.lock_guard();
        Ok(self._put_internal(key, entry))
    }

    fn _put_internal(&self, key: &str, entry: CacheEntry) -> bool {
        let mut any_success = false;
        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.put(key, entry.clone()) {
                Ok(evicted) => {
                    any_success = true;
                    if let Some((evicted_key, evicted_entry)) = evicted {
                        self.handle_tier_eviction(idx, evicted_key, evicted_entry);
                    }
                }
                Err(e) => {
                    tracing::warn!(tier = ?tier.kind(), error = %e, "tier put failed");
                }
            }
        }
        any_success
    }

    /// Reacts to a tier's own capacity-driven eviction. On L1 this is the
    /// spec's "L1 eviction callback" (§4.4.4): demote the evicted record
    /// into every lower tier, tagged `evicted_from_l1 = true`, without
    /// deleting it anywhere. On L2/L3 it is just that tier's own LRU
    /// bookkeeping.
    fn handle_tier_eviction(&self, idx: usize, evicted_key: String, evicted_entry: CacheEntry) {
        self.bump_tier(idx, |t| t.evictions_lru += 1);
        if self.tiers[idx].kind() != TierKind::L1Memory {
            return;
        }
        self.bump_demotions(1);
        let demoted = evicted_entry.with_evicted_from_l1(true);
        for (lower_idx, lower_tier) in self.tiers.iter().enumerate() {
            if lower_idx <= idx {
                continue;
            }
            if let Err(e) = lower_tier.put(&evicted_key, demoted.clone()) {
                tracing::warn!(tier = ?lower_tier.kind(), error = %e, "demotion write failed");
            }
        }
    }

    // ---- delete (spec.md §4.4.3) --------------------------------------

    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        let _guard = self.lock_guard();
        Ok(self._delete_internal(key))
    }

    fn _delete_internal(&self, key: &str) -> bool {
        let mut existed_anywhere = false;
        for tier in &self.tiers {
            match tier.delete(key) {
                Ok(existed) => existed_anywhere |= existed,
                Err(e) => tracing::warn!(tier = ?tier.kind(), error = %e, "tier delete failed"),
            }
        }
        existed_anywhere
    }

    fn _get_internal(&self, key: &str) -> Option<CacheEntry> {
        for tier in &self.tiers {
            if let Ok(Some(entry)) = tier.get(key) {
                return Some(entry);
            }
        }
        None
    }

    // ---- health invalidation (spec.md §4.4.5) -------------------------

    /// TOCTOU-safe threshold eviction: the whole sequence runs under the
    /// orchestrator lock, so a concurrent `get`/`put` cannot interleave
    /// between the failure-count check and the resulting delete.
    pub fn invalidate_by_health(&self, key: &str) -> CacheResult<()> {
        let _guard = self.lock_guard();

        let Some(entry) = self._get_internal(key) else {
            tracing::debug!(key, "invalidate_by_health: key present in no tier");
            return Ok(());
        };
        let updated = entry.with_health_failure();

        if !self.config.health_check_invalidation {
            self._put_internal(key, updated);
            return Ok(());
        }

        if updated.failure_count >= self.config.failure_threshold {
            let holding: Vec<usize> = self
                .tiers
                .iter()
                .enumerate()
                .filter_map(|(idx, tier)| match tier.contains(key) {
                    Ok(true) => Some(idx),
                    _ => None,
                })
                .collect();
            self._delete_internal(key);
            for idx in holding {
                self.bump_tier(idx, |t| t.evictions_health += 1);
            }
        } else {
            self._put_internal(key, updated);
        }
        Ok(())
    }

    // ---- clear ----------------------------------------------------------

    pub fn clear(&self) -> CacheResult<usize> {
        let _guard = self.lock_guard();
        let mut total = 0;
        for tier in &self.tiers {
            match tier.clear() {
                Ok(n) => total += n,
                Err(e) => tracing::warn!(tier = ?tier.kind(), error = %e, "tier clear failed"),
            }
        }
        Ok(total)
    }

    // ---- sweeper pass (spec.md §4.5) ------------------------------------

    fn cleanup_expired_all(&self) -> usize {
        let _guard = self.lock_guard();
        let now = Utc::now();
        let mut total = 0;
        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.cleanup_expired(now) {
                Ok(n) => {
                    total += n;
                    if n > 0 {
                        self.bump_tier(idx, |t| t.evictions_ttl += n as u64);
                    }
                }
                Err(e) => tracing::warn!(tier = ?tier.kind(), error = %e, "tier cleanup_expired failed"),
            }
        }
        total
    }

    // ---- statistics (spec.md §4.6) --------------------------------------

    /// A deep-copied snapshot; callers cannot mutate live counters through
    /// the return value.
    pub fn get_statistics(&self) -> CacheStatistics {
        let mut snapshot = self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone();
        for (idx, tier) in self.tiers.iter().enumerate() {
            if let Some(entry) = snapshot.tiers.get_mut(idx) {
                entry.current_size = tier.size();
                entry.degraded = tier.is_degraded();
            }
        }
        snapshot
    }

    // ---- cache warming (spec.md §4.4.6) ---------------------------------

    pub fn warm_from_file(&self, path: &Path, ttl_override: Option<u64>) -> CacheResult<WarmCounts> {
        let (records, corrupted_lines) = match self.read_warm_records(path) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cache warm file could not be read");
                return Ok(WarmCounts {
                    loaded: 0,
                    skipped: 0,
                    failed: 1,
                });
            }
        };

        let mut counts = WarmCounts {
            failed: corrupted_lines,
            ..Default::default()
        };
        let now = Utc::now();
        for record in records {
            let processed = counts.loaded + counts.skipped + counts.failed;
            log_warm_progress(processed);

            let Some(proxy_url) = record.proxy_url.filter(|u| !u.is_empty()) else {
                tracing::warn!("skipping warm record missing proxy_url");
                counts.skipped += 1;
                continue;
            };
            let key = record
                .key
                .filter(|k| !k.is_empty())
                .unwrap_or_else(|| generate_cache_key(&proxy_url));
            let source = record.source.unwrap_or_else(|| "warmed".to_string());
            let ttl_seconds = ttl_override
                .or(record.ttl_seconds)
                .unwrap_or_else(|| self.config.ttl_for_source(&source));

            let entry = CacheEntry::new(NewCacheEntry {
                key: key.clone(),
                proxy_url,
                username: record.username.map(Secret::new),
                password: record.password.map(Secret::new),
                source,
                fetch_time: now,
                ttl_seconds,
            });
            match entry {
                Ok(entry) => {
                    if self.put(&key, entry)? {
                        counts.loaded += 1;
                    } else {
                        counts.failed += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "warm record failed entry validation");
                    counts.failed += 1;
                }
            }
        }
        log_warm_progress(counts.loaded + counts.skipped + counts.failed);
        Ok(counts)
    }

    /// Returns the parsed records plus a count of individually-corrupted
    /// lines/rows that were skipped (folded into `WarmCounts::failed` by
    /// the caller). A file that cannot be opened or whose top-level shape
    /// is wrong (not a JSON array, no CSV header) surfaces as
    /// `CacheError::MalformedWarmFile` instead, matching spec.md §4.4.6's
    /// "malformed files return `{0, 0, 1}`".
    fn read_warm_records(&self, path: &Path) -> CacheResult<(Vec<WarmRecord>, usize)> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "json" => {
                let text = std::fs::read_to_string(path)?;
                let records = serde_json::from_str::<Vec<WarmRecord>>(&text)
                    .map_err(|e| CacheError::MalformedWarmFile(format!("invalid JSON array: {e}")))?;
                Ok((records, 0))
            }
            "jsonl" => parse_lines(path, |line| {
                serde_json::from_str::<WarmRecord>(line).with_context(|| "invalid jsonl warm record")
            }),
            "csv" => {
                let mut reader = csv::Reader::from_path(path)
                    .map_err(|e| CacheError::MalformedWarmFile(format!("cannot open csv: {e}")))?;
                let mut records = Vec::new();
                let mut corrupted = 0;
                for row in reader.deserialize::<WarmRecord>() {
                    match row {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed csv warm record");
                            corrupted += 1;
                        }
                    }
                }
                Ok((records, corrupted))
            }
            other => Err(CacheError::MalformedWarmFile(format!(
                "unrecognized warm file extension: {other:?}"
            ))),
        }
    }

    // ---- export (spec.md §4.4.7) -----------------------------------------

    /// Walks the union of keys across all tiers and writes one
    /// JSON-per-line [`StoredEntry`] per key, credentials still in
    /// ciphertext form. Calling `get` per key is deliberate: it promotes
    /// lower-tier-only records into L1/L2, matching spec.md §9's open
    /// question 3 (export is diagnostic, not symmetric with warming).
    pub fn export_to_file(&self, path: &Path) -> CacheResult<usize> {
        let keys: HashSet<String> = {
            let _guard = self.lock_guard();
            self.tiers.iter().flat_map(|t| t.keys()).collect()
        };

        let mut file = File::create(path)?;
        let mut exported = 0;
        for key in keys {
            if let Some(entry) = self.get(&key)? {
                let stored = self.to_stored(&entry)?;
                let line = serde_json::to_string(&stored)
                    .map_err(|e| CacheError::Io(format!("failed to serialize export record: {e}")))?;
                writeln!(file, "{line}")?;
                exported += 1;
            }
        }
        Ok(exported)
    }

    fn to_stored(&self, entry: &CacheEntry) -> CacheResult<StoredEntry> {
        let username_encrypted = match &entry.username {
            Some(s) => Some(self.cipher.encrypt(s)?),
            None => None,
        };
        let password_encrypted = match &entry.password {
            Some(s) => Some(self.cipher.encrypt(s)?),
            None => None,
        };
        Ok(StoredEntry {
            key: entry.key.clone(),
            proxy_url: entry.proxy_url.clone(),
            username_encrypted,
            password_encrypted,
            source: entry.source.clone(),
            fetch_time: entry.fetch_time,
            last_accessed: entry.last_accessed,
            access_count: entry.access_count,
            ttl_seconds: entry.ttl_seconds,
            expires_at: entry.expires_at,
            health_status: entry.health_status,
            failure_count: entry.failure_count,
            evicted_from_l1: entry.evicted_from_l1,
        })
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        if let Some(tx) = self
            .sweeper_stop
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
        if let Some(handle) = self
            .sweeper_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            let _ = handle.join();
        }
    }
}
