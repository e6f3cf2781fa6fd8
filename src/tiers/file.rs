//! File tier (L2 file back-end): a 16-shard append-rewrite store
//! (spec.md §4.3.2).
//!
//! Grounded on `proxywhirl/cache/tiers.py`'s `JsonlCacheTier`: MD5-mod-16
//! sharding, an in-memory `{key -> shard_id}` index plus an access-order
//! structure rebuilt at construction, atomic tmp-then-rename writes, and an
//! OS advisory lock per shard. File locking and atomic rename follow
//! `examples/vanyastaff-nebula/crates/nebula-credential`'s local storage
//! backend, which uses the same `fs2`/`atomicwrites` pair for the same
//! reason (a local secret store written to by multiple processes/threads).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use atomicwrites::{AllowOverwrite, AtomicFile};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use md5::{Digest, Md5};

use super::{Tier, TierKind};
use crate::crypto::{CredentialCipher, Secret};
use crate::error::{CacheError, CacheResult};
use crate::model::{CacheEntry, StoredEntry};

const NUM_SHARDS: usize = 16;
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

fn shard_id_for(key: &str) -> usize {
    let mut hasher = Md5::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    // Mirrors `int(md5_hex, 16) % 16`: only the low nibble of the digest
    // determines the result, so reduce on the last byte directly.
    (digest[digest.len() - 1] as usize) % NUM_SHARDS
}

fn shard_path(dir: &Path, shard: usize) -> PathBuf {
    dir.join(format!("shard_{shard:02}"))
}

fn lock_shard(path: &Path) -> CacheResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    let deadline = Instant::now() + LOCK_TIMEOUT;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
            Err(e) => {
                return Err(CacheError::Timeout(format!(
                    "advisory lock on {} timed out: {e}",
                    path.display()
                )))
            }
        }
    }
}

fn read_shard(path: &Path) -> CacheResult<HashMap<String, StoredEntry>> {
    let mut out = HashMap::new();
    if !path.exists() {
        return Ok(out);
    }
    let file = File::open(path)?;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoredEntry>(&line) {
            Ok(record) => {
                out.insert(record.key.clone(), record);
            }
            Err(e) => {
                tracing::warn!(shard = %path.display(), lineno, error = %e, "skipping corrupted shard record");
            }
        }
    }
    Ok(out)
}

fn write_shard(path: &Path, records: &HashMap<String, StoredEntry>) -> CacheResult<()> {
    let mut buf = Vec::new();
    for record in records.values() {
        let line = serde_json::to_string(record)
            .map_err(|e| CacheError::Io(format!("failed to serialize shard record: {e}")))?;
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
    }
    let atomic = AtomicFile::new(path, AllowOverwrite);
    atomic
        .write(|f| f.write_all(&buf))
        .map_err(|e| CacheError::Io(format!("atomic shard write failed: {e}")))
}

fn to_stored(entry: &CacheEntry, cipher: &CredentialCipher) -> CacheResult<StoredEntry> {
    let username_encrypted = match &entry.username {
        Some(s) => Some(cipher.encrypt(s)?),
        None => None,
    };
    let password_encrypted = match &entry.password {
        Some(s) => Some(cipher.encrypt(s)?),
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

fn from_stored(stored: &StoredEntry, cipher: &CredentialCipher) -> CacheResult<CacheEntry> {
    let username = match &stored.username_encrypted {
        Some(bytes) if !bytes.is_empty() => Some(cipher.decrypt(bytes)?),
        _ => None,
    };
    let password = match &stored.password_encrypted {
        Some(bytes) if !bytes.is_empty() => Some(cipher.decrypt(bytes)?),
        _ => None,
    };
    Ok(CacheEntry {
        key: stored.key.clone(),
        proxy_url: stored.proxy_url.clone(),
        username,
        password,
        source: stored.source.clone(),
        fetch_time: stored.fetch_time,
        last_accessed: stored.last_accessed,
        access_count: stored.access_count,
        ttl_seconds: stored.ttl_seconds,
        expires_at: stored.expires_at,
        health_status: stored.health_status,
        failure_count: stored.failure_count,
        evicted_from_l1: stored.evicted_from_l1,
    })
}

struct Index {
    /// key -> shard id
    shard_of: HashMap<String, usize>,
    /// key -> last_accessed unix seconds, insertion-ordered for O(1) LRU
    /// candidate selection (oldest first).
    access_order: HashMap<String, i64>,
}

/// L2 file-backed tier: 16 MD5-sharded append-rewrite shard files.
pub struct FileTier {
    dir: PathBuf,
    max_entries: Option<usize>,
    cipher: std::sync::Arc<CredentialCipher>,
    index: Mutex<Index>,
}

impl FileTier {
    pub fn new(
        dir: PathBuf,
        max_entries: Option<usize>,
        cipher: std::sync::Arc<CredentialCipher>,
    ) -> CacheResult<Self> {
        std::fs::create_dir_all(&dir)?;
        let mut shard_of = HashMap::new();
        let mut access_order = HashMap::new();
        for shard in 0..NUM_SHARDS {
            let path = shard_path(&dir, shard);
            let records = read_shard(&path)?;
            for (key, record) in records {
                shard_of.insert(key.clone(), shard);
                access_order.insert(key, record.last_accessed.timestamp());
            }
        }
        Ok(Self {
            dir,
            max_entries,
            cipher,
            index: Mutex::new(Index {
                shard_of,
                access_order,
            }),
        })
    }

    fn oldest_key(index: &Index) -> Option<String> {
        index
            .access_order
            .iter()
            .min_by_key(|(_, ts)| **ts)
            .map(|(k, _)| k.clone())
    }
}

impl Tier for FileTier {
    fn kind(&self) -> TierKind {
        TierKind::L2File
    }

    fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let shard = {
            let index = self.index.lock().unwrap_or_else(|p| p.into_inner());
            match index.shard_of.get(key) {
                Some(s) => *s,
                None => return Ok(None),
            }
        };
        let path = shard_path(&self.dir, shard);
        let _lock = lock_shard(&path)?;
        let records = read_shard(&path)?;
        match records.get(key) {
            Some(stored) => Ok(Some(from_stored(stored, &self.cipher)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, entry: CacheEntry) -> CacheResult<Option<(String, CacheEntry)>> {
        let shard = shard_id_for(key);
        let path = shard_path(&self.dir, shard);
        let _lock = lock_shard(&path)?;
        let mut records = read_shard(&path)?;
        let is_new_key = !records.contains_key(key);
        records.insert(key.to_string(), to_stored(&entry, &self.cipher)?);
        write_shard(&path, &records)?;

        let mut index = self.index.lock().unwrap_or_else(|p| p.into_inner());
        index.shard_of.insert(key.to_string(), shard);
        index
            .access_order
            .insert(key.to_string(), entry.last_accessed.timestamp());

        if !is_new_key {
            return Ok(None);
        }
        let Some(max) = self.max_entries else {
            return Ok(None);
        };
        if index.shard_of.len() <= max {
            return Ok(None);
        }
        let Some(oldest) = Self::oldest_key(&index) else {
            return Ok(None);
        };
        if oldest == key {
            // nothing older to evict
            return Ok(None);
        }
        let evicted_shard = index.shard_of.remove(&oldest);
        index.access_order.remove(&oldest);
        drop(index);
        if let Some(evicted_shard) = evicted_shard {
            let evicted_path = shard_path(&self.dir, evicted_shard);
            let _evicted_lock = lock_shard(&evicted_path)?;
            let mut evicted_records = read_shard(&evicted_path)?;
            if let Some(removed) = evicted_records.remove(&oldest) {
                write_shard(&evicted_path, &evicted_records)?;
                let evicted_entry = from_stored(&removed, &self.cipher)?;
                return Ok(Some((oldest, evicted_entry)));
            }
        }
        Ok(None)
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        let shard = {
            let index = self.index.lock().unwrap_or_else(|p| p.into_inner());
            match index.shard_of.get(key) {
                Some(s) => *s,
                None => return Ok(false),
            }
        };
        let path = shard_path(&self.dir, shard);
        let _lock = lock_shard(&path)?;
        let mut records = read_shard(&path)?;
        let existed = records.remove(key).is_some();
        if existed {
            write_shard(&path, &records)?;
            let mut index = self.index.lock().unwrap_or_else(|p| p.into_inner());
            index.shard_of.remove(key);
            index.access_order.remove(key);
        }
        Ok(existed)
    }

    fn clear(&self) -> CacheResult<usize> {
        let mut total = 0;
        for shard in 0..NUM_SHARDS {
            let path = shard_path(&self.dir, shard);
            let _lock = lock_shard(&path)?;
            let records = read_shard(&path)?;
            total += records.len();
            write_shard(&path, &HashMap::new())?;
        }
        let mut index = self.index.lock().unwrap_or_else(|p| p.into_inner());
        index.shard_of.clear();
        index.access_order.clear();
        Ok(total)
    }

    fn size(&self) -> usize {
        self.index.lock().unwrap_or_else(|p| p.into_inner()).shard_of.len()
    }

    fn keys(&self) -> Vec<String> {
        self.index
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .shard_of
            .keys()
            .cloned()
            .collect()
    }

    fn cleanup_expired(&self, now: DateTime<Utc>) -> CacheResult<usize> {
        let mut removed_total = 0;
        let mut removed_keys = Vec::new();
        for shard in 0..NUM_SHARDS {
            let path = shard_path(&self.dir, shard);
            let _lock = lock_shard(&path)?;
            let mut records = read_shard(&path)?;
            let expired: Vec<String> = records
                .values()
                .filter(|r| now >= r.expires_at)
                .map(|r| r.key.clone())
                .collect();
            if expired.is_empty() {
                continue;
            }
            for key in &expired {
                records.remove(key);
            }
            write_shard(&path, &records)?;
            removed_total += expired.len();
            removed_keys.extend(expired);
        }
        let mut index = self.index.lock().unwrap_or_else(|p| p.into_inner());
        for key in removed_keys {
            index.shard_of.remove(&key);
            index.access_order.remove(&key);
        }
        Ok(removed_total)
    }
}
