//! Memory tier (L1): an insertion-ordered map acting as an LRU queue
//! (spec.md §4.3.1).
//!
//! Grounded on `proxywhirl/cache/tiers.py`'s `MemoryCacheTier`
//! (`OrderedDict` + `move_to_end`/`popitem(last=False)`), translated to the
//! `linked-hash-map`-less idiom spec.md §9 suggests: a `HashMap` plus an
//! explicit recency `VecDeque` of keys, since the standard library has no
//! ordered map with O(1) move-to-back.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{Tier, TierKind};
use crate::error::CacheResult;
use crate::model::CacheEntry;

struct Inner {
    map: HashMap<String, CacheEntry>,
    /// Recency queue, oldest (LRU) at the front. May contain stale
    /// duplicate keys after a `get`/`put` touch; `move_to_back` appends a
    /// fresh entry and relies on `evict_one` skipping entries no longer in
    /// `map` or no longer matching the front position.
    order: VecDeque<String>,
}

impl Inner {
    /// Move `key` to the MRU (back) position, removing any prior
    /// occurrence first so the front of `order` always reflects the
    /// true LRU key — mirrors `OrderedDict.move_to_end`.
    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    /// Pop the least-recently-used key, evict it, and return it.
    fn evict_one(&mut self) -> Option<(String, CacheEntry)> {
        let candidate = self.order.pop_front()?;
        let entry = self.map.remove(&candidate)?;
        Some((candidate, entry))
    }
}

/// L1 in-memory LRU tier.
pub struct MemoryTier {
    inner: Mutex<Inner>,
    max_entries: Option<usize>,
}

impl MemoryTier {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries,
        }
    }
}

impl Tier for MemoryTier {
    fn kind(&self) -> TierKind {
        TierKind::L1Memory
    }

    fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = inner.map.get(key).cloned() {
            inner.touch(key);
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    fn put(&self, key: &str, entry: CacheEntry) -> CacheResult<Option<(String, CacheEntry)>> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let is_new_key = !inner.map.contains_key(key);
        inner.map.insert(key.to_string(), entry);
        inner.touch(key);

        if !is_new_key {
            return Ok(None);
        }
        let Some(max) = self.max_entries else {
            return Ok(None);
        };
        if inner.map.len() > max {
            Ok(inner.evict_one())
        } else {
            Ok(None)
        }
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let existed = inner.map.remove(key).is_some();
        inner.order.retain(|k| k != key);
        Ok(existed)
    }

    fn clear(&self) -> CacheResult<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let n = inner.map.len();
        inner.map.clear();
        inner.order.clear();
        Ok(n)
    }

    fn size(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).map.len()
    }

    fn keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .map
            .keys()
            .cloned()
            .collect()
    }

    fn cleanup_expired(&self, now: DateTime<Utc>) -> CacheResult<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            inner.map.remove(k);
        }
        inner.order.retain(|k| !expired.contains(k));
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewCacheEntry;

    fn entry(key: &str) -> CacheEntry {
        CacheEntry::new(NewCacheEntry {
            key: key.to_string(),
            proxy_url: format!("http://{key}.example:8080"),
            username: None,
            password: None,
            source: "test".into(),
            fetch_time: Utc::now(),
            ttl_seconds: 3600,
        })
        .unwrap()
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let tier = MemoryTier::new(Some(2));
        tier.put("k1", entry("k1")).unwrap();
        tier.put("k2", entry("k2")).unwrap();
        let evicted = tier.put("k3", entry("k3")).unwrap();
        assert_eq!(tier.size(), 2);
        assert_eq!(evicted.map(|(k, _)| k), Some("k1".to_string()));
    }

    #[test]
    fn get_moves_key_to_mru() {
        let tier = MemoryTier::new(Some(2));
        tier.put("k1", entry("k1")).unwrap();
        tier.put("k2", entry("k2")).unwrap();
        tier.get("k1").unwrap();
        let evicted = tier.put("k3", entry("k3")).unwrap();
        assert_eq!(evicted.map(|(k, _)| k), Some("k2".to_string()));
        assert!(tier.get("k1").unwrap().is_some());
    }

    #[test]
    fn update_of_existing_key_never_evicts() {
        let tier = MemoryTier::new(Some(1));
        tier.put("k1", entry("k1")).unwrap();
        let evicted = tier.put("k1", entry("k1")).unwrap();
        assert!(evicted.is_none());
        assert_eq!(tier.size(), 1);
    }

    #[test]
    fn repeated_reads_do_not_grow_the_recency_queue_unbounded() {
        let tier = MemoryTier::new(Some(2));
        tier.put("k1", entry("k1")).unwrap();
        tier.put("k2", entry("k2")).unwrap();
        for _ in 0..100 {
            tier.get("k1").unwrap();
        }
        let inner = tier.inner.lock().unwrap();
        assert_eq!(inner.order.len(), 2);
    }
}
