//! The cache entry and its supporting value types (spec component C2).
//!
//! Grounded on `examples/original_source/proxywhirl/cache/models.py`'s
//! `CacheEntry`/`HealthStatus` pair, translated from a validated pydantic
//! model into an eagerly-validated Rust constructor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::Secret;
use crate::error::{CacheError, CacheResult};

/// Health state attached to a cache entry, updated by [`crate::manager::CacheManager::invalidate_by_health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Unknown
    }
}

/// One cached proxy record.
///
/// Immutable by convention: every field is mutated only by producing an
/// updated copy via `[Self::touched]`/`[Self::with_health_failure]`/
/// `[Self::with_evicted_from_l1]`, matching spec.md's functional-update
/// lifecycle rule.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub proxy_url: String,
    pub username: Option<Secret>,
    pub password: Option<Secret>,
    pub source: String,
    pub fetch_time: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
    pub health_status: HealthStatus,
    pub failure_count: u32,
    pub evicted_from_l1: bool,
}

/// Parameters needed to construct a fresh entry; `expires_at` and
/// `last_accessed` are derived, not supplied, so the invariants in
/// spec.md §3.1 cannot be violated by a caller.
pub struct NewCacheEntry {
    pub key: String,
    pub proxy_url: String,
    pub username: Option<Secret>,
    pub password: Option<Secret>,
    pub source: String,
    pub fetch_time: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl CacheEntry {
    /// Construct a new entry, validating all invariants eagerly.
    pub fn new(params: NewCacheEntry) -> CacheResult<Self> {
        if params.key.is_empty() {
            return Err(CacheError::InvalidEntry("key must not be empty".into()));
        }
        if params.proxy_url.is_empty() {
            return Err(CacheError::InvalidEntry(
                "proxy_url must not be empty".into(),
            ));
        }
        if params.ttl_seconds == 0 {
            return Err(CacheError::InvalidEntry(
                "ttl_seconds must be positive".into(),
            ));
        }
        let expires_at = params.fetch_time + chrono::Duration::seconds(params.ttl_seconds as i64);
        Ok(Self {
            key: params.key,
            proxy_url: params.proxy_url,
            username: params.username,
            password: params.password,
            source: params.source,
            fetch_time: params.fetch_time,
            last_accessed: params.fetch_time,
            access_count: 0,
            ttl_seconds: params.ttl_seconds,
            expires_at,
            health_status: HealthStatus::Unknown,
            failure_count: 0,
            evicted_from_l1: false,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Return a copy reflecting a successful read: `access_count + 1`,
    /// `last_accessed = now`.
    #[must_use]
    pub fn touched(&self, now: DateTime<Utc>) -> Self {
        let mut copy = self.clone();
        copy.access_count += 1;
        copy.last_accessed = now;
        copy
    }

    /// Return a copy reflecting an observed health failure.
    #[must_use]
    pub fn with_health_failure(&self) -> Self {
        let mut copy = self.clone();
        copy.failure_count += 1;
        copy.health_status = HealthStatus::Unhealthy;
        copy
    }

    /// Return a copy tagged as demoted out of L1.
    #[must_use]
    pub fn with_evicted_from_l1(&self, evicted: bool) -> Self {
        let mut copy = self.clone();
        copy.evicted_from_l1 = evicted;
        copy
    }
}

/// On-the-wire representation used by tier storage (file/database) and by
/// warm/export files. Credentials are carried as ciphertext; this type
/// never holds plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: String,
    pub proxy_url: String,
    #[serde(default, with = "hex_opt")]
    pub username_encrypted: Option<Vec<u8>>,
    #[serde(default, with = "hex_opt")]
    pub password_encrypted: Option<Vec<u8>>,
    pub source: String,
    pub fetch_time: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
    pub health_status: HealthStatus,
    pub failure_count: u32,
    pub evicted_from_l1: bool,
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_str(&hex_encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) if !s.is_empty() => hex_decode(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }

    fn hex_encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
        if s.len() % 2 != 0 {
            return Err("odd-length hex string".into());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(ttl: u64) -> NewCacheEntry {
        NewCacheEntry {
            key: "k1".into(),
            proxy_url: "http://p.example:8080".into(),
            username: Some(Secret::new("u")),
            password: Some(Secret::new("p")),
            source: "test".into(),
            fetch_time: Utc::now(),
            ttl_seconds: ttl,
        }
    }

    #[test]
    fn construction_derives_expires_at() {
        let entry = CacheEntry::new(params(3600)).unwrap();
        assert_eq!(entry.expires_at, entry.fetch_time + chrono::Duration::seconds(3600));
        assert!(entry.last_accessed >= entry.fetch_time);
    }

    #[test]
    fn zero_ttl_is_rejected() {
        assert!(CacheEntry::new(params(0)).is_err());
    }

    #[test]
    fn touched_bumps_access_tracking_only() {
        let entry = CacheEntry::new(params(60)).unwrap();
        let later = entry.fetch_time + chrono::Duration::seconds(5);
        let touched = entry.touched(later);
        assert_eq!(touched.access_count, 1);
        assert_eq!(touched.last_accessed, later);
        assert_eq!(touched.proxy_url, entry.proxy_url);
        assert_eq!(touched.expires_at, entry.expires_at);
    }
}
