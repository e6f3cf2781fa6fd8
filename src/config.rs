//! Cache configuration (spec §3.2).
//!
//! Builder style follows the teacher's `CacheSystemBuilder`/`TierConfig`
//! (`examples/thichuong-multi-tier-cache/src/builder.rs`): `with_*` methods
//! returning `Self`, defaults supplied from one central function.

use std::collections::HashMap;
use std::path::PathBuf;

/// Which storage backend serves as L2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Backend {
    File,
    Database,
}

/// Per-tier knobs. `eviction_policy` has a single variant today (spec only
/// defines LRU); it is kept as an enum rather than implied so a future
/// policy doesn't require a breaking config change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
}

#[derive(Debug, Clone)]
pub struct TierConfig {
    pub enabled: bool,
    pub max_entries: Option<usize>,
    pub eviction_policy: EvictionPolicy,
}

impl TierConfig {
    pub fn enabled(max_entries: Option<usize>) -> Self {
        Self {
            enabled: true,
            max_entries,
            eviction_policy: EvictionPolicy::Lru,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_entries: None,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub l1: TierConfig,
    pub l2: TierConfig,
    pub l3: TierConfig,

    pub default_ttl_seconds: u64,
    pub per_source_ttl: HashMap<String, u64>,

    pub l2_backend: L2Backend,
    pub l2_directory: PathBuf,
    pub l3_database_path: PathBuf,

    /// Overrides the environment for the current encryption key. `None`
    /// means "read `PROXYWHIRL_CACHE_ENCRYPTION_KEY` at construction time".
    pub encryption_key: Option<String>,

    pub health_check_invalidation: bool,
    pub failure_threshold: u32,

    pub enable_background_cleanup: bool,
    pub cleanup_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: TierConfig::enabled(Some(2000)),
            l2: TierConfig::enabled(Some(50_000)),
            l3: TierConfig::enabled(None),
            default_ttl_seconds: 3600,
            per_source_ttl: HashMap::new(),
            l2_backend: L2Backend::File,
            l2_directory: PathBuf::from("./cache/l2"),
            l3_database_path: PathBuf::from("./cache/l3.db"),
            encryption_key: None,
            health_check_invalidation: true,
            failure_threshold: 3,
            enable_background_cleanup: true,
            cleanup_interval_seconds: 60,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_l1(mut self, tier: TierConfig) -> Self {
        self.l1 = tier;
        self
    }

    #[must_use]
    pub fn with_l2(mut self, tier: TierConfig, backend: L2Backend) -> Self {
        self.l2 = tier;
        self.l2_backend = backend;
        self
    }

    #[must_use]
    pub fn with_l3(mut self, tier: TierConfig) -> Self {
        self.l3 = tier;
        self
    }

    #[must_use]
    pub fn with_default_ttl_seconds(mut self, ttl: u64) -> Self {
        self.default_ttl_seconds = ttl;
        self
    }

    #[must_use]
    pub fn with_per_source_ttl(mut self, source: impl Into<String>, ttl: u64) -> Self {
        self.per_source_ttl.insert(source.into(), ttl);
        self
    }

    #[must_use]
    pub fn with_l2_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.l2_directory = dir.into();
        self
    }

    #[must_use]
    pub fn with_l3_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.l3_database_path = path.into();
        self
    }

    #[must_use]
    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_health_check_invalidation(mut self, enabled: bool) -> Self {
        self.health_check_invalidation = enabled;
        self
    }

    #[must_use]
    pub fn with_background_cleanup(mut self, enabled: bool, interval_seconds: u64) -> Self {
        self.enable_background_cleanup = enabled;
        self.cleanup_interval_seconds = interval_seconds;
        self
    }

    /// TTL to use for a record from `source`, honoring the per-source
    /// override map before falling back to `default_ttl_seconds`.
    pub fn ttl_for_source(&self, source: &str) -> u64 {
        self.per_source_ttl
            .get(source)
            .copied()
            .unwrap_or(self.default_ttl_seconds)
    }
}
