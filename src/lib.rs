//! Multi-tier proxy credential cache.
//!
//! A synchronous, single-process cache for rotating proxy credentials,
//! backed by three storage tiers of increasing latency and durability:
//!
//! - **L1** — an in-memory LRU, sub-millisecond.
//! - **L2** — a sharded on-disk store or an embedded SQL database.
//! - **L3** — an embedded SQL database retained across process restarts,
//!   with an auxiliary health-check history table.
//!
//! Every lookup walks the tiers in order, promoting lower-tier hits back
//! into the tiers above it. Credentials are encrypted at rest with a
//! rotatable AES-256-GCM key. A background sweeper bulk-expires stale
//! entries; external health validators report failures through
//! [`CacheManager::invalidate_by_health`], which evicts an entry once it
//! crosses a configured failure threshold.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use proxy_credential_cache::{CacheConfig, CacheManager, CacheEntry, NewCacheEntry, Secret};
//! use chrono::Utc;
//!
//! # fn main() -> proxy_credential_cache::CacheResult<()> {
//! let manager = CacheManager::new(CacheConfig::default())?;
//!
//! let entry = CacheEntry::new(NewCacheEntry {
//!     key: "abc123".into(),
//!     proxy_url: "http://proxy.example:8080".into(),
//!     username: Some(Secret::new("alice")),
//!     password: Some(Secret::new("hunter2")),
//!     source: "free-proxy-list".into(),
//!     fetch_time: Utc::now(),
//!     ttl_seconds: 3600,
//! })?;
//! manager.put(&entry.key, entry)?;
//!
//! if let Some(cached) = manager.get("abc123")? {
//!     println!("cached proxy: {}", cached.proxy_url);
//! }
//!
//! let stats = manager.get_statistics();
//! println!("hit rate: {:.2}%", stats.overall_hit_rate() * 100.0);
//! # Ok(())
//! # }
//! ```
//!
//! # Module layout
//!
//! - [`crypto`] — the credential cipher (C1).
//! - [`model`] — the cache entry and its wire form (C2).
//! - [`config`] — cache configuration (C2).
//! - [`tiers`] — the memory/file/database tier implementations and the
//!   degradation decorator (C3).
//! - [`manager`] — the orchestrator, TTL sweeper, and statistics facade
//!   (C4/C5/C6).
//! - [`error`] — the error taxonomy.
//! - [`stats`] — the statistics aggregate.

pub mod config;
pub mod crypto;
pub mod error;
pub mod manager;
pub mod model;
pub mod stats;
pub mod tiers;

pub use config::{CacheConfig, EvictionPolicy, L2Backend, TierConfig};
pub use crypto::{CredentialCipher, Secret};
pub use error::{CacheError, CacheResult};
pub use manager::{generate_cache_key, CacheManager, WarmCounts};
pub use model::{CacheEntry, HealthStatus, NewCacheEntry, StoredEntry};
pub use stats::{CacheStatistics, TierStats};
pub use tiers::{DatabaseTier, FileTier, Guarded, MemoryTier, Tier, TierKind};
