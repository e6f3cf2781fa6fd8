//! Statistics aggregate (spec §3.3, component C6).

use crate::tiers::TierKind;

/// Counters for a single tier.
#[derive(Debug, Clone, Default)]
pub struct TierStats {
    pub kind: Option<TierKind>,
    pub hits: u64,
    pub misses: u64,
    pub evictions_lru: u64,
    pub evictions_ttl: u64,
    pub evictions_health: u64,
    pub current_size: usize,
    pub degraded: bool,
}

impl TierStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Deep-copyable snapshot returned by `get_statistics()`. Counters are
/// monotonic within a process lifetime; `clear()` does not reset them.
#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub tiers: Vec<TierStats>,
    pub promotions: u64,
    pub demotions: u64,
}

impl CacheStatistics {
    /// `L1_hits / (L1_hits + L1_misses)`, computed on demand since L1 is
    /// the single serialization point every request passes through.
    pub fn overall_hit_rate(&self) -> f64 {
        self.tiers.first().map(TierStats::hit_rate).unwrap_or(0.0)
    }
}
