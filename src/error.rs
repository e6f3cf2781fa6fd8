//! Error taxonomy for the credential cache.
//!
//! Every variant carries a human-readable message. None may ever carry
//! plaintext credential material — callers that need to log an error must
//! be able to do so without redaction review.

use thiserror::Error;

/// Errors surfaced by the cache's public API.
///
/// Tier-internal failures (disk errors, lock timeouts) are absorbed by the
/// tier's own failure counter wherever possible (see [`crate::tiers::Guarded`])
/// and only escape as this type when a caller-facing operation cannot
/// proceed at all.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Encryption key material was malformed at cipher construction or rotation.
    #[error("invalid encryption key ({slot}): {message}")]
    InvalidKey {
        /// Which environment slot produced the bad key.
        slot: &'static str,
        message: String,
    },

    /// Ciphertext could not be decrypted with any known key.
    #[error("failed to decrypt entry: {0}")]
    DecryptionFailed(String),

    /// A `CacheEntry` was constructed in violation of its invariants.
    #[error("invalid cache entry: {0}")]
    InvalidEntry(String),

    /// A tier exceeded its failure threshold and is short-circuiting.
    #[error("tier is degraded and not accepting operations")]
    TierDegraded,

    /// Disk or database I/O failed inside a tier.
    #[error("tier I/O error: {0}")]
    Io(String),

    /// An advisory lock or database busy-timeout elapsed.
    #[error("timed out waiting for a lock: {0}")]
    Timeout(String),

    /// A cache-warming input file could not be parsed.
    #[error("malformed warm file: {0}")]
    MalformedWarmFile(String),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

/// Convenience alias used throughout the crate's public surface.
pub type CacheResult<T> = Result<T, CacheError>;
