//! Credential encryption with key rotation (spec component C1).
//!
//! Grounded on `examples/vanyastaff-nebula/crates/nebula-credential`, which
//! solves the same problem (encrypt-at-rest secrets with a rotatable key)
//! using the same crate family (`aes-gcm`, `zeroize`). The rotation protocol
//! itself follows `examples/original_source/proxywhirl/cache/crypto.py`.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CacheError, CacheResult};

const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

/// Name of the environment variable holding the current encryption key.
pub const ENV_CURRENT_KEY: &str = "PROXYWHIRL_CACHE_ENCRYPTION_KEY";
/// Name of the environment variable holding the previous encryption key.
pub const ENV_PREVIOUS_KEY: &str = "PROXYWHIRL_CACHE_KEY_PREVIOUS";

/// A string value that is never printed in full.
///
/// `Debug` and `Display` both redact; the plaintext is reachable only via
/// [`Secret::expose`], which callers should use only at the point they need
/// the raw value (e.g. handing it to an HTTP client's proxy auth header).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(\"[REDACTED]\")")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

fn decode_key(slot: &'static str, encoded: &str) -> CacheResult<Key<Aes256Gcm>> {
    let bytes = URL_SAFE.decode(encoded.trim()).map_err(|e| CacheError::InvalidKey {
        slot,
        message: format!(
            "key is not valid URL-safe base64 ({e}); set {slot} to a 32-byte \
             URL-safe-base64-encoded value"
        ),
    })?;
    if bytes.len() != KEY_BYTES {
        return Err(CacheError::InvalidKey {
            slot,
            message: format!(
                "decoded key is {} bytes, expected {KEY_BYTES}; set {slot} to a \
                 32-byte URL-safe-base64-encoded value",
                bytes.len()
            ),
        });
    }
    Ok(*Key::<Aes256Gcm>::from_slice(&bytes))
}

fn random_key_base64() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

struct CipherKeys {
    current: Aes256Gcm,
    previous: Option<Aes256Gcm>,
}

/// Symmetric AEAD cipher guarding credential plaintext, with support for
/// rotating the active key while retaining the ability to decrypt data
/// written under the previous one.
pub struct CredentialCipher {
    keys: Mutex<CipherKeys>,
}

impl CredentialCipher {
    /// Acquire `{current_key, optional previous_key}` from the process
    /// environment. If neither slot is set, a random current key is
    /// generated (data encrypted with it will not survive process restart
    /// unless the generated key is persisted by the caller).
    pub fn from_env() -> CacheResult<Self> {
        let current_encoded = match std::env::var(ENV_CURRENT_KEY) {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(
                    "{ENV_CURRENT_KEY} not set; generating a random key. Data encrypted \
                     with this key cannot be decrypted by a future process unless this \
                     key is persisted."
                );
                random_key_base64()
            }
        };
        let current = Aes256Gcm::new(&decode_key(ENV_CURRENT_KEY, &current_encoded)?);

        let previous = match std::env::var(ENV_PREVIOUS_KEY) {
            Ok(v) if !v.trim().is_empty() => {
                Some(Aes256Gcm::new(&decode_key(ENV_PREVIOUS_KEY, &v)?))
            }
            _ => None,
        };

        Ok(Self {
            keys: Mutex::new(CipherKeys { current, previous }),
        })
    }

    /// Build a cipher from an explicit current key, bypassing the
    /// environment. Used by tests and by callers supplying key material
    /// through their own configuration plumbing.
    pub fn with_key(current_key_b64: &str) -> CacheResult<Self> {
        let current = Aes256Gcm::new(&decode_key(ENV_CURRENT_KEY, current_key_b64)?);
        Ok(Self {
            keys: Mutex::new(CipherKeys {
                current,
                previous: None,
            }),
        })
    }

    /// Encrypt a secret. Empty input returns empty output.
    pub fn encrypt(&self, secret: &Secret) -> CacheResult<Vec<u8>> {
        if secret.is_empty() {
            return Ok(Vec::new());
        }
        let keys = self.keys.lock();
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = keys
            .current
            .encrypt(nonce, secret.expose().as_bytes())
            .map_err(|e| CacheError::InvalidEntry(format!("encryption failed: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a ciphertext produced by [`Self::encrypt`]. Empty input
    /// returns an empty secret. Tries the current key, then the previous
    /// key, before failing.
    pub fn decrypt(&self, bytes: &[u8]) -> CacheResult<Secret> {
        if bytes.is_empty() {
            return Ok(Secret::new(String::new()));
        }
        if bytes.len() < NONCE_BYTES {
            return Err(CacheError::DecryptionFailed(
                "ciphertext shorter than nonce".into(),
            ));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_BYTES);
        let nonce = Nonce::from_slice(nonce_bytes);

        let keys = self.keys.lock();
        if let Ok(plain) = keys.current.decrypt(nonce, ciphertext) {
            return String::from_utf8(plain)
                .map(Secret::new)
                .map_err(|e| CacheError::DecryptionFailed(e.to_string()));
        }
        if let Some(previous) = &keys.previous {
            if let Ok(plain) = previous.decrypt(nonce, ciphertext) {
                return String::from_utf8(plain)
                    .map(Secret::new)
                    .map_err(|e| CacheError::DecryptionFailed(e.to_string()));
            }
        }
        Err(CacheError::DecryptionFailed(
            "ciphertext does not decrypt with the current or previous key".into(),
        ))
    }

    /// Rotate to a new key: validate its format, move the current key into
    /// the previous slot, and install the new key as current. Acquires the
    /// same internal lock as [`Self::encrypt`]/[`Self::decrypt`], so rotation
    /// is atomic relative to in-flight cipher calls.
    pub fn rotate(&self, new_key_b64: &str) -> CacheResult<()> {
        let new_current = Aes256Gcm::new(&decode_key(ENV_CURRENT_KEY, new_key_b64)?);
        let mut keys = self.keys.lock();
        let retiring = std::mem::replace(&mut keys.current, new_current);
        keys.previous = Some(retiring);
        tracing::info!("encryption key rotated");
        Ok(())
    }
}
