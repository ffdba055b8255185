//! Integrity-checked, time-bound cache of backend responses.
//!
//! Entries are keyed by a content fingerprint and carry a keyed HMAC-SHA256
//! tag over the payload, computed under a process-wide secret. A read
//! recomputes the tag and compares it in constant time; a mismatch means
//! the stored bytes were altered underneath us (shared storage, stray
//! writer), and the entry is evicted and reported as a miss rather than
//! returned, with a drainable event recording the eviction. Corruption is
//! never fatal here; the router simply pays for a fresh dispatch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Fingerprints and tags
// ---------------------------------------------------------------------------

/// Content fingerprint of a request payload: hex SHA-256.
pub fn fingerprint(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    hex_string(&digest)
}

/// Keyed integrity tag over a payload: hex HMAC-SHA256.
fn keyed_tag(secret: &[u8], payload: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex_string(&mac.finalize().into_bytes())
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut result = 0;
    for (x, y) in a_bytes.iter().zip(b_bytes.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ---------------------------------------------------------------------------
// CacheConfig / CacheError
// ---------------------------------------------------------------------------

/// Configuration for the response cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default entry lifetime in milliseconds.
    pub default_ttl_ms: u64,
    /// Maximum resident entries; inserting past this evicts the entry with
    /// the earliest expiry.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 300_000,
            max_entries: 1_024,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.default_ttl_ms == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "default_ttl_ms must be > 0".to_string(),
            });
        }
        if self.max_entries == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "max_entries must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Errors from cache construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheError {
    InvalidConfig { reason: String },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { reason } => write!(f, "invalid cache config: {reason}"),
        }
    }
}

impl std::error::Error for CacheError {}

// ---------------------------------------------------------------------------
// CacheStats / CacheEvent
// ---------------------------------------------------------------------------

/// Counters describing cache behavior since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub corruption_evictions: u64,
    pub insertions: u64,
    pub capacity_evictions: u64,
}

/// Structured event emitted when an entry is discarded for cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEvent {
    /// `corruption_evicted`.
    pub event: String,
    /// Fingerprint of the affected entry.
    pub fingerprint: String,
}

// ---------------------------------------------------------------------------
// ResponseCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: String,
    integrity_tag: String,
    expires_at_ms: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: BTreeMap<String, CacheEntry>,
    stats: CacheStats,
    events: Vec<CacheEvent>,
}

/// Shared, integrity-checked TTL cache.
///
/// A single mutex guards the entry map, so readers always observe an entry's
/// payload, tag, and expiry as one atomic snapshot.
pub struct ResponseCache {
    config: CacheConfig,
    secret: Vec<u8>,
    inner: Mutex<CacheInner>,
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    /// Create a cache with the given integrity secret.
    pub fn new(config: CacheConfig, secret: &[u8]) -> Result<Self, CacheError> {
        config.validate()?;
        if secret.is_empty() {
            return Err(CacheError::InvalidConfig {
                reason: "integrity secret must not be empty".to_string(),
            });
        }
        Ok(Self {
            config,
            secret: secret.to_vec(),
            inner: Mutex::new(CacheInner::default()),
        })
    }

    /// Store a payload under a fingerprint with an explicit TTL.
    pub fn put(&self, fingerprint: &str, payload: &str, ttl_ms: u64, now_ms: u64) {
        let entry = CacheEntry {
            payload: payload.to_string(),
            integrity_tag: keyed_tag(&self.secret, payload),
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        };
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.entries.contains_key(fingerprint) && inner.entries.len() >= self.config.max_entries
        {
            // Evict the entry closest to expiry; ties break on key order.
            let victim = inner
                .entries
                .iter()
                .min_by(|(ka, a), (kb, b)| {
                    a.expires_at_ms.cmp(&b.expires_at_ms).then(ka.cmp(kb))
                })
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                inner.entries.remove(&victim);
                inner.stats.capacity_evictions += 1;
            }
        }
        inner.entries.insert(fingerprint.to_string(), entry);
        inner.stats.insertions += 1;
    }

    /// Store a payload using the configured default TTL.
    pub fn put_default(&self, fingerprint: &str, payload: &str, now_ms: u64) {
        self.put(fingerprint, payload, self.config.default_ttl_ms, now_ms);
    }

    /// Fetch a payload by fingerprint.
    ///
    /// Expired and corrupted entries are evicted and read as misses; a
    /// corrupted entry is never returned.
    pub fn get(&self, fingerprint: &str, now_ms: u64) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = match inner.entries.get(fingerprint) {
            Some(entry) => entry.clone(),
            None => {
                inner.stats.misses += 1;
                return None;
            }
        };

        if now_ms > entry.expires_at_ms {
            inner.entries.remove(fingerprint);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }

        let expected = keyed_tag(&self.secret, &entry.payload);
        if !constant_time_eq(&expected, &entry.integrity_tag) {
            inner.entries.remove(fingerprint);
            inner.stats.corruption_evictions += 1;
            inner.stats.misses += 1;
            inner.events.push(CacheEvent {
                event: "corruption_evicted".to_string(),
                fingerprint: fingerprint.to_string(),
            });
            return None;
        }

        inner.stats.hits += 1;
        Some(entry.payload)
    }

    /// Resident entry count.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
    }

    /// Drain accumulated eviction events.
    pub fn drain_events(&self) -> Vec<CacheEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut inner.events)
    }

    /// Default TTL from configuration.
    pub fn default_ttl_ms(&self) -> u64 {
        self.config.default_ttl_ms
    }

    #[cfg(test)]
    fn tamper(&self, fingerprint: &str, payload: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = inner.entries.get_mut(fingerprint) {
            entry.payload = payload.to_string();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
