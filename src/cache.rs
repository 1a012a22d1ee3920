//! Result cache
//!
//! In-process, bounded, TTL-based cache of execution results. Keys are
//! SHA-256 digests over the normalized question, the tenant id and the
//! prompt-context fingerprint, so entries never cross tenants.
//!
//! A cache failure is never fatal: a poisoned lock reads as a miss and
//! skips the write.

use crate::config::CacheConfig;
use crate::execution::ExecutionResult;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(question: &str, tenant_id: &str, context_fingerprint: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_question(question).as_bytes());
        hasher.update([0u8]);
        hasher.update(tenant_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(context_fingerprint.as_bytes());
        CacheKey(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

/// Case, whitespace and trailing punctuation do not change the question.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(|c: char| c == '?' || c == '.' || c == '!')
        .trim_end()
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

struct Entry {
    value: ExecutionResult,
    inserted_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct ResultCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Look up a live entry. Expired entries read as absent.
    pub fn get(&self, key: &CacheKey) -> Option<ExecutionResult> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => {
                warn!("Result cache lock poisoned, treating lookup as miss");
                return None;
            }
        };

        let ttl = self.config.ttl;
        let hit = inner
            .entries
            .get(key)
            .filter(|e| e.inserted_at.elapsed() < ttl)
            .map(|e| e.value.clone());
        match hit {
            Some(value) => {
                inner.hits += 1;
                debug!("Cache hit for {}", key);
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Store a result. When full, exactly the oldest entry is evicted.
    pub fn put(&self, key: CacheKey, value: ExecutionResult) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => {
                warn!("Result cache lock poisoned, skipping write");
                return;
            }
        };

        let capacity = self.config.capacity.max(1);
        if !inner.entries.contains_key(&key) && inner.entries.len() >= capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.inserted_at, e.seq))
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
                debug!("Evicted oldest cache entry {}", oldest);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                seq,
            },
        );
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let ttl = self.config.ttl;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner
            .lock()
            .map(|i| CacheStats {
                hits: i.hits,
                misses: i.misses,
                evictions: i.evictions,
                entries: i.entries.len(),
            })
            .unwrap_or_default()
    }
}
