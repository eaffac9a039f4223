//! Bounded, TTL'd LRU cache that stands in for the backing store during outages.

use crate::clock::Clock;
use crate::error::ConfigError;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Sizing for the local fallback cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCacheConfig {
    /// Maximum number of entries held at once.
    pub max_size: usize,
    /// Entries older than this are treated as absent.
    pub ttl: Duration,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self { max_size: 1_000, ttl: Duration::from_secs(300) }
    }
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    inserted_at_millis: u64,
}

/// In-process LRU with per-entry expiry.
///
/// `max_size` and `ttl` are fixed at construction. All operations take `&self`; the LRU list is
/// guarded by a mutex that is only held for the in-memory update.
#[derive(Debug)]
pub struct LocalFallbackCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl_millis: u64,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl LocalFallbackCache {
    /// Build a cache; `max_size` and `ttl` must both be non-zero.
    pub fn new(config: LocalCacheConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let cap = NonZeroUsize::new(config.max_size)
            .ok_or(ConfigError::NotPositive { field: "local_cache.max_size" })?;
        if config.ttl.is_zero() {
            return Err(ConfigError::NotPositive { field: "local_cache.ttl" });
        }
        Ok(Self {
            entries: Mutex::new(LruCache::new(cap)),
            ttl_millis: u64::try_from(config.ttl.as_millis()).unwrap_or(u64::MAX),
            ttl: config.ttl,
            clock,
        })
    }

    /// Look up `key`. Expired entries are purged and reported absent; hits become
    /// most-recently-used.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        let inserted_at = entries.peek(key)?.inserted_at_millis;
        if now.saturating_sub(inserted_at) >= self.ttl_millis {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    /// Insert or refresh `key`. A new key at capacity evicts the least-recently-used entry.
    pub fn set(&self, key: &str, value: Vec<u8>) {
        let entry = Entry { value, inserted_at_millis: self.clock.now_millis() };
        let evicted = self.lock().push(key.to_string(), entry);
        if let Some((old_key, _)) = evicted.filter(|(k, _)| k != key) {
            tracing::trace!(evicted = %old_key, "local fallback cache evicted lru entry");
        }
    }

    /// Remove `key`. Returns whether it was present (expired entries count as absent).
    pub fn delete(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.lock()
            .pop(key)
            .is_some_and(|e| now.saturating_sub(e.inserted_at_millis) < self.ttl_millis)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of entries currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Configured capacity.
    pub fn max_size(&self) -> usize {
        self.lock().cap().get()
    }

    /// Configured entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
