//! In-process tier backed by Moka.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use moka::Expiry;
use moka::sync::Cache;

use super::{Tier, TierCapabilities};
use crate::cache::config::MemoryTierConfig;
use crate::cache::entry::CacheEntry;
use crate::cache::key::glob_match;
use crate::error::Result;

/// Expires every entry at its own `expires_at`, optionally capped.
struct EntryExpiry {
    max_ttl: Option<Duration>,
}

impl EntryExpiry {
    fn lifetime(&self, entry: &CacheEntry) -> Duration {
        let ttl = entry.remaining_ttl().unwrap_or(Duration::ZERO);
        match self.max_ttl {
            Some(max) => ttl.min(max),
            None => ttl,
        }
    }
}

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.lifetime(value))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.lifetime(value))
    }
}

/// Bounded in-process tier.
///
/// This tier is:
/// - Thread-safe (Moka guards its segments with short-held locks)
/// - Size-bounded with TinyLFU admission and LRU eviction
/// - Clone-friendly (clones share the same underlying cache)
#[derive(Clone)]
pub struct MemoryTier {
    inner: Cache<String, CacheEntry>,
    name: Arc<str>,
}

impl MemoryTier {
    /// Create a new memory tier with the given name and config.
    pub fn new(name: impl Into<Arc<str>>, config: MemoryTierConfig) -> Self {
        let inner = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(EntryExpiry {
                max_ttl: config.max_ttl,
            })
            .build();

        Self {
            inner,
            name: name.into(),
        }
    }

    /// Check if a live entry exists for the key.
    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Remove a key without going through the async trait.
    pub fn evict(&self, key: &str) {
        self.inner.invalidate(key);
    }

    /// Remove every key matching the glob. Returns the number removed.
    pub fn evict_matching(&self, pattern: &str) -> u64 {
        let mut removed = 0;
        for (key, _) in self.inner.iter() {
            if glob_match(pattern, key.as_str()) {
                self.inner.invalidate(key.as_str());
                removed += 1;
            }
        }
        removed
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    /// Get the number of entries.
    ///
    /// Note: This may not be perfectly accurate due to concurrent operations.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[async_trait]
impl Tier for MemoryTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> TierCapabilities {
        TierCapabilities {
            supports_ttl: true,
            supports_pattern_scan: true,
        }
    }

    async fn read(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self.inner.get(key) {
            Some(entry) if entry.is_expired() => {
                self.inner.invalidate(key);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn write(&self, key: &str, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        // Never keep an entry past the shorter of its own expiry and `ttl`
        let deadline = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));

        let stored = match deadline {
            Some(deadline) if deadline < entry.expires_at => CacheEntry {
                expires_at: deadline,
                ..entry.clone()
            },
            _ => entry.clone(),
        };

        self.inner.insert(key.to_string(), stored);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.remove(key).is_some())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        Ok(self.evict_matching(pattern))
    }
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("name", &self.name)
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}
