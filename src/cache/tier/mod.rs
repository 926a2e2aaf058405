//! Storage backends making up the tier chain.
//!
//! Tiers know nothing about each other, tenants or tags: they store opaque
//! [`CacheEntry`] values under full keys. Ordering, back-fill and timeouts
//! are handled by [`TierChain`](super::chain::TierChain).

pub(crate) mod distributed;
mod durable;
mod memory;

use std::time::Duration;

use async_trait::async_trait;

use super::entry::CacheEntry;
use crate::error::{CacheError, Result};

pub use distributed::RedisTier;
pub use durable::DurableTier;
pub use memory::MemoryTier;

/// What a tier can do beyond plain get/set/delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCapabilities {
    pub supports_ttl: bool,
    pub supports_pattern_scan: bool,
}

/// A single storage backend.
#[async_trait]
pub trait Tier: Send + Sync {
    /// Stable name used in logs, events and `required_tier`.
    fn name(&self) -> &str;

    fn capabilities(&self) -> TierCapabilities;

    /// Read an entry. Expired entries are reported as `None`.
    async fn read(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry that must disappear after `ttl`.
    async fn write(&self, key: &str, entry: &CacheEntry, ttl: Duration) -> Result<()>;

    /// Remove an entry. Returns whether something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every key matching a `*`/`?` glob. Returns the count removed.
    async fn delete_matching(&self, _pattern: &str) -> Result<u64> {
        Err(CacheError::PatternScanUnsupported {
            tier: self.name().to_string(),
        })
    }

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
