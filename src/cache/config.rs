//! Cache configuration.

use std::time::Duration;

use super::strategy::{DEFAULT_TTL, Strategy, StrategySelector};

/// Configuration for the in-process memory tier.
#[derive(Debug, Clone)]
pub struct MemoryTierConfig {
    /// Maximum number of entries in the tier.
    pub max_capacity: u64,

    /// Upper bound on how long an entry stays in memory, regardless of
    /// its own expiry. `None` keeps entries until they expire or are evicted.
    pub max_ttl: Option<Duration>,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            max_ttl: None,
        }
    }
}

impl MemoryTierConfig {
    /// Create a new memory tier config with the given max capacity.
    pub fn with_capacity(max_capacity: u64) -> Self {
        Self {
            max_capacity,
            ..Default::default()
        }
    }

    /// Cap how long any entry may stay in memory.
    #[must_use]
    pub fn max_ttl(mut self, duration: Duration) -> Self {
        self.max_ttl = Some(duration);
        self
    }
}

/// Immutable settings of a [`TieredCache`](super::TieredCache).
///
/// Built once at startup and moved into the cache; nothing in the core
/// mutates it afterwards.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Prefix of every key written by this cache.
    pub namespace: String,

    /// Strategy table plus default strategy.
    pub strategies: StrategySelector,

    /// Name of the tier whose acceptance decides whether a write-through
    /// `set` succeeded. When the chain has no tier with this name, any
    /// accepted tier write counts.
    pub required_tier: String,

    /// Capacity of the write-behind queue.
    pub write_behind_queue: usize,

    /// Upper bound on how long invalidation waits for queued
    /// write-behind writes to land.
    pub flush_timeout: Duration,

    /// Time budget for a single tag index operation.
    pub tag_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            namespace: "cache".to_string(),
            strategies: StrategySelector::default(),
            required_tier: "distributed".to_string(),
            write_behind_queue: 1024,
            flush_timeout: Duration::from_secs(2),
            tag_timeout: Duration::from_millis(250),
        }
    }
}

impl CacheSettings {
    /// Create settings for the given namespace with defaults elsewhere.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Set the strategy table, keeping the built-in default strategy.
    #[must_use]
    pub fn strategies(mut self, strategies: Vec<Strategy>) -> Self {
        self.strategies = StrategySelector::new(strategies, Strategy::fallback(DEFAULT_TTL));
        self
    }

    /// Set the strategy table together with the default TTL.
    #[must_use]
    pub fn strategies_with_default(mut self, strategies: Vec<Strategy>, default_ttl: Duration) -> Self {
        self.strategies = StrategySelector::new(strategies, Strategy::fallback(default_ttl));
        self
    }

    /// Set the tier that must accept write-through writes.
    #[must_use]
    pub fn required_tier(mut self, tier: impl Into<String>) -> Self {
        self.required_tier = tier.into();
        self
    }

    /// Set the write-behind queue capacity.
    #[must_use]
    pub fn write_behind_queue(mut self, capacity: usize) -> Self {
        self.write_behind_queue = capacity.max(1);
        self
    }

    /// Set the tag index time budget.
    #[must_use]
    pub fn tag_timeout(mut self, timeout: Duration) -> Self {
        self.tag_timeout = timeout;
        self
    }

    /// Set the invalidation flush timeout.
    #[must_use]
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }
}
