//! Per-category caching strategies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Built-in TTL used when no category matches.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Category reported for keys handled by the default strategy.
pub const DEFAULT_CATEGORY: &str = "default";

/// How a `set` propagates through the tier chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Every tier synchronously.
    #[default]
    WriteThrough,
    /// Fastest tier synchronously, the rest from a background queue.
    WriteBehind,
    /// Every tier except the fastest, synchronously.
    WriteAround,
}

impl WriteMode {
    /// Whether entries in this mode may live in the fastest tier.
    pub fn uses_fastest_tier(self) -> bool {
        !matches!(self, Self::WriteAround)
    }
}

/// TTL, tags and write mode applied to one category of keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub category: String,
    pub ttl: Duration,
    pub tags: Vec<String>,
    pub write_mode: WriteMode,
}

impl Strategy {
    pub fn new(category: impl Into<String>, ttl: Duration) -> Self {
        Self {
            category: category.into(),
            ttl,
            tags: Vec::new(),
            write_mode: WriteMode::default(),
        }
    }

    /// Add a tag (builder pattern).
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set the write mode (builder pattern).
    #[must_use]
    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// The strategy used when no category matches.
    pub fn fallback(ttl: Duration) -> Self {
        Self::new(DEFAULT_CATEGORY, ttl)
    }
}

/// Serialized form of a strategy in the configuration JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategySpec {
    pub category: String,
    pub ttl_secs: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub write_mode: WriteMode,
}

impl TryFrom<StrategySpec> for Strategy {
    type Error = CacheError;

    fn try_from(spec: StrategySpec) -> Result<Self> {
        if spec.category.is_empty() {
            return Err(CacheError::Config("strategy category is empty".to_string()));
        }
        if spec.ttl_secs == 0 {
            return Err(CacheError::Config(format!(
                "strategy '{}' has a zero TTL",
                spec.category
            )));
        }
        Ok(Self {
            category: spec.category,
            ttl: Duration::from_secs(spec.ttl_secs),
            tags: spec.tags,
            write_mode: spec.write_mode,
        })
    }
}

/// Parse a JSON strategy table.
pub fn parse_strategies(json: &str) -> Result<Vec<Strategy>> {
    let specs: Vec<StrategySpec> = serde_json::from_str(json)
        .map_err(|e| CacheError::Config(format!("strategy table: {e}")))?;
    specs.into_iter().map(Strategy::try_from).collect()
}

/// Maps logical keys to strategies.
///
/// Categories are plain substring checks evaluated in declaration order;
/// the first match wins.
#[derive(Debug, Clone)]
pub struct StrategySelector {
    strategies: Vec<Strategy>,
    fallback: Strategy,
}

impl StrategySelector {
    pub fn new(strategies: Vec<Strategy>, fallback: Strategy) -> Self {
        Self {
            strategies,
            fallback,
        }
    }

    pub fn resolve(&self, logical_key: &str) -> &Strategy {
        self.strategies
            .iter()
            .find(|s| logical_key.contains(s.category.as_str()))
            .unwrap_or(&self.fallback)
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    pub fn fallback(&self) -> &Strategy {
        &self.fallback
    }
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::new(Vec::new(), Strategy::fallback(DEFAULT_TTL))
    }
}
