//! Configuration module for the tiered cache runner.
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use crate::cache::{CacheSettings, DEFAULT_TTL, MemoryTierConfig, Strategy, parse_strategies};
use crate::error::{CacheError, Result};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Prefix of every cache key.
    pub namespace: String,

    // Redis
    pub redis_url: Option<String>,
    pub redis_pool_size: usize,

    // MongoDB
    pub mongodb_uri: Option<String>,
    pub mongodb_database: String,
    pub mongodb_collection: String,

    // Cache behaviour
    pub memory_capacity: u64,
    pub memory_max_ttl: Option<Duration>,
    pub tier_timeout: Duration,
    pub required_tier: String,
    pub default_ttl: Duration,
    pub write_behind_queue: usize,
    pub strategies: Vec<Strategy>,

    /// Publish invalidations to other instances. Only meaningful with Redis.
    pub broadcast_invalidations: bool,

    /// How often the runner logs cache statistics.
    pub stats_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables (and `.env`).
    ///
    /// # Errors
    /// Returns `CacheError::Config` when a variable is set but malformed.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let redis_url = var("REDIS_URL");
        let default_ttl = Duration::from_secs(parse(&var, "CACHE_DEFAULT_TTL_SECS", DEFAULT_TTL.as_secs())?);
        if default_ttl.is_zero() {
            return Err(CacheError::Config("CACHE_DEFAULT_TTL_SECS must be positive".to_string()));
        }

        // Inline JSON wins over a file
        let strategies = match (var("CACHE_STRATEGIES"), var("CACHE_STRATEGIES_FILE")) {
            (Some(json), _) => parse_strategies(&json)?,
            (None, Some(path)) => {
                let json = std::fs::read_to_string(&path)
                    .map_err(|e| CacheError::Config(format!("cannot read {path}: {e}")))?;
                parse_strategies(&json)?
            }
            (None, None) => Vec::new(),
        };

        Ok(Self {
            namespace: var("CACHE_NAMESPACE").unwrap_or_else(|| "cache".to_string()),
            broadcast_invalidations: parse_bool(&var, "CACHE_BROADCAST_INVALIDATIONS", redis_url.is_some())?,
            redis_url,
            redis_pool_size: parse(&var, "REDIS_POOL_SIZE", 16)?,
            mongodb_uri: var("MONGODB_URI"),
            mongodb_database: var("MONGODB_DATABASE").unwrap_or_else(|| "tiered_cache".to_string()),
            mongodb_collection: var("MONGODB_COLLECTION").unwrap_or_else(|| "cache_entries".to_string()),
            memory_capacity: parse(&var, "CACHE_MEMORY_CAPACITY", 10_000)?,
            memory_max_ttl: parse_opt(&var, "CACHE_MEMORY_MAX_TTL_SECS")?.map(Duration::from_secs),
            tier_timeout: Duration::from_millis(parse(&var, "CACHE_TIER_TIMEOUT_MS", 250)?),
            required_tier: var("CACHE_REQUIRED_TIER").unwrap_or_else(|| "distributed".to_string()),
            default_ttl,
            write_behind_queue: parse(&var, "CACHE_WRITE_BEHIND_QUEUE", 1024)?,
            strategies,
            stats_interval: Duration::from_secs(parse(&var, "CACHE_STATS_INTERVAL_SECS", 60)?.max(1)),
        })
    }

    /// Settings for the cache core.
    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings::new(&self.namespace)
            .strategies_with_default(self.strategies.clone(), self.default_ttl)
            .required_tier(&self.required_tier)
            .write_behind_queue(self.write_behind_queue)
    }

    /// Settings for the memory tier.
    pub fn memory_tier(&self) -> MemoryTierConfig {
        let config = MemoryTierConfig::with_capacity(self.memory_capacity);
        match self.memory_max_ttl {
            Some(max_ttl) => config.max_ttl(max_ttl),
            None => config,
        }
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(var, name)?.unwrap_or(default))
}

fn parse_opt<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.parse()
                .map_err(|e| CacheError::Config(format!("{name}='{raw}': {e}")))
        })
        .transpose()
}

fn parse_bool(var: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> Result<bool> {
    match var(name).map(|v| v.to_lowercase()).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(CacheError::Config(format!("{name}='{other}' is not a boolean"))),
    }
}
