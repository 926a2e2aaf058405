//! Cache module - Tenant-scoped multi-tier caching.
//!
//! ## Architecture
//!
//! - `TieredCache` - Facade: reads, writes, invalidation, stats
//! - `TierChain` - Ordered tiers with per-tier timeouts and back-fill
//! - `Tier` - Storage backends (`MemoryTier`, `RedisTier`, `DurableTier`)
//! - `KeyBuilder` - Namespaced, tenant-scoped keys
//! - `StrategySelector` - TTL, tags and write mode per key category
//! - `TagIndex` - Tag to member keys, for group invalidation
//! - `EventBus` - Per-operation events fanned out to sinks and counters
//!
//! ## Usage
//!
//! ```rust,ignore
//! let cache = TieredCache::builder(CacheSettings::new("app"))
//!     .tier(Arc::new(MemoryTier::new("memory", MemoryTierConfig::default())), DEFAULT_TIER_TIMEOUT)
//!     .tier(Arc::new(RedisTier::connect("distributed", &url, 16)?), DEFAULT_TIER_TIMEOUT)
//!     .build()?;
//!
//! let tenant = TenantId::new("acme")?;
//! cache.set(&tenant, "projects:1", &project).await?;
//! let project: Option<Project> = cache.get(&tenant, "projects:1").await?;
//! ```

mod chain;
mod config;
mod deferred;
mod entry;
mod events;
mod invalidation;
mod key;
mod pubsub;
mod strategy;
mod tags;
mod tiered;

pub mod tier;

pub use chain::{ChainRead, ChainTier, DEFAULT_TIER_TIMEOUT, TierChain, TierReport};
pub use config::{CacheSettings, MemoryTierConfig};
pub use entry::CacheEntry;
pub use events::{CacheEvent, CacheStats, ChannelSink, EventSink, Operation, TracingSink};
pub use invalidation::{InvalidationFailure, InvalidationReport};
pub use key::{KeyBuilder, TenantId};
pub use pubsub::{InvalidationListener, InvalidationMessage, InvalidationPublisher};
pub use strategy::{DEFAULT_TTL, Strategy, StrategySelector, StrategySpec, WriteMode, parse_strategies};
pub use tags::{MemoryTagIndex, RedisTagIndex, TagIndex};
pub use tier::{DurableTier, MemoryTier, RedisTier, Tier, TierCapabilities};
pub use tiered::{TierHealth, TieredCache, TieredCacheBuilder};
