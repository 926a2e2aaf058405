//! Tiered Cache - Tenant-scoped multi-tier caching
//!
//! Caches JSON-serializable values across an ordered chain of tiers
//! (in-process memory, Redis, MongoDB) with per-category TTLs, tag and
//! pattern invalidation, and per-tier failure isolation.
//!
//! ## Architecture
//!
//! - `cache` - Tier chain, strategies, tags, invalidation, events
//! - `config` - Environment configuration
//! - `database` - MongoDB connection for the durable tier
//! - `error` - Error types

pub mod cache;
pub mod config;
pub mod database;
pub mod error;

pub use cache::{CacheSettings, TenantId, TieredCache};
pub use error::{CacheError, Result};
