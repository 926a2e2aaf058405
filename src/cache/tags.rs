//! Reverse index from tag to member keys.
//!
//! Index keys come from [`KeyBuilder::tag_key`](super::key::KeyBuilder::tag_key)
//! and are therefore tenant-scoped. A tag whose member set is taken is
//! removed outright, so empty tags never accumulate.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tracing::debug;

use super::invalidation::TAG_INDEX;
use super::key::glob_match;
use super::tier::distributed::scan_keys;
use crate::error::{CacheError, Result};

/// Storage for tag membership.
#[async_trait]
pub trait TagIndex: Send + Sync {
    /// Register `member` under `tag_key`. `ttl` is the member's lifetime;
    /// implementations may keep the tag longer but never shorter.
    async fn add_member(&self, tag_key: &str, member: &str, ttl: Duration) -> Result<()>;

    /// Atomically return and clear the members of a tag.
    async fn take(&self, tag_key: &str) -> Result<HashSet<String>>;

    /// Current members of a tag.
    async fn members(&self, tag_key: &str) -> Result<HashSet<String>>;

    /// Drop every tag whose key matches the glob. Returns the count dropped.
    async fn clear_matching(&self, pattern: &str) -> Result<u64>;
}

/// Adds between two full sweeps of the memory index.
const SWEEP_EVERY: u64 = 256;

/// Run a tag index call under a time budget.
pub(crate) async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::TierTimeout {
            tier: TAG_INDEX.to_string(),
            timeout,
        }),
    }
}

/// Process-local tag index.
///
/// Every member carries the expiry of the entry it was registered for.
/// Expired members are dropped whenever their tag is touched, and a full
/// sweep runs every few hundred registrations, so tags whose entries all
/// expired do not pile up.
#[derive(Debug, Default)]
pub struct MemoryTagIndex {
    tags: DashMap<String, HashMap<String, DateTime<Utc>>>,
    adds: AtomicU64,
}

impl MemoryTagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked tags, including ones not yet swept.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Drop expired members everywhere and remove tags left empty.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.tags.retain(|_, members| {
            members.retain(|_, expires_at| *expires_at > now);
            !members.is_empty()
        });
    }

    fn live(members: HashMap<String, DateTime<Utc>>) -> HashSet<String> {
        let now = Utc::now();
        members
            .into_iter()
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(member, _)| member)
            .collect()
    }
}

#[async_trait]
impl TagIndex for MemoryTagIndex {
    async fn add_member(&self, tag_key: &str, member: &str, ttl: Duration) -> Result<()> {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        {
            let mut members = self.tags.entry(tag_key.to_string()).or_default();
            members.retain(|_, at| *at > now);
            let slot = members.entry(member.to_string()).or_insert(expires_at);
            *slot = (*slot).max(expires_at);
        }

        if (self.adds.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.sweep();
        }
        Ok(())
    }

    async fn take(&self, tag_key: &str) -> Result<HashSet<String>> {
        Ok(self
            .tags
            .remove(tag_key)
            .map(|(_, members)| Self::live(members))
            .unwrap_or_default())
    }

    async fn members(&self, tag_key: &str) -> Result<HashSet<String>> {
        let members = self
            .tags
            .get(tag_key)
            .map(|members| Self::live(members.clone()))
            .unwrap_or_default();
        if members.is_empty() {
            self.tags.remove_if(tag_key, |_, members| {
                let now = Utc::now();
                members.values().all(|at| *at <= now)
            });
        }
        Ok(members)
    }

    async fn clear_matching(&self, pattern: &str) -> Result<u64> {
        let before = self.tags.len();
        self.tags.retain(|key, _| !glob_match(pattern, key));
        Ok(before.saturating_sub(self.tags.len()) as u64)
    }
}

/// Tag index shared by every process through Redis sets.
///
/// Expiry is only ever extended (`EXPIRE NX` then `EXPIRE GT`), so a member
/// with a short TTL cannot shorten the life of a tag that still tracks
/// longer-lived keys. Requires Redis 7.0 or later.
#[derive(Clone)]
pub struct RedisTagIndex {
    pool: Pool,
}

impl RedisTagIndex {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(err)
    }
}

fn err(e: impl std::fmt::Display) -> CacheError {
    CacheError::unavailable(TAG_INDEX, e)
}

#[async_trait]
impl TagIndex for RedisTagIndex {
    async fn add_member(&self, tag_key: &str, member: &str, ttl: Duration) -> Result<()> {
        let secs = ttl.as_secs().max(1);
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .sadd(tag_key, member)
            .ignore()
            .cmd("EXPIRE")
            .arg(tag_key)
            .arg(secs)
            .arg("NX")
            .ignore()
            .cmd("EXPIRE")
            .arg(tag_key)
            .arg(secs)
            .arg("GT")
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(err)?;
        Ok(())
    }

    async fn take(&self, tag_key: &str) -> Result<HashSet<String>> {
        let mut conn = self.conn().await?;
        let (members, _): (HashSet<String>, i64) = redis::pipe()
            .atomic()
            .smembers(tag_key)
            .del(tag_key)
            .query_async(&mut conn)
            .await
            .map_err(err)?;
        debug!(tag = %tag_key, members = members.len(), "took tag members");
        Ok(members)
    }

    async fn members(&self, tag_key: &str) -> Result<HashSet<String>> {
        let mut conn = self.conn().await?;
        conn.smembers(tag_key).await.map_err(err)
    }

    async fn clear_matching(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let keys = scan_keys(&mut conn, pattern).await.map_err(err)?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: i64 = conn.del(&keys).await.map_err(err)?;
        Ok(removed.max(0) as u64)
    }
}

impl std::fmt::Debug for RedisTagIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTagIndex")
            .field("pool", &self.pool.status())
            .finish()
    }
}
