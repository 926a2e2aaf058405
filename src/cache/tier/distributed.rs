//! Distributed tier backed by Redis.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use tracing::debug;

use super::{Tier, TierCapabilities};
use crate::cache::entry::CacheEntry;
use crate::error::{CacheError, Result};

/// Keys fetched per `SCAN` round trip.
const SCAN_BATCH: usize = 500;

/// Shared tier over a Redis connection pool.
///
/// Values are stored as the raw payload with a millisecond expiry; on read
/// the remaining `PTTL` rebuilds the absolute `expires_at`, so back-fill
/// from this tier can never extend an entry's lifetime. Tags are not
/// stored here; they live in the tag index.
#[derive(Clone)]
pub struct RedisTier {
    pool: Pool,
    name: String,
}

impl RedisTier {
    pub fn new(name: impl Into<String>, pool: Pool) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    /// Build a pool for `url` with at most `pool_size` connections.
    pub fn connect(name: impl Into<String>, url: &str, pool_size: usize) -> Result<Self> {
        let name = name.into();
        let mut config = deadpool_redis::Config::from_url(url);
        if let Some(ref mut pool_config) = config.pool {
            pool_config.max_size = pool_size;
        } else {
            config.pool = Some(deadpool_redis::PoolConfig::new(pool_size));
        }
        let pool = config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| CacheError::unavailable(&name, e))?;
        Ok(Self::new(name, pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::unavailable(&self.name, e))
    }

    fn err(&self, e: redis::RedisError) -> CacheError {
        CacheError::unavailable(&self.name, e)
    }
}

/// Collect every key matching `pattern` with cursor-based `SCAN`.
pub(crate) async fn scan_keys(conn: &mut Connection, pattern: &str) -> redis::RedisResult<Vec<String>> {
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query_async(conn)
            .await?;
        keys.extend(batch);
        if next == 0 {
            return Ok(keys);
        }
        cursor = next;
    }
}

#[async_trait]
impl Tier for RedisTier {
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
        let mut conn = self.conn().await?;
        let (data, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.err(e))?;

        // PTTL: -2 missing, -1 no expiry (never written by us), 0 expiring now
        match data {
            Some(payload) if pttl > 0 => {
                let expires_at = Utc::now() + chrono::Duration::milliseconds(pttl);
                Ok(Some(CacheEntry::with_expiry(payload, expires_at, Vec::new())))
            }
            Some(_) if pttl == -1 => {
                debug!(key = %key, tier = %self.name, "ignoring key without expiry");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn write(&self, key: &str, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let millis = ttl.as_millis().min(u64::MAX as u128) as u64;
        if millis == 0 {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        conn.pset_ex::<_, _, ()>(key, entry.payload.as_ref(), millis)
            .await
            .map_err(|e| self.err(e))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await.map_err(|e| self.err(e))?;
        Ok(removed > 0)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let keys = scan_keys(&mut conn, pattern).await.map_err(|e| self.err(e))?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut removed = 0u64;
        for chunk in keys.chunks(SCAN_BATCH) {
            let n: i64 = conn.del(chunk).await.map_err(|e| self.err(e))?;
            removed += n.max(0) as u64;
        }
        debug!(pattern = %pattern, removed, tier = %self.name, "pattern delete");
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTier")
            .field("name", &self.name)
            .field("pool", &self.pool.status())
            .finish()
    }
}
