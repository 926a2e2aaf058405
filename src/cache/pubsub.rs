//! Redis Pub/Sub for cross-instance invalidation of memory tiers.
//!
//! Redis and MongoDB tiers are shared, but every process owns its memory
//! tier. After a local invalidation the cache publishes what it removed;
//! listeners in the other processes evict the same keys from their own
//! memory tier.
//!
//! ```text
//! Instance 1: invalidate("cache:acme:projects:1")
//!   ↓
//! Redis Pub/Sub: PUBLISH cache:invalidate {"kind":"key",...}
//!   ↓
//! Instance 2: listener evicts the key from its memory tier
//! ```

use std::time::Duration;

use deadpool_redis::Pool;
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::tier::MemoryTier;
use crate::error::{CacheError, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// What another instance should evict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum InvalidationMessage {
    Key(String),
    Pattern(String),
}

/// Channel name used for a namespace.
pub fn channel_for(namespace: &str) -> String {
    format!("{namespace}:invalidate")
}

/// Publishes invalidation messages without blocking the caller.
#[derive(Clone)]
pub struct InvalidationPublisher {
    pool: Pool,
    channel: String,
}

impl InvalidationPublisher {
    pub fn new(pool: Pool, namespace: &str) -> Self {
        Self {
            pool,
            channel: channel_for(namespace),
        }
    }

    /// Fire-and-forget publish of a batch of messages.
    pub fn publish(&self, messages: Vec<InvalidationMessage>) {
        if messages.is_empty() {
            return;
        }
        let pool = self.pool.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = publish_all(&pool, &channel, &messages).await {
                warn!(channel = %channel, error = %e, "failed to publish invalidation");
            }
        });
    }
}

async fn publish_all(pool: &Pool, channel: &str, messages: &[InvalidationMessage]) -> Result<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| CacheError::unavailable("pubsub", e))?;
    for message in messages {
        let payload = serde_json::to_string(message)?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| CacheError::unavailable("pubsub", e))?;
    }
    debug!(channel = %channel, count = messages.len(), "published invalidations");
    Ok(())
}

/// Subscribes to the invalidation channel and evicts from a memory tier.
pub struct InvalidationListener {
    pub redis_url: String,
    pub channel: String,
    pub local: MemoryTier,
}

impl InvalidationListener {
    pub fn new(redis_url: impl Into<String>, namespace: &str, local: MemoryTier) -> Self {
        Self {
            redis_url: redis_url.into(),
            channel: channel_for(namespace),
            local,
        }
    }

    /// Spawn the listener. It reconnects with exponential backoff until
    /// the returned handle is aborted.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                match self.run().await {
                    Ok(()) => backoff = Duration::from_secs(1),
                    Err(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "invalidation listener error, reconnecting..."
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        })
    }

    async fn run(&self) -> Result<()> {
        let client = redis::Client::open(self.redis_url.as_str())
            .map_err(|e| CacheError::unavailable("pubsub", e))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::unavailable("pubsub", e))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| CacheError::unavailable("pubsub", e))?;

        info!(channel = %self.channel, "subscribed to invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            match msg.get_payload::<String>() {
                Ok(payload) => self.apply(&payload),
                Err(e) => warn!(error = %e, "invalidation payload is not a string"),
            }
        }

        Err(CacheError::unavailable("pubsub", "connection closed"))
    }

    /// Evict what a message names from the local memory tier.
    pub fn apply(&self, payload: &str) {
        match serde_json::from_str::<InvalidationMessage>(payload) {
            Ok(InvalidationMessage::Key(key)) => {
                debug!(key = %key, "received key invalidation");
                self.local.evict(&key);
            }
            Ok(InvalidationMessage::Pattern(pattern)) => {
                let removed = self.local.evict_matching(&pattern);
                debug!(pattern = %pattern, removed, "received pattern invalidation");
            }
            Err(e) => warn!(error = %e, "failed to parse invalidation message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::MemoryTierConfig;
    use crate::cache::entry::CacheEntry;
    use crate::cache::tier::Tier;

    #[test]
    fn test_message_format() {
        let json = serde_json::to_string(&InvalidationMessage::Key("cache:acme:k".into())).unwrap();
        assert_eq!(json, r#"{"kind":"key","target":"cache:acme:k"}"#);
        assert_eq!(channel_for("cache"), "cache:invalidate");
    }

    #[tokio::test]
    async fn test_apply_evicts_local_entries() {
        let local = MemoryTier::new("memory", MemoryTierConfig::default());
        let entry = CacheEntry::new(b"1".to_vec(), Duration::from_secs(60), Vec::new());
        for key in ["cache:acme:a", "cache:acme:b", "cache:globex:a"] {
            local.write(key, &entry, Duration::from_secs(60)).await.unwrap();
        }

        let listener = InvalidationListener::new("redis://localhost", "cache", local.clone());
        listener.apply(r#"{"kind":"key","target":"cache:acme:a"}"#);
        assert!(!local.contains("cache:acme:a"));
        assert!(local.contains("cache:acme:b"));

        listener.apply(r#"{"kind":"pattern","target":"cache:acme:*"}"#);
        assert!(!local.contains("cache:acme:b"));
        assert!(local.contains("cache:globex:a"));

        // Garbage is logged and ignored
        listener.apply("not json");
        assert!(local.contains("cache:globex:a"));
    }
}
