//! Durable tier backed by a MongoDB collection.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{self, Binary, doc};
use mongodb::options::{IndexOptions, ReplaceOptions};
use mongodb::{Collection, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Tier, TierCapabilities};
use crate::cache::entry::CacheEntry;
use crate::cache::key::glob_to_regex;
use crate::database::Database;
use crate::error::{CacheError, Result};

/// One cached entry as stored in MongoDB.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    #[serde(rename = "_id")]
    key: String,
    payload: Binary,
    expires_at: bson::DateTime,
    #[serde(default)]
    tags: Vec<String>,
    written_at: bson::DateTime,
}

impl StoredEntry {
    fn into_entry(self) -> CacheEntry {
        let expires_at = chrono::DateTime::from_timestamp_millis(self.expires_at.timestamp_millis())
            .unwrap_or_else(Utc::now);
        CacheEntry::with_expiry(self.payload.bytes, expires_at, self.tags)
    }
}

/// Largest, slowest tier: survives restarts of every process.
///
/// Expired documents are filtered on read and reaped by a TTL index on
/// `expires_at` (see [`DurableTier::ensure_indexes`]).
#[derive(Clone)]
pub struct DurableTier {
    db: Database,
    collection: Collection<StoredEntry>,
    name: String,
}

impl DurableTier {
    /// Create a tier over `collection_name` in the given database.
    pub fn new(name: impl Into<String>, db: &Database, collection_name: &str) -> Self {
        Self {
            db: db.clone(),
            collection: db.collection(collection_name),
            name: name.into(),
        }
    }

    /// Create the TTL index that lets MongoDB delete expired entries.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let index = IndexModel::builder()
            .keys(doc! { "expires_at": 1 })
            .options(
                IndexOptions::builder()
                    .expire_after(Duration::ZERO)
                    .name("expires_at_ttl".to_string())
                    .build(),
            )
            .build();

        self.collection
            .create_index(index)
            .await
            .map_err(|e| self.err(e))?;
        info!(tier = %self.name, "TTL index ensured");
        Ok(())
    }

    fn err(&self, e: mongodb::error::Error) -> CacheError {
        CacheError::unavailable(&self.name, e)
    }
}

#[async_trait]
impl Tier for DurableTier {
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
        let filter = doc! {
            "_id": key,
            "expires_at": { "$gt": bson::DateTime::now() },
        };
        let found = self
            .collection
            .find_one(filter)
            .await
            .map_err(|e| self.err(e))?;
        Ok(found.map(StoredEntry::into_entry))
    }

    async fn write(&self, key: &str, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let now = Utc::now().timestamp_millis();
        let expires_at = entry
            .expires_at
            .timestamp_millis()
            .min(now.saturating_add(ttl_millis));

        let stored = StoredEntry {
            key: key.to_string(),
            payload: Binary {
                subtype: BinarySubtype::Generic,
                bytes: entry.payload.to_vec(),
            },
            expires_at: bson::DateTime::from_millis(expires_at),
            tags: entry.tags.to_vec(),
            written_at: bson::DateTime::from_millis(now),
        };

        let options = ReplaceOptions::builder().upsert(true).build();
        self.collection
            .replace_one(doc! { "_id": key }, &stored)
            .with_options(options)
            .await
            .map_err(|e| self.err(e))?;

        debug!(key = %key, tier = %self.name, "stored entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = self
            .collection
            .delete_one(doc! { "_id": key })
            .await
            .map_err(|e| self.err(e))?;
        Ok(result.deleted_count > 0)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let filter = doc! { "_id": { "$regex": glob_to_regex(pattern) } };
        let result = self
            .collection
            .delete_many(filter)
            .await
            .map_err(|e| self.err(e))?;
        Ok(result.deleted_count)
    }

    async fn ping(&self) -> Result<()> {
        self.db.ping().await.map_err(|e| self.err(e))
    }
}

impl std::fmt::Debug for DurableTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableTier")
            .field("name", &self.name)
            .field("collection", &self.collection.name())
            .finish()
    }
}
