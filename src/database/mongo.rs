//! MongoDB connection for the durable tier.

use std::time::Duration;

use mongodb::bson::doc;
use mongodb::{Client, Collection, options::ClientOptions};
use tracing::info;

use crate::error::{CacheError, Result};

/// How long the driver may look for a usable server before an operation
/// fails. Kept short so a dead durable tier surfaces as a tier failure.
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared MongoDB handle for durable tiers.
#[derive(Debug, Clone)]
pub struct Database {
    client: Client,
    db: mongodb::Database,
}

impl Database {
    /// Connect and verify the server answers.
    ///
    /// # Errors
    /// Returns `TierUnavailable` if the URI is invalid or the ping fails.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| CacheError::unavailable("durable", e))?;
        options.app_name = Some("tiered-cache".to_string());
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);

        let client = Client::with_options(options).map_err(|e| CacheError::unavailable("durable", e))?;
        let db = client.database(db_name);
        let database = Self { client, db };

        database
            .ping()
            .await
            .map_err(|e| CacheError::unavailable("durable", e))?;
        info!(database = %db_name, "Connected to MongoDB");

        Ok(database)
    }

    /// Round-trip a `ping` to the server.
    pub async fn ping(&self) -> mongodb::error::Result<()> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.db.name()
    }

    pub fn collection<T: Send + Sync>(&self, name: &str) -> Collection<T> {
        self.db.collection(name)
    }
}
