//! Tiered cache runner.
//!
//! Assembles the tier chain from the environment, checks tier health,
//! keeps the cross-instance invalidation listener running and logs cache
//! statistics until interrupted.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tiered_cache::cache::{
    DurableTier, InvalidationListener, InvalidationPublisher, MemoryTier, RedisTagIndex, RedisTier,
    TieredCache,
};
use tiered_cache::config::Config;
use tiered_cache::database::Database;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first (before anything else)
    dotenvy::dotenv().ok();

    // If RUST_LOG is not set, default to "info" level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tiered_cache=info,mongodb=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting tiered cache...");

    let config = Config::from_env()?;
    info!(namespace = %config.namespace, strategies = config.strategies.len(), "Configuration loaded");

    let memory = MemoryTier::new("memory", config.memory_tier());
    let mut builder = TieredCache::builder(config.cache_settings())
        .tier(Arc::new(memory.clone()), config.tier_timeout);

    let mut listener = None;
    if let Some(url) = &config.redis_url {
        info!("Connecting to Redis...");
        let redis = RedisTier::connect("distributed", url, config.redis_pool_size)?;
        let pool = redis.pool().clone();
        builder = builder
            .tier(Arc::new(redis), config.tier_timeout)
            .tag_index(Arc::new(RedisTagIndex::new(pool.clone())));

        if config.broadcast_invalidations {
            builder = builder.broadcast(InvalidationPublisher::new(pool, &config.namespace));
            listener = Some(InvalidationListener::new(url.clone(), &config.namespace, memory.clone()).start());
        }
    } else {
        info!("REDIS_URL not set, running without distributed tier");
    }

    if let Some(uri) = &config.mongodb_uri {
        info!("Connecting to MongoDB...");
        let db = Database::connect(uri, &config.mongodb_database).await?;
        let durable = DurableTier::new("durable", &db, &config.mongodb_collection);
        durable.ensure_indexes().await?;
        builder = builder.tier(Arc::new(durable), config.tier_timeout);
        info!(database = %db.name(), "Durable tier ready");
    } else {
        info!("MONGODB_URI not set, running without durable tier");
    }

    let cache = builder.build()?;

    for health in cache.health().await {
        match &health.error {
            None => info!(tier = %health.tier, latency_ms = health.latency.as_millis() as u64, "Tier healthy"),
            Some(e) => warn!(tier = %health.tier, error = %e, "Tier unhealthy, continuing degraded"),
        }
    }

    let mut ticker = tokio::time::interval(config.stats_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
            _ = ticker.tick() => {
                let stats = cache.stats();
                info!(
                    hits = stats.hits,
                    misses = stats.misses,
                    hit_rate = format!("{:.1}%", stats.hit_rate() * 100.0),
                    writes = stats.writes,
                    write_failures = stats.write_failures,
                    invalidations = stats.invalidations,
                    deferred_dropped = stats.deferred_dropped,
                    "Cache stats"
                );
            }
        }
    }

    info!("Shutting down...");
    if let Some(listener) = listener {
        listener.abort();
    }
    cache.shutdown().await;

    Ok(())
}
