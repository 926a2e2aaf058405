//! The tiered cache facade.
//!
//! [`TieredCache`] ties the pieces together: the key builder scopes every
//! key to a tenant, the strategy selector picks TTL, tags and write mode,
//! the tier chain does the reads and writes, and the invalidation engine
//! purges keys, tags and patterns. Reads never fail because a tier is
//! down; they degrade to misses.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::chain::{ChainTier, TierChain, TierReport};
use super::config::CacheSettings;
use super::deferred::{DeferredWrite, DeferredWriter};
use super::entry::CacheEntry;
use super::events::{CacheEvent, CacheStats, EventBus, EventSink, Operation, TracingSink};
use super::invalidation::{InvalidationEngine, InvalidationFailure, InvalidationReport, TAG_INDEX};
use super::key::{KeyBuilder, TenantId};
use super::pubsub::{InvalidationMessage, InvalidationPublisher};
use super::strategy::{Strategy, WriteMode};
use super::tags::{MemoryTagIndex, TagIndex, bounded};
use super::tier::Tier;
use crate::error::{CacheError, Result};

/// Name reported when queued write-behind writes could not be flushed.
const WRITE_BEHIND: &str = "write-behind";

/// Builder for [`TieredCache`].
///
/// Tiers are added fastest first.
pub struct TieredCacheBuilder {
    settings: CacheSettings,
    tiers: Vec<ChainTier>,
    tags: Option<Arc<dyn TagIndex>>,
    sinks: Vec<Arc<dyn EventSink>>,
    publisher: Option<InvalidationPublisher>,
}

impl TieredCacheBuilder {
    /// Append a tier with its time budget.
    #[must_use]
    pub fn tier(mut self, tier: Arc<dyn Tier>, timeout: Duration) -> Self {
        self.tiers.push(ChainTier::new(tier, timeout));
        self
    }

    /// Use a shared tag index instead of the process-local default.
    #[must_use]
    pub fn tag_index(mut self, tags: Arc<dyn TagIndex>) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Add an event sink. Events are always logged through `tracing` too.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Broadcast invalidations to other instances.
    #[must_use]
    pub fn broadcast(mut self, publisher: InvalidationPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Build the cache and start the write-behind worker.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<TieredCache> {
        let keys = KeyBuilder::new(&self.settings.namespace)?;
        let chain = TierChain::new(self.tiers)?;

        let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink)];
        sinks.extend(self.sinks);
        let bus = EventBus::new(sinks);

        let tags = self
            .tags
            .unwrap_or_else(|| Arc::new(MemoryTagIndex::new()) as Arc<dyn TagIndex>);
        let deferred = DeferredWriter::spawn(chain.clone(), self.settings.write_behind_queue, bus.clone());
        let invalidation = InvalidationEngine::new(chain.clone(), tags.clone(), bus.clone(), self.settings.tag_timeout);
        let required_tier = chain.position(&self.settings.required_tier);

        if required_tier.is_none() {
            debug!(
                required = %self.settings.required_tier,
                "required tier not in chain, any accepted write counts"
            );
        }
        info!(
            namespace = %keys.namespace(),
            tiers = ?chain,
            strategies = self.settings.strategies.strategies().len(),
            "tiered cache ready"
        );

        Ok(TieredCache {
            settings: self.settings,
            keys,
            chain,
            tags,
            bus,
            deferred,
            invalidation,
            required_tier,
            publisher: self.publisher,
            write_locks: DashMap::new(),
        })
    }
}

/// Health of one tier.
#[derive(Debug, Clone)]
pub struct TierHealth {
    pub tier: String,
    pub latency: Duration,
    pub error: Option<String>,
}

impl TierHealth {
    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}

/// Multi-tier, tenant-scoped cache.
pub struct TieredCache {
    settings: CacheSettings,
    keys: KeyBuilder,
    chain: TierChain,
    tags: Arc<dyn TagIndex>,
    bus: EventBus,
    deferred: DeferredWriter,
    invalidation: InvalidationEngine,
    required_tier: Option<usize>,
    publisher: Option<InvalidationPublisher>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TieredCache {
    pub fn builder(settings: CacheSettings) -> TieredCacheBuilder {
        TieredCacheBuilder {
            settings,
            tiers: Vec::new(),
            tags: None,
            sinks: Vec::new(),
            publisher: None,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    pub fn chain(&self) -> &TierChain {
        &self.chain
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> CacheStats {
        self.bus.metrics().snapshot()
    }

    // ---- reads ----

    /// Read a value, walking the tiers fastest first.
    ///
    /// Tier failures, timeouts and undecodable entries are all misses.
    /// Only an invalid key is an error.
    pub async fn get<T: DeserializeOwned>(&self, tenant: &TenantId, key: &str) -> Result<Option<T>> {
        let full_key = self.keys.key(tenant, key)?;
        let strategy = self.settings.strategies.resolve(key);
        let started = Instant::now();

        let read = self
            .chain
            .get_with_backfill(&full_key, self.fill_from(strategy))
            .await;
        self.bus
            .publish_reports(&read.reports, &strategy.category, tenant.as_str());

        let Some((index, entry)) = read.hit else {
            self.publish_miss(strategy, tenant, started, None);
            return Ok(None);
        };

        match entry.decode::<T>() {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(
                    key = %full_key,
                    tier = %self.chain.name(index),
                    error = %e,
                    "cached value could not be decoded, treating as miss"
                );
                self.publish_miss(strategy, tenant, started, Some(e.to_string()));
                Ok(None)
            }
        }
    }

    /// Read several keys of one tenant concurrently. Results keep the
    /// order of `keys`.
    pub async fn get_many<T: DeserializeOwned>(
        &self,
        tenant: &TenantId,
        keys: &[&str],
    ) -> Result<Vec<Option<T>>> {
        join_all(keys.iter().map(|key| self.get::<T>(tenant, key)))
            .await
            .into_iter()
            .collect()
    }

    /// Read a value or produce, cache and return it.
    ///
    /// The produced value is returned even when caching it fails.
    pub async fn get_or_insert_with<T, E, F, Fut>(
        &self,
        tenant: &TenantId,
        key: &str,
        producer: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(tenant, key).await? {
            return Ok(value);
        }

        let value = producer().await?;
        match self.set(tenant, key, &value).await {
            Ok(true) => {}
            Ok(false) => debug!(key = %key, tenant = %tenant, "produced value was not cached"),
            Err(e) => warn!(key = %key, tenant = %tenant, error = %e, "failed to cache produced value"),
        }
        Ok(value)
    }

    // ---- writes ----

    /// Store a value using the strategy of its key.
    ///
    /// Returns `Ok(false)` when the tiers that decide success did not
    /// accept the write, or when the key's strategy has a zero TTL. A
    /// `false` write leaves nothing cached. Errors are reserved for invalid
    /// keys and values that cannot be serialized.
    pub async fn set<T: Serialize + ?Sized>(&self, tenant: &TenantId, key: &str, value: &T) -> Result<bool> {
        self.set_with_tags(tenant, key, value, &[]).await
    }

    /// Store a value with tags in addition to its strategy's tags.
    pub async fn set_with_tags<T: Serialize + ?Sized>(
        &self,
        tenant: &TenantId,
        key: &str,
        value: &T,
        extra_tags: &[&str],
    ) -> Result<bool> {
        let full_key = self.keys.key(tenant, key)?;
        let strategy = self.settings.strategies.resolve(key);

        let mut tags = strategy.tags.clone();
        for tag in extra_tags {
            if !tags.iter().any(|t| t == tag) {
                tags.push((*tag).to_string());
            }
        }
        let tag_keys = tags
            .iter()
            .map(|tag| self.keys.tag_key(tenant, tag))
            .collect::<Result<Vec<_>>>()?;
        let entry = CacheEntry::encode(value, strategy.ttl, tags)?;
        if entry.remaining_ttl().is_none() {
            debug!(key = %full_key, category = %strategy.category, "zero TTL, value not cached");
            return Ok(false);
        }

        let lock = KeyLock::acquire(&self.write_locks, &full_key);
        let _held = lock.lock().await;

        // Register tags before the value becomes readable, so a tag purge
        // can never miss a cached key
        for tag_key in &tag_keys {
            if let Err(e) = self.register_tag(tag_key, &full_key, strategy, tenant).await {
                warn!(key = %full_key, tag = %tag_key, error = %e, "tag registration failed, value not cached");
                return Ok(false);
            }
        }

        let len = self.chain.len();
        let accepted = match strategy.write_mode {
            WriteMode::WriteThrough => {
                let reports = self.chain.write_range(0..len, &full_key, &entry).await;
                self.bus
                    .publish_reports(&reports, &strategy.category, tenant.as_str());
                self.accepted_or_rollback(&reports, 0, &full_key).await
            }
            WriteMode::WriteBehind => {
                let reports = self.chain.write_range(0..1, &full_key, &entry).await;
                self.bus
                    .publish_reports(&reports, &strategy.category, tenant.as_str());
                let fast_accepted = reports.iter().all(|r| r.error.is_none());
                if fast_accepted && len > 1 {
                    self.deferred.enqueue(DeferredWrite {
                        key: full_key.clone(),
                        entry,
                        tiers: 1..len,
                        category: strategy.category.clone(),
                        tenant: tenant.to_string(),
                    });
                }
                fast_accepted
            }
            WriteMode::WriteAround => {
                let start = self.around_start();
                let reports = self.chain.write_range(start..len, &full_key, &entry).await;
                self.bus
                    .publish_reports(&reports, &strategy.category, tenant.as_str());
                self.accepted_or_rollback(&reports, start, &full_key).await
            }
        };

        Ok(accepted)
    }

    /// Populate the cache ahead of traffic. Returns how many values were
    /// accepted.
    pub async fn warm_up<K, T, I>(&self, tenant: &TenantId, entries: I) -> Result<usize>
    where
        K: AsRef<str>,
        T: Serialize,
        I: IntoIterator<Item = (K, T)>,
    {
        let mut stored = 0;
        for (key, value) in entries {
            if self.set(tenant, key.as_ref(), &value).await? {
                stored += 1;
            }
        }
        info!(tenant = %tenant, stored, "cache warm-up finished");
        Ok(stored)
    }

    // ---- invalidation ----

    /// Remove one key from every tier.
    pub async fn invalidate(&self, tenant: &TenantId, key: &str) -> Result<InvalidationReport> {
        let full_key = self.keys.key(tenant, key)?;
        let category = &self.settings.strategies.resolve(key).category;

        let mut report = self.fence(&full_key).await;
        report.merge(
            self.invalidation
                .by_key(&full_key, category, tenant.as_str())
                .await,
        );
        self.broadcast(vec![InvalidationMessage::Key(full_key)]);
        Ok(report)
    }

    /// Remove every key registered under any of the tags.
    pub async fn invalidate_tags(&self, tenant: &TenantId, tags: &[&str]) -> Result<InvalidationReport> {
        let tag_keys = tags
            .iter()
            .map(|tag| self.keys.tag_key(tenant, tag))
            .collect::<Result<Vec<_>>>()?;

        let mut report = self.fence(&tags.join(",")).await;
        let (purged, keys) = self
            .invalidation
            .by_tags(&tag_keys, &self.keys.tenant_prefix(tenant), tenant.as_str())
            .await;
        report.merge(purged);

        debug!(tenant = %tenant, tags = ?tags, removed = report.removed, "tags invalidated");
        self.broadcast(keys.into_iter().map(InvalidationMessage::Key).collect());
        Ok(report)
    }

    /// Remove keys of a tenant matching a glob (`*` and `?`).
    ///
    /// Tiers that cannot scan are listed in the report's `skipped_tiers`.
    pub async fn invalidate_pattern(&self, tenant: &TenantId, pattern: &str) -> Result<InvalidationReport> {
        let full_pattern = self.keys.pattern(tenant, pattern)?;

        let mut report = self.fence(&full_pattern).await;
        report.merge(
            self.invalidation
                .by_pattern(&full_pattern, tenant.as_str())
                .await,
        );
        self.broadcast(vec![InvalidationMessage::Pattern(full_pattern)]);
        Ok(report)
    }

    /// Remove every key and tag of a tenant.
    pub async fn flush_tenant(&self, tenant: &TenantId) -> InvalidationReport {
        let pattern = self.keys.tenant_pattern(tenant);

        let mut report = self.fence(&pattern).await;
        report.merge(self.invalidation.by_pattern(&pattern, tenant.as_str()).await);
        report.merge(
            self.invalidation
                .clear_tags(&self.keys.tag_pattern(tenant))
                .await,
        );

        info!(tenant = %tenant, removed = report.removed, complete = report.is_complete(), "tenant flushed");
        self.broadcast(vec![InvalidationMessage::Pattern(pattern)]);
        report
    }

    // ---- lifecycle ----

    /// Wait for queued write-behind writes. Returns false on timeout.
    pub async fn flush_pending(&self) -> bool {
        self.deferred.flush(self.settings.flush_timeout).await
    }

    /// Ping every tier under its time budget.
    pub async fn health(&self) -> Vec<TierHealth> {
        let checks = (0..self.chain.len()).map(|index| async move {
            let started = Instant::now();
            let result = self.chain.ping_at(index).await;
            TierHealth {
                tier: self.chain.name(index).to_string(),
                latency: started.elapsed(),
                error: result.err().map(|e| e.to_string()),
            }
        });
        join_all(checks).await
    }

    /// Drain the write-behind queue and stop its worker.
    pub async fn shutdown(&self) {
        self.deferred.shutdown().await;
        info!("tiered cache shut down");
    }

    // ---- internals ----

    /// First tier a read may back-fill.
    fn fill_from(&self, strategy: &Strategy) -> usize {
        if strategy.write_mode.uses_fastest_tier() {
            0
        } else {
            self.around_start()
        }
    }

    /// First tier written by write-around. A single-tier chain has nothing
    /// to go around.
    fn around_start(&self) -> usize {
        usize::from(self.chain.len() > 1)
    }

    /// Whether a synchronous write counts as accepted. `reports[i]` belongs
    /// to tier `offset + i`.
    fn accepted(&self, reports: &[TierReport], offset: usize) -> bool {
        match self.required_tier {
            Some(required) if required >= offset && required - offset < reports.len() => {
                reports[required - offset].error.is_none()
            }
            _ => reports.iter().any(|r| r.error.is_none()),
        }
    }

    /// Like [`accepted`](Self::accepted), but a rejected write is removed
    /// again from the tiers that did store it.
    async fn accepted_or_rollback(&self, reports: &[TierReport], offset: usize, key: &str) -> bool {
        if self.accepted(reports, offset) {
            return true;
        }

        let stored = reports
            .iter()
            .enumerate()
            .filter(|(_, r)| r.error.is_none())
            .map(|(i, _)| offset + i);
        let deletes = stored.map(|index| async move {
            if let Err(e) = self.chain.delete_at(index, key).await {
                warn!(key = %key, tier = %self.chain.name(index), error = %e, "rollback of rejected write failed");
            }
        });
        join_all(deletes).await;
        debug!(key = %key, "write rejected by required tier, rolled back");
        false
    }

    async fn register_tag(&self, tag_key: &str, member: &str, strategy: &Strategy, tenant: &TenantId) -> Result<()> {
        let started = Instant::now();
        let result = bounded(
            self.settings.tag_timeout,
            self.tags.add_member(tag_key, member, strategy.ttl),
        )
        .await;

        if let Err(e) = &result {
            self.bus.publish_reports(
                &[TierReport {
                    tier: TAG_INDEX.to_string(),
                    operation: Operation::Write,
                    duration: started.elapsed(),
                    error: Some(e.to_string()),
                }],
                &strategy.category,
                tenant.as_str(),
            );
        }
        result
    }

    /// Let queued write-behind writes land before deleting anything.
    async fn fence(&self, target: &str) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        if !self.deferred.flush(self.settings.flush_timeout).await {
            report.failures.push(InvalidationFailure {
                tier: WRITE_BEHIND.to_string(),
                target: target.to_string(),
                error: "queued writes did not land in time".to_string(),
            });
        }
        report
    }

    fn broadcast(&self, messages: Vec<InvalidationMessage>) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(messages);
        }
    }

    fn publish_miss(&self, strategy: &Strategy, tenant: &TenantId, started: Instant, error: Option<String>) {
        self.bus.publish(&CacheEvent {
            operation: Operation::Miss,
            tier: None,
            key_category: strategy.category.clone(),
            duration: started.elapsed(),
            tenant_id: tenant.to_string(),
            error,
        });
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("namespace", &self.keys.namespace())
            .field("chain", &self.chain)
            .field("required_tier", &self.required_tier)
            .finish()
    }
}

/// Per-key write lock. The map entry is removed once nobody else holds
/// or waits on the lock.
struct KeyLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> KeyLock<'a> {
    fn acquire(locks: &'a DashMap<String, Arc<Mutex<()>>>, key: &'a str) -> Self {
        let lock = locks.entry(key.to_string()).or_default().clone();
        Self { locks, key, lock }
    }

    async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        // One reference in the map, one here
        self.locks
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) == 2);
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::cache::config::MemoryTierConfig;
    use crate::cache::events::ChannelSink;
    use crate::cache::tier::MemoryTier;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Project {
        id: u32,
        name: String,
    }

    fn tiers() -> (Arc<MemoryTier>, Arc<MemoryTier>) {
        (
            Arc::new(MemoryTier::new("memory", MemoryTierConfig::default())),
            Arc::new(MemoryTier::new("distributed", MemoryTierConfig::default())),
        )
    }

    fn cache(settings: CacheSettings, fast: Arc<MemoryTier>, slow: Arc<MemoryTier>) -> TieredCache {
        TieredCache::builder(settings)
            .tier(fast, Duration::from_millis(100))
            .tier(slow, Duration::from_millis(100))
            .build()
            .unwrap()
    }

    fn acme() -> TenantId {
        TenantId::new("acme").unwrap()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (fast, slow) = tiers();
        let cache = cache(CacheSettings::new("app"), fast.clone(), slow.clone());
        let project = Project { id: 1, name: "apollo".into() };

        assert!(cache.set(&acme(), "projects:1", &project).await.unwrap());
        assert!(fast.contains("app:acme:projects:1"));
        assert!(slow.contains("app:acme:projects:1"));

        let cached: Option<Project> = cache.get(&acme(), "projects:1").await.unwrap();
        assert_eq!(cached, Some(project));
    }

    #[tokio::test]
    async fn test_miss_is_counted() {
        let (fast, slow) = tiers();
        let cache = cache(CacheSettings::new("app"), fast, slow);

        let cached: Option<Project> = cache.get(&acme(), "projects:404").await.unwrap();
        assert!(cached.is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_a_miss() {
        let (fast, slow) = tiers();
        let cache = cache(CacheSettings::new("app"), fast, slow);
        cache.set(&acme(), "projects:1", "not a project").await.unwrap();

        let cached: Option<Project> = cache.get(&acme(), "projects:1").await.unwrap();
        assert!(cached.is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_write_around_skips_fastest_tier() {
        let (fast, slow) = tiers();
        let settings = CacheSettings::new("app").strategies(vec![
            Strategy::new("report", Duration::from_secs(60)).write_mode(WriteMode::WriteAround),
        ]);
        let cache = cache(settings, fast.clone(), slow.clone());

        assert!(cache.set(&acme(), "report:q3", &42).await.unwrap());
        assert!(!fast.contains("app:acme:report:q3"));

        let value: Option<i32> = cache.get(&acme(), "report:q3").await.unwrap();
        assert_eq!(value, Some(42));
        // Back-fill must not promote it either
        assert!(!fast.contains("app:acme:report:q3"));
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_cached() {
        let (fast, slow) = tiers();
        let settings = CacheSettings::new("app").strategies(vec![
            Strategy::new("ephemeral", Duration::ZERO).tag("ephemeral"),
        ]);
        let cache = cache(settings, fast.clone(), slow.clone());

        assert!(!cache.set(&acme(), "ephemeral:1", &1).await.unwrap());
        assert!(!fast.contains("app:acme:ephemeral:1"));
        assert!(!slow.contains("app:acme:ephemeral:1"));
        assert!(cache.tags.members("app#tags:acme:ephemeral").await.unwrap().is_empty());

        let value: Option<i32> = cache.get(&acme(), "ephemeral:1").await.unwrap();
        assert!(value.is_none());
    }

    /// Tag index that never answers.
    struct StalledIndex;

    #[async_trait::async_trait]
    impl TagIndex for StalledIndex {
        async fn add_member(&self, _: &str, _: &str, _: Duration) -> Result<()> {
            std::future::pending().await
        }

        async fn take(&self, _: &str) -> Result<std::collections::HashSet<String>> {
            std::future::pending().await
        }

        async fn members(&self, _: &str) -> Result<std::collections::HashSet<String>> {
            std::future::pending().await
        }

        async fn clear_matching(&self, _: &str) -> Result<u64> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_tag_index_cannot_block_callers() {
        let (fast, slow) = tiers();
        let cache = TieredCache::builder(CacheSettings::new("app").tag_timeout(Duration::from_millis(50)))
            .tier(fast, Duration::from_millis(100))
            .tier(slow, Duration::from_millis(100))
            .tag_index(Arc::new(StalledIndex))
            .build()
            .unwrap();
        let within = Duration::from_secs(2);

        let stored = tokio::time::timeout(within, cache.set_with_tags(&acme(), "projects:1", &1, &["p"]))
            .await
            .expect("set returned");
        assert!(!stored.unwrap());

        let report = tokio::time::timeout(within, cache.invalidate_tags(&acme(), &["p"]))
            .await
            .expect("invalidate_tags returned")
            .unwrap();
        assert!(report.failures.iter().any(|f| f.tier == TAG_INDEX));

        let report = tokio::time::timeout(within, cache.flush_tenant(&acme()))
            .await
            .expect("flush_tenant returned");
        assert!(report.failures.iter().any(|f| f.tier == TAG_INDEX));
    }

    #[tokio::test]
    async fn test_write_behind_lands_after_flush() {
        let (fast, slow) = tiers();
        let settings = CacheSettings::new("app").strategies(vec![
            Strategy::new("activity", Duration::from_secs(60)).write_mode(WriteMode::WriteBehind),
        ]);
        let cache = cache(settings, fast.clone(), slow.clone());

        assert!(cache.set(&acme(), "activity:7", &"logged in").await.unwrap());
        assert!(fast.contains("app:acme:activity:7"));
        assert!(cache.flush_pending().await);
        assert!(slow.contains("app:acme:activity:7"));
    }

    #[tokio::test]
    async fn test_get_or_insert_with_runs_producer_once() {
        let (fast, slow) = tiers();
        let cache = cache(CacheSettings::new("app"), fast, slow);
        let calls = std::sync::atomic::AtomicU32::new(0);

        for _ in 0..3 {
            let value: u32 = cache
                .get_or_insert_with(&acme(), "counter", || async {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, CacheError>(7)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_extra_tags_are_invalidated() {
        let (fast, slow) = tiers();
        let cache = cache(CacheSettings::new("app"), fast.clone(), slow.clone());

        cache
            .set_with_tags(&acme(), "projects:1", &1, &["project:1"])
            .await
            .unwrap();
        cache.set(&acme(), "projects:2", &2).await.unwrap();

        let report = cache.invalidate_tags(&acme(), &["project:1"]).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.removed, 1);
        assert!(!fast.contains("app:acme:projects:1"));
        assert!(fast.contains("app:acme:projects:2"));
    }

    #[tokio::test]
    async fn test_get_many_keeps_order() {
        let (fast, slow) = tiers();
        let cache = cache(CacheSettings::new("app"), fast, slow);
        cache.set(&acme(), "a", &1).await.unwrap();
        cache.set(&acme(), "c", &3).await.unwrap();

        let values: Vec<Option<i32>> = cache.get_many(&acme(), &["a", "b", "c"]).await.unwrap();
        assert_eq!(values, vec![Some(1), None, Some(3)]);
    }

    #[tokio::test]
    async fn test_warm_up_and_flush_tenant() {
        let (fast, slow) = tiers();
        let cache = cache(CacheSettings::new("app"), fast.clone(), slow.clone());
        let globex = TenantId::new("globex").unwrap();

        let stored = cache
            .warm_up(&acme(), vec![("a", 1), ("b", 2)])
            .await
            .unwrap();
        assert_eq!(stored, 2);
        cache.set(&globex, "a", &9).await.unwrap();

        let report = cache.flush_tenant(&acme()).await;
        assert!(report.is_complete());
        assert!(!fast.contains("app:acme:a"));
        assert!(!slow.contains("app:acme:b"));
        assert!(slow.contains("app:globex:a"));
    }

    #[tokio::test]
    async fn test_events_reach_sinks() {
        let (fast, slow) = tiers();
        let (sink, mut rx) = ChannelSink::new();
        let cache = TieredCache::builder(CacheSettings::new("app"))
            .tier(fast, Duration::from_millis(100))
            .tier(slow, Duration::from_millis(100))
            .sink(Arc::new(sink))
            .build()
            .unwrap();

        cache.set(&acme(), "k", &1).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation, Operation::Write);
        assert_eq!(event.tenant_id, "acme");
    }

    #[tokio::test]
    async fn test_health_reports_every_tier() {
        let (fast, slow) = tiers();
        let cache = cache(CacheSettings::new("app"), fast, slow);

        let health = cache.health().await;
        assert_eq!(health.len(), 2);
        assert!(health.iter().all(TierHealth::is_healthy));
    }

    #[tokio::test]
    async fn test_write_locks_are_released() {
        let (fast, slow) = tiers();
        let cache = cache(CacheSettings::new("app"), fast, slow);

        cache.set(&acme(), "k", &1).await.unwrap();
        assert!(cache.write_locks.is_empty());
    }

    #[test]
    fn test_build_without_tiers_fails() {
        let result = TieredCache::builder(CacheSettings::new("app")).build();
        assert!(matches!(result, Err(CacheError::NoTiers)));
    }
}
