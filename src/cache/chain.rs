//! Ordered tier chain with per-tier timeouts and back-fill.
//!
//! Tiers are ordered fastest first. A failing or slow tier only ever costs
//! that tier: reads move on to the next tier and writes/deletes report a
//! per-tier error instead of aborting the rest of the chain.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::events::Operation;
use super::tier::Tier;
use crate::error::{CacheError, Result};

/// Default time budget for a single tier operation.
pub const DEFAULT_TIER_TIMEOUT: Duration = Duration::from_millis(250);

/// A tier together with its time budget.
#[derive(Clone)]
pub struct ChainTier {
    pub tier: Arc<dyn Tier>,
    pub timeout: Duration,
}

impl ChainTier {
    pub fn new(tier: Arc<dyn Tier>, timeout: Duration) -> Self {
        Self { tier, timeout }
    }

    pub fn name(&self) -> &str {
        self.tier.name()
    }
}

/// Outcome of one operation against one tier.
#[derive(Debug, Clone)]
pub struct TierReport {
    pub tier: String,
    pub operation: Operation,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Result of a chain read.
#[derive(Debug, Default)]
pub struct ChainRead {
    /// Position of the tier that answered, with its entry.
    pub hit: Option<(usize, CacheEntry)>,
    /// Per-tier reports: misses, failures, the hit and back-fill writes.
    pub reports: Vec<TierReport>,
}

/// Tiers ordered from lowest latency to largest capacity.
#[derive(Clone)]
pub struct TierChain {
    tiers: Arc<[ChainTier]>,
}

impl TierChain {
    pub fn new(tiers: Vec<ChainTier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(CacheError::NoTiers);
        }
        Ok(Self {
            tiers: tiers.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn tiers(&self) -> &[ChainTier] {
        &self.tiers
    }

    pub fn name(&self, index: usize) -> &str {
        self.tiers[index].name()
    }

    /// Position of the tier with the given name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.tiers.iter().position(|t| t.name() == name)
    }

    /// Run a tier future under that tier's timeout.
    async fn guarded<T, F>(&self, index: usize, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let slot = &self.tiers[index];
        match tokio::time::timeout(slot.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::TierTimeout {
                tier: slot.name().to_string(),
                timeout: slot.timeout,
            }),
        }
    }

    pub async fn read_at(&self, index: usize, key: &str) -> Result<Option<CacheEntry>> {
        let tier = &self.tiers[index].tier;
        self.guarded(index, tier.read(key)).await
    }

    /// Write an entry with its remaining lifetime. Expired entries are
    /// skipped.
    pub async fn write_at(&self, index: usize, key: &str, entry: &CacheEntry) -> Result<()> {
        let Some(ttl) = entry.remaining_ttl() else {
            debug!(key = %key, tier = %self.name(index), "skipping write of expired entry");
            return Ok(());
        };
        let tier = &self.tiers[index].tier;
        self.guarded(index, tier.write(key, entry, ttl)).await
    }

    pub async fn delete_at(&self, index: usize, key: &str) -> Result<bool> {
        let tier = &self.tiers[index].tier;
        self.guarded(index, tier.delete(key)).await
    }

    /// Pattern delete on one tier, or `PatternScanUnsupported`.
    pub async fn delete_matching_at(&self, index: usize, pattern: &str) -> Result<u64> {
        let slot = &self.tiers[index];
        if !slot.tier.capabilities().supports_pattern_scan {
            return Err(CacheError::PatternScanUnsupported {
                tier: slot.name().to_string(),
            });
        }
        self.guarded(index, slot.tier.delete_matching(pattern)).await
    }

    pub async fn ping_at(&self, index: usize) -> Result<()> {
        let tier = &self.tiers[index].tier;
        self.guarded(index, tier.ping()).await
    }

    /// Walk the chain fastest first and back-fill faster tiers on a hit.
    ///
    /// Back-fill only targets tiers at positions `fill_from..hit` and uses
    /// the entry's remaining TTL, so it never extends `expires_at`.
    pub async fn get_with_backfill(&self, key: &str, fill_from: usize) -> ChainRead {
        let mut read = ChainRead::default();

        for index in 0..self.len() {
            let started = Instant::now();
            match self.read_at(index, key).await {
                Ok(Some(entry)) if !entry.is_expired() => {
                    read.reports.push(report(self.name(index), Operation::Hit, started, None));
                    if index > fill_from {
                        let fills = self.write_range(fill_from..index, key, &entry).await;
                        read.reports.extend(fills);
                    }
                    read.hit = Some((index, entry));
                    return read;
                }
                Ok(_) => {
                    read.reports.push(report(self.name(index), Operation::Miss, started, None));
                }
                Err(e) => {
                    warn!(key = %key, tier = %self.name(index), error = %e, "tier read failed, treating as miss");
                    read.reports.push(report(self.name(index), Operation::Miss, started, Some(&e)));
                }
            }
        }

        read
    }

    /// Write to every tier in `range` concurrently.
    pub async fn write_range(
        &self,
        range: std::ops::Range<usize>,
        key: &str,
        entry: &CacheEntry,
    ) -> Vec<TierReport> {
        let writes = range.map(|index| async move {
            let started = Instant::now();
            let result = self.write_at(index, key, entry).await;
            if let Err(e) = &result {
                warn!(key = %key, tier = %self.name(index), error = %e, "tier write failed");
            }
            report(self.name(index), Operation::Write, started, result.err().as_ref())
        });
        join_all(writes).await
    }

    /// Delete a key from every tier concurrently.
    pub async fn delete_everywhere(&self, key: &str) -> Vec<(TierReport, bool)> {
        let deletes = (0..self.len()).map(|index| async move {
            let started = Instant::now();
            let result = self.delete_at(index, key).await;
            let removed = *result.as_ref().unwrap_or(&false);
            if let Err(e) = &result {
                warn!(key = %key, tier = %self.name(index), error = %e, "tier delete failed");
            }
            (
                report(self.name(index), Operation::Invalidate, started, result.err().as_ref()),
                removed,
            )
        });
        join_all(deletes).await
    }
}

fn report(tier: &str, operation: Operation, started: Instant, error: Option<&CacheError>) -> TierReport {
    TierReport {
        tier: tier.to_string(),
        operation,
        duration: started.elapsed(),
        error: error.map(ToString::to_string),
    }
}

impl std::fmt::Debug for TierChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tiers.iter().map(|t| (t.name(), t.timeout)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::MemoryTierConfig;
    use crate::cache::tier::{MemoryTier, TierCapabilities};
    use async_trait::async_trait;

    /// Tier whose every call fails.
    struct DownTier;

    #[async_trait]
    impl Tier for DownTier {
        fn name(&self) -> &str {
            "down"
        }

        fn capabilities(&self) -> TierCapabilities {
            TierCapabilities {
                supports_ttl: true,
                supports_pattern_scan: false,
            }
        }

        async fn read(&self, _key: &str) -> Result<Option<CacheEntry>> {
            Err(CacheError::unavailable("down", "connection refused"))
        }

        async fn write(&self, _key: &str, _entry: &CacheEntry, _ttl: Duration) -> Result<()> {
            Err(CacheError::unavailable("down", "connection refused"))
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(CacheError::unavailable("down", "connection refused"))
        }
    }

    /// Tier that never answers.
    struct StuckTier;

    #[async_trait]
    impl Tier for StuckTier {
        fn name(&self) -> &str {
            "stuck"
        }

        fn capabilities(&self) -> TierCapabilities {
            TierCapabilities {
                supports_ttl: true,
                supports_pattern_scan: false,
            }
        }

        async fn read(&self, _key: &str) -> Result<Option<CacheEntry>> {
            futures::future::pending().await
        }

        async fn write(&self, _key: &str, _entry: &CacheEntry, _ttl: Duration) -> Result<()> {
            futures::future::pending().await
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            futures::future::pending().await
        }
    }

    fn memory(name: &str) -> Arc<MemoryTier> {
        Arc::new(MemoryTier::new(name, MemoryTierConfig::default()))
    }

    fn entry(ttl: Duration) -> CacheEntry {
        CacheEntry::new(b"1".to_vec(), ttl, Vec::new())
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert!(matches!(TierChain::new(Vec::new()), Err(CacheError::NoTiers)));
    }

    #[tokio::test]
    async fn test_backfill_uses_remaining_ttl() {
        let fast = memory("memory");
        let slow = memory("distributed");
        let chain = TierChain::new(vec![
            ChainTier::new(fast.clone(), DEFAULT_TIER_TIMEOUT),
            ChainTier::new(slow.clone(), DEFAULT_TIER_TIMEOUT),
        ])
        .unwrap();

        let original = entry(Duration::from_secs(30));
        slow.write("k", &original, Duration::from_secs(30)).await.unwrap();

        let read = chain.get_with_backfill("k", 0).await;
        assert_eq!(read.hit.as_ref().map(|(i, _)| *i), Some(1));

        let filled = fast.read("k").await.unwrap().unwrap();
        assert!(filled.expires_at <= original.expires_at);
    }

    #[tokio::test]
    async fn test_backfill_respects_floor() {
        let fast = memory("memory");
        let mid = memory("distributed");
        let slow = memory("durable");
        let chain = TierChain::new(vec![
            ChainTier::new(fast.clone(), DEFAULT_TIER_TIMEOUT),
            ChainTier::new(mid.clone(), DEFAULT_TIER_TIMEOUT),
            ChainTier::new(slow.clone(), DEFAULT_TIER_TIMEOUT),
        ])
        .unwrap();

        slow.write("k", &entry(Duration::from_secs(30)), Duration::from_secs(30))
            .await
            .unwrap();

        let read = chain.get_with_backfill("k", 1).await;
        assert_eq!(read.hit.as_ref().map(|(i, _)| *i), Some(2));
        assert!(mid.contains("k"));
        assert!(!fast.contains("k"));
    }

    #[tokio::test]
    async fn test_failing_tier_is_a_miss() {
        let slow = memory("distributed");
        let chain = TierChain::new(vec![
            ChainTier::new(Arc::new(DownTier), DEFAULT_TIER_TIMEOUT),
            ChainTier::new(slow.clone(), DEFAULT_TIER_TIMEOUT),
        ])
        .unwrap();

        slow.write("k", &entry(Duration::from_secs(30)), Duration::from_secs(30))
            .await
            .unwrap();

        let read = chain.get_with_backfill("k", 0).await;
        assert_eq!(read.hit.as_ref().map(|(i, _)| *i), Some(1));
        assert!(read.reports.iter().any(|r| r.tier == "down" && r.error.is_some()));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let chain = TierChain::new(vec![ChainTier::new(
            Arc::new(StuckTier),
            Duration::from_millis(20),
        )])
        .unwrap();

        let err = chain.read_at(0, "k").await.unwrap_err();
        assert!(matches!(err, CacheError::TierTimeout { .. }));

        let reports = chain.write_range(0..1, "k", &entry(Duration::from_secs(5))).await;
        assert!(reports[0].error.is_some());
    }

    #[tokio::test]
    async fn test_pattern_delete_requires_capability() {
        let chain = TierChain::new(vec![ChainTier::new(Arc::new(DownTier), DEFAULT_TIER_TIMEOUT)]).unwrap();
        let err = chain.delete_matching_at(0, "cache:acme:*").await.unwrap_err();
        assert!(matches!(err, CacheError::PatternScanUnsupported { .. }));
    }
}
