//! Key, tag and pattern invalidation across every tier.
//!
//! Invalidation is best-effort: a failure on one tier never stops the
//! remaining tiers, keys or tags. Failures are collected into an
//! [`InvalidationReport`] so callers that need certainty can retry exactly
//! the failed subset.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream;
use tracing::{debug, warn};

use super::chain::{TierChain, TierReport};
use super::events::{EventBus, Operation};
use super::tags::{TagIndex, bounded};
use crate::error::CacheError;

/// Concurrent key deletions during a tag purge.
const PURGE_CONCURRENCY: usize = 32;

/// Name reported for tag index failures.
pub const TAG_INDEX: &str = "tag-index";

/// One failed deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationFailure {
    pub tier: String,
    /// Key, pattern or tag that could not be purged.
    pub target: String,
    pub error: String,
}

/// Outcome of an invalidation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Distinct keys removed from at least one tier (pattern deletes
    /// count every key each tier removed).
    pub removed: u64,
    pub failures: Vec<InvalidationFailure>,
    /// Tiers that cannot scan by pattern and were left untouched.
    pub skipped_tiers: Vec<String>,
}

impl InvalidationReport {
    /// True when every tier accepted every deletion.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Targets that need a retry.
    pub fn failed_targets(&self) -> HashSet<&str> {
        self.failures.iter().map(|f| f.target.as_str()).collect()
    }

    pub fn merge(&mut self, other: InvalidationReport) {
        self.removed += other.removed;
        self.failures.extend(other.failures);
        for tier in other.skipped_tiers {
            if !self.skipped_tiers.contains(&tier) {
                self.skipped_tiers.push(tier);
            }
        }
    }

    fn fail(&mut self, tier: &str, target: &str, error: impl ToString) {
        self.failures.push(InvalidationFailure {
            tier: tier.to_string(),
            target: target.to_string(),
            error: error.to_string(),
        });
    }
}

/// Deletes keys from the chain and consumes tag index entries.
#[derive(Clone)]
pub struct InvalidationEngine {
    chain: TierChain,
    tags: Arc<dyn TagIndex>,
    bus: EventBus,
    /// Budget for each tag index call.
    tag_timeout: Duration,
}

impl InvalidationEngine {
    pub fn new(chain: TierChain, tags: Arc<dyn TagIndex>, bus: EventBus, tag_timeout: Duration) -> Self {
        Self {
            chain,
            tags,
            bus,
            tag_timeout,
        }
    }

    /// Delete one key from every tier. Absent keys are not an error.
    pub async fn by_key(&self, key: &str, category: &str, tenant: &str) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        let results = self.chain.delete_everywhere(key).await;

        let mut removed = false;
        for (tier_report, hit) in &results {
            removed |= *hit;
            if let Some(error) = &tier_report.error {
                report.fail(&tier_report.tier, key, error);
            }
        }
        if removed {
            report.removed = 1;
        }

        let reports: Vec<TierReport> = results.into_iter().map(|(r, _)| r).collect();
        self.bus.publish_reports(&reports, category, tenant);
        report
    }

    /// Purge every member of every tag, then drop the tags.
    ///
    /// Members are taken atomically from the index before deletion, so a
    /// key registered afterwards starts a fresh tag entry instead of being
    /// lost. Members outside `tenant_prefix` are ignored. Also returns the
    /// keys that were purged.
    pub async fn by_tags(
        &self,
        tag_keys: &[String],
        tenant_prefix: &str,
        tenant: &str,
    ) -> (InvalidationReport, Vec<String>) {
        let mut report = InvalidationReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        for tag_key in tag_keys {
            let members = match bounded(self.tag_timeout, self.tags.take(tag_key)).await {
                Ok(members) => members,
                Err(e) => {
                    warn!(tag = %tag_key, error = %e, "failed to read tag members");
                    report.fail(TAG_INDEX, tag_key, &e);
                    continue;
                }
            };

            let fresh: Vec<String> = members
                .into_iter()
                .filter(|key| key.starts_with(tenant_prefix))
                .filter(|key| seen.insert(key.clone()))
                .collect();
            debug!(tag = %tag_key, keys = fresh.len(), "purging tag");

            // `{namespace}#tags:{tenant}:{tag}`; the tag itself may contain ':'
            let category = tag_key.splitn(3, ':').nth(2).unwrap_or(tag_key);
            let outcomes: Vec<InvalidationReport> = stream::iter(fresh)
                .map(|key| async move { self.by_key(&key, category, tenant).await })
                .buffer_unordered(PURGE_CONCURRENCY)
                .collect()
                .await;

            for outcome in outcomes {
                report.merge(outcome);
            }
        }

        (report, seen.into_iter().collect())
    }

    /// Delete keys matching a scoped glob on tiers that can scan.
    pub async fn by_pattern(&self, pattern: &str, tenant: &str) -> InvalidationReport {
        let mut report = InvalidationReport::default();

        for index in 0..self.chain.len() {
            let name = self.chain.name(index).to_string();
            let started = Instant::now();
            match self.chain.delete_matching_at(index, pattern).await {
                Ok(removed) => {
                    report.removed += removed;
                    self.publish(&name, started, None, tenant);
                }
                Err(CacheError::PatternScanUnsupported { .. }) => {
                    debug!(tier = %name, pattern = %pattern, "pattern invalidation skipped");
                    report.skipped_tiers.push(name);
                }
                Err(e) => {
                    warn!(tier = %name, pattern = %pattern, error = %e, "pattern invalidation failed");
                    self.publish(&name, started, Some(e.to_string()), tenant);
                    report.fail(&name, pattern, e);
                }
            }
        }

        report
    }

    /// Drop every tag index entry matching the glob.
    pub async fn clear_tags(&self, pattern: &str) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        if let Err(e) = bounded(self.tag_timeout, self.tags.clear_matching(pattern)).await {
            warn!(pattern = %pattern, error = %e, "failed to clear tag index");
            report.fail(TAG_INDEX, pattern, e);
        }
        report
    }

    fn publish(&self, tier: &str, started: Instant, error: Option<String>, tenant: &str) {
        let report = TierReport {
            tier: tier.to_string(),
            operation: Operation::Invalidate,
            duration: started.elapsed(),
            error,
        };
        self.bus.publish_reports(&[report], "pattern", tenant);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::cache::chain::ChainTier;
    use crate::cache::config::MemoryTierConfig;
    use crate::cache::tier::MemoryTier;
    use crate::error::Result;

    /// Tag index whose calls never complete.
    struct StuckIndex;

    #[async_trait]
    impl TagIndex for StuckIndex {
        async fn add_member(&self, _: &str, _: &str, _: Duration) -> Result<()> {
            std::future::pending().await
        }

        async fn take(&self, _: &str) -> Result<HashSet<String>> {
            std::future::pending().await
        }

        async fn members(&self, _: &str) -> Result<HashSet<String>> {
            std::future::pending().await
        }

        async fn clear_matching(&self, _: &str) -> Result<u64> {
            std::future::pending().await
        }
    }

    fn stuck_engine() -> InvalidationEngine {
        let memory = Arc::new(MemoryTier::new("memory", MemoryTierConfig::default()));
        let chain = TierChain::new(vec![ChainTier::new(memory, Duration::from_millis(100))]).unwrap();
        InvalidationEngine::new(
            chain,
            Arc::new(StuckIndex),
            EventBus::new(Vec::new()),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_stalled_tag_index_is_reported() {
        let engine = stuck_engine();
        let tags = vec!["app#tags:acme:dashboard".to_string()];

        let (report, purged) = tokio::time::timeout(
            Duration::from_secs(2),
            engine.by_tags(&tags, "app:acme:", "acme"),
        )
        .await
        .expect("tag purge must not hang");
        assert!(purged.is_empty());
        assert!(!report.is_complete());
        assert_eq!(report.failures[0].tier, TAG_INDEX);
        assert!(report.failed_targets().contains("app#tags:acme:dashboard"));

        let report = tokio::time::timeout(Duration::from_secs(2), engine.clear_tags("app#tags:acme:*"))
            .await
            .expect("tag clear must not hang");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].tier, TAG_INDEX);
    }

    #[test]
    fn test_report_merge() {
        let mut a = InvalidationReport {
            removed: 2,
            failures: Vec::new(),
            skipped_tiers: vec!["durable".to_string()],
        };
        let mut b = InvalidationReport {
            removed: 1,
            skipped_tiers: vec!["durable".to_string()],
            ..Default::default()
        };
        b.fail("distributed", "cache:acme:k", "timed out");

        a.merge(b);
        assert_eq!(a.removed, 3);
        assert!(!a.is_complete());
        assert_eq!(a.skipped_tiers.len(), 1);
        assert!(a.failed_targets().contains("cache:acme:k"));
    }

    #[test]
    fn test_empty_report_is_complete() {
        assert!(InvalidationReport::default().is_complete());
    }
}
