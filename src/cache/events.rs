//! Cache events, sinks and counters.
//!
//! Every operation produces a [`CacheEvent`]. Sinks receive events
//! synchronously on the caller's task, so implementations must not block:
//! log, bump a counter or push onto an unbounded channel.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::chain::TierReport;

/// Kind of cache operation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Hit,
    Miss,
    Write,
    Invalidate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Write => "write",
            Self::Invalidate => "invalidate",
        })
    }
}

/// Structured record of one cache operation.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub operation: Operation,
    /// Tier involved; `None` for chain-wide outcomes such as a full miss.
    pub tier: Option<String>,
    pub key_category: String,
    pub duration: Duration,
    pub tenant_id: String,
    pub error: Option<String>,
}

/// Receiver of cache events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &CacheEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &CacheEvent) {
        let tier = event.tier.as_deref().unwrap_or("-");
        match &event.error {
            Some(error) => warn!(
                operation = %event.operation,
                tier = %tier,
                category = %event.key_category,
                tenant = %event.tenant_id,
                duration_us = event.duration.as_micros() as u64,
                error = %error,
                "cache operation failed"
            ),
            None => debug!(
                operation = %event.operation,
                tier = %tier,
                category = %event.key_category,
                tenant = %event.tenant_id,
                duration_us = event.duration.as_micros() as u64,
                "cache operation"
            ),
        }
    }
}

/// Forwards events to an unbounded channel for out-of-band consumers.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CacheEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CacheEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn record(&self, event: &CacheEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event.clone());
    }
}

/// Lock-free operation counters kept by every cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits_by_tier: DashMap<String, AtomicU64>,
    misses: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    invalidations: AtomicU64,
    invalidation_failures: AtomicU64,
    deferred_dropped: AtomicU64,
}

impl CacheMetrics {
    pub fn record_deferred_drop(&self) {
        self.deferred_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters into a plain snapshot.
    pub fn snapshot(&self) -> CacheStats {
        let hits_by_tier: BTreeMap<String, u64> = self
            .hits_by_tier
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();

        CacheStats {
            hits: hits_by_tier.values().sum(),
            hits_by_tier,
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            invalidation_failures: self.invalidation_failures.load(Ordering::Relaxed),
            deferred_dropped: self.deferred_dropped.load(Ordering::Relaxed),
        }
    }
}

impl EventSink for CacheMetrics {
    fn record(&self, event: &CacheEvent) {
        match (event.operation, event.error.is_some()) {
            (Operation::Hit, _) => {
                let tier = event.tier.as_deref().unwrap_or("unknown");
                self.hits_by_tier
                    .entry(tier.to_string())
                    .or_default()
                    .fetch_add(1, Ordering::Relaxed);
            }
            // Per-tier misses are folded into the chain-wide one
            (Operation::Miss, _) if event.tier.is_none() => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
            (Operation::Miss, _) => {}
            (Operation::Write, false) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            (Operation::Write, true) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
            }
            (Operation::Invalidate, false) => {
                self.invalidations.fetch_add(1, Ordering::Relaxed);
            }
            (Operation::Invalidate, true) => {
                self.invalidation_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Fan-out of events to the built-in counters and every configured sink.
#[derive(Clone)]
pub struct EventBus {
    metrics: Arc<CacheMetrics>,
    sinks: Arc<[Arc<dyn EventSink>]>,
}

impl EventBus {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            metrics: Arc::new(CacheMetrics::default()),
            sinks: sinks.into(),
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn publish(&self, event: &CacheEvent) {
        self.metrics.record(event);
        for sink in self.sinks.iter() {
            sink.record(event);
        }
    }

    /// Publish one event per tier report.
    pub fn publish_reports(&self, reports: &[TierReport], category: &str, tenant: &str) {
        for report in reports {
            self.publish(&CacheEvent {
                operation: report.operation,
                tier: Some(report.tier.clone()),
                key_category: category.to_string(),
                duration: report.duration,
                tenant_id: tenant.to_string(),
                error: report.error.clone(),
            });
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub hits_by_tier: BTreeMap<String, u64>,
    pub misses: u64,
    /// Successful tier writes.
    pub writes: u64,
    /// Failed tier writes.
    pub write_failures: u64,
    /// Successful tier deletions.
    pub invalidations: u64,
    pub invalidation_failures: u64,
    /// Write-behind writes discarded because the queue was full.
    pub deferred_dropped: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(operation: Operation, tier: Option<&str>, error: Option<&str>) -> CacheEvent {
        CacheEvent {
            operation,
            tier: tier.map(str::to_string),
            key_category: "default".to_string(),
            duration: Duration::from_micros(5),
            tenant_id: "acme".to_string(),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_metrics_counts() {
        let metrics = CacheMetrics::default();
        metrics.record(&event(Operation::Hit, Some("memory"), None));
        metrics.record(&event(Operation::Hit, Some("memory"), None));
        metrics.record(&event(Operation::Hit, Some("distributed"), None));
        metrics.record(&event(Operation::Miss, None, None));
        metrics.record(&event(Operation::Miss, Some("distributed"), Some("down")));
        metrics.record(&event(Operation::Write, Some("memory"), None));
        metrics.record(&event(Operation::Write, Some("durable"), Some("timeout")));

        let stats = metrics.snapshot();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.hits_by_tier["memory"], 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.write_failures, 1);
        assert!((stats.hit_rate() - 0.75).abs() < 0.001);
    }

    #[test]
    fn test_hit_rate_empty() {
        assert!((CacheStats::default().hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_bus_fans_out() {
        let (sink, mut rx) = ChannelSink::new();
        let bus = EventBus::new(vec![Arc::new(TracingSink), Arc::new(sink)]);

        bus.publish_reports(
            &[TierReport {
                tier: "memory".to_string(),
                operation: Operation::Hit,
                duration: Duration::from_micros(3),
                error: None,
            }],
            "dashboard_data",
            "acme",
        );

        assert_eq!(bus.metrics().snapshot().hits, 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.key_category, "dashboard_data");
        assert_eq!(event.tenant_id, "acme");
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.record(&event(Operation::Write, Some("memory"), None));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.operation, Operation::Write);
        assert_eq!(received.tier.as_deref(), Some("memory"));
    }
}
