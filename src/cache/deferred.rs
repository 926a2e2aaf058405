//! Background queue for write-behind writes.
//!
//! A single worker drains the queue in FIFO order, so for any key the
//! slower tiers converge to the most recently queued value.

use std::ops::Range;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::chain::TierChain;
use super::entry::CacheEntry;
use super::events::EventBus;

/// A deferred write: `entry` goes to the tiers in `tiers`.
#[derive(Debug)]
pub struct DeferredWrite {
    pub key: String,
    pub entry: CacheEntry,
    pub tiers: Range<usize>,
    pub category: String,
    pub tenant: String,
}

enum Job {
    Write(DeferredWrite),
    Flush(oneshot::Sender<()>),
}

/// Handle to the write-behind worker.
pub struct DeferredWriter {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    bus: EventBus,
}

impl DeferredWriter {
    /// Spawn the worker on the current Tokio runtime.
    pub fn spawn(chain: TierChain, capacity: usize, bus: EventBus) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run(chain, rx, bus.clone()));

        Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            bus,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        self.sender.lock().clone()
    }

    /// Queue a write without waiting. Returns false when it was dropped.
    pub fn enqueue(&self, write: DeferredWrite) -> bool {
        let Some(tx) = self.sender() else {
            warn!(key = %write.key, "write-behind queue closed, dropping write");
            self.bus.metrics().record_deferred_drop();
            return false;
        };

        match tx.try_send(Job::Write(write)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(Job::Write(write))) => {
                warn!(key = %write.key, "write-behind queue full, dropping write");
                self.bus.metrics().record_deferred_drop();
                false
            }
            Err(_) => {
                warn!("write-behind worker stopped, dropping write");
                self.bus.metrics().record_deferred_drop();
                false
            }
        }
    }

    /// Wait until every write queued before this call has been applied.
    ///
    /// Returns false if that did not happen within `timeout`.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let Some(tx) = self.sender() else {
            return true;
        };

        let (done_tx, done_rx) = oneshot::channel();
        let fence = async move {
            tx.send(Job::Flush(done_tx)).await.is_ok() && done_rx.await.is_ok()
        };

        match tokio::time::timeout(timeout, fence).await {
            Ok(flushed) => flushed,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "write-behind flush timed out");
                false
            }
        }
    }

    /// Close the queue and wait for the worker to drain it.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            warn!(error = %e, "write-behind worker panicked");
        }
    }
}

impl Drop for DeferredWriter {
    fn drop(&mut self) {
        // Dropping the sender lets the worker finish the backlog and exit
        self.sender.get_mut().take();
    }
}

impl std::fmt::Debug for DeferredWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredWriter")
            .field("open", &self.sender.lock().is_some())
            .finish()
    }
}

async fn run(chain: TierChain, mut rx: mpsc::Receiver<Job>, bus: EventBus) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Write(write) => {
                let reports = chain.write_range(write.tiers, &write.key, &write.entry).await;
                bus.publish_reports(&reports, &write.category, &write.tenant);
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("write-behind worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::chain::{ChainTier, DEFAULT_TIER_TIMEOUT};
    use crate::cache::config::MemoryTierConfig;
    use crate::cache::tier::{MemoryTier, Tier};

    fn setup() -> (DeferredWriter, Arc<MemoryTier>) {
        let fast = Arc::new(MemoryTier::new("memory", MemoryTierConfig::default()));
        let slow = Arc::new(MemoryTier::new("distributed", MemoryTierConfig::default()));
        let chain = TierChain::new(vec![
            ChainTier::new(fast, DEFAULT_TIER_TIMEOUT),
            ChainTier::new(slow.clone(), DEFAULT_TIER_TIMEOUT),
        ])
        .unwrap();
        (DeferredWriter::spawn(chain, 8, EventBus::new(Vec::new())), slow)
    }

    fn write(key: &str, value: &str) -> DeferredWrite {
        DeferredWrite {
            key: key.to_string(),
            entry: CacheEntry::encode(value, Duration::from_secs(60), Vec::new()).unwrap(),
            tiers: 1..2,
            category: "default".to_string(),
            tenant: "acme".to_string(),
        }
    }

    #[tokio::test]
    async fn test_flush_applies_queued_writes_in_order() {
        let (writer, slow) = setup();

        assert!(writer.enqueue(write("k", "v1")));
        assert!(writer.enqueue(write("k", "v2")));
        assert!(writer.flush(Duration::from_secs(1)).await);

        let stored: String = slow.read("k").await.unwrap().unwrap().decode().unwrap();
        assert_eq!(stored, "v2");
    }

    #[tokio::test]
    async fn test_shutdown_drains_backlog() {
        let (writer, slow) = setup();

        assert!(writer.enqueue(write("a", "1")));
        writer.shutdown().await;

        assert!(slow.contains("a"));
        assert!(!writer.enqueue(write("b", "2")));
        assert!(writer.flush(Duration::from_millis(10)).await);
    }
}
