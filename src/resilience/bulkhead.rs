//! Bulkhead isolation.
//!
//! # Responsibilities
//! - Cap concurrent calls per partition at `max_concurrent`
//! - Hold overflow in a bounded FIFO queue, rejecting when it is full
//! - Give up on queued calls after `queue_timeout`
//! - Track `active`, `queued` and `rejected` per partition and in aggregate
//!
//! # Design Decisions
//! - Tokio's fair semaphore provides FIFO hand-off on release
//! - Queue slots are reserved with a CAS loop, so the bound is never overshot
//! - Both the queue slot and the permit are RAII guards; every counter moves
//!   exactly once per state change, including when the caller is cancelled
//! - Partitions are created lazily and never share capacity; idle partitions
//!   are evicted by `evict_idle`, driven by the health sampler

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BulkheadConfig;
use crate::error::{BoxError, ResilienceError};
use crate::observability::metrics;

/// Partition used when the caller does not name one.
pub const DEFAULT_PARTITION: &str = "default";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadMetrics {
    pub active: usize,
    pub queued: usize,
    pub rejected: u64,
}

impl std::ops::Add for BulkheadMetrics {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            active: self.active + other.active,
            queued: self.queued + other.queued,
            rejected: self.rejected + other.rejected,
        }
    }
}

#[derive(Debug)]
pub struct Bulkhead {
    partition: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    queued: AtomicUsize,
    rejected: AtomicU64,
}

impl Bulkhead {
    pub fn new(partition: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            partition: partition.into(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent as usize)),
            config,
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            active: self.active.load(Ordering::Acquire),
            queued: self.queued.load(Ordering::Acquire),
            rejected: self.rejected.load(Ordering::Acquire),
        }
    }

    /// Admit immediately, wait in the queue, or reject.
    pub async fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> Result<BulkheadPermit, ResilienceError> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(self.admit(permit, false));
        }

        let slot = self.try_enqueue().ok_or_else(|| {
            self.reject();
            tracing::warn!(partition = %self.partition, "Bulkhead full");
            ResilienceError::BulkheadFull {
                partition: self.partition.clone(),
            }
        })?;

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResilienceError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit.map_err(|_| {
                ResilienceError::Configuration(format!("bulkhead '{}' closed", self.partition))
            }),
            _ = tokio::time::sleep(self.config.queue_timeout) => {
                self.reject();
                tracing::warn!(partition = %self.partition, waited = ?started.elapsed(), "Bulkhead queue timeout");
                Err(ResilienceError::BulkheadQueueTimeout {
                    partition: self.partition.clone(),
                    waited: started.elapsed(),
                })
            }
        };

        let permit = outcome?;
        let admitted = self.admit(permit, true);
        drop(slot);
        Ok(admitted)
    }

    /// Run `operation` inside the bulkhead.
    pub async fn execute<T, E, Fut>(self: &Arc<Self>, operation: Fut) -> Result<T, ResilienceError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let _permit = self.acquire(&CancellationToken::new()).await?;
        operation.await.map_err(ResilienceError::operation)
    }

    fn try_enqueue(self: &Arc<Self>) -> Option<QueueSlot> {
        let max_queue = self.config.max_queue as usize;
        let mut prev = self.queued.load(Ordering::Relaxed);
        loop {
            if prev >= max_queue {
                return None;
            }
            match self
                .queued
                .compare_exchange_weak(prev, prev + 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        self.publish();
        Some(QueueSlot {
            bulkhead: self.clone(),
        })
    }

    fn admit(self: &Arc<Self>, permit: OwnedSemaphorePermit, waited: bool) -> BulkheadPermit {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.publish();
        BulkheadPermit {
            bulkhead: self.clone(),
            waited,
            _permit: permit,
        }
    }

    fn reject(&self) {
        self.rejected.fetch_add(1, Ordering::AcqRel);
    }

    fn publish(&self) {
        let m = self.metrics();
        metrics::record_bulkhead(&self.partition, m.active, m.queued);
    }
}

/// Reserved queue position; released on drop.
#[derive(Debug)]
struct QueueSlot {
    bulkhead: Arc<Bulkhead>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.bulkhead.queued.fetch_sub(1, Ordering::AcqRel);
        self.bulkhead.publish();
    }
}

/// Execution slot. Capacity returns to the partition when dropped.
#[derive(Debug)]
pub struct BulkheadPermit {
    bulkhead: Arc<Bulkhead>,
    waited: bool,
    _permit: OwnedSemaphorePermit,
}

impl BulkheadPermit {
    /// True when the call sat in the queue before admission.
    pub fn waited(&self) -> bool {
        self.waited
    }

    pub fn partition(&self) -> &str {
        &self.bulkhead.partition
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.bulkhead.active.fetch_sub(1, Ordering::AcqRel);
        self.bulkhead.publish();
    }
}

/// Independent bulkheads keyed by partition.
#[derive(Debug)]
pub struct PartitionedBulkhead {
    config: BulkheadConfig,
    partitions: DashMap<String, Arc<Bulkhead>>,
    /// Rejections counted by partitions that were since evicted.
    evicted_rejections: AtomicU64,
}

impl PartitionedBulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            config,
            partitions: DashMap::new(),
            evicted_rejections: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Bulkhead for `partition`, created on first use.
    pub fn partition(&self, partition: &str) -> Arc<Bulkhead> {
        if let Some(existing) = self.partitions.get(partition) {
            return existing.clone();
        }
        self.partitions
            .entry(partition.to_string())
            .or_insert_with(|| Arc::new(Bulkhead::new(partition, self.config.clone())))
            .clone()
    }

    pub async fn acquire(
        &self,
        partition: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BulkheadPermit, ResilienceError> {
        self.partition(partition.unwrap_or(DEFAULT_PARTITION))
            .acquire(cancel)
            .await
    }

    pub fn partition_metrics(&self, partition: &str) -> Option<BulkheadMetrics> {
        self.partitions.get(partition).map(|b| b.metrics())
    }

    /// Sum over all partitions, including rejections of evicted ones.
    pub fn metrics(&self) -> BulkheadMetrics {
        let evicted = BulkheadMetrics {
            rejected: self.evicted_rejections.load(Ordering::Acquire),
            ..BulkheadMetrics::default()
        };
        self.partitions
            .iter()
            .map(|entry| entry.value().metrics())
            .fold(evicted, |acc, m| acc + m)
    }

    /// Drop partitions nobody is using. A partition is in use while a caller
    /// holds it, a permit is out, or a call is queued.
    pub fn evict_idle(&self) -> usize {
        let before = self.partitions.len();
        self.partitions.retain(|_, bulkhead| {
            let metrics = bulkhead.metrics();
            let idle = Arc::strong_count(bulkhead) == 1 && metrics.active == 0 && metrics.queued == 0;
            if idle {
                self.evicted_rejections.fetch_add(metrics.rejected, Ordering::AcqRel);
            }
            !idle
        });
        let evicted = before.saturating_sub(self.partitions.len());
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted idle bulkhead partitions");
        }
        evicted
    }

    pub fn partition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.partitions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    fn config(max_concurrent: u32, max_queue: u32) -> BulkheadConfig {
        BulkheadConfig {
            max_concurrent,
            max_queue,
            queue_timeout: Duration::from_secs(5),
        }
    }

    async fn wait_for_queued(bulkhead: &Bulkhead, queued: usize) {
        while bulkhead.metrics().queued != queued {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_two_active_one_queued_one_rejected() {
        let bulkhead = Arc::new(Bulkhead::new("tenant", config(2, 1)));
        let cancel = CancellationToken::new();

        let p1 = bulkhead.acquire(&cancel).await.unwrap();
        let p2 = bulkhead.acquire(&cancel).await.unwrap();

        let waiter = {
            let bulkhead = bulkhead.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bulkhead.acquire(&cancel).await.map(|p| p.waited()) })
        };
        wait_for_queued(&bulkhead, 1).await;

        let fourth = bulkhead.acquire(&cancel).await;
        assert_eq!(fourth.unwrap_err().kind(), ErrorKind::BulkheadFull);
        assert_eq!(
            bulkhead.metrics(),
            BulkheadMetrics {
                active: 2,
                queued: 1,
                rejected: 1
            }
        );

        drop(p1);
        assert!(waiter.await.unwrap().unwrap());
        drop(p2);
        assert_eq!(
            bulkhead.metrics(),
            BulkheadMetrics {
                active: 0,
                queued: 0,
                rejected: 1
            }
        );
    }

    #[tokio::test]
    async fn test_release_is_fifo() {
        let bulkhead = Arc::new(Bulkhead::new("p", config(1, 3)));
        let cancel = CancellationToken::new();
        let held = bulkhead.acquire(&cancel).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for i in 0..3 {
            let task_bulkhead = bulkhead.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = task_bulkhead.acquire(&cancel).await.unwrap();
                tx.send(i).unwrap();
            }));
            wait_for_queued(&bulkhead, i + 1).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        let order: Vec<usize> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_releases_slot() {
        let bulkhead = Arc::new(Bulkhead::new("p", config(1, 1)));
        let cancel = CancellationToken::new();
        let _held = bulkhead.acquire(&cancel).await.unwrap();

        let err = bulkhead.acquire(&cancel).await.unwrap_err();
        match err {
            ResilienceError::BulkheadQueueTimeout { waited, .. } => {
                assert_eq!(waited, Duration::from_secs(5))
            }
            other => panic!("expected queue timeout, got {:?}", other),
        }
        assert_eq!(bulkhead.metrics().queued, 0);
        assert_eq!(bulkhead.metrics().rejected, 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let bulkhead = Arc::new(Bulkhead::new("p", config(1, 1)));
        let cancel = CancellationToken::new();
        let _held = bulkhead.acquire(&CancellationToken::new()).await.unwrap();

        let waiter = {
            let bulkhead = bulkhead.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bulkhead.acquire(&cancel).await.map(|_| ()) })
        };
        wait_for_queued(&bulkhead, 1).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap().unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(bulkhead.metrics().queued, 0);
        assert_eq!(bulkhead.metrics().rejected, 0);
    }

    #[tokio::test]
    async fn test_zero_queue_rejects_immediately() {
        let bulkhead = Arc::new(Bulkhead::new("p", config(1, 0)));
        bulkhead.execute(async { Ok::<_, BoxError>(()) }).await.unwrap();
        assert_eq!(bulkhead.metrics().active, 0);

        let cancel = CancellationToken::new();
        let _p = bulkhead.acquire(&cancel).await.unwrap();
        assert_eq!(
            bulkhead.acquire(&cancel).await.unwrap_err().kind(),
            ErrorKind::BulkheadFull
        );
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let bulkheads = PartitionedBulkhead::new(config(1, 0));
        let cancel = CancellationToken::new();

        let _a = bulkheads.acquire(Some("tenant-a"), &cancel).await.unwrap();
        let _b = bulkheads.acquire(Some("tenant-b"), &cancel).await.unwrap();
        assert!(bulkheads.acquire(Some("tenant-a"), &cancel).await.is_err());
        let _d = bulkheads.acquire(None, &cancel).await.unwrap();

        assert_eq!(
            bulkheads.metrics(),
            BulkheadMetrics {
                active: 3,
                queued: 0,
                rejected: 1
            }
        );
        assert_eq!(bulkheads.partition_metrics("tenant-a").unwrap().rejected, 1);
        assert_eq!(
            bulkheads.partition_names(),
            vec!["default".to_string(), "tenant-a".to_string(), "tenant-b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_idle_partitions_are_evicted() {
        let bulkheads = PartitionedBulkhead::new(config(1, 0));
        let cancel = CancellationToken::new();

        let busy = bulkheads.acquire(Some("busy"), &cancel).await.unwrap();
        for tenant in ["a", "b", "c"] {
            drop(bulkheads.acquire(Some(tenant), &cancel).await.unwrap());
        }
        assert!(bulkheads.acquire(Some("busy"), &cancel).await.is_err());
        assert_eq!(bulkheads.partition_names().len(), 4);

        assert_eq!(bulkheads.evict_idle(), 3);
        assert_eq!(bulkheads.partition_names(), vec!["busy".to_string()]);

        // A held handle keeps its partition alive.
        let handle = bulkheads.partition("held");
        assert_eq!(bulkheads.evict_idle(), 0);
        drop(handle);

        drop(busy);
        assert_eq!(bulkheads.evict_idle(), 2);
        assert!(bulkheads.partition_names().is_empty());
        assert_eq!(bulkheads.metrics().rejected, 1);

        // An evicted partition comes back with full capacity.
        let _again = bulkheads.acquire(Some("a"), &cancel).await.unwrap();
        assert_eq!(bulkheads.partition_metrics("a").unwrap().active, 1);
    }
}
