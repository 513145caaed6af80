//! Shared counter store for cross-process rate limiting.
//!
//! # Responsibilities
//! - Define the `CounterStore` boundary (increment with TTL, read)
//! - Provide an in-memory store for single-process use and tests
//! - Layer a shared sliding-window limit over a process-local limiter
//!
//! # Design Decisions
//! - Keys are `{namespace}:{key}:{window_bucket}`; a window is 10 buckets and
//!   the bucket about to expire still counts, so no process ever sees more
//!   than the limit admitted within one window
//! - Store failures fall back to the local limiter (fail open to local,
//!   never fail closed)
//! - Synchronization is best-effort; no consensus between processes

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{RateLimitAlgorithm, RateLimitConfig};
use crate::error::ResilienceError;
use crate::observability::events::unix_millis;
use crate::resilience::rate_limit::{Decision, RateLimitHeaders, RateLimiter, RING_SLOTS, WINDOW_BUCKETS};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CounterStore: Send + Sync + fmt::Debug {
    /// Add one to `key`, creating it with `ttl` if absent. Returns the new count.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Current count for `key`; zero when absent or expired.
    async fn get(&self, key: &str) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, (u64, Instant)>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired counters.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.counters.retain(|_, (_, expires)| *expires > now);
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert((0, now + ttl));
        let (count, expires) = entry.value_mut();
        if *expires <= now {
            *count = 0;
            *expires = now + ttl;
        }
        *count += 1;
        Ok(*count)
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .filter(|entry| entry.value().1 > now)
            .map_or(0, |entry| entry.value().0))
    }
}

/// Rate limiter whose counts are shared through a `CounterStore`.
///
/// Both algorithms are enforced as a bucketed sliding window over the store.
/// A sliding window admits `limit` calls per `window`. A token bucket admits
/// `burst_size` calls per the time it takes to earn `burst_size` tokens, which
/// caps bursts at the bucket size and keeps the long-run rate at
/// `limit / window`.
#[derive(Debug)]
pub struct DistributedRateLimiter {
    namespace: String,
    config: RateLimitConfig,
    store: Arc<dyn CounterStore>,
    local: RateLimiter,
    origin: Instant,
    origin_ms: u64,
}

impl DistributedRateLimiter {
    pub fn new(namespace: impl Into<String>, config: RateLimitConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            namespace: namespace.into(),
            local: RateLimiter::new(config.clone()),
            config,
            store,
            origin: Instant::now(),
            origin_ms: unix_millis(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Calls admitted per span.
    fn effective_limit(&self) -> u64 {
        match self.config.algorithm {
            RateLimitAlgorithm::TokenBucket => u64::from(self.config.burst_size.max(1)),
            RateLimitAlgorithm::SlidingWindow => u64::from(self.config.limit.max(1)),
        }
    }

    fn span_ms(&self) -> u64 {
        let window_ms = self.config.window.as_millis() as u64;
        let span = match self.config.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                window_ms.saturating_mul(u64::from(self.config.burst_size.max(1)))
                    / u64::from(self.config.limit.max(1))
            }
            RateLimitAlgorithm::SlidingWindow => window_ms,
        };
        span.max(1)
    }

    fn bucket_ms(&self) -> u64 {
        (self.span_ms() / WINDOW_BUCKETS).max(1)
    }

    /// How long a bucket key must outlive its first increment.
    fn bucket_ttl(&self) -> Duration {
        Duration::from_millis(self.bucket_ms().saturating_mul(RING_SLOTS as u64))
    }

    /// Unix milliseconds, advanced by the runtime clock.
    fn now_ms(&self) -> u64 {
        self.origin_ms.saturating_add(self.origin.elapsed().as_millis() as u64)
    }

    /// Store key for `key` in the bucket containing `now_ms`.
    pub fn store_key(&self, key: &str, now_ms: u64) -> String {
        self.bucket_key(key, now_ms / self.bucket_ms())
    }

    fn bucket_key(&self, key: &str, bucket: u64) -> String {
        format!("{}:{}:{}", self.namespace, key, bucket)
    }

    /// Counts of every bucket still inside the window, oldest first. The last
    /// entry is the current bucket.
    async fn counted(&self, key: &str, now_bucket: u64) -> Result<Vec<(u64, u64)>, StoreError> {
        let oldest = now_bucket.saturating_sub(WINDOW_BUCKETS);
        let mut counts = Vec::with_capacity(RING_SLOTS);
        for bucket in oldest..=now_bucket {
            let count = self.store.get(&self.bucket_key(key, bucket)).await?;
            counts.push((bucket, count));
        }
        Ok(counts)
    }

    /// Time from `now_ms` until the counted total drops to `target` or below.
    fn wait_for(&self, counts: &[(u64, u64)], target: u64, now_ms: u64) -> Duration {
        let mut remaining: u64 = counts.iter().map(|(_, count)| count).sum();
        if remaining <= target {
            return Duration::ZERO;
        }
        for (bucket, count) in counts {
            remaining = remaining.saturating_sub(*count);
            if remaining <= target {
                let expires_ms = (bucket + RING_SLOTS as u64).saturating_mul(self.bucket_ms());
                return Duration::from_millis(expires_ms.saturating_sub(now_ms));
            }
        }
        Duration::from_millis(self.bucket_ms())
    }

    fn headers_for(&self, counts: &[(u64, u64)], now_ms: u64) -> RateLimitHeaders {
        let limit = self.effective_limit();
        let used: u64 = counts.iter().map(|(_, count)| count).sum();
        RateLimitHeaders::new(
            limit as u32,
            limit.saturating_sub(used) as u32,
            self.wait_for(counts, 0, now_ms),
        )
    }

    async fn check_shared(&self, key: &str) -> Result<Decision, StoreError> {
        let now_ms = self.now_ms();
        let now_bucket = now_ms / self.bucket_ms();
        let limit = self.effective_limit();
        let mut counts = self.counted(key, now_bucket).await?;
        let used: u64 = counts.iter().map(|(_, count)| count).sum();

        if used < limit {
            let current = self
                .store
                .increment(&self.bucket_key(key, now_bucket), self.bucket_ttl())
                .await?;
            // The fresh count includes anyone who incremented since the read.
            if let Some(last) = counts.last_mut() {
                last.1 = current;
            }
            let used: u64 = counts.iter().map(|(_, count)| count).sum();
            if used <= limit {
                return Ok(Decision {
                    allowed: true,
                    retry_after: Duration::ZERO,
                    headers: self.headers_for(&counts, now_ms),
                });
            }
        }

        Ok(Decision {
            allowed: false,
            retry_after: self.wait_for(&counts, limit - 1, now_ms),
            headers: self.headers_for(&counts, now_ms),
        })
    }

    /// Decide admission for `key` against the shared counts, consuming
    /// capacity when admitted. A failing store falls back to the local limiter.
    pub async fn check(&self, key: &str) -> Decision {
        match self.check_shared(key).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(namespace = %self.namespace, key, error = %e, "Counter store failed, using local limit");
                self.local.check(key)
            }
        }
    }

    pub async fn acquire(&self, key: &str) -> Result<RateLimitHeaders, ResilienceError> {
        let decision = self.check(key).await;
        if decision.allowed {
            Ok(decision.headers)
        } else {
            Err(ResilienceError::RateLimited {
                key: key.to_string(),
                retry_after: decision.retry_after,
                headers: decision.headers,
            })
        }
    }

    /// Current headers for `key` without consuming anything.
    pub async fn headers(&self, key: &str) -> RateLimitHeaders {
        let now_ms = self.now_ms();
        match self.counted(key, now_ms / self.bucket_ms()).await {
            Ok(counts) => self.headers_for(&counts, now_ms),
            Err(_) => self.local.headers(key),
        }
    }

    /// Drop idle keys from the local fallback limiter.
    pub fn evict_idle(&self) -> usize {
        self.local.evict_idle()
    }
}
