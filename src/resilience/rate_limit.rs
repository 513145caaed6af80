//! Rate limiting.
//!
//! # Responsibilities
//! - Admit or reject calls per key under a token bucket or sliding window
//! - Report `retry_after` on rejection
//! - Expose limit / remaining / reset headers on every decision
//!
//! # Design Decisions
//! - One map entry per key; the map shard lock makes decide+decrement atomic
//! - Token bucket refills lazily on access, never from a background task
//! - Sliding window keeps 10 bucketed counters and also counts the bucket
//!   about to expire, so it never over-admits (it may reject up to one bucket
//!   width early)
//! - Idle keys are evicted by `evict_idle`, driven by the health sampler

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{RateLimitAlgorithm, RateLimitConfig};
use crate::error::ResilienceError;
use crate::observability::events::unix_millis;

/// Buckets per sliding window.
pub(crate) const WINDOW_BUCKETS: u64 = 10;
/// Ring slots: the window's buckets plus the one currently expiring.
pub(crate) const RING_SLOTS: usize = WINDOW_BUCKETS as usize + 1;

/// Introspection headers attached to every decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds at which the key is back to full capacity.
    pub reset: u64,
}

impl RateLimitHeaders {
    pub(crate) fn new(limit: u32, remaining: u32, reset_after: Duration) -> Self {
        let reset_ms = unix_millis().saturating_add(reset_after.as_millis() as u64);
        Self {
            limit,
            remaining,
            reset: reset_ms.div_ceil(1000),
        }
    }

    /// Conventional HTTP header names and values.
    pub fn to_pairs(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset.to_string()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    /// Zero when allowed.
    pub retry_after: Duration,
    pub headers: RateLimitHeaders,
}

/// Lazily refilled token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_update: now,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, capacity: f64, refill_rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;
    }

    /// Take one token, or report how long until one is available.
    pub fn try_acquire(&mut self, capacity: f64, refill_rate: f64, now: Instant) -> Result<(), Duration> {
        self.refill(capacity, refill_rate, now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / refill_rate))
        }
    }

    fn until_full(&self, capacity: f64, refill_rate: f64) -> Duration {
        Duration::from_secs_f64(((capacity - self.tokens) / refill_rate).max(0.0))
    }
}

/// Bucketed counters over a trailing window.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    counts: [u32; RING_SLOTS],
    /// Absolute index of the newest bucket the ring has been advanced to.
    head: u64,
}

impl SlidingWindow {
    pub fn new(now_bucket: u64) -> Self {
        Self {
            counts: [0; RING_SLOTS],
            head: now_bucket,
        }
    }

    fn advance(&mut self, now_bucket: u64) {
        if now_bucket <= self.head {
            return;
        }
        if now_bucket - self.head >= RING_SLOTS as u64 {
            self.counts = [0; RING_SLOTS];
        } else {
            for idx in (self.head + 1)..=now_bucket {
                self.counts[(idx % RING_SLOTS as u64) as usize] = 0;
            }
        }
        self.head = now_bucket;
    }

    pub fn count(&self) -> u32 {
        self.counts.iter().sum()
    }

    /// Buckets oldest first, paired with their absolute index.
    fn oldest_first(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        let oldest = self.head.saturating_sub(WINDOW_BUCKETS);
        (oldest..=self.head).map(move |idx| (idx, self.counts[(idx % RING_SLOTS as u64) as usize]))
    }

    /// Bucket index after whose expiry the count drops to `target` or below.
    fn expiry_for(&self, target: u32) -> Option<u64> {
        let mut remaining = self.count();
        if remaining <= target {
            return None;
        }
        for (idx, count) in self.oldest_first() {
            remaining -= count;
            if remaining <= target {
                return Some(idx);
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
enum KeyState {
    Bucket(TokenBucket),
    Window(SlidingWindow),
}

/// Keyed rate limiter for one policy.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    origin: Instant,
    keys: DashMap<String, KeyState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            origin: Instant::now(),
            keys: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    fn capacity(&self) -> f64 {
        f64::from(self.config.burst_size.max(1))
    }

    fn refill_rate(&self) -> f64 {
        let window = self.config.window.as_secs_f64().max(f64::MIN_POSITIVE);
        f64::from(self.config.limit.max(1)) / window
    }

    fn bucket_width(&self) -> Duration {
        (self.config.window / WINDOW_BUCKETS as u32).max(Duration::from_nanos(1))
    }

    fn bucket_index(&self, now: Instant) -> u64 {
        let width = self.bucket_width().as_nanos();
        (now.saturating_duration_since(self.origin).as_nanos() / width) as u64
    }

    fn bucket_start(&self, idx: u64) -> Instant {
        let width = self.bucket_width();
        self.origin + width.saturating_mul(u32::try_from(idx).unwrap_or(u32::MAX))
    }

    fn fresh_state(&self, now: Instant) -> KeyState {
        match self.config.algorithm {
            RateLimitAlgorithm::TokenBucket => KeyState::Bucket(TokenBucket::new(self.capacity(), now)),
            RateLimitAlgorithm::SlidingWindow => {
                KeyState::Window(SlidingWindow::new(self.bucket_index(now)))
            }
        }
    }

    /// Decide admission for `key`, consuming capacity when admitted.
    pub fn check(&self, key: &str) -> Decision {
        let now = Instant::now();
        let mut entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| self.fresh_state(now));

        match entry.value_mut() {
            KeyState::Bucket(bucket) => {
                let (capacity, rate) = (self.capacity(), self.refill_rate());
                let outcome = bucket.try_acquire(capacity, rate, now);
                let headers = RateLimitHeaders::new(
                    self.config.burst_size,
                    bucket.tokens().floor() as u32,
                    bucket.until_full(capacity, rate),
                );
                match outcome {
                    Ok(()) => Decision {
                        allowed: true,
                        retry_after: Duration::ZERO,
                        headers,
                    },
                    Err(retry_after) => Decision {
                        allowed: false,
                        retry_after,
                        headers,
                    },
                }
            }
            KeyState::Window(window) => {
                let now_bucket = self.bucket_index(now);
                window.advance(now_bucket);
                let limit = self.config.limit;

                if window.count() < limit {
                    window.counts[(now_bucket % RING_SLOTS as u64) as usize] += 1;
                    let headers = self.window_headers(window, now);
                    Decision {
                        allowed: true,
                        retry_after: Duration::ZERO,
                        headers,
                    }
                } else {
                    let retry_after = window
                        .expiry_for(limit.saturating_sub(1))
                        .map(|idx| self.expired_at(idx).saturating_duration_since(now))
                        .unwrap_or_else(|| self.bucket_width());
                    Decision {
                        allowed: false,
                        retry_after,
                        headers: self.window_headers(window, now),
                    }
                }
            }
        }
    }

    /// Like `check`, but a rejection becomes a `RateLimited` error.
    pub fn acquire(&self, key: &str) -> Result<RateLimitHeaders, ResilienceError> {
        let decision = self.check(key);
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
    pub fn headers(&self, key: &str) -> RateLimitHeaders {
        let now = Instant::now();
        let Some(mut entry) = self.keys.get_mut(key) else {
            let full = match self.config.algorithm {
                RateLimitAlgorithm::TokenBucket => self.config.burst_size,
                RateLimitAlgorithm::SlidingWindow => self.config.limit,
            };
            return RateLimitHeaders::new(full, full, Duration::ZERO);
        };

        match entry.value_mut() {
            KeyState::Bucket(bucket) => {
                let (capacity, rate) = (self.capacity(), self.refill_rate());
                bucket.refill(capacity, rate, now);
                RateLimitHeaders::new(
                    self.config.burst_size,
                    bucket.tokens().floor() as u32,
                    bucket.until_full(capacity, rate),
                )
            }
            KeyState::Window(window) => {
                window.advance(self.bucket_index(now));
                self.window_headers(window, now)
            }
        }
    }

    /// Highest fraction of capacity in use across all keys, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        let now = Instant::now();
        let mut highest: f64 = 0.0;

        for mut entry in self.keys.iter_mut() {
            let used = match entry.value_mut() {
                KeyState::Bucket(bucket) => {
                    let capacity = self.capacity();
                    bucket.refill(capacity, self.refill_rate(), now);
                    1.0 - bucket.tokens() / capacity
                }
                KeyState::Window(window) => {
                    window.advance(self.bucket_index(now));
                    f64::from(window.count()) / f64::from(self.config.limit.max(1))
                }
            };
            highest = highest.max(used);
        }

        highest.clamp(0.0, 1.0)
    }

    /// Drop keys that are back at full capacity.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.keys.len();
        let (capacity, rate) = (self.capacity(), self.refill_rate());
        let now_bucket = self.bucket_index(now);

        self.keys.retain(|_, state| match state {
            KeyState::Bucket(bucket) => {
                bucket.refill(capacity, rate, now);
                bucket.tokens() < capacity
            }
            KeyState::Window(window) => {
                window.advance(now_bucket);
                window.count() > 0
            }
        });

        before.saturating_sub(self.keys.len())
    }

    /// Instant at which bucket `idx` stops being counted.
    fn expired_at(&self, idx: u64) -> Instant {
        self.bucket_start(idx + RING_SLOTS as u64)
    }

    fn window_headers(&self, window: &SlidingWindow, now: Instant) -> RateLimitHeaders {
        let limit = self.config.limit;
        let reset_after = window
            .expiry_for(0)
            .map(|idx| self.expired_at(idx).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        RateLimitHeaders::new(limit, limit.saturating_sub(window.count()), reset_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(algorithm: RateLimitAlgorithm, limit: u32, window: Duration, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            algorithm,
            limit,
            window,
            burst_size: burst,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_burst_then_reject() {
        let limiter = RateLimiter::new(config(
            RateLimitAlgorithm::TokenBucket,
            10,
            Duration::from_secs(1),
            10,
        ));

        for i in 0..10 {
            let decision = limiter.check("client");
            assert!(decision.allowed, "request {} should pass", i);
            assert_eq!(decision.headers.remaining, 9 - i);
        }

        let rejected = limiter.check("client");
        assert!(!rejected.allowed);
        assert_eq!(rejected.headers.remaining, 0);
        let ms = rejected.retry_after.as_secs_f64() * 1000.0;
        assert!((ms - 100.0).abs() < 1.0, "retry_after was {}ms", ms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refills_lazily() {
        let limiter = RateLimiter::new(config(
            RateLimitAlgorithm::TokenBucket,
            10,
            Duration::from_secs(1),
            5,
        ));
        for _ in 0..5 {
            assert!(limiter.check("k").allowed);
        }
        assert!(!limiter.check("k").allowed);

        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(limiter.check("k").allowed);
        assert!(limiter.check("k").allowed);
        assert!(!limiter.check("k").allowed);

        // Never above capacity, however long we wait.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.headers("k").remaining, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(config(
            RateLimitAlgorithm::TokenBucket,
            1,
            Duration::from_secs(1),
            1,
        ));
        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
        assert_eq!(limiter.key_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_limits_trailing_window() {
        let limiter = RateLimiter::new(config(
            RateLimitAlgorithm::SlidingWindow,
            5,
            Duration::from_secs(1),
            5,
        ));

        for _ in 0..5 {
            assert!(limiter.check("k").allowed);
        }
        let rejected = limiter.check("k");
        assert!(!rejected.allowed);
        assert!(rejected.retry_after > Duration::ZERO);
        assert!(rejected.retry_after <= Duration::from_millis(1100));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!limiter.check("k").allowed);

        tokio::time::advance(rejected.retry_after).await;
        assert!(limiter.check("k").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_never_over_admits() {
        let limiter = RateLimiter::new(config(
            RateLimitAlgorithm::SlidingWindow,
            20,
            Duration::from_secs(1),
            20,
        ));

        // One request every 10ms for 5s; every trailing second must hold at most 20 admissions.
        let mut admitted = Vec::new();
        for step in 0..500u64 {
            if limiter.check("k").allowed {
                admitted.push(step * 10);
            }
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        for &t in &admitted {
            let in_window = admitted.iter().filter(|&&s| s <= t && s + 1000 > t).count();
            assert!(in_window <= 20, "{} admissions in window ending {}ms", in_window, t);
        }
        assert!(admitted.len() >= 80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_headers_do_not_consume() {
        let limiter = RateLimiter::new(config(
            RateLimitAlgorithm::SlidingWindow,
            3,
            Duration::from_secs(1),
            3,
        ));
        assert_eq!(limiter.headers("k").remaining, 3);
        limiter.check("k");
        for _ in 0..5 {
            assert_eq!(limiter.headers("k").remaining, 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_maps_rejection_to_error() {
        let limiter = RateLimiter::new(config(
            RateLimitAlgorithm::TokenBucket,
            1,
            Duration::from_secs(1),
            1,
        ));
        assert!(limiter.acquire("k").is_ok());
        match limiter.acquire("k") {
            Err(ResilienceError::RateLimited { key, retry_after, .. }) => {
                assert_eq!(key, "k");
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected rate limited, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_utilization_and_eviction() {
        let limiter = RateLimiter::new(config(
            RateLimitAlgorithm::TokenBucket,
            10,
            Duration::from_secs(1),
            10,
        ));
        for _ in 0..9 {
            limiter.check("hot");
        }
        limiter.check("cold");
        assert!((limiter.utilization() - 0.9).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(limiter.utilization(), 0.0);
        assert_eq!(limiter.evict_idle(), 2);
        assert_eq!(limiter.key_count(), 0);
    }
}
