//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilience_runtime::config::{
    BulkheadConfig, CircuitBreakerConfig, RateLimitAlgorithm, RateLimitConfig, RetryConfig,
    TimeoutConfig,
};
use resilience_runtime::observability::EventBus;
use resilience_runtime::{BoxError, Policy, PolicyEngine};

/// A programmable downstream dependency.
#[derive(Debug, Clone, Default)]
pub struct MockDependency {
    calls: Arc<AtomicU32>,
    fail_first: u32,
    latency: Duration,
}

impl MockDependency {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self::flaky(u32::MAX)
    }

    /// Fails the first `n` calls, then succeeds.
    pub fn flaky(n: u32) -> Self {
        Self {
            fail_first: n,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn call(&self) -> Result<&'static str, BoxError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if n < self.fail_first {
            Err("503 Service Unavailable".into())
        } else {
            Ok("ok")
        }
    }
}

pub fn engine_with(policies: Vec<Policy>) -> Arc<PolicyEngine> {
    let engine = PolicyEngine::new(EventBus::new(256));
    engine
        .apply_policies(policies)
        .expect("test policies must be valid");
    Arc::new(engine)
}

pub fn breaker(failure_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        success_threshold: 1,
        open_timeout: Duration::from_secs(5),
        probe_count: 1,
    }
}

/// Deterministic backoff: 100ms, 200ms, 400ms, ...
pub fn retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
        jitter_percent: 0.0,
    }
}

pub fn timeout(default: Duration, per_attempt: bool) -> TimeoutConfig {
    TimeoutConfig {
        default,
        max: Duration::from_secs(60),
        per_attempt,
        ..TimeoutConfig::default()
    }
}

pub fn token_bucket(limit: u32, burst: u32) -> RateLimitConfig {
    RateLimitConfig {
        algorithm: RateLimitAlgorithm::TokenBucket,
        limit,
        window: Duration::from_secs(1),
        burst_size: burst,
    }
}

pub fn bulkhead(max_concurrent: u32, max_queue: u32) -> BulkheadConfig {
    BulkheadConfig {
        max_concurrent,
        max_queue,
        queue_timeout: Duration::from_secs(5),
    }
}

/// Write `content` to `name` inside `dir`, returning the full path.
pub fn write_config(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}
