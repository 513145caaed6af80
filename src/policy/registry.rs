//! Live primitive instances shared by every call.
//!
//! Breakers are keyed by dependency so several policies guarding the same
//! dependency share one state machine. Rate limiters and bulkheads belong to
//! a single policy and are keyed by its name.

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::{BulkheadConfig, CircuitBreakerConfig, RateLimitConfig};
use crate::observability::EventBus;
use crate::resilience::{CircuitBreaker, CounterStore, DistributedRateLimiter, PartitionedBulkhead, RateLimiter};

#[derive(Debug, Default)]
pub struct Registry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    limiters: DashMap<String, Arc<RateLimiter>>,
    shared_limiters: DashMap<String, Arc<DistributedRateLimiter>>,
    bulkheads: DashMap<String, Arc<PartitionedBulkhead>>,
    events: EventBus,
}

impl Registry {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    /// Breaker for `dependency`; thresholds follow the latest config, state is kept.
    pub fn breaker(&self, dependency: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            existing.update_config(config.clone());
            return existing.clone();
        }
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                tracing::debug!(dependency, "Registering circuit breaker");
                Arc::new(CircuitBreaker::new(dependency, config.clone()).with_events(self.events.clone()))
            })
            .clone()
    }

    pub fn find_breaker(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(dependency).map(|b| b.clone())
    }

    /// Limiter for `policy`, rebuilt when its config changes.
    pub fn limiter(&self, policy: &str, config: &RateLimitConfig) -> Arc<RateLimiter> {
        let mut entry = self
            .limiters
            .entry(policy.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(config.clone())));
        if entry.config() != config {
            tracing::debug!(policy, "Rate limiter replaced after config change");
            *entry = Arc::new(RateLimiter::new(config.clone()));
        }
        entry.clone()
    }

    pub fn find_limiter(&self, policy: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(policy).map(|l| l.clone())
    }

    /// Store-backed limiter for `policy`, rebuilt when its config changes.
    pub fn shared_limiter(
        &self,
        policy: &str,
        config: &RateLimitConfig,
        namespace: &str,
        store: &Arc<dyn CounterStore>,
    ) -> Arc<DistributedRateLimiter> {
        let build = || Arc::new(DistributedRateLimiter::new(namespace, config.clone(), store.clone()));
        let mut entry = self
            .shared_limiters
            .entry(policy.to_string())
            .or_insert_with(build);
        if entry.config() != config {
            tracing::debug!(policy, "Shared rate limiter replaced after config change");
            *entry = build();
        }
        entry.clone()
    }

    /// Bulkhead partitions for `policy`, rebuilt when its config changes.
    ///
    /// Permits held against a replaced instance drain against that instance.
    pub fn bulkhead(&self, policy: &str, config: &BulkheadConfig) -> Arc<PartitionedBulkhead> {
        let mut entry = self
            .bulkheads
            .entry(policy.to_string())
            .or_insert_with(|| Arc::new(PartitionedBulkhead::new(config.clone())));
        if entry.config() != config {
            tracing::debug!(policy, "Bulkhead replaced after config change");
            *entry = Arc::new(PartitionedBulkhead::new(config.clone()));
        }
        entry.clone()
    }

    pub fn find_bulkhead(&self, policy: &str) -> Option<Arc<PartitionedBulkhead>> {
        self.bulkheads.get(policy).map(|b| b.clone())
    }

    /// Drop per-policy instances. Breakers stay; other policies may share them.
    pub fn remove_policy(&self, policy: &str) {
        self.remove_limiter(policy);
        self.remove_bulkhead(policy);
    }

    pub fn remove_limiter(&self, policy: &str) -> bool {
        let shared = self.shared_limiters.remove(policy).is_some();
        self.limiters.remove(policy).is_some() || shared
    }

    pub fn remove_bulkhead(&self, policy: &str) -> bool {
        self.bulkheads.remove(policy).is_some()
    }

    /// All breakers, ordered by dependency.
    pub fn breakers(&self) -> Vec<Arc<CircuitBreaker>> {
        let mut all: Vec<_> = self.breakers.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.dependency().cmp(b.dependency()));
        all
    }

    /// All limiters with their policy name, ordered by name.
    pub fn limiters(&self) -> Vec<(String, Arc<RateLimiter>)> {
        let mut all: Vec<_> = self
            .limiters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn shared_limiters(&self) -> Vec<(String, Arc<DistributedRateLimiter>)> {
        let mut all: Vec<_> = self
            .shared_limiters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn bulkheads(&self) -> Vec<(String, Arc<PartitionedBulkhead>)> {
        let mut all: Vec<_> = self
            .bulkheads
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
