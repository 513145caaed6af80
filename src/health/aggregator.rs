//! Health aggregation over live breakers and limiters.
//!
//! # Responsibilities
//! - Map each breaker and limiter to a component status
//! - Reduce component statuses to one overall status
//! - Announce overall status changes, naming the component responsible
//! - Periodically sample until shutdown, evicting idle limiter keys and
//!   bulkhead partitions

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::health::HealthStatus;
use crate::observability::events::unix_millis;
use crate::observability::{metrics, EventBus, PolicyEvent, PolicyEventKind};
use crate::policy::registry::Registry;
use crate::resilience::{CircuitBreaker, CircuitState, RateLimiter};

/// Subject reported when no single component is responsible.
const RUNTIME_SUBJECT: &str = "runtime";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    CircuitBreaker,
    RateLimiter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// `circuit:{dependency}` or `rate_limit:{policy}`.
    pub name: String,
    pub kind: ComponentKind,
    pub status: HealthStatus,
    pub message: String,
}

impl ComponentHealth {
    fn from_breaker(breaker: &CircuitBreaker) -> Self {
        let state = breaker.state();
        let status = match state {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::HalfOpen => HealthStatus::Degraded,
            CircuitState::Open => HealthStatus::Unhealthy,
        };
        Self {
            name: format!("circuit:{}", breaker.dependency()),
            kind: ComponentKind::CircuitBreaker,
            status,
            message: format!("circuit {}", state),
        }
    }

    fn from_limiter(policy: &str, limiter: &RateLimiter, degraded_at: f64) -> Self {
        let utilization = limiter.utilization();
        let status = if utilization >= degraded_at {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            name: format!("rate_limit:{}", policy),
            kind: ComponentKind::RateLimiter,
            status,
            message: format!("{:.0}% of capacity in use", utilization * 100.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// First component with the worst status, when not healthy.
    pub responsible: Option<String>,
    pub components: Vec<ComponentHealth>,
    pub checked_at_ms: u64,
}

#[derive(Debug)]
struct LastSeen {
    status: HealthStatus,
    subject: String,
}

#[derive(Debug)]
pub struct HealthAggregator {
    config: HealthConfig,
    registry: Arc<Registry>,
    events: EventBus,
    last: Mutex<LastSeen>,
}

impl HealthAggregator {
    pub fn new(config: HealthConfig, registry: Arc<Registry>, events: EventBus) -> Self {
        Self {
            config,
            registry,
            events,
            last: Mutex::new(LastSeen {
                status: HealthStatus::Healthy,
                subject: RUNTIME_SUBJECT.to_string(),
            }),
        }
    }

    fn components(&self) -> Vec<ComponentHealth> {
        let breakers = self
            .registry
            .breakers()
            .into_iter()
            .map(|b| ComponentHealth::from_breaker(&b));
        let limiters = self
            .registry
            .limiters()
            .into_iter()
            .map(|(policy, l)| ComponentHealth::from_limiter(&policy, &l, self.config.degraded_utilization));
        breakers.chain(limiters).collect()
    }

    /// Sample everything, emitting an event if the overall status moved.
    pub fn check(&self) -> HealthReport {
        let components = self.components();
        let worst = components.iter().map(|c| c.status).max().unwrap_or(HealthStatus::Healthy);
        let responsible = (worst != HealthStatus::Healthy)
            .then(|| components.iter().find(|c| c.status == worst))
            .flatten()
            .map(|c| c.name.clone());

        let change = {
            let mut last = self.last.lock();
            if last.status == worst {
                None
            } else {
                // On recovery, credit the component that caused the previous status.
                let subject = responsible.clone().unwrap_or_else(|| last.subject.clone());
                let previous = last.status;
                *last = LastSeen {
                    status: worst,
                    subject: subject.clone(),
                };
                Some((previous, subject))
            }
        };

        if let Some((previous, subject)) = change {
            match worst {
                HealthStatus::Healthy => {
                    tracing::info!(previous = %previous, subject = %subject, "Runtime healthy")
                }
                _ => tracing::warn!(previous = %previous, status = %worst, subject = %subject, "Health status changed"),
            }
            self.events.emit(PolicyEvent::transition(
                PolicyEventKind::HealthStatusChanged,
                subject,
                previous,
                worst,
            ));
        }
        metrics::record_health(worst);

        HealthReport {
            status: worst,
            responsible,
            components,
            checked_at_ms: unix_millis(),
        }
    }

    /// Report for one component by name, without touching the overall status.
    pub fn component(&self, name: &str) -> Option<ComponentHealth> {
        if let Some(dependency) = name.strip_prefix("circuit:") {
            return self
                .registry
                .find_breaker(dependency)
                .map(|b| ComponentHealth::from_breaker(&b));
        }
        if let Some(policy) = name.strip_prefix("rate_limit:") {
            return self
                .registry
                .find_limiter(policy)
                .map(|l| ComponentHealth::from_limiter(policy, &l, self.config.degraded_utilization));
        }
        None
    }

    pub fn status(&self) -> HealthStatus {
        self.last.lock().status
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            tracing::info!("Health aggregation disabled");
            return;
        }

        tracing::info!(interval = ?self.config.interval, "Health aggregator starting");
        let mut ticker = time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check();
                    for (_, limiter) in self.registry.limiters() {
                        limiter.evict_idle();
                    }
                    for (_, limiter) in self.registry.shared_limiters() {
                        limiter.evict_idle();
                    }
                    for (_, bulkheads) in self.registry.bulkheads() {
                        bulkheads.evict_idle();
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Health aggregator received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BulkheadConfig, CircuitBreakerConfig, RateLimitAlgorithm, RateLimitConfig};
    use std::time::Duration;

    fn breaker_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_timeout: Duration::from_secs(10),
            probe_count: 1,
        }
    }

    fn setup() -> (Arc<Registry>, HealthAggregator, tokio::sync::broadcast::Receiver<PolicyEvent>) {
        let events = EventBus::new(32);
        let rx = events.subscribe();
        let registry = Arc::new(Registry::new(events.clone()));
        let aggregator = HealthAggregator::new(HealthConfig::default(), registry.clone(), events);
        (registry, aggregator, rx)
    }

    fn health_events(rx: &mut tokio::sync::broadcast::Receiver<PolicyEvent>) -> Vec<PolicyEvent> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| e.kind == PolicyEventKind::HealthStatusChanged)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_makes_runtime_unhealthy() {
        let (registry, aggregator, mut rx) = setup();
        let breaker = registry.breaker("payments", &breaker_config());
        registry.breaker("search", &breaker_config());

        assert_eq!(aggregator.check().status, HealthStatus::Healthy);

        breaker.try_acquire().unwrap().record_failure();
        let report = aggregator.check();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.responsible.as_deref(), Some("circuit:payments"));

        let events = health_events(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject, "circuit:payments");
        assert_eq!(events[0].previous.as_deref(), Some("healthy"));
        assert_eq!(events[0].current.as_deref(), Some("unhealthy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_only_on_change() {
        let (registry, aggregator, mut rx) = setup();
        let breaker = registry.breaker("db", &breaker_config());
        breaker.try_acquire().unwrap().record_failure();

        aggregator.check();
        aggregator.check();
        assert_eq!(health_events(&mut rx).len(), 1);

        // Half-open is degraded, then recovery returns to healthy.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(aggregator.check().status, HealthStatus::Degraded);
        breaker.try_acquire().unwrap().record_success();
        assert_eq!(aggregator.check().status, HealthStatus::Healthy);

        let events = health_events(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].subject, "circuit:db");
        assert_eq!(events[1].current.as_deref(), Some("healthy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_limit_is_degraded() {
        let (registry, aggregator, _rx) = setup();
        let limiter = registry.limiter(
            "api",
            &RateLimitConfig {
                algorithm: RateLimitAlgorithm::TokenBucket,
                limit: 10,
                window: Duration::from_secs(1),
                burst_size: 10,
            },
        );
        for _ in 0..9 {
            limiter.check("client");
        }

        let report = aggregator.check();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.responsible.as_deref(), Some("rate_limit:api"));

        let component = aggregator.component("rate_limit:api").unwrap();
        assert_eq!(component.status, HealthStatus::Degraded);
        assert!(aggregator.component("rate_limit:missing").is_none());
        assert!(aggregator.component("bogus").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_evicts_idle_partitions() {
        let (registry, aggregator, _rx) = setup();
        let bulkheads = registry.bulkhead("tenants", &BulkheadConfig::default());
        let cancel = CancellationToken::new();
        for tenant in ["t1", "t2", "t3"] {
            drop(bulkheads.acquire(Some(tenant), &cancel).await.unwrap());
        }
        let _held = bulkheads.acquire(Some("t4"), &cancel).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(aggregator).run(shutdown.clone()));
        while bulkheads.partition_names().len() > 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(bulkheads.partition_names(), vec!["t4".to_string()]);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (_registry, aggregator, _rx) = setup();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(aggregator).run(shutdown.clone()));

        tokio::time::advance(Duration::from_secs(12)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
