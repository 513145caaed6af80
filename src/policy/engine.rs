//! Policy engine: the single entry point for protected calls.
//!
//! # Responsibilities
//! - Hold the active policy set behind one atomically swapped snapshot
//! - Validate, version and install policy changes (single or whole set)
//! - Run an operation through Bulkhead → Rate Limiter → Breaker → Retry/Timeout
//! - Produce one `ExecutionMetrics` record per call
//!
//! # Data Flow
//! ```text
//! execute("payments", op)
//!     → snapshot.load() → Arc<Policy>        (held for the whole call)
//!     → registry.bulkhead(..).acquire()      (BulkheadFull / BulkheadQueueTimeout)
//!     → registry.limiter(..).check(key)      (RateLimited + headers; store-backed
//!                                             when a CounterStore is attached)
//!     → registry.breaker(dependency)         (CircuitOpen, no attempt consumed)
//!     → RetryHandler::run(attempt → Deadline::run(op()))
//!     → ExecutionMetrics → metrics facade + execution channel
//! ```
//!
//! # Design Decisions
//! - Readers never lock: one `ArcSwap::load` per call
//! - Writers serialize on a mutex and publish with a single `store`
//! - A call rejected at one stage never reaches or counts against later stages
//! - The call deadline starts after admission and bounds attempts and backoff

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::validation::{validate_policies, validate_policy};
use crate::config::watcher::PolicySnapshot;
use crate::config::{HealthConfig, Policy, RateLimitStoreConfig, RuntimeConfig, ValidationErrors};
use crate::error::{BoxError, ResilienceError};
use crate::health::HealthAggregator;
use crate::observability::{metrics, EventBus, ExecutionMetrics, PolicyEvent, PolicyEventKind};
use crate::policy::registry::Registry;
use crate::resilience::{
    BulkheadMetrics, CircuitBreakerState, CircuitState, CounterStore, DistributedRateLimiter,
    RateLimitHeaders, RetryHandler, TimeoutManager,
};

/// Rate-limit key used when the caller does not supply one.
pub const GLOBAL_RATE_LIMIT_KEY: &str = "global";

type PolicyMap = HashMap<String, Arc<Policy>>;

/// Per-call routing and cancellation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Operation name, used for per-operation timeout overrides.
    pub operation: Option<String>,
    /// Bulkhead partition; `default` when absent.
    pub partition: Option<String>,
    /// Rate-limit key; one shared key when absent.
    pub rate_limit_key: Option<String>,
    /// Breaker key; the policy name when absent.
    pub dependency: Option<String>,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = Some(key.into());
        self
    }

    pub fn dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    pub fn cancel_with(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Outcome of `PolicyEngine::run`.
#[derive(Debug)]
pub struct Execution<T> {
    pub result: Result<T, ResilienceError>,
    pub metrics: ExecutionMetrics,
    /// Headers from the rate-limit decision, when the policy limits.
    pub rate_limit: Option<RateLimitHeaders>,
}

/// What `apply_policies` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: usize,
}

impl ApplySummary {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug)]
pub struct PolicyEngine {
    policies: ArcSwap<PolicyMap>,
    write_lock: Mutex<()>,
    registry: Arc<Registry>,
    events: EventBus,
    executions: EventBus<ExecutionMetrics>,
    production_mode: bool,
    counter_store: Option<Arc<dyn CounterStore>>,
    store_namespace: String,
}

impl PolicyEngine {
    pub fn new(events: EventBus) -> Self {
        Self {
            policies: ArcSwap::from_pointee(PolicyMap::new()),
            write_lock: Mutex::new(()),
            registry: Arc::new(Registry::new(events.clone())),
            executions: EventBus::new(1024),
            events,
            production_mode: false,
            counter_store: None,
            store_namespace: RateLimitStoreConfig::default().namespace,
        }
    }

    /// Count rate limits in `store` so every engine sharing it enforces one limit.
    pub fn with_counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    /// Engine sized and seeded from a validated runtime config.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, ResilienceError> {
        let mut engine = Self::new(EventBus::new(config.events.capacity));
        engine.executions = EventBus::new(config.events.capacity);
        engine.production_mode = config.observability.production_mode;
        engine.store_namespace = config.rate_limit_store.namespace.clone();
        engine.apply_policies(config.policies.clone())?;
        Ok(engine)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PolicyEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_executions(&self) -> broadcast::Receiver<ExecutionMetrics> {
        self.executions.subscribe()
    }

    /// Aggregator over this engine's breakers and limiters.
    pub fn health(&self, config: HealthConfig) -> HealthAggregator {
        HealthAggregator::new(config, self.registry.clone(), self.events.clone())
    }

    /// Message safe to return to a remote caller.
    pub fn public_message(&self, error: &ResilienceError) -> String {
        error.public_message(self.production_mode)
    }

    /// Run `operation` under `policy` with a default context.
    pub async fn execute<T, E, F, Fut>(&self, policy: &str, operation: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(policy, ExecutionContext::default(), operation)
            .await
            .result
    }

    /// Run `operation` under `policy`, returning the result with its execution record.
    pub async fn run<T, E, F, Fut>(
        &self,
        policy: &str,
        ctx: ExecutionContext,
        operation: F,
    ) -> Execution<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let started = Instant::now();
        let mut record = ExecutionMetrics {
            policy: policy.to_string(),
            duration: Default::default(),
            success: false,
            circuit_state: None,
            attempts: 0,
            rate_limited: false,
            bulkhead_queued: false,
            error_kind: None,
        };
        let mut rate_limit = None;

        let bundle = self.policies.load().get(policy).cloned();
        let result = match bundle {
            Some(bundle) => {
                self.chain(&bundle, &ctx, &mut record, &mut rate_limit, operation)
                    .await
            }
            None => Err(ResilienceError::PolicyNotFound(policy.to_string())),
        };

        record.duration = started.elapsed();
        record.success = result.is_ok();
        record.error_kind = result.as_ref().err().map(|e| e.kind());
        metrics::record_execution(&record);
        self.executions.emit(record.clone());

        Execution {
            result,
            metrics: record,
            rate_limit,
        }
    }

    async fn chain<T, E, F, Fut>(
        &self,
        policy: &Policy,
        ctx: &ExecutionContext,
        record: &mut ExecutionMetrics,
        rate_limit: &mut Option<RateLimitHeaders>,
        mut operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let name = policy.name.as_str();

        let _bulkhead_permit = match &policy.bulkhead {
            Some(config) => {
                let bulkheads = self.registry.bulkhead(name, config);
                match bulkheads.acquire(ctx.partition.as_deref(), &ctx.cancel).await {
                    Ok(permit) => {
                        record.bulkhead_queued = permit.waited();
                        Some(permit)
                    }
                    Err(e) => {
                        record.bulkhead_queued = matches!(e, ResilienceError::BulkheadQueueTimeout { .. });
                        if e.kind().is_admission() {
                            metrics::record_rejection(name, "bulkhead");
                        }
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        if let Some(config) = &policy.rate_limit {
            let key = ctx.rate_limit_key.as_deref().unwrap_or(GLOBAL_RATE_LIMIT_KEY);
            let decision = match &self.counter_store {
                Some(store) => {
                    self.registry
                        .shared_limiter(name, config, &self.store_namespace, store)
                        .check(key)
                        .await
                }
                None => self.registry.limiter(name, config).check(key),
            };
            *rate_limit = Some(decision.headers.clone());
            if !decision.allowed {
                record.rate_limited = true;
                metrics::record_rejection(name, "rate_limit");
                tracing::warn!(policy = name, key, retry_after = ?decision.retry_after, "Rate limited");
                return Err(ResilienceError::RateLimited {
                    key: key.to_string(),
                    retry_after: decision.retry_after,
                    headers: decision.headers,
                });
            }
        }

        let mut retry = match &policy.retry {
            Some(config) => RetryHandler::new(config.clone()),
            None => RetryHandler::once(),
        };
        if let Some(config) = &policy.circuit_breaker {
            let dependency = ctx.dependency.as_deref().unwrap_or(name);
            let breaker = self.registry.breaker(dependency, config);
            record.circuit_state = Some(breaker.state());
            retry = retry.with_breaker(breaker);
        }

        let timeouts = policy.timeout.clone().map(TimeoutManager::new);
        let operation_name = ctx.operation.as_deref();
        let call_deadline = timeouts
            .as_ref()
            .filter(|t| !t.per_attempt())
            .map(|t| t.deadline(operation_name));
        let attempt_timeouts = timeouts.as_ref().filter(|t| t.per_attempt());

        let outcome = retry
            .run(&ctx.cancel, call_deadline.as_ref(), |attempt| {
                let deadline = attempt_timeouts
                    .map(|t| t.deadline(operation_name))
                    .or(call_deadline);
                let fut = operation();
                tracing::debug!(policy = name, attempt, "Attempt started");
                async move {
                    let fut = async move { fut.await.map_err(ResilienceError::operation) };
                    match deadline {
                        Some(deadline) => deadline.run(fut).await,
                        None => fut.await,
                    }
                }
            })
            .await;

        record.attempts = outcome.attempts;
        if let Err(e) = &outcome.result {
            if matches!(e, ResilienceError::CircuitOpen { .. }) {
                record.circuit_state = Some(CircuitState::Open);
                metrics::record_rejection(name, "circuit");
                tracing::warn!(policy = name, error = %e, "Call rejected by open circuit");
            }
        }
        outcome.result
    }

    /// Install or replace one policy. Returns the installed bundle with its version.
    pub fn update_policy(&self, name: &str, mut policy: Policy) -> Result<Arc<Policy>, ResilienceError> {
        if policy.name.is_empty() {
            policy.name = name.to_string();
        }
        if policy.name != name {
            return Err(ResilienceError::Validation(ValidationErrors::single(
                "name",
                format!("must match the policy being updated ('{}')", name),
            )));
        }
        validate_policy(&policy).map_err(ResilienceError::Validation)?;

        let _guard = self.write_lock.lock();
        let current = self.policies.load_full();
        let existing = current.get(name);

        if let Some(existing) = existing {
            if existing.same_settings(&policy) {
                return Ok(existing.clone());
            }
        }

        policy.version = existing.map_or(1, |p| p.version + 1);
        let installed = Arc::new(policy);
        let mut next = PolicyMap::clone(&current);
        next.insert(name.to_string(), installed.clone());
        self.policies.store(Arc::new(next));
        self.prune_registry(&installed);

        let kind = if existing.is_some() {
            PolicyEventKind::PolicyUpdated
        } else {
            PolicyEventKind::PolicyCreated
        };
        self.announce(kind, name, existing.map(|p| p.version), Some(installed.version));
        Ok(installed)
    }

    /// Replace the whole policy set. Nothing is applied unless every bundle is valid.
    pub fn apply_policies(&self, policies: Vec<Policy>) -> Result<ApplySummary, ResilienceError> {
        validate_policies(&policies).map_err(ResilienceError::Validation)?;

        let _guard = self.write_lock.lock();
        let current = self.policies.load_full();
        let mut next = PolicyMap::with_capacity(policies.len());
        let mut summary = ApplySummary::default();
        let mut announcements = Vec::new();

        for mut policy in policies {
            let name = policy.name.clone();
            match current.get(&name) {
                Some(existing) if existing.same_settings(&policy) => {
                    summary.unchanged += 1;
                    next.insert(name, existing.clone());
                }
                Some(existing) => {
                    policy.version = existing.version + 1;
                    announcements.push((
                        PolicyEventKind::PolicyUpdated,
                        name.clone(),
                        Some(existing.version),
                        Some(policy.version),
                    ));
                    summary.updated.push(name.clone());
                    next.insert(name, Arc::new(policy));
                }
                None => {
                    policy.version = 1;
                    announcements.push((PolicyEventKind::PolicyCreated, name.clone(), None, Some(1)));
                    summary.created.push(name.clone());
                    next.insert(name, Arc::new(policy));
                }
            }
        }

        for (name, existing) in current.iter() {
            if !next.contains_key(name) {
                announcements.push((PolicyEventKind::PolicyDeleted, name.clone(), Some(existing.version), None));
                summary.deleted.push(name.clone());
            }
        }

        self.policies.store(Arc::new(next));

        for name in &summary.deleted {
            self.registry.remove_policy(name);
        }
        for name in summary.created.iter().chain(&summary.updated) {
            if let Some(policy) = self.policies.load().get(name) {
                self.prune_registry(policy);
            }
        }
        for (kind, name, previous, current) in announcements {
            self.announce(kind, &name, previous, current);
        }

        summary.created.sort();
        summary.updated.sort();
        summary.deleted.sort();
        tracing::info!(
            created = summary.created.len(),
            updated = summary.updated.len(),
            deleted = summary.deleted.len(),
            unchanged = summary.unchanged,
            "Policy set applied"
        );
        Ok(summary)
    }

    pub fn get_policy(&self, name: &str) -> Result<Arc<Policy>, ResilienceError> {
        self.policies
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| ResilienceError::PolicyNotFound(name.to_string()))
    }

    /// Active policies ordered by name.
    pub fn list_policies(&self) -> Vec<Arc<Policy>> {
        let mut all: Vec<_> = self.policies.load().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn delete_policy(&self, name: &str) -> Result<(), ResilienceError> {
        let _guard = self.write_lock.lock();
        let current = self.policies.load_full();
        let Some(existing) = current.get(name) else {
            return Err(ResilienceError::PolicyNotFound(name.to_string()));
        };

        let mut next = PolicyMap::clone(&current);
        next.remove(name);
        self.policies.store(Arc::new(next));
        self.registry.remove_policy(name);
        self.announce(PolicyEventKind::PolicyDeleted, name, Some(existing.version), None);
        Ok(())
    }

    /// Breaker state for `dependency`. Unknown dependencies report a fresh closed circuit.
    pub fn state(&self, dependency: &str) -> CircuitBreakerState {
        self.registry
            .find_breaker(dependency)
            .map(|b| b.snapshot())
            .unwrap_or_else(|| CircuitBreakerState::closed(dependency))
    }

    /// Force a breaker closed. Returns false when no breaker exists for `dependency`.
    pub fn reset_circuit(&self, dependency: &str) -> bool {
        match self.registry.find_breaker(dependency) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Install a replicated breaker state. Returns false when the breaker is unknown.
    pub fn restore_circuit(&self, state: &CircuitBreakerState) -> bool {
        match self.registry.find_breaker(&state.dependency) {
            Some(breaker) => {
                breaker.restore(state);
                true
            }
            None => false,
        }
    }

    /// Non-consuming rate-limit headers for `key` under `policy`.
    pub fn rate_limit_headers(&self, policy: &str, key: &str) -> Option<RateLimitHeaders> {
        self.registry.find_limiter(policy).map(|l| l.headers(key))
    }

    /// The store-backed limiter `policy` runs under, shared with the call path.
    pub fn distributed_limiter(&self, policy: &str) -> Result<Arc<DistributedRateLimiter>, ResilienceError> {
        let bundle = self.get_policy(policy)?;
        let config = bundle.rate_limit.as_ref().ok_or_else(|| {
            ResilienceError::Configuration(format!("policy '{}' has no rate limit", policy))
        })?;
        let store = self.counter_store.as_ref().ok_or_else(|| {
            ResilienceError::Configuration("no counter store configured".to_string())
        })?;
        Ok(self
            .registry
            .shared_limiter(policy, config, &self.store_namespace, store))
    }

    /// Aggregate bulkhead metrics for `policy`.
    pub fn bulkhead_metrics(&self, policy: &str) -> Option<BulkheadMetrics> {
        self.registry.find_bulkhead(policy).map(|b| b.metrics())
    }

    /// Apply every snapshot received on `updates` until shutdown.
    pub fn spawn_reloader(
        self: &Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<PolicySnapshot>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    snapshot = updates.recv() => {
                        let Some(snapshot) = snapshot else {
                            tracing::debug!("Policy update channel closed");
                            break;
                        };
                        match engine.apply_policies(snapshot) {
                            Ok(summary) if summary.is_noop() => tracing::debug!("Reloaded policy set unchanged"),
                            Ok(_) => tracing::info!("Policies reloaded"),
                            Err(e) => tracing::warn!(error = %e, "Rejected policy reload. Keeping current set."),
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!("Policy reloader received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
        })
    }

    /// Drop live instances a policy no longer configures.
    fn prune_registry(&self, policy: &Policy) {
        if policy.rate_limit.is_none() {
            self.registry.remove_limiter(&policy.name);
        }
        if policy.bulkhead.is_none() {
            self.registry.remove_bulkhead(&policy.name);
        }
    }

    fn announce(&self, kind: PolicyEventKind, name: &str, previous: Option<u64>, current: Option<u64>) {
        tracing::info!(policy = name, kind = %kind, version = ?current, "Policy changed");
        self.events.emit(PolicyEvent::new(
            kind,
            name,
            previous.map(|v| v.to_string()),
            current.map(|v| v.to_string()),
        ));
    }
}
