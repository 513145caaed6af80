//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: dependency assumed down, requests fail fast
//! - Half-Open: a limited number of probes test if the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: open_timeout elapsed since the circuit opened
//! Half-Open → Closed: consecutive probe successes >= success_threshold
//! Half-Open → Open: any probe fails (open time reset to now)
//! ```
//!
//! # Design Decisions
//! - One breaker per dependency, each behind its own lock
//! - Admission and counter update happen under a single lock acquisition
//! - Admission hands out a permit; the outcome is reported through it
//! - Outcomes from a permit issued in an earlier state are ignored
//! - A dropped permit with no outcome frees its probe slot without counting

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::{BoxError, ResilienceError};
use crate::observability::events::unix_millis;
use crate::observability::{metrics, EventBus, PolicyEvent, PolicyEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible breaker record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// When the circuit last opened, Unix milliseconds.
    pub opened_at_ms: Option<u64>,
    /// Probes admitted since entering half-open.
    pub probes_issued: u32,
    /// Probes admitted and not yet reported.
    pub probes_in_flight: u32,
}

impl CircuitBreakerState {
    const KEYS: [&'static str; 7] = [
        "dependency",
        "state",
        "consecutive_failures",
        "consecutive_successes",
        "opened_at_ms",
        "probes_issued",
        "probes_in_flight",
    ];

    /// Record for a dependency that has never been called.
    pub fn closed(dependency: impl Into<String>) -> Self {
        Self {
            dependency: dependency.into(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at_ms: None,
            probes_issued: 0,
            probes_in_flight: 0,
        }
    }

    /// Flat key/value form for stores that only hold strings.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("dependency".to_string(), self.dependency.clone());
        map.insert("state".to_string(), self.state.as_str().to_string());
        map.insert(
            "consecutive_failures".to_string(),
            self.consecutive_failures.to_string(),
        );
        map.insert(
            "consecutive_successes".to_string(),
            self.consecutive_successes.to_string(),
        );
        map.insert(
            "opened_at_ms".to_string(),
            self.opened_at_ms.map(|t| t.to_string()).unwrap_or_default(),
        );
        map.insert("probes_issued".to_string(), self.probes_issued.to_string());
        map.insert(
            "probes_in_flight".to_string(),
            self.probes_in_flight.to_string(),
        );
        map
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, ResilienceError> {
        for key in Self::KEYS {
            if !map.contains_key(key) {
                return Err(ResilienceError::Configuration(format!(
                    "circuit state is missing '{}'",
                    key
                )));
            }
        }

        let number = |key: &str| -> Result<u32, ResilienceError> {
            map[key].parse().map_err(|_| {
                ResilienceError::Configuration(format!("circuit state field '{}' is not a number", key))
            })
        };

        let state = CircuitState::parse(&map["state"]).ok_or_else(|| {
            ResilienceError::Configuration("circuit state field 'state' is not a state name".into())
        })?;

        let opened_at_ms = match map["opened_at_ms"].as_str() {
            "" if state == CircuitState::Open => {
                return Err(ResilienceError::Configuration(
                    "circuit state field 'opened_at_ms' is required for an open circuit".into(),
                ))
            }
            "" => None,
            raw => Some(raw.parse().map_err(|_| {
                ResilienceError::Configuration(
                    "circuit state field 'opened_at_ms' is not a timestamp".into(),
                )
            })?),
        };

        Ok(Self {
            dependency: map["dependency"].clone(),
            state,
            consecutive_failures: number("consecutive_failures")?,
            consecutive_successes: number("consecutive_successes")?,
            opened_at_ms,
            probes_issued: number("probes_issued")?,
            probes_in_flight: number("probes_in_flight")?,
        })
    }
}

#[derive(Debug)]
struct Inner {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probes_issued: u32,
    probes_in_flight: u32,
    /// Bumped on every transition so stale permits can be recognised.
    generation: u64,
}

type Transition = (CircuitState, CircuitState);

impl Inner {
    fn transition(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        self.consecutive_successes = 0;
        self.probes_issued = 0;
        self.probes_in_flight = 0;
        match to {
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::Closed => self.consecutive_failures = 0,
            CircuitState::HalfOpen => {}
        }
        (from, to)
    }

    /// Open → HalfOpen once the open timeout has elapsed.
    fn refresh(&mut self, now: Instant) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        let opened = self.opened_at.unwrap_or(now);
        if now.saturating_duration_since(opened) >= self.config.open_timeout {
            Some(self.transition(CircuitState::HalfOpen, now))
        } else {
            None
        }
    }

    fn remaining_open(&self, now: Instant) -> Duration {
        let opened = self.opened_at.unwrap_or(now);
        self.config
            .open_timeout
            .saturating_sub(now.saturating_duration_since(opened))
    }
}

/// Per-dependency circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    inner: Mutex<Inner>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            inner: Mutex::new(Inner {
                config,
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probes_issued: 0,
                probes_in_flight: 0,
                generation: 0,
            }),
            events: None,
        }
    }

    /// Publish state transitions on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.inner.lock().config.clone()
    }

    /// Swap thresholds in place, keeping the current state and counters.
    pub fn update_config(&self, config: CircuitBreakerConfig) {
        let mut inner = self.inner.lock();
        if inner.config != config {
            tracing::debug!(dependency = %self.dependency, "Circuit breaker reconfigured");
            inner.config = config;
        }
    }

    /// Current state, moving Open to HalfOpen if the open timeout has passed.
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = inner.refresh(Instant::now());
            (inner.state, transition)
        };
        self.publish(transition);
        state
    }

    /// Decide admission and reserve a probe slot in one step.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CircuitPermit, ResilienceError> {
        let now = Instant::now();
        let (result, transition) = {
            let mut inner = self.inner.lock();
            let transition = inner.refresh(now);
            let result = match inner.state {
                CircuitState::Closed => Ok(CircuitPermit {
                    breaker: self.clone(),
                    generation: inner.generation,
                    probe: false,
                    settled: false,
                }),
                CircuitState::HalfOpen if inner.probes_in_flight < inner.config.probe_count => {
                    inner.probes_in_flight += 1;
                    inner.probes_issued += 1;
                    Ok(CircuitPermit {
                        breaker: self.clone(),
                        generation: inner.generation,
                        probe: true,
                        settled: false,
                    })
                }
                CircuitState::HalfOpen => Err(self.open_error(Duration::ZERO)),
                CircuitState::Open => Err(self.open_error(inner.remaining_open(now))),
            };
            (result, transition)
        };
        self.publish(transition);
        result
    }

    /// Run `operation` under the breaker. Rejected calls never invoke it.
    pub async fn call<T, E, F, Fut>(self: &Arc<Self>, operation: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let permit = self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(e) => {
                permit.record_failure();
                Err(ResilienceError::Operation(e.into()))
            }
        }
    }

    /// Serializable snapshot of the current state.
    pub fn snapshot(&self) -> CircuitBreakerState {
        let now = Instant::now();
        let now_ms = unix_millis();
        let (snapshot, transition) = {
            let mut inner = self.inner.lock();
            let transition = inner.refresh(now);
            let opened_at_ms = inner.opened_at.map(|at| {
                now_ms.saturating_sub(now.saturating_duration_since(at).as_millis() as u64)
            });
            let snapshot = CircuitBreakerState {
                dependency: self.dependency.clone(),
                state: inner.state,
                consecutive_failures: inner.consecutive_failures,
                consecutive_successes: inner.consecutive_successes,
                opened_at_ms,
                probes_issued: inner.probes_issued,
                probes_in_flight: inner.probes_in_flight,
            };
            (snapshot, transition)
        };
        self.publish(transition);
        snapshot
    }

    /// Install a replicated state. Outstanding permits become stale.
    ///
    /// Probes in flight belong to whoever issued them, so every probe slot
    /// starts free here. An Open state without an opening time opens now.
    pub fn restore(&self, state: &CircuitBreakerState) {
        let now = Instant::now();
        let now_ms = unix_millis();
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.state = state.state;
            inner.consecutive_failures = state.consecutive_failures;
            inner.consecutive_successes = state.consecutive_successes;
            inner.probes_issued = state.probes_issued;
            inner.probes_in_flight = 0;
            inner.opened_at = match (state.state, state.opened_at_ms) {
                (_, Some(at)) => {
                    let age = Duration::from_millis(now_ms.saturating_sub(at));
                    Some(now.checked_sub(age).unwrap_or(now))
                }
                (CircuitState::Open, None) => Some(now),
                (_, None) => None,
            };
            inner.generation += 1;
            (from != state.state).then_some((from, state.state))
        };
        tracing::info!(dependency = %self.dependency, state = %state.state, "Circuit state restored");
        self.publish(transition);
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Closed {
                inner.consecutive_failures = 0;
                None
            } else {
                Some(inner.transition(CircuitState::Closed, Instant::now()))
            }
        };
        self.publish(transition);
    }

    fn on_success(&self, generation: u64, probe: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen if probe => {
                    inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= inner.config.success_threshold {
                        Some(inner.transition(CircuitState::Closed, Instant::now()))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        self.publish(transition);
    }

    fn on_failure(&self, generation: u64, probe: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    inner.consecutive_successes = 0;
                    if inner.consecutive_failures >= inner.config.failure_threshold {
                        Some(inner.transition(CircuitState::Open, Instant::now()))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if probe => {
                    Some(inner.transition(CircuitState::Open, Instant::now()))
                }
                _ => None,
            }
        };
        self.publish(transition);
    }

    fn on_abandon(&self, generation: u64, probe: bool) {
        if !probe {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    fn open_error(&self, retry_after: Duration) -> ResilienceError {
        ResilienceError::CircuitOpen {
            dependency: self.dependency.clone(),
            retry_after,
        }
    }

    fn publish(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => {
                tracing::warn!(dependency = %self.dependency, from = %from, "Circuit opened")
            }
            _ => tracing::info!(dependency = %self.dependency, from = %from, to = %to, "Circuit state changed"),
        }
        metrics::record_circuit_state(&self.dependency, to);

        if let Some(events) = &self.events {
            events.emit(PolicyEvent::transition(
                PolicyEventKind::CircuitStateChanged,
                self.dependency.clone(),
                from,
                to,
            ));
        }
    }
}

/// Admission ticket; report the outcome through it.
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl CircuitPermit {
    /// True when this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation, self.probe);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation, self.probe);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.generation, self.probe);
        }
    }
}
