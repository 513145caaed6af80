//! Timeout enforcement.
//!
//! # Responsibilities
//! - Resolve the deadline for a call (per-operation override, else default)
//! - Bound an operation by that deadline
//! - Bound retry sleeps by the same deadline
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - A timed-out operation is dropped, never awaited to completion
//! - The deadline is fixed once per call unless `per_attempt` is set

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::TimeoutConfig;
use crate::error::ResilienceError;

#[derive(Debug, Clone)]
pub struct TimeoutManager {
    config: TimeoutConfig,
}

impl TimeoutManager {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Budget for `operation`: its override if one exists, else the default.
    pub fn budget_for(&self, operation: Option<&str>) -> Duration {
        operation
            .and_then(|op| self.config.per_operation.get(op).copied())
            .unwrap_or(self.config.default)
    }

    /// Start the clock for one call (or one attempt with `per_attempt`).
    pub fn deadline(&self, operation: Option<&str>) -> Deadline {
        Deadline::after(self.budget_for(operation))
    }

    pub fn per_attempt(&self) -> bool {
        self.config.per_attempt
    }

    /// Run `future` under a fresh deadline for `operation`.
    pub async fn run<T, F>(&self, operation: Option<&str>, future: F) -> Result<T, ResilienceError>
    where
        F: Future<Output = Result<T, ResilienceError>>,
    {
        self.deadline(operation).run(future).await
    }
}

/// A fixed point in time by which a call must finish.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    fn elapsed_error(&self) -> ResilienceError {
        ResilienceError::Timeout { after: self.budget }
    }

    /// Await `future`, or give up with a timeout error once the deadline passes.
    pub async fn run<T, F>(&self, future: F) -> Result<T, ResilienceError>
    where
        F: Future<Output = Result<T, ResilienceError>>,
    {
        match tokio::time::timeout_at(self.at, future).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(budget = ?self.budget, "Deadline exceeded");
                Err(self.elapsed_error())
            }
        }
    }

    /// Sleep for `delay`, failing at the deadline if it comes first.
    pub async fn sleep(&self, delay: Duration) -> Result<(), ResilienceError> {
        let wake = Instant::now() + delay;
        if wake >= self.at {
            tokio::time::sleep_until(self.at).await;
            return Err(self.elapsed_error());
        }
        tokio::time::sleep_until(wake).await;
        Ok(())
    }
}
