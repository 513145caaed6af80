//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges and cross-field constraints of every policy bundle
//! - Detect duplicate policy names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function: config → Result<(), ValidationErrors>
//! - Messages name the field and the violated bound, never the rejected secret

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::schema::{
    BulkheadConfig, CircuitBreakerConfig, Policy, RateLimitConfig, RetryConfig, RuntimeConfig,
    TimeoutConfig,
};

/// A single violated constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// Dotted path of the offending field, e.g. `policies[1].retry.multiplier`.
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// One or more violations found in a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationErrors(Vec<FieldViolation>);

impl ValidationErrors {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self(vec![FieldViolation {
            field: field.into(),
            message: message.into(),
        }])
    }

    pub fn violations(&self) -> &[FieldViolation] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when some violation targets exactly `field`.
    pub fn has_field(&self, field: &str) -> bool {
        self.0.iter().any(|v| v.field == field)
    }

    fn push(&mut self, field: String, message: impl Into<String>) {
        self.0.push(FieldViolation {
            field,
            message: message.into(),
        });
    }

    fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", violation)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Collects violations under a common field prefix.
struct Checker<'a> {
    prefix: String,
    errors: &'a mut ValidationErrors,
}

impl<'a> Checker<'a> {
    fn new(prefix: impl Into<String>, errors: &'a mut ValidationErrors) -> Self {
        Self {
            prefix: prefix.into(),
            errors,
        }
    }

    fn path(&self, field: &str) -> String {
        if self.prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", self.prefix, field)
        }
    }

    fn fail(&mut self, field: &str, message: impl Into<String>) {
        let path = self.path(field);
        self.errors.push(path, message);
    }

    /// Records a violation unless `value` is in range; returns whether it was.
    fn int_range(&mut self, field: &str, value: u32, min: u32, max: u32) -> bool {
        let ok = (min..=max).contains(&value);
        if !ok {
            self.fail(field, format!("must be between {} and {}", min, max));
        }
        ok
    }

    fn float_range(&mut self, field: &str, value: f64, min: f64, max: f64) {
        if !value.is_finite() || value < min || value > max {
            self.fail(field, format!("must be between {} and {}", min, max));
        }
    }

    fn duration_range(&mut self, field: &str, value: Duration, min: Duration, max: Duration) -> bool {
        let ok = (min..=max).contains(&value);
        if !ok {
            self.fail(field, format!("must be between {:?} and {:?}", min, max));
        }
        ok
    }
}

/// Validate the whole runtime configuration, policies included.
pub fn validate_config(config: &RuntimeConfig) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();

    {
        let mut c = Checker::new("observability", &mut errors);
        if config.observability.metrics_enabled
            && config.observability.metrics_address.parse::<SocketAddr>().is_err()
        {
            c.fail("metrics_address", "must be a socket address");
        }
    }
    {
        let mut c = Checker::new("health", &mut errors);
        if config.health.interval.is_zero() {
            c.fail("interval", "must be positive");
        }
        c.float_range("degraded_utilization", config.health.degraded_utilization, 0.0, 1.0);
    }
    if config.reload.poll_interval.is_zero() {
        Checker::new("reload", &mut errors).fail("poll_interval", "must be positive");
    }
    if config.events.capacity == 0 {
        Checker::new("events", &mut errors).fail("capacity", "must be at least 1");
    }
    if config.rate_limit_store.namespace.is_empty() {
        Checker::new("rate_limit_store", &mut errors).fail("namespace", "must not be empty");
    }

    collect_policies(&config.policies, &mut errors);
    errors.into_result()
}

/// Validate a complete policy set, e.g. the contents of a reloaded file.
pub fn validate_policies(policies: &[Policy]) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    collect_policies(policies, &mut errors);
    errors.into_result()
}

/// Validate a single policy bundle.
pub fn validate_policy(policy: &Policy) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    collect_policy("", policy, &mut errors);
    errors.into_result()
}

fn collect_policies(policies: &[Policy], errors: &mut ValidationErrors) {
    let mut seen = HashSet::new();
    for (i, policy) in policies.iter().enumerate() {
        let prefix = format!("policies[{}]", i);
        if !seen.insert(policy.name.as_str()) {
            Checker::new(prefix.clone(), errors).fail("name", "duplicate policy name");
        }
        collect_policy(&prefix, policy, errors);
    }
}

fn collect_policy(prefix: &str, policy: &Policy, errors: &mut ValidationErrors) {
    if policy.name.trim().is_empty() {
        Checker::new(prefix, errors).fail("name", "must not be empty");
    }

    let nested = |section: &str| {
        if prefix.is_empty() {
            section.to_string()
        } else {
            format!("{}.{}", prefix, section)
        }
    };

    if let Some(cb) = &policy.circuit_breaker {
        check_circuit_breaker(&mut Checker::new(nested("circuit_breaker"), errors), cb);
    }
    if let Some(retry) = &policy.retry {
        check_retry(&mut Checker::new(nested("retry"), errors), retry);
    }
    if let Some(timeout) = &policy.timeout {
        check_timeout(&mut Checker::new(nested("timeout"), errors), timeout);
    }
    if let Some(rl) = &policy.rate_limit {
        check_rate_limit(&mut Checker::new(nested("rate_limit"), errors), rl);
    }
    if let Some(bh) = &policy.bulkhead {
        check_bulkhead(&mut Checker::new(nested("bulkhead"), errors), bh);
    }
}

fn check_circuit_breaker(c: &mut Checker<'_>, cb: &CircuitBreakerConfig) {
    let failure_ok = c.int_range("failure_threshold", cb.failure_threshold, 1, 100);
    let success_ok = c.int_range("success_threshold", cb.success_threshold, 1, 10);
    c.duration_range(
        "open_timeout",
        cb.open_timeout,
        Duration::from_secs(1),
        Duration::from_secs(300),
    );
    c.int_range("probe_count", cb.probe_count, 1, 10);

    // Cross-field checks only compare values that are individually valid.
    if failure_ok && success_ok && cb.success_threshold > cb.failure_threshold {
        c.fail(
            "success_threshold",
            format!(
                "cannot be greater than failure_threshold ({})",
                cb.failure_threshold
            ),
        );
    }
}

fn check_retry(c: &mut Checker<'_>, retry: &RetryConfig) {
    c.int_range("max_attempts", retry.max_attempts, 1, 10);
    let base_ok = c.duration_range(
        "base_delay",
        retry.base_delay,
        Duration::from_millis(1),
        Duration::from_secs(10),
    );
    let max_ok = c.duration_range(
        "max_delay",
        retry.max_delay,
        Duration::from_secs(1),
        Duration::from_secs(300),
    );
    c.float_range("multiplier", retry.multiplier, 1.0, 10.0);
    c.float_range("jitter_percent", retry.jitter_percent, 0.0, 1.0);

    if base_ok && max_ok && retry.base_delay > retry.max_delay {
        c.fail("base_delay", "cannot be greater than max_delay");
    }
}

fn check_timeout(c: &mut Checker<'_>, timeout: &TimeoutConfig) {
    let default_ok = c.duration_range(
        "default",
        timeout.default,
        Duration::from_millis(100),
        Duration::from_secs(300),
    );
    let max_ok = c.duration_range(
        "max",
        timeout.max,
        Duration::from_secs(1),
        Duration::from_secs(600),
    );

    if default_ok && max_ok && timeout.default > timeout.max {
        c.fail("default", "cannot be greater than max");
    }

    for (operation, value) in &timeout.per_operation {
        let field = format!("per_operation.{}", operation);
        if value.is_zero() {
            c.fail(&field, "must be positive");
        } else if *value > timeout.max {
            c.fail(&field, "cannot be greater than max");
        }
    }
}

fn check_rate_limit(c: &mut Checker<'_>, rl: &RateLimitConfig) {
    let limit_ok = c.int_range("limit", rl.limit, 1, 100_000);
    c.duration_range(
        "window",
        rl.window,
        Duration::from_secs(1),
        Duration::from_secs(3600),
    );
    let burst_ok = c.int_range("burst_size", rl.burst_size, 1, 10_000);

    if limit_ok && burst_ok && rl.burst_size > rl.limit {
        c.fail(
            "burst_size",
            format!("cannot be greater than limit ({})", rl.limit),
        );
    }
}

fn check_bulkhead(c: &mut Checker<'_>, bh: &BulkheadConfig) {
    c.int_range("max_concurrent", bh.max_concurrent, 1, 10_000);
    c.int_range("max_queue", bh.max_queue, 0, 10_000);
    c.duration_range(
        "queue_timeout",
        bh.queue_timeout,
        Duration::from_millis(1),
        Duration::from_secs(30),
    );
}
