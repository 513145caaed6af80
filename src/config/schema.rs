//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the runtime,
//! including the policy bundles themselves. All types derive Serde traits for
//! deserialization from config files; durations are written in human-readable
//! form (`"250ms"`, `"30s"`, `"1m 30s"`).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the runtime.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,

    /// Health aggregation settings.
    pub health: HealthConfig,

    /// Hot reload settings.
    pub reload: ReloadConfig,

    /// Event channel settings.
    pub events: EventConfig,

    /// Distributed rate-limit counter settings.
    pub rate_limit_store: RateLimitStoreConfig,

    /// Named policy bundles.
    pub policies: Vec<Policy>,
}

/// A named, versioned bundle of resilience settings.
///
/// A policy with no sub-configs is a passthrough.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Policy {
    /// Unique policy name.
    pub name: String,

    /// Version assigned by the engine; bumped on every accepted change.
    #[serde(default)]
    pub version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadConfig>,
}

impl Policy {
    /// Create an empty (passthrough) policy.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            circuit_breaker: None,
            retry: None,
            timeout: None,
            rate_limit: None,
            bulkhead: None,
        }
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn with_timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = Some(config);
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    /// True when no primitive is configured.
    pub fn is_passthrough(&self) -> bool {
        self.circuit_breaker.is_none()
            && self.retry.is_none()
            && self.timeout.is_none()
            && self.rate_limit.is_none()
            && self.bulkhead.is_none()
    }

    /// Compare bundles ignoring the engine-assigned version.
    pub fn same_settings(&self, other: &Policy) -> bool {
        self.name == other.name
            && self.circuit_breaker == other.circuit_breaker
            && self.retry == other.retry
            && self.timeout == other.timeout
            && self.rate_limit == other.rate_limit
            && self.bulkhead == other.bulkhead
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before opening.
    pub failure_threshold: u32,

    /// Consecutive probe successes in HalfOpen before closing.
    pub success_threshold: u32,

    /// How long the circuit stays open before probing.
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,

    /// Concurrent probes allowed in HalfOpen.
    pub probe_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            probe_count: 1,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Exponential growth factor.
    pub multiplier: f64,

    /// Jitter as a fraction of the computed delay (0.0 - 1.0).
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_percent: 0.1,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline used when no per-operation override matches.
    #[serde(with = "humantime_serde")]
    pub default: Duration,

    /// Hard ceiling for the default and every override.
    #[serde(with = "humantime_serde")]
    pub max: Duration,

    /// Give every retry attempt its own deadline instead of one per call.
    pub per_attempt: bool,

    /// Operation name -> deadline.
    #[serde(with = "duration_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub per_operation: BTreeMap<String, Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(30),
            max: Duration::from_secs(300),
            per_attempt: false,
            per_operation: BTreeMap::new(),
        }
    }
}

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

impl fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitAlgorithm::TokenBucket => write!(f, "token_bucket"),
            RateLimitAlgorithm::SlidingWindow => write!(f, "sliding_window"),
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub algorithm: RateLimitAlgorithm,

    /// Requests allowed per `window`.
    pub limit: u32,

    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Bucket capacity (token bucket only).
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            limit: 100,
            window: Duration::from_secs(60),
            burst_size: 10,
        }
    }
}

/// Bulkhead configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Concurrent executions per partition.
    pub max_concurrent: u32,

    /// Waiters allowed per partition once all permits are held.
    pub max_queue: u32,

    /// Longest time a waiter stays queued.
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue: 100,
            queue_timeout: Duration::from_secs(5),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Hide diagnostic detail from caller-facing error messages.
    pub production_mode: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
            production_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Health aggregation configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Run the periodic sampler.
    pub enabled: bool,

    /// Sampling interval.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Limiter utilization (0.0 - 1.0) at which a limiter counts as near its limit.
    pub degraded_utilization: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            degraded_utilization: 0.8,
        }
    }
}

/// Hot reload configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReloadConfig {
    pub enabled: bool,

    /// Poll interval for backends that cannot deliver native change events.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Event channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EventConfig {
    /// Buffered events per channel; the oldest is dropped when full.
    pub capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Distributed rate-limit counter configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitStoreConfig {
    /// Prefix for counter keys (`{namespace}:{key}:{window_bucket}`).
    pub namespace: String,
}

impl Default for RateLimitStoreConfig {
    fn default() -> Self {
        Self {
            namespace: "ratelimit".to_string(),
        }
    }
}

/// Serde helper for `BTreeMap<String, Duration>` with human-readable values.
mod duration_map {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use humantime_serde::Serde;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let wrapped: BTreeMap<&str, Serde<Duration>> = map
            .iter()
            .map(|(k, v)| (k.as_str(), Serde::from(*v)))
            .collect();
        wrapped.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Duration>, D::Error> {
        let wrapped: BTreeMap<String, Serde<Duration>> = BTreeMap::deserialize(deserializer)?;
        Ok(wrapped
            .into_iter()
            .map(|(k, v)| (k, v.into_inner()))
            .collect())
    }
}
