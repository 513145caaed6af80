//! Metrics collection and exposition.
//!
//! # Metrics
//! - `resilience_executions_total` (counter): calls by policy and outcome
//! - `resilience_execution_duration_seconds` (histogram): end-to-end latency
//! - `resilience_retry_attempts` (histogram): attempts used per call
//! - `resilience_rejections_total` (counter): admission rejections by stage
//! - `resilience_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `resilience_bulkhead_active` / `resilience_bulkhead_queued` (gauge)
//! - `resilience_health_status` (gauge): 0=healthy, 1=degraded, 2=unhealthy
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; with no recorder installed
//!   every call is a no-op
//! - The Prometheus endpoint is optional and installed once at startup

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::health::HealthStatus;
use crate::resilience::circuit_breaker::CircuitState;

/// Per-call execution record, produced once per top-level call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub policy: String,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub success: bool,
    /// Breaker state seen at admission, if the policy has a breaker.
    pub circuit_state: Option<CircuitState>,
    /// Operation attempts made (0 when rejected before the first attempt).
    pub attempts: u32,
    pub rate_limited: bool,
    pub bulkhead_queued: bool,
    pub error_kind: Option<ErrorKind>,
}

/// Install the Prometheus recorder and scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_execution(record: &ExecutionMetrics) {
    let outcome = match record.error_kind {
        None => "success",
        Some(kind) => kind.as_str(),
    };

    metrics::counter!(
        "resilience_executions_total",
        "policy" => record.policy.clone(),
        "outcome" => outcome
    )
    .increment(1);

    metrics::histogram!(
        "resilience_execution_duration_seconds",
        "policy" => record.policy.clone()
    )
    .record(record.duration.as_secs_f64());

    if record.attempts > 0 {
        metrics::histogram!(
            "resilience_retry_attempts",
            "policy" => record.policy.clone()
        )
        .record(f64::from(record.attempts));
    }
}

/// Record an admission rejection (`bulkhead`, `rate_limit`, `circuit`).
pub fn record_rejection(policy: &str, stage: &'static str) {
    metrics::counter!(
        "resilience_rejections_total",
        "policy" => policy.to_string(),
        "stage" => stage
    )
    .increment(1);
}

pub fn record_circuit_state(dependency: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    metrics::gauge!("resilience_circuit_state", "dependency" => dependency.to_string())
        .set(value);
}

pub fn record_bulkhead(partition: &str, active: usize, queued: usize) {
    metrics::gauge!("resilience_bulkhead_active", "partition" => partition.to_string())
        .set(active as f64);
    metrics::gauge!("resilience_bulkhead_queued", "partition" => partition.to_string())
        .set(queued as f64);
}

pub fn record_health(status: HealthStatus) {
    let value = match status {
        HealthStatus::Healthy => 0.0,
        HealthStatus::Degraded => 1.0,
        HealthStatus::Unhealthy => 2.0,
    };
    metrics::gauge!("resilience_health_status").set(value);
}
