//! Health aggregation subsystem.
//!
//! # Data Flow
//! ```text
//! Periodic timer or on-demand check (aggregator.rs):
//!     → Sample every registered breaker and rate limiter
//!     → Derive one status per component
//!     → Fold into the overall status
//!     → Emit a PolicyEvent when the overall status changes
//! ```
//!
//! # Design Decisions
//! - Sampling is independent of calls; it never blocks a caller
//! - Worst component wins: any open breaker makes the runtime unhealthy

pub mod aggregator;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use aggregator::{ComponentHealth, ComponentKind, HealthAggregator, HealthReport};

/// Overall or per-component health. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Healthy or degraded: traffic can still be served.
    pub fn is_ready(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
