//! Resilience Runtime Library
//!
//! Fault-tolerance primitives and the policy engine that composes them.
//!
//! # Architecture Overview
//!
//! ```text
//!   caller ──▶ PolicyEngine::run("payments", ctx, op)
//!                 │  snapshot of named policies (hot-reloaded)
//!                 ▼
//!             ┌──────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────────────┐
//!             │ bulkhead │──▶│ rate limit │──▶│   circuit   │──▶│ retry + timeout  │──▶ op
//!             └──────────┘   └────────────┘   │   breaker   │   └──────────────────┘
//!                                             └─────────────┘
//!                 │ outcomes
//!                 ▼
//!   ExecutionMetrics / PolicyEvent ──▶ metrics facade, event subscribers
//!
//!   HealthAggregator samples breakers and limiters on its own schedule.
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod policy;
pub mod resilience;

pub use config::{Policy, RuntimeConfig};
pub use error::{BoxError, ErrorKind, ResilienceError, StatusCode};
pub use health::{HealthAggregator, HealthStatus};
pub use lifecycle::Shutdown;
pub use policy::{Execution, ExecutionContext, PolicyEngine};
