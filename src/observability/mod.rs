//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms, per-call ExecutionMetrics)
//!     → events.rs (PolicyEvent notifications)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//!     → Event subscribers (exporters, audit, mesh controllers)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Emission never blocks and never fails the primitive that emits
//! - Metrics are cheap (atomic increments)

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{EventBus, PolicyEvent, PolicyEventKind};
pub use metrics::ExecutionMetrics;
