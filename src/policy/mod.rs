//! Policy subsystem.
//!
//! # Data Flow
//! ```text
//! Bundles (config file, update_policy, reload snapshot)
//!     → config::validation (all violations, nothing partially applied)
//!     → engine.rs (versioned, atomically swapped snapshot)
//!     → registry.rs (live breakers, limiters, bulkheads)
//!
//! codec.rs: stable JSON and pretty TOML forms for downstream consumers
//! ```
//!
//! # Design Decisions
//! - The registry is owned by the engine and injected where needed; no globals
//! - Breakers outlive policy changes, limiters and bulkheads are rebuilt

pub mod codec;
pub mod engine;
pub mod registry;

pub use engine::{ApplySummary, Execution, ExecutionContext, PolicyEngine};
pub use registry::Registry;
