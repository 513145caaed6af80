//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML/JSON)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RuntimeConfig (validated, immutable)
//!     → policies handed to the policy engine
//!
//! On change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates the complete policy set
//!     → engine swaps its policy snapshot atomically
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - An invalid file is rejected whole; nothing is partially applied

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    BulkheadConfig, CircuitBreakerConfig, EventConfig, HealthConfig, LogFormat,
    ObservabilityConfig, Policy, RateLimitAlgorithm, RateLimitConfig, RateLimitStoreConfig,
    ReloadConfig, RetryConfig, RuntimeConfig, TimeoutConfig,
};
pub use validation::{FieldViolation, ValidationErrors};
