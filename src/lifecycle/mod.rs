//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger() → every subscribed background task observes cancellation
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Background tasks (watcher, reloader, health loop) hold child tokens
//! - In-flight calls are never cancelled by shutdown; only callers cancel calls

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
