//! Resilience primitives.
//!
//! # Data Flow
//! ```text
//! Call under policy:
//!     → bulkhead.rs (partition concurrency cap, bounded FIFO queue)
//!     → rate_limit.rs (token bucket / sliding window per key)
//!     → circuit_breaker.rs (fail fast while the dependency is down)
//!     → retries.rs (repeat failures with backoff.rs delays)
//!     → timeouts.rs (deadline over each attempt and the backoff sleeps)
//!     → operation
//! ```
//!
//! # Design Decisions
//! - Each primitive is usable alone; the policy engine composes them
//! - State is scoped per key (dependency, rate-limit key, partition)
//! - Suspension points (queue wait, backoff, deadline) honour cancellation
//! - store.rs holds the optional cross-process counter boundary

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod retries;
pub mod store;
pub mod timeouts;

pub use bulkhead::{Bulkhead, BulkheadMetrics, BulkheadPermit, PartitionedBulkhead};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitPermit, CircuitState};
pub use rate_limit::{Decision, RateLimitHeaders, RateLimiter};
pub use retries::{RetryHandler, RetryOutcome};
pub use store::{CounterStore, DistributedRateLimiter, InMemoryCounterStore};
pub use timeouts::{Deadline, TimeoutManager};
