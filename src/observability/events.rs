//! Fire-and-forget notifications.
//!
//! # Responsibilities
//! - Define `PolicyEvent` (circuit transitions, health changes, policy lifecycle)
//! - Deliver events and execution records to any number of subscribers
//!
//! # Design Decisions
//! - Bounded broadcast ring: `send` never blocks and never fails the emitter
//! - A lagging subscriber loses the oldest entries, not the newest
//! - Having no subscribers is normal; the event is simply dropped

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEventKind {
    CircuitStateChanged,
    HealthStatusChanged,
    PolicyCreated,
    PolicyUpdated,
    PolicyDeleted,
}

impl fmt::Display for PolicyEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyEventKind::CircuitStateChanged => "circuit_state_changed",
            PolicyEventKind::HealthStatusChanged => "health_status_changed",
            PolicyEventKind::PolicyCreated => "policy_created",
            PolicyEventKind::PolicyUpdated => "policy_updated",
            PolicyEventKind::PolicyDeleted => "policy_deleted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvent {
    pub id: Uuid,
    pub kind: PolicyEventKind,
    /// Breaker dependency, policy name, or health component.
    pub subject: String,
    pub previous: Option<String>,
    pub current: Option<String>,
    /// Unix milliseconds.
    pub timestamp_ms: u64,
}

impl PolicyEvent {
    pub fn new(
        kind: PolicyEventKind,
        subject: impl Into<String>,
        previous: Option<String>,
        current: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            subject: subject.into(),
            previous,
            current,
            timestamp_ms: unix_millis(),
        }
    }

    pub fn transition(
        kind: PolicyEventKind,
        subject: impl Into<String>,
        previous: impl fmt::Display,
        current: impl fmt::Display,
    ) -> Self {
        Self::new(
            kind,
            subject,
            Some(previous.to_string()),
            Some(current.to_string()),
        )
    }
}

/// Bounded, non-blocking fan-out channel.
#[derive(Debug, Clone)]
pub struct EventBus<T = PolicyEvent> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Publish without waiting. Returns whether anyone was listening.
    pub fn emit(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
