//! Notifications published by the limiter, the circuit breaker and the manager.
//!
//! Every component holds a clone of the same [`EventBus`]; consumers call
//! [`EventBus::subscribe`] and receive every event published after that point.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1024;

/// Failure and success statistics attached to circuit transitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStats {
    /// Failures currently counted towards the threshold
    pub failures: u32,
    /// Consecutive successes in the current half-open trial
    pub successes: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejected: u64,
    pub times_opened: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResilienceEvent {
    #[serde(rename_all = "camelCase")]
    RateLimitExceeded {
        service_id: String,
        wait_time_ms: u64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    CircuitOpened {
        service_id: String,
        stats: CircuitStats,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    CircuitHalfOpened {
        service_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    CircuitClosed {
        service_id: String,
        stats: CircuitStats,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RequestCompleted {
        service_id: String,
        request_id: Uuid,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    RequestFailed {
        service_id: String,
        request_id: Uuid,
        error: String,
    },
}

impl ResilienceEvent {
    pub fn service_id(&self) -> &str {
        match self {
            ResilienceEvent::RateLimitExceeded { service_id, .. }
            | ResilienceEvent::CircuitOpened { service_id, .. }
            | ResilienceEvent::CircuitHalfOpened { service_id, .. }
            | ResilienceEvent::CircuitClosed { service_id, .. }
            | ResilienceEvent::RequestCompleted { service_id, .. }
            | ResilienceEvent::RequestFailed { service_id, .. } => service_id,
        }
    }

    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            ResilienceEvent::RateLimitExceeded { .. } => "rate-limit-exceeded",
            ResilienceEvent::CircuitOpened { .. } => "circuit-opened",
            ResilienceEvent::CircuitHalfOpened { .. } => "circuit-half-opened",
            ResilienceEvent::CircuitClosed { .. } => "circuit-closed",
            ResilienceEvent::RequestCompleted { .. } => "request-completed",
            ResilienceEvent::RequestFailed { .. } => "request-failed",
        }
    }
}

/// Broadcast channel shared by all components
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ResilienceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.sender.subscribe()
    }

    /// Logs the event and delivers it to current subscribers
    pub fn publish(&self, event: ResilienceEvent) {
        match &event {
            ResilienceEvent::RateLimitExceeded {
                service_id,
                wait_time_ms,
                ..
            } => info!(service_id = %service_id, wait_time_ms, "rate-limit-exceeded"),
            ResilienceEvent::CircuitOpened {
                service_id, stats, ..
            } => warn!(
                service_id = %service_id,
                failures = stats.failures,
                times_opened = stats.times_opened,
                "circuit-opened"
            ),
            ResilienceEvent::CircuitHalfOpened { service_id, .. } => {
                info!(service_id = %service_id, "circuit-half-opened")
            }
            ResilienceEvent::CircuitClosed { service_id, .. } => {
                info!(service_id = %service_id, "circuit-closed")
            }
            ResilienceEvent::RequestCompleted {
                service_id,
                request_id,
                duration_ms,
            } => debug!(
                service_id = %service_id,
                request_id = %request_id,
                duration_ms,
                "request-completed"
            ),
            ResilienceEvent::RequestFailed {
                service_id,
                request_id,
                error,
            } => warn!(
                service_id = %service_id,
                request_id = %request_id,
                error = %error,
                "request-failed"
            ),
        }

        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

/// Converts a clock reading into an event timestamp
pub(crate) fn timestamp(millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or_else(Utc::now)
}
